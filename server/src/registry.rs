//! Participant directory for the live session
//!
//! This module owns every participant the session knows about, including:
//! - Registration with host-slot exclusivity and the player cap
//! - Suspend/resume of liveness without losing role, specialties or readiness
//! - Per-participant attribute mutators with their validation rules
//! - Enumeration queries used by the orchestrator and the broadcast dispatcher
//!
//! Directory membership is guarded by one lock; each participant's mutable
//! attributes sit behind their own lock so that one player's update never
//! blocks another player's read. Neither lock is ever held across an await.

use crate::error::{SessionError, SessionResult};
use crate::utils::display_name;
use log::{debug, info};
use mosaic_shared::{Category, Role, TokenKind, MAX_SPECIALTIES_PER_PLAYER};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

pub type ParticipantId = String;

/// Outbound half of one live connection.
///
/// Frames are pre-serialized JSON shared between all recipients of a
/// broadcast. The `connection_id` distinguishes a reconnection from the
/// socket it replaced.
#[derive(Debug, Clone)]
pub struct Transport {
    pub connection_id: u64,
    sender: mpsc::Sender<Arc<String>>,
}

impl Transport {
    pub fn new(connection_id: u64, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Queues a frame without waiting. A full queue counts as a failed delivery.
    pub fn try_send(&self, frame: Arc<String>) -> SessionResult<()> {
        self.sender.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SessionError::Transport("outbound queue is full".into()),
            TrySendError::Closed(_) => SessionError::Transport("connection closed".into()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct ParticipantState {
    liveness: Liveness,
    role: Option<Role>,
    specialties: Vec<Category>,
    ready: bool,
    location: Option<TokenKind>,
    last_seen: Instant,
    transport: Option<Transport>,
}

/// A host or player known to the session.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub is_host: bool,
    /// Registration order, used for stable enumeration
    pub ordinal: usize,
    state: RwLock<ParticipantState>,
}

/// Point-in-time copy of a participant's attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub name: String,
    pub is_host: bool,
    pub connected: bool,
    pub role: Option<Role>,
    pub specialties: Vec<Category>,
    pub ready: bool,
    pub location: Option<TokenKind>,
    #[serde(skip)]
    pub ordinal: usize,
}

impl Participant {
    fn new(id: ParticipantId, is_host: bool, ordinal: usize, transport: Transport) -> Self {
        Self {
            name: display_name(is_host, ordinal),
            id,
            is_host,
            ordinal,
            state: RwLock::new(ParticipantState {
                liveness: Liveness::Connected,
                role: None,
                specialties: Vec::new(),
                ready: false,
                location: None,
                last_seen: Instant::now(),
                transport: Some(transport),
            }),
        }
    }

    pub fn view(&self) -> ParticipantView {
        let state = self.state.read();
        ParticipantView {
            id: self.id.clone(),
            name: self.name.clone(),
            is_host: self.is_host,
            connected: state.liveness == Liveness::Connected,
            role: state.role,
            specialties: state.specialties.clone(),
            ready: state.ready,
            location: state.location,
            ordinal: self.ordinal,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.state.read().liveness
    }

    pub fn is_connected(&self) -> bool {
        self.liveness() == Liveness::Connected
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.state
            .read()
            .transport
            .as_ref()
            .map(|transport| transport.connection_id)
    }

    /// Records inbound activity from this participant.
    pub fn touch(&self) {
        self.state.write().last_seen = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.read().last_seen.elapsed()
    }

    /// Cuts the participant off from its connection. Dropping the transport
    /// ends the writer task, which closes the socket.
    fn detach(&self) -> Option<Transport> {
        let mut state = self.state.write();
        state.liveness = Liveness::Disconnected;
        state.transport.take()
    }

    /// Hands a frame to the participant's current connection, if any.
    pub fn send(&self, frame: Arc<String>) -> SessionResult<()> {
        let transport = self.state.read().transport.clone();
        match transport {
            Some(transport) => transport.try_send(frame),
            None => Err(SessionError::Transport(format!(
                "{} has no live connection",
                self.id
            ))),
        }
    }
}

/// Availability of one role in the lobby catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAvailability {
    pub role: Role,
    pub bonus_token: TokenKind,
    pub taken: usize,
    pub capacity: usize,
    pub available: bool,
}

struct Directory {
    participants: HashMap<ParticipantId, Arc<Participant>>,
    joined: usize,
}

/// Thread-safe directory of participants.
pub struct Registry {
    directory: RwLock<Directory>,
    /// Serializes role picks so two players cannot both take the last slot
    role_gate: Mutex<()>,
    max_players: usize,
}

impl Registry {
    /// Creates an empty registry admitting at most `max_players` non-host participants.
    pub fn new(max_players: usize) -> Self {
        Self {
            directory: RwLock::new(Directory {
                participants: HashMap::new(),
                joined: 0,
            }),
            role_gate: Mutex::new(()),
            max_players,
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Adds a participant with a fresh identifier.
    ///
    /// A host claim fails while another host is connected; a player claim
    /// fails once the cap is reached. Both checks and the insert happen under
    /// the directory lock, so concurrent claims cannot both succeed.
    pub fn register(&self, is_host: bool, transport: Transport) -> SessionResult<Arc<Participant>> {
        let mut directory = self.directory.write();

        if is_host {
            let host_connected = directory
                .participants
                .values()
                .any(|p| p.is_host && p.is_connected());
            if host_connected {
                return Err(SessionError::HostTaken);
            }
        } else {
            let players = directory.participants.values().filter(|p| !p.is_host).count();
            if players >= self.max_players {
                return Err(SessionError::SessionFull(self.max_players));
            }
        }

        let ordinal = if is_host {
            0
        } else {
            directory.joined += 1;
            directory.joined
        };

        let id = Uuid::new_v4().to_string();
        let participant = Arc::new(Participant::new(id.clone(), is_host, ordinal, transport));
        directory.participants.insert(id.clone(), Arc::clone(&participant));

        info!(
            "Registered {} as {} ({} participants)",
            id,
            participant.name,
            directory.participants.len()
        );
        Ok(participant)
    }

    pub fn lookup(&self, id: &str) -> SessionResult<Arc<Participant>> {
        self.directory
            .read()
            .participants
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::not_found("participant", id))
    }

    /// Marks a participant disconnected if `connection_id` is still its live connection.
    ///
    /// Returns false when a newer connection has already replaced it, in which
    /// case nothing changes.
    pub fn suspend(&self, id: &str, connection_id: u64) -> SessionResult<bool> {
        let participant = self.lookup(id)?;
        let mut state = participant.state.write();

        let current = state.transport.as_ref().map(|t| t.connection_id);
        if current != Some(connection_id) {
            debug!(
                "Ignoring stale disconnect of {} (connection {})",
                id, connection_id
            );
            return Ok(false);
        }

        state.transport = None;
        state.liveness = Liveness::Disconnected;
        info!("{} disconnected", participant.name);
        Ok(true)
    }

    /// Attaches a new connection to an existing participant.
    ///
    /// Role, specialties, readiness and location are untouched.
    pub fn resume(&self, id: &str, transport: Transport) -> SessionResult<Arc<Participant>> {
        let participant = self.lookup(id)?;
        {
            let mut state = participant.state.write();
            state.transport = Some(transport);
            state.liveness = Liveness::Connected;
            state.last_seen = Instant::now();
        }
        info!("{} reconnected", participant.name);
        Ok(participant)
    }

    /// Drops a participant's record entirely.
    pub fn remove(&self, id: &str) -> Option<Arc<Participant>> {
        let removed = self.directory.write().participants.remove(id);
        if let Some(participant) = &removed {
            info!("Removed {} from the session", participant.name);
        }
        removed
    }

    /// Empties the directory. Connections lose their transport and close.
    ///
    /// Connection tasks still hold their participant, so the transport is
    /// taken out of each record rather than left to drop with the map.
    pub fn reset(&self) -> usize {
        let cleared: Vec<Arc<Participant>> = {
            let mut directory = self.directory.write();
            directory.joined = 0;
            directory.participants.drain().map(|(_, p)| p).collect()
        };
        for participant in &cleared {
            if participant.detach().is_some() {
                debug!("Closed connection of {}", participant.name);
            }
        }
        cleared.len()
    }

    fn collect(&self, filter: impl Fn(&Participant) -> bool) -> Vec<Arc<Participant>> {
        let mut selected: Vec<Arc<Participant>> = self
            .directory
            .read()
            .participants
            .values()
            .filter(|p| filter(p))
            .cloned()
            .collect();
        selected.sort_by_key(|p| p.ordinal);
        selected
    }

    pub fn all(&self) -> Vec<Arc<Participant>> {
        self.collect(|_| true)
    }

    pub fn connected(&self) -> Vec<Arc<Participant>> {
        self.collect(|p| p.is_connected())
    }

    /// Every player record, connected or not. Excludes the host.
    pub fn players(&self) -> Vec<Arc<Participant>> {
        self.collect(|p| !p.is_host)
    }

    pub fn connected_players(&self) -> Vec<Arc<Participant>> {
        self.collect(|p| !p.is_host && p.is_connected())
    }

    pub fn ready_players(&self) -> Vec<Arc<Participant>> {
        self.collect(|p| !p.is_host && p.is_connected() && p.state.read().ready)
    }

    pub fn connected_host(&self) -> Option<Arc<Participant>> {
        self.collect(|p| p.is_host && p.is_connected()).into_iter().next()
    }

    pub fn views(&self) -> Vec<ParticipantView> {
        self.all().iter().map(|p| p.view()).collect()
    }

    pub fn player_views(&self) -> Vec<ParticipantView> {
        self.players().iter().map(|p| p.view()).collect()
    }

    /// Number of players holding each role.
    pub fn role_distribution(&self) -> HashMap<Role, usize> {
        let mut counts = HashMap::new();
        for player in self.players() {
            if let Some(role) = player.state.read().role {
                *counts.entry(role).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Per-role slots: a quarter of the players, rounded up, at least one.
    pub fn role_capacity(&self) -> usize {
        self.players().len().div_ceil(4).max(1)
    }

    pub fn available_roles(&self) -> Vec<RoleAvailability> {
        let capacity = self.role_capacity();
        let distribution = self.role_distribution();
        Role::ALL
            .iter()
            .map(|role| {
                let taken = distribution.get(role).copied().unwrap_or(0);
                RoleAvailability {
                    role: *role,
                    bonus_token: role.bonus_token(),
                    taken,
                    capacity,
                    available: taken < capacity,
                }
            })
            .collect()
    }

    fn player(&self, id: &str, action: &str) -> SessionResult<Arc<Participant>> {
        let participant = self.lookup(id)?;
        if participant.is_host {
            return Err(SessionError::forbidden(format!("the host cannot {}", action)));
        }
        Ok(participant)
    }

    pub fn set_role(&self, id: &str, role: Role) -> SessionResult<()> {
        let participant = self.player(id, "select a role")?;
        let _gate = self.role_gate.lock();

        if participant.state.read().role == Some(role) {
            return Ok(());
        }

        let taken = self.role_distribution().get(&role).copied().unwrap_or(0);
        if taken >= self.role_capacity() {
            return Err(SessionError::validation(format!(
                "role {} is not available",
                role
            )));
        }

        participant.state.write().role = Some(role);
        debug!("{} selected role {}", participant.name, role);
        Ok(())
    }

    pub fn set_specialties(&self, id: &str, specialties: &[Category]) -> SessionResult<()> {
        let participant = self.player(id, "select specialties")?;

        if specialties.is_empty() || specialties.len() > MAX_SPECIALTIES_PER_PLAYER {
            return Err(SessionError::validation(format!(
                "select between 1 and {} specialties",
                MAX_SPECIALTIES_PER_PLAYER
            )));
        }
        if specialties.len() == 2 && specialties[0] == specialties[1] {
            return Err(SessionError::validation("duplicate specialty"));
        }

        participant.state.write().specialties = specialties.to_vec();
        Ok(())
    }

    pub fn set_ready(&self, id: &str, ready: bool) -> SessionResult<()> {
        let participant = self.player(id, "toggle readiness")?;
        participant.state.write().ready = ready;
        Ok(())
    }

    /// Records the station a player scanned and returns its token type.
    pub fn set_location(&self, id: &str, station_hash: &str) -> SessionResult<TokenKind> {
        let participant = self.player(id, "verify a location")?;
        let kind = TokenKind::from_station_hash(station_hash)
            .ok_or_else(|| SessionError::validation("unknown resource station"))?;
        participant.state.write().location = Some(kind);
        Ok(kind)
    }

    pub fn len(&self) -> usize {
        self.directory.read().participants.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.directory.read().participants.is_empty()
    }
}
