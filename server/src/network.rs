//! Connection gateway: the only code that touches websockets.
//!
//! Each accepted connection gets two tasks. The writer drains the
//! participant's outbound queue and sends heartbeat pings; the reader parses
//! inbound frames in arrival order and routes them to the orchestrator. When
//! either task ends, the other is torn down and disconnect handling runs once.
//!
//! Admission happens before the upgrade, so a rejected handshake never becomes
//! a websocket.

use crate::broadcast::Dispatcher;
use crate::config::GameTimings;
use crate::error::{SessionError, SessionResult};
use crate::orchestrator::Orchestrator;
use crate::registry::{Participant, Registry, Transport};
use crate::status;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use mosaic_shared::protocol::{
    AuthenticatedPayload, Envelope, FragmentMoveRequest, HostStartGame, InboundKind,
    LocationVerified, ReadyToggle, RecommendationRequest, RecommendationResponse, RoleSelection,
    SegmentCompleted, SpecialtySelection, TriviaAnswer,
};
use mosaic_shared::{Category, Difficulty, Role, CONNECTION_QUEUE_CAPACITY, MAX_MESSAGE_BYTES};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "playerId")]
    pub player_id: Option<String>,
}

/// Shared state behind every HTTP and websocket handler.
pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    host_token: String,
    origins: Vec<String>,
    next_connection: AtomicU64,
    started_at: Instant,
}

impl Gateway {
    pub fn new(orchestrator: Arc<Orchestrator>, host_token: String, origins: Vec<String>) -> Self {
        Self {
            orchestrator,
            host_token,
            origins,
            next_connection: AtomicU64::new(1),
            started_at: Instant::now(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    fn registry(&self) -> &Arc<Registry> {
        self.orchestrator.registry()
    }

    fn dispatcher(&self) -> &Dispatcher {
        self.orchestrator.dispatcher()
    }

    fn timings(&self) -> &GameTimings {
        self.orchestrator.timings()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Requests without an Origin header come from non-browser clients and are let through.
    pub fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if self.origins.is_empty() {
            return true;
        }
        match headers.get(header::ORIGIN).and_then(|value| value.to_str().ok()) {
            Some(origin) => self.origins.iter().any(|allowed| allowed == origin),
            None => true,
        }
    }

    /// Resumes a known participant or registers a new one.
    ///
    /// Returns the participant and whether this was a reconnection. An
    /// unknown or mismatched identifier falls back to a fresh registration.
    pub async fn admit(
        &self,
        requested: Option<&str>,
        wants_host: bool,
        transport: Transport,
    ) -> SessionResult<(Arc<Participant>, bool)> {
        if let Some(id) = requested.filter(|id| !id.is_empty()) {
            match self.registry().lookup(id) {
                Ok(existing) if existing.is_host == wants_host => {
                    let participant = self.registry().resume(id, transport)?;
                    return Ok((participant, true));
                }
                Ok(_) => debug!("{} tried to resume through the wrong endpoint", id),
                Err(_) => debug!("Unknown participant {}, registering fresh", id),
            }
        }

        let participant = if wants_host {
            self.registry().register(true, transport)?
        } else {
            self.orchestrator.register_player(transport).await?
        };
        Ok((participant, false))
    }

    async fn accept(
        self: Arc<Self>,
        ws: WebSocketUpgrade,
        headers: &HeaderMap,
        requested: Option<String>,
        wants_host: bool,
    ) -> Response {
        if !self.origin_allowed(headers) {
            warn!("Refused websocket from disallowed origin {:?}", headers.get(header::ORIGIN));
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }

        let connection_id = self.next_connection_id();
        let (sender, outbound) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let transport = Transport::new(connection_id, sender);

        let (participant, resumed) =
            match self.admit(requested.as_deref(), wants_host, transport).await {
                Ok(admitted) => admitted,
                Err(e) => {
                    warn!("Rejected connection {}: {}", connection_id, e);
                    return (rejection_status(&e), e.to_string()).into_response();
                }
            };

        let failed = Arc::clone(&self);
        let failed_id = participant.id.clone();
        ws.max_message_size(MAX_MESSAGE_BYTES)
            .on_failed_upgrade(move |e| {
                warn!("Websocket upgrade failed for {}: {}", failed_id, e);
                failed.release(&failed_id, connection_id);
            })
            .on_upgrade(move |socket| {
                self.run_connection(socket, participant, connection_id, outbound, resumed)
            })
    }

    /// Synchronous part of disconnect handling: suspend, and free the host slot.
    ///
    /// Returns false when the connection was already superseded or the
    /// participant is gone.
    fn release(&self, participant_id: &str, connection_id: u64) -> bool {
        match self.registry().suspend(participant_id, connection_id) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(_) => {
                debug!("{} already left the session", participant_id);
                return false;
            }
        }

        if let Ok(participant) = self.registry().lookup(participant_id) {
            if participant.is_host {
                self.registry().remove(participant_id);
                info!("Host slot freed");
            }
        }
        true
    }

    async fn run_connection(
        self: Arc<Self>,
        socket: WebSocket,
        participant: Arc<Participant>,
        connection_id: u64,
        mut outbound: mpsc::Receiver<Arc<String>>,
        resumed: bool,
    ) {
        info!(
            "{} ({}) connected on connection {}{}",
            participant.name,
            participant.id,
            connection_id,
            if resumed { ", resumed" } else { "" }
        );
        let (mut sink, mut stream) = socket.split();

        let ping_interval = self.timings().ping_interval;
        let mut writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(ping_interval);
            // Skip the first tick since it fires immediately
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            if sink.send(Message::Text(frame.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Transport dropped by a reset
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.orchestrator.welcome(&participant, resumed).await;

        let pong_timeout = self.timings().pong_timeout;
        let gateway = Arc::clone(&self);
        let reader_participant = Arc::clone(&participant);
        let mut reader = tokio::spawn(async move {
            let participant = reader_participant;
            loop {
                let next = match tokio::time::timeout(pong_timeout, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(
                            "{} timed out after {}s idle",
                            participant.name,
                            participant.idle_for().as_secs()
                        );
                        break;
                    }
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        participant.touch();
                        gateway.handle_text(&participant, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        participant.touch();
                        let err = SessionError::validation("binary frames are not supported");
                        gateway.dispatcher().send_error(&participant.id, &err).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => participant.touch(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Read error from {}: {}", participant.name, e);
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut writer => reader.abort(),
            _ = &mut reader => writer.abort(),
        }
        self.handle_disconnect(&participant.id, connection_id).await;
    }

    /// Runs once per connection when it closes.
    pub async fn handle_disconnect(&self, participant_id: &str, connection_id: u64) {
        if !self.release(participant_id, connection_id) {
            return;
        }
        self.orchestrator.handle_departure(participant_id).await;
        self.orchestrator.lobby_status().await;
    }

    /// Routes one inbound frame; failures go back to the sender only.
    pub async fn handle_text(&self, participant: &Participant, text: &str) {
        if let Err(e) = self.route(participant, text).await {
            debug!("Rejected message from {}: {}", participant.name, e);
            self.dispatcher().send_error(&participant.id, &e).await;
        }
    }

    async fn route(&self, participant: &Participant, text: &str) -> SessionResult<()> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(SessionError::validation(format!(
                "message exceeds {} bytes",
                MAX_MESSAGE_BYTES
            )));
        }

        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = InboundKind::from_tag(&envelope.kind).ok_or_else(|| {
            SessionError::validation(format!("unknown message type {}", envelope.kind))
        })?;
        let wrapped: AuthenticatedPayload = serde_json::from_value(envelope.payload)?;
        if wrapped.auth.participant_id != participant.id {
            return Err(SessionError::forbidden(
                "claimed identity does not match this connection",
            ));
        }

        let id = participant.id.as_str();
        let payload = wrapped.payload;
        debug!("{} sent {}", participant.name, kind.as_str());

        match kind {
            InboundKind::RoleSelection => {
                let request: RoleSelection = serde_json::from_value(payload)?;
                let role: Role = request.role.parse()?;
                self.orchestrator.select_role(id, role).await?;
            }
            InboundKind::SpecialtySelection => {
                let request: SpecialtySelection = serde_json::from_value(payload)?;
                let specialties = request
                    .specialties
                    .iter()
                    .map(|name| name.parse::<Category>())
                    .collect::<Result<Vec<_>, _>>()?;
                self.orchestrator.select_specialties(id, &specialties).await?;
            }
            InboundKind::PlayerReady => {
                let request: ReadyToggle = serde_json::from_value(payload)?;
                self.orchestrator.set_ready(id, request.ready).await?;
            }
            InboundKind::LocationVerified => {
                let request: LocationVerified = serde_json::from_value(payload)?;
                let station = self
                    .orchestrator
                    .verify_location(id, &request.verified_hash)
                    .await?;
                info!("{} verified the {} station", participant.name, station);
            }
            InboundKind::TriviaAnswer => {
                let request: TriviaAnswer = serde_json::from_value(payload)?;
                self.orchestrator.submit_answer(id, &request).await?;
            }
            InboundKind::SegmentCompleted => {
                let request: SegmentCompleted = serde_json::from_value(payload)?;
                self.orchestrator.complete_segment(id, &request).await?;
            }
            InboundKind::FragmentMoveRequest => {
                let request: FragmentMoveRequest = serde_json::from_value(payload)?;
                self.orchestrator.move_fragment(id, &request).await?;
            }
            InboundKind::HostStartGame => {
                let request: HostStartGame = if payload.is_null() {
                    HostStartGame::default()
                } else {
                    serde_json::from_value(payload)?
                };
                let difficulty = request
                    .difficulty
                    .map(|name| name.parse::<Difficulty>())
                    .transpose()?;
                self.orchestrator.start(id, difficulty).await?;
            }
            InboundKind::HostStartPuzzle => {
                self.orchestrator.start_timer(id).await?;
            }
            InboundKind::RecommendationRequest => {
                let request: RecommendationRequest = serde_json::from_value(payload)?;
                self.orchestrator.recommend(id, &request).await?;
            }
            InboundKind::RecommendationResponse => {
                let request: RecommendationResponse = serde_json::from_value(payload)?;
                self.orchestrator.respond(id, &request).await?;
            }
        }
        Ok(())
    }
}

fn rejection_status(err: &SessionError) -> StatusCode {
    if !err.is_admission_failure() {
        return StatusCode::BAD_REQUEST;
    }
    match err {
        SessionError::SessionFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::CONFLICT,
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET])
}

/// Websocket and status routes.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = cors_layer(&gateway.origins);
    Router::new()
        .route("/ws", get(player_socket))
        .route("/ws/host/{token}", get(host_socket))
        .route("/health", get(status::health))
        .route("/stats", get(status::stats))
        .with_state(gateway)
        .layer(cors)
}

async fn player_socket(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    gateway.accept(ws, &headers, query.player_id, false).await
}

async fn host_socket(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Path(token): Path<String>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    if token != gateway.host_token {
        warn!("Refused host connection with an invalid token");
        return (StatusCode::FORBIDDEN, "invalid host token").into_response();
    }
    gateway.accept(ws, &headers, query.player_id, true).await
}

/// Builds the `{auth, payload}` wrapper clients put around inbound payloads.
pub fn wrap_inbound(kind: InboundKind, participant_id: &str, payload: Value) -> Envelope {
    Envelope::new(
        kind.as_str(),
        serde_json::json!({ "auth": { "playerId": participant_id }, "payload": payload }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::trivia::QuestionBank;
    use mosaic_shared::Phase;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Fixture {
        gateway: Arc<Gateway>,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(origins: Vec<String>) -> Fixture {
        let registry = Arc::new(Registry::new(8));
        let (dispatcher, _) = Dispatcher::spawn(Arc::clone(&registry), 64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            dispatcher,
            Arc::new(QuestionBank::new()),
            SessionSettings::default(),
            shutdown_rx,
        ));
        Fixture {
            gateway: Arc::new(Gateway::new(orchestrator, "secret".into(), origins)),
            _shutdown: shutdown_tx,
        }
    }

    fn transport(gateway: &Gateway) -> (Transport, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        (Transport::new(gateway.next_connection_id(), tx), rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Arc<String>>, kind: &str) -> Value {
        let found = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(frame) = rx.recv().await {
                let value: Value = serde_json::from_str(&frame).unwrap();
                if value["type"] == kind {
                    return Some(value);
                }
            }
            None
        })
        .await;
        found.ok().flatten().unwrap_or_else(|| panic!("no {} message", kind))
    }

    #[tokio::test]
    async fn test_admit_registers_then_resumes() {
        let f = fixture(Vec::new());
        let (first, _rx) = transport(&f.gateway);
        let (player, resumed) = f.gateway.admit(None, false, first).await.unwrap();
        assert!(!resumed);
        assert_eq!(player.name, "Player1");

        let (second, _rx2) = transport(&f.gateway);
        let (again, resumed) = f
            .gateway
            .admit(Some(&player.id), false, second)
            .await
            .unwrap();
        assert!(resumed);
        assert_eq!(again.id, player.id);

        let (third, _rx3) = transport(&f.gateway);
        let (fresh, resumed) = f
            .gateway
            .admit(Some("no-such-player"), false, third)
            .await
            .unwrap();
        assert!(!resumed);
        assert_ne!(fresh.id, player.id);
    }

    #[tokio::test]
    async fn test_second_host_is_rejected() {
        let f = fixture(Vec::new());
        let (first, _rx) = transport(&f.gateway);
        f.gateway.admit(None, true, first).await.unwrap();

        let (second, _rx2) = transport(&f.gateway);
        let err = f.gateway.admit(None, true, second).await.unwrap_err();
        assert!(matches!(err, SessionError::HostTaken));
        assert_eq!(rejection_status(&err), StatusCode::CONFLICT);
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            rejection_status(&SessionError::NotAccepting(Phase::Assembly)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            rejection_status(&SessionError::SessionFull(64)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            rejection_status(&SessionError::validation("bad query")),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_host_disconnect_frees_slot() {
        let f = fixture(Vec::new());
        let (first, _rx) = transport(&f.gateway);
        let connection_id = first.connection_id;
        let (host, _) = f.gateway.admit(None, true, first).await.unwrap();

        f.gateway.handle_disconnect(&host.id, connection_id).await;
        assert!(f.gateway.registry().lookup(&host.id).is_err());

        let (second, _rx2) = transport(&f.gateway);
        assert!(f.gateway.admit(None, true, second).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let f = fixture(Vec::new());
        let (first, _rx) = transport(&f.gateway);
        let stale_id = first.connection_id;
        let (player, _) = f.gateway.admit(None, false, first).await.unwrap();

        let (second, _rx2) = transport(&f.gateway);
        f.gateway
            .admit(Some(&player.id), false, second)
            .await
            .unwrap();

        f.gateway.handle_disconnect(&player.id, stale_id).await;
        assert!(player.is_connected());
    }

    fn count_kind(rx: &mut mpsc::Receiver<Arc<String>>, kind: &str) -> usize {
        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            let value: Value = serde_json::from_str(&frame).unwrap();
            if value["type"] == kind {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_repeated_disconnect_runs_once() {
        let f = fixture(Vec::new());
        let (observer_transport, mut observer_rx) = transport(&f.gateway);
        f.gateway.admit(None, false, observer_transport).await.unwrap();
        let (first, _rx) = transport(&f.gateway);
        let connection_id = first.connection_id;
        let (player, _) = f.gateway.admit(None, false, first).await.unwrap();

        f.gateway.dispatcher().flush().await;
        count_kind(&mut observer_rx, "game_lobby_status");

        // Reader and writer teardown can both report the same connection
        f.gateway.handle_disconnect(&player.id, connection_id).await;
        f.gateway.dispatcher().flush().await;
        let status = count_kind(&mut observer_rx, "game_lobby_status");
        assert_eq!(status, 1);
        assert!(!player.is_connected());

        f.gateway.handle_disconnect(&player.id, connection_id).await;
        f.gateway.dispatcher().flush().await;
        assert_eq!(count_kind(&mut observer_rx, "game_lobby_status"), 0);
    }

    #[tokio::test]
    async fn test_mismatched_identity_is_reported() {
        let f = fixture(Vec::new());
        let (t, mut rx) = transport(&f.gateway);
        let (player, _) = f.gateway.admit(None, false, t).await.unwrap();

        let frame = wrap_inbound(
            InboundKind::RoleSelection,
            "someone-else",
            json!({ "role": "detective" }),
        );
        f.gateway
            .handle_text(&player, &serde_json::to_string(&frame).unwrap())
            .await;

        let error = next_message(&mut rx, "error").await;
        assert_eq!(error["payload"]["kind"], "forbidden");
        assert!(player.view().role.is_none());
    }

    #[tokio::test]
    async fn test_role_selection_is_routed() {
        let f = fixture(Vec::new());
        let (t, mut rx) = transport(&f.gateway);
        let (player, _) = f.gateway.admit(None, false, t).await.unwrap();

        let frame = wrap_inbound(
            InboundKind::RoleSelection,
            &player.id,
            json!({ "role": "detective" }),
        );
        f.gateway
            .handle_text(&player, &serde_json::to_string(&frame).unwrap())
            .await;

        next_message(&mut rx, "game_lobby_status").await;
        assert_eq!(player.view().role, Some(Role::Detective));
    }

    #[tokio::test]
    async fn test_malformed_frames_get_validation_errors() {
        let f = fixture(Vec::new());
        let (t, mut rx) = transport(&f.gateway);
        let (player, _) = f.gateway.admit(None, false, t).await.unwrap();

        f.gateway.handle_text(&player, "not json").await;
        let error = next_message(&mut rx, "error").await;
        assert_eq!(error["payload"]["kind"], "validation");

        let unknown = json!({ "type": "available_roles", "payload": {} }).to_string();
        f.gateway.handle_text(&player, &unknown).await;
        let error = next_message(&mut rx, "error").await;
        assert_eq!(error["payload"]["kind"], "validation");

        let frame = wrap_inbound(InboundKind::RoleSelection, &player.id, json!({ "role": "pilot" }));
        f.gateway
            .handle_text(&player, &serde_json::to_string(&frame).unwrap())
            .await;
        let error = next_message(&mut rx, "error").await;
        assert_eq!(error["payload"]["kind"], "validation");
    }

    #[tokio::test]
    async fn test_start_from_player_is_forbidden() {
        let f = fixture(Vec::new());
        let (t, mut rx) = transport(&f.gateway);
        let (player, _) = f.gateway.admit(None, false, t).await.unwrap();

        let frame = wrap_inbound(InboundKind::HostStartGame, &player.id, Value::Null);
        f.gateway
            .handle_text(&player, &serde_json::to_string(&frame).unwrap())
            .await;

        let error = next_message(&mut rx, "error").await;
        assert_eq!(error["payload"]["kind"], "forbidden");
        assert_eq!(f.gateway.orchestrator().phase().await, Phase::Setup);
    }

    #[tokio::test]
    async fn test_origin_allowlist() {
        let f = fixture(vec!["https://party.example".to_string()]);

        let mut headers = HeaderMap::new();
        assert!(f.gateway.origin_allowed(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://party.example"));
        assert!(f.gateway.origin_allowed(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(!f.gateway.origin_allowed(&headers));
    }
}
