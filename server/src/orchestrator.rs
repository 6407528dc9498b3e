//! Drives the session through its phases.
//!
//! The orchestrator owns the [`SessionState`] behind one async lock. Every
//! mutation takes the write lock, computes the envelopes it needs to send,
//! and releases the lock before anything is queued on the dispatcher.
//!
//! Timer driven work (the round loop, the assembly clock, the post-game
//! countdown) runs on spawned tasks that carry the epoch they were started
//! for. A task whose epoch no longer matches the state, or whose phase has
//! moved on, stops without touching anything. The shutdown flag is observed at
//! every wait.

use crate::analytics::GameReport;
use crate::broadcast::{Dispatcher, Envelope};
use crate::config::{GameTimings, SessionSettings};
use crate::error::{SessionError, SessionResult};
use crate::game::{
    AnswerOutcome, MoveOutcome, MoveRecord, Outcome, ProgressSnapshot, PuzzleSnapshot,
    Recommendation, SessionState,
};
use crate::phase::Action;
use crate::puzzle;
use crate::registry::{Participant, ParticipantView, Registry, Transport};
use crate::trivia::{QuestionProvider, QuestionRequest};
use crate::utils::get_timestamp;
use log::{debug, info, warn};
use mosaic_shared::protocol::{
    FragmentMoveRequest, OutboundKind, RecommendationRequest, RecommendationResponse,
    SegmentCompleted, TriviaAnswer,
};
use mosaic_shared::{
    Category, Difficulty, GridPos, Phase, Role, TokenKind, AVAILABLE_PUZZLE_IMAGES,
    GUIDE_HIGHLIGHT_COVERAGE, MAX_TOKEN_THRESHOLDS,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;

const RECENT_MOVES: usize = 10;

/// Result of the start precondition check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
}

impl Eligibility {
    fn ready() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CentralState<'a> {
    #[serde(flatten)]
    puzzle: &'a PuzzleSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    recent_moves: Option<Vec<MoveRecord>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostSummary<'a> {
    #[serde(flatten)]
    report: &'a GameReport,
    outcome: Outcome,
    move_log: &'a [MoveRecord],
    puzzle: PuzzleSnapshot,
}

/// Everything announced when the assembly ends.
struct Conclusion {
    epoch: u64,
    outcome: Outcome,
    report: GameReport,
    host_summary: Value,
}

pub struct Orchestrator {
    state: RwLock<SessionState>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    questions: Arc<dyn QuestionProvider>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        questions: Arc<dyn QuestionProvider>,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: RwLock::new(SessionState::new(0, settings.default_difficulty)),
            registry,
            dispatcher,
            questions,
            settings,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn timings(&self) -> &GameTimings {
        &self.settings.timings
    }

    pub fn question_count(&self) -> usize {
        self.questions.question_count()
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase()
    }

    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch()
    }

    /// Runs `f` against a point-in-time view of the session.
    pub async fn snapshot<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.state.read().await.epoch() == epoch
    }

    /// Sleeps for `duration` unless shutdown is signalled first.
    async fn pause(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn round_span(&self) -> Duration {
        self.settings.timings.question_interval * self.settings.timings.questions_per_round()
    }

    fn connected_player_views(&self) -> Vec<ParticipantView> {
        self.registry
            .connected_players()
            .iter()
            .map(|p| p.view())
            .collect()
    }

    // ---- Setup ----

    /// Registers a fresh player. Joining is only open during setup.
    ///
    /// The state lock is held across the insert so a concurrent start cannot
    /// slip in between the phase check and the registration.
    pub async fn register_player(&self, transport: Transport) -> SessionResult<Arc<Participant>> {
        let state = self.state.read().await;
        if state.phase() != Phase::Setup {
            return Err(SessionError::NotAccepting(state.phase()));
        }
        self.registry.register(false, transport)
    }

    /// Whether the host could start right now, and if not, why.
    pub fn can_start(&self) -> Eligibility {
        if self.registry.connected_host().is_none() {
            return Eligibility::blocked("Waiting for the host to connect");
        }

        let players = self.connected_player_views();
        if players.len() < self.settings.min_players {
            return Eligibility::blocked(format!(
                "Waiting for {} more players",
                self.settings.min_players - players.len()
            ));
        }

        for player in &players {
            if player.role.is_none() {
                return Eligibility::blocked(format!("{} has not chosen a role", player.name));
            }
            if player.specialties.is_empty() {
                return Eligibility::blocked(format!(
                    "{} has not chosen a specialty",
                    player.name
                ));
            }
            if !player.ready {
                return Eligibility::blocked(format!("{} is not ready", player.name));
            }
        }
        Eligibility::ready()
    }

    pub async fn select_role(&self, participant_id: &str, role: Role) -> SessionResult<()> {
        {
            let state = self.state.read().await;
            state.guard(Action::ConfigureParticipant)?;
            self.registry.set_role(participant_id, role)?;
        }
        self.dispatcher
            .broadcast(
                OutboundKind::AvailableRoles,
                json!({ "roles": self.registry.available_roles() }),
            )
            .await;
        self.lobby_status().await;
        Ok(())
    }

    /// Stores the specialties and marks the player ready.
    pub async fn select_specialties(
        &self,
        participant_id: &str,
        specialties: &[Category],
    ) -> SessionResult<()> {
        {
            let state = self.state.read().await;
            state.guard(Action::ConfigureParticipant)?;
            self.registry.set_specialties(participant_id, specialties)?;
            self.registry.set_ready(participant_id, true)?;
        }
        self.lobby_status().await;
        Ok(())
    }

    pub async fn set_ready(&self, participant_id: &str, ready: bool) -> SessionResult<()> {
        {
            let state = self.state.read().await;
            state.guard(Action::ConfigureParticipant)?;
            self.registry.set_ready(participant_id, ready)?;
        }
        self.lobby_status().await;
        Ok(())
    }

    pub async fn verify_location(
        &self,
        participant_id: &str,
        station_hash: &str,
    ) -> SessionResult<TokenKind> {
        let kind = {
            let state = self.state.read().await;
            state.guard(Action::VerifyLocation)?;
            self.registry.set_location(participant_id, station_hash)?
        };
        debug!("{} is at the {} station", participant_id, kind);
        self.host_update().await;
        Ok(kind)
    }

    /// Host-only. Leaves setup and spawns the round loop.
    pub async fn start(
        self: &Arc<Self>,
        requester: &str,
        difficulty: Option<Difficulty>,
    ) -> SessionResult<()> {
        let host = self.registry.lookup(requester)?;
        if !host.is_host {
            return Err(SessionError::forbidden("only the host can start the game"));
        }

        let now = get_timestamp();
        let (epoch, players) = {
            let mut state = self.state.write().await;
            state.guard(Action::StartGame)?;

            let eligibility = self.can_start();
            if !eligibility.eligible {
                return Err(SessionError::NotEligible(
                    eligibility.reason.unwrap_or_default(),
                ));
            }
            if let Some(difficulty) = difficulty {
                state.set_difficulty(difficulty)?;
            }

            let players = self.connected_player_views();
            state.begin(&players, now)?;
            (state.epoch(), players.len())
        };

        info!("Game started with {} players (session {})", players, epoch);
        tokio::spawn(Arc::clone(self).run_rounds(epoch));
        self.host_update().await;
        Ok(())
    }

    // ---- Resource gathering ----

    async fn run_rounds(self: Arc<Self>, epoch: u64) {
        let timings = self.settings.timings;
        let per_round = timings.questions_per_round();

        for round in 1..=timings.rounds {
            let now = get_timestamp();
            let difficulty = {
                let mut state = self.state.write().await;
                if state.epoch() != epoch {
                    return;
                }
                if let Err(e) = state.begin_round(round, now) {
                    debug!("Round loop for session {} stopped: {}", epoch, e);
                    return;
                }
                state.difficulty()
            };

            info!("Resource gathering round {}/{} started", round, timings.rounds);
            self.dispatcher
                .broadcast(
                    OutboundKind::ResourcePhaseStart,
                    self.round_payload(round, difficulty),
                )
                .await;
            self.host_update().await;

            for _ in 0..per_round {
                if !self.is_current(epoch).await {
                    return;
                }
                self.dispatch_questions(epoch).await;
                self.broadcast_progress().await;
                if !self.pause(timings.question_interval).await {
                    debug!("Round loop for session {} interrupted by shutdown", epoch);
                    return;
                }
            }
        }

        self.enter_assembly(epoch).await;
    }

    fn round_payload(&self, round: u32, difficulty: Difficulty) -> Value {
        let stations: Vec<Value> = TokenKind::ALL
            .iter()
            .map(|kind| json!({ "tokenType": kind, "hash": kind.station_hash() }))
            .collect();
        json!({
            "round": round,
            "totalRounds": self.settings.timings.rounds,
            "roundDurationSecs": self.round_span().as_secs(),
            "questionIntervalSecs": self.settings.timings.question_interval.as_secs(),
            "difficulty": difficulty,
            "stations": stations,
        })
    }

    /// Sends each connected player their next question.
    async fn dispatch_questions(&self, epoch: u64) {
        let players = self.connected_player_views();
        let mut outgoing = Vec::with_capacity(players.len());
        {
            let mut state = self.state.write().await;
            if state.epoch() != epoch || state.phase() != Phase::ResourceGathering {
                return;
            }
            let difficulty = state.difficulty();

            for player in &players {
                let asked = state.question_history(&player.id);
                let request = QuestionRequest {
                    difficulty,
                    specialties: &player.specialties,
                    asked: &asked,
                };
                match self.questions.next_question(&request) {
                    Ok(question) => match state.assign_question(&player.id, question.clone()) {
                        Ok(()) => outgoing.push((player.id.clone(), question)),
                        Err(e) => warn!("Could not assign a question to {}: {}", player.name, e),
                    },
                    Err(e) => warn!("No question available for {}: {}", player.name, e),
                }
            }
        }

        debug!("Dispatching {} trivia questions", outgoing.len());
        for (id, question) in outgoing {
            self.dispatcher
                .send_to(&id, OutboundKind::TriviaQuestion, json!(question))
                .await;
        }
    }

    async fn broadcast_progress(&self) {
        let progress = self.state.read().await.progress(get_timestamp());
        self.dispatcher
            .broadcast(OutboundKind::TeamProgress, json!(progress))
            .await;
    }

    pub async fn submit_answer(
        &self,
        participant_id: &str,
        answer: &TriviaAnswer,
    ) -> SessionResult<AnswerOutcome> {
        let view = self.registry.lookup(participant_id)?.view();
        let (outcome, progress) = {
            let mut state = self.state.write().await;
            let questions = &self.questions;
            let outcome = state.submit_answer(&view, &answer.question_id, |question| {
                questions.is_correct(question, &answer.answer)
            })?;
            (outcome, state.progress(get_timestamp()))
        };

        info!(
            "{} answered {}: correct={}, {} {} tokens",
            view.name, answer.question_id, outcome.correct, outcome.awarded, outcome.token
        );

        self.dispatcher
            .send_to(
                participant_id,
                OutboundKind::TeamProgress,
                progress_with_answer(&progress, &answer.question_id, &outcome),
            )
            .await;

        let answered_by = participant_id.to_string();
        self.dispatcher
            .enqueue(Envelope::filtered(
                OutboundKind::TeamProgress,
                json!(progress),
                move |view| view.id != answered_by,
            ))
            .await;
        self.host_update().await;
        Ok(outcome)
    }

    // ---- Assembly ----

    async fn enter_assembly(&self, epoch: u64) {
        let players = self.connected_player_views();
        let image = puzzle::puzzle_image(rand::thread_rng().gen_range(1..=AVAILABLE_PUZZLE_IMAGES));
        let now = get_timestamp();

        let (plan, highlights, puzzle_state) = {
            let mut state = self.state.write().await;
            if state.epoch() != epoch {
                return;
            }
            let plan = match state.enter_assembly(&players, image, now) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("Could not enter assembly: {}", e);
                    return;
                }
            };
            let highlights: Vec<Envelope> = plan
                .assignments
                .iter()
                .filter_map(|a| highlight_envelope(&state, &a.participant_id))
                .collect();
            (plan, highlights, puzzle_envelopes(&state))
        };

        info!(
            "Assembly started: {}x{} grid, image {}, {} fragments pre-solved",
            plan.grid_size,
            plan.grid_size,
            plan.puzzle_image,
            plan.assignments.iter().filter(|a| a.pre_solved).count()
        );

        if plan.preview_secs > 0 {
            self.dispatcher
                .broadcast(
                    OutboundKind::ImagePreview,
                    json!({ "imageId": plan.puzzle_image, "duration": plan.preview_secs }),
                )
                .await;
        }

        for assignment in &plan.assignments {
            self.dispatcher
                .send_to(
                    &assignment.participant_id,
                    OutboundKind::PuzzlePhaseLoad,
                    json!({
                        "imageId": plan.puzzle_image,
                        "segmentId": assignment.segment_id,
                        "fragmentId": assignment.fragment_id,
                        "gridSize": plan.grid_size,
                        "preSolved": assignment.pre_solved,
                    }),
                )
                .await;
        }
        self.dispatcher
            .enqueue(Envelope::to_host(
                OutboundKind::PuzzlePhaseLoad,
                json!({
                    "imageId": plan.puzzle_image,
                    "gridSize": plan.grid_size,
                    "isHost": true,
                    "playerCount": plan.assignments.len(),
                    "thresholds": plan.thresholds,
                }),
            ))
            .await;

        for envelope in highlights.into_iter().chain(puzzle_state) {
            self.dispatcher.enqueue(envelope).await;
        }
        self.host_update().await;
    }

    /// Host-only. Starts the assembly clock and reveals unassigned fragments.
    ///
    /// Returns the total seconds available.
    pub async fn start_timer(self: &Arc<Self>, requester: &str) -> SessionResult<u64> {
        let host = self.registry.lookup(requester)?;
        if !host.is_host {
            return Err(SessionError::forbidden(
                "only the host can start the puzzle timer",
            ));
        }

        let now = get_timestamp();
        let (total_secs, epoch, puzzle_state, conclusion) = {
            let mut state = self.state.write().await;
            let total_secs = state.start_timer(self.settings.timings.assembly_base.as_secs(), now)?;
            // Every player fragment may already be pre-solved
            let conclusion = if state.is_puzzle_complete() {
                self.finish_locked(&mut state, Outcome::Solved, now)
            } else {
                None
            };
            (total_secs, state.epoch(), puzzle_envelopes(&state), conclusion)
        };

        info!("Puzzle timer started: {} seconds", total_secs);
        self.dispatcher
            .broadcast(
                OutboundKind::PuzzlePhaseStart,
                json!({ "startTimestamp": now, "totalTime": total_secs }),
            )
            .await;
        for envelope in puzzle_state {
            self.dispatcher.enqueue(envelope).await;
        }

        match conclusion {
            Some(conclusion) => self.announce(conclusion).await,
            None => {
                tokio::spawn(
                    Arc::clone(self).run_assembly_clock(epoch, Duration::from_secs(total_secs)),
                );
                self.host_update().await;
            }
        }
        Ok(total_secs)
    }

    async fn run_assembly_clock(self: Arc<Self>, epoch: u64, total: Duration) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return;
        }

        let deadline = tokio::time::sleep(total);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.settings.timings.progress_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let now = get_timestamp();
                    let conclusion = {
                        let mut state = self.state.write().await;
                        if state.epoch() != epoch {
                            return;
                        }
                        self.finish_locked(&mut state, Outcome::TimedOut, now)
                    };
                    if let Some(conclusion) = conclusion {
                        info!("Puzzle timer expired for session {}", epoch);
                        self.announce(conclusion).await;
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let running = {
                        let state = self.state.read().await;
                        state.epoch() == epoch && state.phase() == Phase::Assembly
                    };
                    if !running {
                        return;
                    }
                    self.broadcast_progress().await;
                    self.host_update().await;
                }
                _ = shutdown.changed() => {
                    debug!("Assembly clock for session {} interrupted by shutdown", epoch);
                    return;
                }
            }
        }
    }

    pub async fn move_fragment(
        self: &Arc<Self>,
        participant_id: &str,
        request: &FragmentMoveRequest,
    ) -> SessionResult<MoveOutcome> {
        let mover = self.registry.lookup(participant_id)?.view();
        let cooldown_ms = self.settings.timings.move_cooldown.as_millis() as u64;
        let now = get_timestamp();

        let (outcome, puzzle_state, conclusion) = {
            let mut state = self.state.write().await;
            let outcome = state.move_fragment(
                &mover,
                &request.fragment_id,
                request.new_position,
                cooldown_ms,
                now,
            )?;
            let conclusion = match outcome {
                MoveOutcome::Moved { .. } if state.is_puzzle_complete() => {
                    self.finish_locked(&mut state, Outcome::Solved, now)
                }
                _ => None,
            };
            (outcome, puzzle_envelopes(&state), conclusion)
        };

        match &outcome {
            MoveOutcome::Moved { fragment, swapped } => {
                debug!(
                    "{} moved {} to ({}, {})",
                    mover.name, fragment.id, fragment.position.x, fragment.position.y
                );
                self.dispatcher
                    .send_to(
                        participant_id,
                        OutboundKind::FragmentMoveResponse,
                        json!({ "status": "success", "fragment": fragment, "swapped": swapped }),
                    )
                    .await;
                for envelope in puzzle_state {
                    self.dispatcher.enqueue(envelope).await;
                }
            }
            MoveOutcome::Ignored { next_eligible_at } => {
                self.dispatcher
                    .send_to(
                        participant_id,
                        OutboundKind::FragmentMoveResponse,
                        json!({
                            "status": "ignored",
                            "reason": "cooldown",
                            "fragmentId": request.fragment_id,
                            "nextMoveAvailable": next_eligible_at,
                        }),
                    )
                    .await;
            }
        }

        if let Some(conclusion) = conclusion {
            self.announce(conclusion).await;
        }
        Ok(outcome)
    }

    /// Marks the caller's fragment solved. Completion is checked under the
    /// same lock, so a simultaneous timeout cannot also end the game.
    pub async fn complete_segment(
        self: &Arc<Self>,
        participant_id: &str,
        request: &SegmentCompleted,
    ) -> SessionResult<GridPos> {
        let participant = self.registry.lookup(participant_id)?;
        if participant.is_host {
            return Err(SessionError::forbidden("the host has no puzzle segment"));
        }

        let now = get_timestamp();
        let (target, puzzle_state, conclusion) = {
            let mut state = self.state.write().await;
            let target = state.complete_segment(participant_id, &request.segment_id, now)?;
            let conclusion = if state.is_puzzle_complete() {
                self.finish_locked(&mut state, Outcome::Solved, now)
            } else {
                None
            };
            (target, puzzle_envelopes(&state), conclusion)
        };

        info!("{} completed {}", participant.name, request.segment_id);
        self.dispatcher
            .send_to(
                participant_id,
                OutboundKind::SegmentCompletionAck,
                json!({
                    "status": "acknowledged",
                    "segmentId": request.segment_id,
                    "gridPosition": target,
                }),
            )
            .await;
        for envelope in puzzle_state {
            self.dispatcher.enqueue(envelope).await;
        }

        if let Some(conclusion) = conclusion {
            self.announce(conclusion).await;
        }
        Ok(target)
    }

    pub async fn recommend(
        &self,
        participant_id: &str,
        request: &RecommendationRequest,
    ) -> SessionResult<Recommendation> {
        let from = self.registry.lookup(participant_id)?.view();
        let to = self.registry.lookup(&request.to_player_id)?.view();

        let recommendation = {
            let mut state = self.state.write().await;
            state.recommend(&from, &to, request, get_timestamp())?
        };

        debug!("{} recommended a swap to {}", from.name, to.name);
        let mut payload = json!(recommendation);
        if let Some(map) = payload.as_object_mut() {
            map.insert("fromPlayerName".to_string(), json!(from.name));
        }
        self.dispatcher
            .send_to(&to.id, OutboundKind::PieceRecommendation, payload)
            .await;
        Ok(recommendation)
    }

    /// Resolves a recommendation. Accepting moves nothing; the recipient
    /// still has to issue the moves themselves.
    pub async fn respond(
        &self,
        participant_id: &str,
        response: &RecommendationResponse,
    ) -> SessionResult<Recommendation> {
        let recommendation = {
            let mut state = self.state.write().await;
            state.respond_recommendation(
                participant_id,
                &response.recommendation_id,
                response.accepted,
            )?
        };

        self.dispatcher
            .send_to(
                &recommendation.from_player_id,
                OutboundKind::RecommendationResult,
                json!({
                    "recommendationId": recommendation.id,
                    "accepted": response.accepted,
                    "respondedBy": participant_id,
                }),
            )
            .await;
        Ok(recommendation)
    }

    /// Settles the fragment of a participant who left during assembly.
    pub async fn handle_departure(self: &Arc<Self>, participant_id: &str) {
        let now = get_timestamp();
        let (puzzle_state, conclusion) = {
            let mut state = self.state.write().await;
            let Some(fragment) = state.detach_participant(participant_id, now) else {
                return;
            };
            info!(
                "Released fragment {} of departed {} at ({}, {})",
                fragment.id, participant_id, fragment.position.x, fragment.position.y
            );
            let conclusion = if state.is_puzzle_complete() {
                self.finish_locked(&mut state, Outcome::Solved, now)
            } else {
                None
            };
            (puzzle_envelopes(&state), conclusion)
        };

        for envelope in puzzle_state {
            self.dispatcher.enqueue(envelope).await;
        }
        if let Some(conclusion) = conclusion {
            self.announce(conclusion).await;
        }
    }

    // ---- Post game ----

    /// Ends the assembly while the caller holds the write lock.
    ///
    /// Returns None when another trigger already ended it.
    fn finish_locked(
        &self,
        state: &mut SessionState,
        outcome: Outcome,
        now: u64,
    ) -> Option<Conclusion> {
        if let Err(e) = state.finish(outcome, now) {
            debug!("Ignoring {:?} for session {}: {}", outcome, state.epoch(), e);
            return None;
        }

        let report = state.report(&self.registry.player_views(), now);
        let host_summary = json!(HostSummary {
            report: &report,
            outcome,
            move_log: state.move_log(),
            puzzle: state.puzzle_snapshot(),
        });
        Some(Conclusion {
            epoch: state.epoch(),
            outcome,
            report,
            host_summary,
        })
    }

    async fn announce(self: &Arc<Self>, conclusion: Conclusion) {
        info!(
            "Session {} ended: {:?}, team score {}",
            conclusion.epoch, conclusion.outcome, conclusion.report.team.score
        );
        self.dispatcher
            .enqueue(Envelope::to_players(
                OutboundKind::GameAnalytics,
                json!(conclusion.report),
            ))
            .await;
        self.dispatcher
            .enqueue(Envelope::to_host(
                OutboundKind::GameAnalytics,
                conclusion.host_summary,
            ))
            .await;
        self.host_update().await;

        let this = Arc::clone(self);
        let epoch = conclusion.epoch;
        tokio::spawn(async move {
            if this.pause(this.settings.timings.post_game_display).await {
                this.reset(epoch).await;
            }
        });
    }

    /// Replaces the session state and clears the registry.
    ///
    /// Everyone is told to reconnect first; the flush makes sure that message
    /// reaches each connection before its transport is dropped. A stale epoch
    /// is a no-op.
    pub async fn reset(&self, epoch: u64) -> bool {
        if !self.is_current(epoch).await {
            return false;
        }

        self.dispatcher
            .broadcast(
                OutboundKind::GameReset,
                json!({
                    "message": "Game resetting. Please rejoin to start a new game.",
                    "reconnectRequired": true,
                }),
            )
            .await;
        self.dispatcher.flush().await;

        let mut state = self.state.write().await;
        if state.epoch() != epoch {
            return false;
        }
        match state.next_session(self.settings.default_difficulty) {
            Ok(next) => *state = next,
            Err(e) => {
                warn!("Reset of session {} refused: {}", epoch, e);
                return false;
            }
        }
        let cleared = self.registry.reset();
        info!(
            "Session reset: {} participants cleared, now session {}",
            cleared,
            state.epoch()
        );
        true
    }

    // ---- Status and resynchronization ----

    fn lobby_payload(&self) -> Value {
        let eligibility = self.can_start();
        json!({
            "currentPlayers": self.registry.connected().len(),
            "nonHostPlayers": self.registry.connected_players().len(),
            "readyPlayers": self.registry.ready_players().len(),
            "playerRoles": self.registry.role_distribution(),
            "hasHost": self.registry.connected_host().is_some(),
            "canStart": eligibility.eligible,
            "waitingMessage": eligibility
                .reason
                .unwrap_or_else(|| "Ready to start! The host can begin the game".to_string()),
        })
    }

    pub async fn lobby_status(&self) {
        self.dispatcher
            .broadcast(OutboundKind::LobbyStatus, self.lobby_payload())
            .await;
        self.host_update().await;
    }

    fn host_payload(&self, state: &SessionState, now: u64) -> Value {
        let time_remaining = match state.phase() {
            Phase::ResourceGathering => self
                .round_span()
                .as_secs()
                .saturating_sub(state.round_elapsed_secs(now)),
            Phase::Assembly => state.remaining_secs(now).unwrap_or(0),
            _ => 0,
        };
        let progress = state.progress(now);
        let puzzle_progress = if progress.total_fragments == 0 {
            0.0
        } else {
            progress.solved_fragments as f64 / progress.total_fragments as f64
        };

        json!({
            "phase": state.phase(),
            "difficulty": state.difficulty(),
            "connectedPlayers": self.registry.connected_players().len(),
            "readyPlayers": self.registry.ready_players().len(),
            "currentRound": state.round(),
            "totalRounds": self.settings.timings.rounds,
            "timeRemaining": time_remaining,
            "teamTokens": state.tokens(),
            "thresholds": state.thresholds(),
            "puzzleProgress": puzzle_progress,
            "playerStatuses": self.registry.player_views(),
        })
    }

    pub async fn host_update(&self) {
        let payload = {
            let state = self.state.read().await;
            self.host_payload(&state, get_timestamp())
        };
        self.dispatcher
            .enqueue(Envelope::to_host(OutboundKind::HostUpdate, payload))
            .await;
    }

    /// First messages on a new or resumed connection.
    pub async fn welcome(&self, participant: &Participant, resumed: bool) {
        let phase = self.phase().await;
        self.dispatcher
            .send_to(
                &participant.id,
                OutboundKind::AvailableRoles,
                json!({
                    "playerId": participant.id,
                    "name": participant.name,
                    "isHost": participant.is_host,
                    "resumed": resumed,
                    "phase": phase,
                    "roles": self.registry.available_roles(),
                }),
            )
            .await;
        if resumed {
            self.resync(&participant.id).await;
        }
        self.lobby_status().await;
    }

    /// Replays what a reconnecting participant missed for the current phase.
    pub async fn resync(&self, participant_id: &str) {
        let Ok(participant) = self.registry.lookup(participant_id) else {
            return;
        };
        let view = participant.view();
        let id = view.id.as_str();
        let now = get_timestamp();

        let envelopes = {
            let state = self.state.read().await;
            let mut out = Vec::new();
            match state.phase() {
                Phase::Setup => {}
                Phase::ResourceGathering => {
                    out.push(Envelope::to_participant(
                        OutboundKind::ResourcePhaseStart,
                        self.round_payload(state.round(), state.difficulty()),
                        id,
                    ));
                    if let Some(question) = state.current_question(id) {
                        out.push(Envelope::to_participant(
                            OutboundKind::TriviaQuestion,
                            json!(question),
                            id,
                        ));
                    }
                    out.push(Envelope::to_participant(
                        OutboundKind::TeamProgress,
                        json!(state.progress(now)),
                        id,
                    ));
                }
                Phase::Assembly => {
                    let image = state.puzzle_image().unwrap_or_default();
                    let load = match state.fragment_of(id) {
                        Some(fragment) if !view.is_host => json!({
                            "imageId": image,
                            "segmentId": puzzle::segment_id(fragment.target),
                            "fragmentId": fragment.id,
                            "gridSize": state.grid_size(),
                            "preSolved": fragment.pre_solved,
                        }),
                        _ => json!({
                            "imageId": image,
                            "gridSize": state.grid_size(),
                            "isHost": view.is_host,
                        }),
                    };
                    out.push(Envelope::to_participant(
                        OutboundKind::PuzzlePhaseLoad,
                        load,
                        id,
                    ));
                    if let (Some(started), Some(total)) =
                        (state.timer_started_at(), state.time_limit_secs())
                    {
                        out.push(Envelope::to_participant(
                            OutboundKind::PuzzlePhaseStart,
                            json!({
                                "startTimestamp": started,
                                "totalTime": total,
                                "timeRemaining": state.remaining_secs(now),
                            }),
                            id,
                        ));
                    }
                    out.push(Envelope::to_participant(
                        OutboundKind::CentralPuzzleState,
                        central_state_payload(&state, view.is_host),
                        id,
                    ));
                    if let Some(envelope) = highlight_envelope(&state, id) {
                        out.push(envelope);
                    }
                }
                Phase::PostGame => {
                    let report = state.report(&self.registry.player_views(), now);
                    out.push(Envelope::to_participant(
                        OutboundKind::GameAnalytics,
                        json!(report),
                        id,
                    ));
                }
            }
            out
        };

        debug!("Resyncing {} with {} messages", view.name, envelopes.len());
        for envelope in envelopes {
            self.dispatcher.enqueue(envelope).await;
        }
    }
}

fn progress_with_answer(
    progress: &ProgressSnapshot,
    question_id: &str,
    outcome: &AnswerOutcome,
) -> Value {
    let mut payload = json!(progress);
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "lastAnswer".to_string(),
            json!({
                "questionId": question_id,
                "correct": outcome.correct,
                "tokensAwarded": outcome.awarded,
                "tokenType": outcome.token,
            }),
        );
    }
    payload
}

/// Players only see revealed fragments; the host sees everything plus recent moves.
fn central_state_payload(state: &SessionState, full: bool) -> Value {
    let mut snapshot = state.puzzle_snapshot();
    if full {
        let recent: Vec<MoveRecord> = state
            .move_log()
            .iter()
            .rev()
            .take(RECENT_MOVES)
            .cloned()
            .collect();
        json!(CentralState {
            puzzle: &snapshot,
            recent_moves: Some(recent),
        })
    } else {
        snapshot.fragments.retain(|fragment| fragment.visible);
        json!(CentralState {
            puzzle: &snapshot,
            recent_moves: None,
        })
    }
}

fn puzzle_envelopes(state: &SessionState) -> Vec<Envelope> {
    vec![
        Envelope::to_players(
            OutboundKind::CentralPuzzleState,
            central_state_payload(state, false),
        ),
        Envelope::to_host(
            OutboundKind::CentralPuzzleState,
            central_state_payload(state, true),
        ),
    ]
}

fn highlight_envelope(state: &SessionState, participant_id: &str) -> Option<Envelope> {
    let (positions, level) = state.guide_highlight(participant_id)?;
    Some(Envelope::to_participant(
        OutboundKind::GuideHighlight,
        json!({
            "playerId": participant_id,
            "positions": positions,
            "thresholdLevel": level,
            "maxThresholds": MAX_TOKEN_THRESHOLDS,
            "coverage": GUIDE_HIGHLIGHT_COVERAGE.get(level).copied().unwrap_or_default(),
        }),
        participant_id,
    ))
}
