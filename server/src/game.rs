use crate::analytics::{self, GameReport, PlayerAnalytics, TeamFacts};
use crate::error::{SessionError, SessionResult};
use crate::phase::{ensure, transition, Action, PhaseEvent};
use crate::puzzle::{self, ThresholdCounts};
use crate::registry::{ParticipantId, ParticipantView};
use crate::trivia::Question;
use crate::utils::elapsed_secs;
use log::info;
use mosaic_shared::protocol::RecommendationRequest;
use mosaic_shared::{
    Difficulty, GridPos, Phase, TeamTokens, TokenKind, BASE_TOKENS_PER_CORRECT_ANSWER,
    MAX_UNASSIGNED_FRAGMENTS, ROLE_RESOURCE_MULTIPLIER, SPECIALTY_POINT_MULTIPLIER,
};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Who may move a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovableBy {
    Anyone,
    Participant(ParticipantId),
}

impl MovableBy {
    pub fn permits(&self, participant: &str) -> bool {
        match self {
            MovableBy::Anyone => true,
            MovableBy::Participant(id) => id == participant,
        }
    }
}

impl Serialize for MovableBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MovableBy::Anyone => serializer.serialize_str("anyone"),
            MovableBy::Participant(id) => serializer.serialize_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    pub owner: Option<ParticipantId>,
    pub position: GridPos,
    pub target: GridPos,
    pub solved: bool,
    pub visible: bool,
    pub pre_solved: bool,
    pub movable_by: MovableBy,
    pub last_moved_at: Option<u64>,
}

impl Fragment {
    pub fn is_placed(&self) -> bool {
        self.solved && self.visible && self.position == self.target
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub fragment_id: String,
    pub moved_by: ParticipantId,
    pub from: GridPos,
    pub to: GridPos,
    pub swapped_with: Option<String>,
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub from_player_id: ParticipantId,
    pub to_player_id: ParticipantId,
    pub from_fragment_id: String,
    pub to_fragment_id: String,
    pub suggested_from_pos: GridPos,
    pub suggested_to_pos: GridPos,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Moved {
        fragment: Fragment,
        swapped: Option<Fragment>,
    },
    /// Cooldown still running; nothing changed
    Ignored { next_eligible_at: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerOutcome {
    pub correct: bool,
    pub awarded: u32,
    pub token: TokenKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Solved,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentAssignment {
    pub participant_id: ParticipantId,
    pub fragment_id: String,
    pub segment_id: String,
    pub target: GridPos,
    pub pre_solved: bool,
}

/// What the orchestrator announces when assembly begins.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyPlan {
    pub grid_size: u32,
    pub puzzle_image: String,
    pub assignments: Vec<SegmentAssignment>,
    pub thresholds: ThresholdCounts,
    pub preview_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AssemblyTimer {
    started_at: u64,
    total_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleSnapshot {
    pub grid_size: u32,
    pub puzzle_image: Option<String>,
    pub fragments: Vec<Fragment>,
    pub solved: usize,
    pub total: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub round: u32,
    pub team_tokens: TeamTokens,
    pub thresholds: ThresholdCounts,
    pub questions_answered: u32,
    pub correct_answers: u32,
    pub solved_fragments: usize,
    pub total_fragments: usize,
    pub elapsed_secs: Option<u64>,
    pub remaining_secs: Option<u64>,
}

/// Everything the session knows beyond participant identity.
///
/// One instance per game. A reset builds a fresh instance with the next
/// epoch instead of clearing fields, so timers started for an older epoch can
/// recognise that their game is gone.
#[derive(Debug, Clone)]
pub struct SessionState {
    epoch: u64,
    phase: Phase,
    difficulty: Difficulty,
    round: u32,
    phase_started_at: u64,
    round_started_at: u64,
    tokens: TeamTokens,
    grid_size: u32,
    puzzle_image: Option<String>,
    fragments: BTreeMap<String, Fragment>,
    move_log: Vec<MoveRecord>,
    question_history: HashMap<ParticipantId, HashSet<String>>,
    current_questions: HashMap<ParticipantId, Question>,
    analytics: HashMap<ParticipantId, PlayerAnalytics>,
    recommendations: HashMap<String, Recommendation>,
    timer: Option<AssemblyTimer>,
    outcome: Option<Outcome>,
    finished_at: Option<u64>,
}

impl SessionState {
    pub fn new(epoch: u64, difficulty: Difficulty) -> Self {
        Self {
            epoch,
            phase: Phase::Setup,
            difficulty,
            round: 0,
            phase_started_at: 0,
            round_started_at: 0,
            tokens: TeamTokens::default(),
            grid_size: 0,
            puzzle_image: None,
            fragments: BTreeMap::new(),
            move_log: Vec::new(),
            question_history: HashMap::new(),
            current_questions: HashMap::new(),
            analytics: HashMap::new(),
            recommendations: HashMap::new(),
            timer: None,
            outcome: None,
            finished_at: None,
        }
    }

    /// The replacement state for a full reset.
    pub fn next_session(&self, difficulty: Difficulty) -> SessionResult<SessionState> {
        transition(self.phase, PhaseEvent::Reset)?;
        Ok(SessionState::new(self.epoch + 1, difficulty))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn tokens(&self) -> TeamTokens {
        self.tokens
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    pub fn puzzle_image(&self) -> Option<&str> {
        self.puzzle_image.as_deref()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn move_log(&self) -> &[MoveRecord] {
        &self.move_log
    }

    pub fn analytics_for(&self, id: &str) -> Option<&PlayerAnalytics> {
        self.analytics.get(id)
    }

    pub fn thresholds(&self) -> ThresholdCounts {
        ThresholdCounts::from_tokens(&self.tokens, self.difficulty)
    }

    pub fn guard(&self, action: Action) -> SessionResult<()> {
        ensure(self.phase, action)
    }

    fn advance(&mut self, event: PhaseEvent, now: u64) -> SessionResult<()> {
        let next = transition(self.phase, event)?;
        info!(
            "Session {} phase {} -> {} ({})",
            self.epoch,
            self.phase,
            next,
            event.label()
        );
        self.phase = next;
        self.phase_started_at = now;
        Ok(())
    }

    pub fn set_difficulty(&mut self, difficulty: Difficulty) -> SessionResult<()> {
        self.guard(Action::SelectDifficulty)?;
        self.difficulty = difficulty;
        Ok(())
    }

    /// Leaves setup and opens analytics for every player present.
    pub fn begin(&mut self, players: &[ParticipantView], now: u64) -> SessionResult<()> {
        self.advance(PhaseEvent::Start, now)?;
        self.round = 0;
        for player in players.iter().filter(|p| !p.is_host) {
            self.analytics.insert(player.id.clone(), PlayerAnalytics::default());
            self.question_history.entry(player.id.clone()).or_default();
        }
        Ok(())
    }

    pub fn begin_round(&mut self, round: u32, now: u64) -> SessionResult<()> {
        if self.phase != Phase::ResourceGathering {
            return Err(SessionError::PhaseMismatch {
                action: "round start",
                phase: self.phase,
            });
        }
        self.round = round;
        self.round_started_at = now;
        // Unanswered questions from the previous round expire
        self.current_questions.clear();
        Ok(())
    }

    pub fn round_elapsed_secs(&self, now: u64) -> u64 {
        elapsed_secs(self.round_started_at, now)
    }

    pub fn question_history(&self, id: &str) -> HashSet<String> {
        self.question_history.get(id).cloned().unwrap_or_default()
    }

    pub fn current_question(&self, id: &str) -> Option<&Question> {
        self.current_questions.get(id)
    }

    /// Makes `question` the one `id` is expected to answer next.
    pub fn assign_question(&mut self, id: &str, question: Question) -> SessionResult<()> {
        self.guard(Action::SubmitAnswer)?;
        self.question_history
            .entry(id.to_string())
            .or_default()
            .insert(question.id.clone());
        self.current_questions.insert(id.to_string(), question);
        Ok(())
    }

    /// Scores an answer to the participant's current question.
    ///
    /// `judge` decides correctness. A correct answer credits the token type of
    /// the player's station, boosted when their role favours that token and
    /// doubled for specialty questions.
    pub fn submit_answer(
        &mut self,
        who: &ParticipantView,
        question_id: &str,
        judge: impl FnOnce(&Question) -> bool,
    ) -> SessionResult<AnswerOutcome> {
        self.guard(Action::SubmitAnswer)?;
        if who.is_host {
            return Err(SessionError::forbidden("the host cannot answer questions"));
        }
        let token = who.location.ok_or_else(|| {
            SessionError::validation("verify a resource station before answering")
        })?;

        let question = match self.current_questions.get(&who.id) {
            Some(question) if question.id == question_id => question,
            _ => return Err(SessionError::not_found("question", question_id)),
        };

        let correct = judge(question);
        let is_specialty = question.is_specialty;
        self.current_questions.remove(&who.id);

        let mut awarded = 0;
        if correct {
            let mut amount = BASE_TOKENS_PER_CORRECT_ANSWER as f64;
            if who.role.map(|role| role.bonus_token()) == Some(token) {
                amount *= ROLE_RESOURCE_MULTIPLIER;
            }
            if is_specialty {
                amount *= SPECIALTY_POINT_MULTIPLIER;
            }
            awarded = amount.floor() as u32;
            self.tokens.credit(token, awarded);
        }

        let stats = self.analytics.entry(who.id.clone()).or_default();
        stats.questions_answered += 1;
        if correct {
            stats.correct_answers += 1;
            stats.tokens_contributed += awarded;
            if is_specialty {
                stats.specialty_correct += 1;
            }
        }

        Ok(AnswerOutcome {
            correct,
            awarded,
            token,
        })
    }

    /// Leaves resource gathering and lays out one fragment per player.
    ///
    /// Players fill the grid in row-major order. Up to three spare cells get
    /// unassigned fragments. The first fragments, up to the anchor allowance,
    /// start already solved.
    pub fn enter_assembly(
        &mut self,
        players: &[ParticipantView],
        puzzle_image: String,
        now: u64,
    ) -> SessionResult<AssemblyPlan> {
        self.advance(PhaseEvent::RoundsComplete, now)?;

        let players: Vec<&ParticipantView> = players.iter().filter(|p| !p.is_host).collect();
        let grid_size = puzzle::grid_size(players.len());
        let thresholds = self.thresholds();
        let allowance = thresholds.pre_solved_allowance();

        self.grid_size = grid_size;
        self.puzzle_image = Some(puzzle_image.clone());
        self.current_questions.clear();
        self.fragments.clear();
        self.timer = None;

        let mut assignments = Vec::with_capacity(players.len());
        for (index, player) in players.iter().enumerate() {
            let cell = GridPos::from_index(index, grid_size);
            let pre_solved = index < allowance;
            let fragment = Fragment {
                id: puzzle::fragment_id(&player.id),
                owner: Some(player.id.clone()),
                position: cell,
                target: cell,
                solved: pre_solved,
                visible: pre_solved,
                pre_solved,
                movable_by: MovableBy::Participant(player.id.clone()),
                last_moved_at: None,
            };
            if pre_solved {
                self.analytics.entry(player.id.clone()).or_default().fragment_solved = true;
            }
            assignments.push(SegmentAssignment {
                participant_id: player.id.clone(),
                fragment_id: fragment.id.clone(),
                segment_id: puzzle::segment_id(cell),
                target: cell,
                pre_solved,
            });
            self.fragments.insert(fragment.id.clone(), fragment);
        }

        let cells = (grid_size * grid_size) as usize;
        let spare = if players.is_empty() {
            0
        } else {
            cells.saturating_sub(players.len()).min(MAX_UNASSIGNED_FRAGMENTS)
        };
        for slot in 0..spare {
            let cell = GridPos::from_index(players.len() + slot, grid_size);
            let fragment = Fragment {
                id: puzzle::unassigned_fragment_id(slot),
                owner: None,
                position: cell,
                target: cell,
                solved: false,
                visible: false,
                pre_solved: false,
                movable_by: MovableBy::Anyone,
                last_moved_at: None,
            };
            self.fragments.insert(fragment.id.clone(), fragment);
        }

        Ok(AssemblyPlan {
            grid_size,
            puzzle_image,
            assignments,
            thresholds,
            preview_secs: thresholds.preview_secs(),
        })
    }

    /// Starts the assembly clock and reveals unassigned fragments.
    ///
    /// Returns the total time available in seconds.
    pub fn start_timer(&mut self, base_secs: u64, now: u64) -> SessionResult<u64> {
        self.guard(Action::StartTimer)?;
        if self.timer.is_some() {
            return Err(SessionError::validation("the puzzle timer is already running"));
        }

        let total_secs = puzzle::assembly_time_secs(base_secs, self.difficulty, &self.thresholds());
        self.timer = Some(AssemblyTimer {
            started_at: now,
            total_secs,
        });

        for fragment in self.fragments.values_mut().filter(|f| f.owner.is_none()) {
            fragment.solved = true;
            fragment.visible = true;
        }
        Ok(total_secs)
    }

    pub fn timer_running(&self) -> bool {
        self.timer.is_some() && self.phase == Phase::Assembly
    }

    pub fn timer_started_at(&self) -> Option<u64> {
        self.timer.map(|timer| timer.started_at)
    }

    pub fn time_limit_secs(&self) -> Option<u64> {
        self.timer.map(|timer| timer.total_secs)
    }

    pub fn remaining_secs(&self, now: u64) -> Option<u64> {
        self.timer
            .map(|timer| timer.total_secs.saturating_sub(elapsed_secs(timer.started_at, now)))
    }

    /// Moves a fragment, swapping with whatever occupies the destination.
    ///
    /// Checks run in order: phase, existence, cooldown, bounds, permission.
    /// A running cooldown is not an error; the caller gets the time the
    /// fragment may move again.
    pub fn move_fragment(
        &mut self,
        mover: &ParticipantView,
        fragment_id: &str,
        to: GridPos,
        cooldown_ms: u64,
        now: u64,
    ) -> SessionResult<MoveOutcome> {
        self.guard(Action::MoveFragment)?;

        let fragment = self
            .fragments
            .get(fragment_id)
            .ok_or_else(|| SessionError::not_found("fragment", fragment_id))?;

        if let Some(last) = fragment.last_moved_at {
            let next_eligible_at = last + cooldown_ms;
            if now < next_eligible_at {
                return Ok(MoveOutcome::Ignored { next_eligible_at });
            }
        }

        if !to.in_bounds(self.grid_size) {
            return Err(SessionError::OutOfBounds {
                x: to.x,
                y: to.y,
                grid_size: self.grid_size,
            });
        }
        if mover.is_host {
            return Err(SessionError::forbidden("the host cannot move fragments"));
        }
        if !fragment.visible {
            return Err(SessionError::forbidden("fragment is not revealed yet"));
        }
        if !fragment.movable_by.permits(&mover.id) {
            return Err(SessionError::forbidden("fragment belongs to another player"));
        }

        let from = fragment.position;
        let occupant = self
            .fragments
            .values()
            .find(|f| f.position == to && f.id != fragment_id)
            .map(|f| f.id.clone());

        let swapped = match &occupant {
            Some(other_id) => self.fragments.get_mut(other_id).map(|other| {
                other.position = from;
                other.last_moved_at = Some(now);
                other.clone()
            }),
            None => None,
        };

        let moved = match self.fragments.get_mut(fragment_id) {
            Some(fragment) => {
                fragment.position = to;
                fragment.last_moved_at = Some(now);
                fragment.clone()
            }
            None => return Err(SessionError::not_found("fragment", fragment_id)),
        };

        self.move_log.push(MoveRecord {
            fragment_id: fragment_id.to_string(),
            moved_by: mover.id.clone(),
            from,
            to,
            swapped_with: occupant,
            at: now,
        });
        self.analytics.entry(mover.id.clone()).or_default().moves_made += 1;

        Ok(MoveOutcome::Moved {
            fragment: moved,
            swapped,
        })
    }

    /// Marks the player's fragment solved and revealed.
    ///
    /// Returns the fragment's target cell.
    pub fn complete_segment(
        &mut self,
        participant: &str,
        segment_id: &str,
        now: u64,
    ) -> SessionResult<GridPos> {
        self.guard(Action::CompleteSegment)?;

        let solve_secs = elapsed_secs(self.timer_started_at().unwrap_or(self.phase_started_at), now);
        let fragment_id = puzzle::fragment_id(participant);
        let fragment = self
            .fragments
            .get_mut(&fragment_id)
            .ok_or_else(|| SessionError::not_found("fragment", fragment_id.as_str()))?;

        if puzzle::segment_id(fragment.target) != segment_id {
            return Err(SessionError::validation(format!(
                "segment {} is not assigned to this player",
                segment_id
            )));
        }
        if fragment.solved {
            return Err(SessionError::validation("segment already completed"));
        }

        fragment.solved = true;
        fragment.visible = true;
        let target = fragment.target;

        let stats = self.analytics.entry(participant.to_string()).or_default();
        stats.fragment_solved = true;
        stats.solve_secs = Some(solve_secs);
        Ok(target)
    }

    /// True when every fragment is solved, revealed and on its target cell.
    pub fn is_puzzle_complete(&self) -> bool {
        !self.fragments.is_empty() && self.fragments.values().all(Fragment::is_placed)
    }

    /// Ends the assembly. Fails if another trigger already ended it.
    pub fn finish(&mut self, outcome: Outcome, now: u64) -> SessionResult<()> {
        let event = match outcome {
            Outcome::Solved => PhaseEvent::PuzzleSolved,
            Outcome::TimedOut => PhaseEvent::PuzzleTimedOut,
        };
        self.advance(event, now)?;
        self.outcome = Some(outcome);
        self.finished_at = Some(now);
        self.recommendations.clear();
        Ok(())
    }

    /// Records a suggestion from one player to another.
    ///
    /// A newer suggestion between the same two players replaces the pending
    /// one. `recipient` must already be known to exist.
    pub fn recommend(
        &mut self,
        from: &ParticipantView,
        recipient: &ParticipantView,
        request: &RecommendationRequest,
        now: u64,
    ) -> SessionResult<Recommendation> {
        self.guard(Action::Recommend)?;
        if from.is_host || recipient.is_host {
            return Err(SessionError::forbidden("recommendations are between players"));
        }
        if from.id == recipient.id {
            return Err(SessionError::validation("cannot recommend to yourself"));
        }
        for fragment_id in [&request.from_fragment_id, &request.to_fragment_id] {
            if !self.fragments.contains_key(fragment_id.as_str()) {
                return Err(SessionError::not_found("fragment", fragment_id.as_str()));
            }
        }
        for pos in [request.suggested_from_pos, request.suggested_to_pos] {
            if !pos.in_bounds(self.grid_size) {
                return Err(SessionError::OutOfBounds {
                    x: pos.x,
                    y: pos.y,
                    grid_size: self.grid_size,
                });
            }
        }

        self.recommendations
            .retain(|_, r| !(r.from_player_id == from.id && r.to_player_id == recipient.id));

        let recommendation = Recommendation {
            id: Uuid::new_v4().to_string(),
            from_player_id: from.id.clone(),
            to_player_id: recipient.id.clone(),
            from_fragment_id: request.from_fragment_id.clone(),
            to_fragment_id: request.to_fragment_id.clone(),
            suggested_from_pos: request.suggested_from_pos,
            suggested_to_pos: request.suggested_to_pos,
            created_at: now,
        };
        self.recommendations
            .insert(recommendation.id.clone(), recommendation.clone());

        self.analytics.entry(from.id.clone()).or_default().recommendations_sent += 1;
        self.analytics
            .entry(recipient.id.clone())
            .or_default()
            .recommendations_received += 1;
        Ok(recommendation)
    }

    /// Resolves a pending recommendation. Acceptance moves nothing.
    pub fn respond_recommendation(
        &mut self,
        responder: &str,
        recommendation_id: &str,
        accepted: bool,
    ) -> SessionResult<Recommendation> {
        self.guard(Action::RespondToRecommendation)?;

        let recommendation = self
            .recommendations
            .get(recommendation_id)
            .ok_or_else(|| SessionError::not_found("recommendation", recommendation_id))?;
        if recommendation.to_player_id != responder {
            return Err(SessionError::forbidden(
                "only the recipient can answer a recommendation",
            ));
        }

        let recommendation = self
            .recommendations
            .remove(recommendation_id)
            .ok_or_else(|| SessionError::not_found("recommendation", recommendation_id))?;
        if accepted {
            self.analytics
                .entry(recommendation.from_player_id.clone())
                .or_default()
                .recommendations_accepted += 1;
        }
        Ok(recommendation)
    }

    pub fn pending_recommendations(&self) -> usize {
        self.recommendations.len()
    }

    /// Settles a departed player's fragment so the puzzle stays finishable.
    ///
    /// The fragment becomes solved, revealed and movable by anyone. If an
    /// empty cell precedes it in row-major order it moves there, keeping the
    /// occupied cells a contiguous prefix. No-op outside assembly.
    pub fn detach_participant(&mut self, participant: &str, now: u64) -> Option<Fragment> {
        if self.phase != Phase::Assembly {
            return None;
        }
        let fragment_id = puzzle::fragment_id(participant);
        let grid_size = self.grid_size;
        let cells = (grid_size * grid_size) as usize;

        let occupied: HashSet<usize> = self
            .fragments
            .values()
            .filter(|f| f.id != fragment_id)
            .filter_map(|f| f.position.index(grid_size))
            .collect();
        let first_free = (0..cells).find(|index| !occupied.contains(index));

        let fragment = self.fragments.get_mut(&fragment_id)?;
        fragment.solved = true;
        fragment.visible = true;
        fragment.movable_by = MovableBy::Anyone;

        let current = fragment.position.index(grid_size).unwrap_or(usize::MAX);
        if let Some(free) = first_free.filter(|free| *free < current) {
            fragment.position = GridPos::from_index(free, grid_size);
            fragment.last_moved_at = Some(now);
        }
        Some(fragment.clone())
    }

    pub fn fragment(&self, id: &str) -> Option<&Fragment> {
        self.fragments.get(id)
    }

    pub fn fragment_of(&self, participant: &str) -> Option<&Fragment> {
        self.fragments.get(&puzzle::fragment_id(participant))
    }

    /// Fragments in row-major order of their current cell.
    pub fn fragments(&self) -> Vec<Fragment> {
        let mut fragments: Vec<Fragment> = self.fragments.values().cloned().collect();
        fragments.sort_by_key(|f| f.position.index(self.grid_size).unwrap_or(usize::MAX));
        fragments
    }

    pub fn puzzle_snapshot(&self) -> PuzzleSnapshot {
        PuzzleSnapshot {
            grid_size: self.grid_size,
            puzzle_image: self.puzzle_image.clone(),
            fragments: self.fragments(),
            solved: self.fragments.values().filter(|f| f.solved).count(),
            total: self.fragments.len(),
            complete: self.is_puzzle_complete(),
        }
    }

    /// Highlighted cells for the participant's fragment at the team's guide level.
    pub fn guide_highlight(&self, participant: &str) -> Option<(Vec<GridPos>, usize)> {
        let fragment = self.fragment_of(participant)?;
        let level = self.thresholds().highlight_level();
        Some((
            puzzle::highlight_candidates(fragment.target, self.grid_size, level),
            level,
        ))
    }

    pub fn progress(&self, now: u64) -> ProgressSnapshot {
        let (questions_answered, correct_answers) = self
            .analytics
            .values()
            .fold((0, 0), |(answered, correct), stats| {
                (
                    answered + stats.questions_answered,
                    correct + stats.correct_answers,
                )
            });

        ProgressSnapshot {
            phase: self.phase,
            round: self.round,
            team_tokens: self.tokens,
            thresholds: self.thresholds(),
            questions_answered,
            correct_answers,
            solved_fragments: self.fragments.values().filter(|f| f.solved).count(),
            total_fragments: self.fragments.len(),
            elapsed_secs: self
                .timer_started_at()
                .map(|started| elapsed_secs(started, now)),
            remaining_secs: self.remaining_secs(now),
        }
    }

    /// Final report for the players given.
    pub fn report(&self, players: &[ParticipantView], now: u64) -> GameReport {
        let started = self.timer_started_at().unwrap_or(self.phase_started_at);
        let finished = self.finished_at.unwrap_or(now);
        let facts = TeamFacts {
            success: self.outcome == Some(Outcome::Solved),
            solved_fragments: self.fragments.values().filter(|f| f.solved).count(),
            total_fragments: self.fragments.len(),
            total_secs: elapsed_secs(started, finished),
            time_limit_secs: self.time_limit_secs().unwrap_or(0),
            tokens: self.tokens,
            thresholds: self.thresholds(),
            total_moves: self.move_log.len(),
        };

        let rows: Vec<(ParticipantView, PlayerAnalytics)> = players
            .iter()
            .filter(|p| !p.is_host)
            .map(|p| {
                let stats = self.analytics.get(&p.id).cloned().unwrap_or_default();
                (p.clone(), stats)
            })
            .collect();
        analytics::build_report(&facts, &rows)
    }
}
