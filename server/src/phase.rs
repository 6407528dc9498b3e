//! The authoritative phase table.
//!
//! `transition` is the only place that decides which phase follows which,
//! and `ensure` is the only place that decides which actions a phase admits.
//! Handlers never compare phases inline.

use crate::error::{SessionError, SessionResult};
use mosaic_shared::Phase;

/// Something that can move the session to another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    RoundsComplete,
    PuzzleSolved,
    PuzzleTimedOut,
    Reset,
}

impl PhaseEvent {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseEvent::Start => "game start",
            PhaseEvent::RoundsComplete => "end of resource gathering",
            PhaseEvent::PuzzleSolved => "puzzle completion",
            PhaseEvent::PuzzleTimedOut => "puzzle timeout",
            PhaseEvent::Reset => "session reset",
        }
    }
}

/// Next phase for `event`, or a phase-mismatch error if the table has no entry.
pub fn transition(current: Phase, event: PhaseEvent) -> SessionResult<Phase> {
    use PhaseEvent::*;

    let next = match (current, event) {
        (Phase::Setup, Start) => Phase::ResourceGathering,
        (Phase::ResourceGathering, RoundsComplete) => Phase::Assembly,
        (Phase::Assembly, PuzzleSolved) | (Phase::Assembly, PuzzleTimedOut) => Phase::PostGame,
        // Reset is the one backwards edge and is valid from anywhere
        (_, Reset) => Phase::Setup,
        _ => {
            return Err(SessionError::PhaseMismatch {
                action: event.label(),
                phase: current,
            })
        }
    };
    Ok(next)
}

/// Participant-triggered operations subject to a phase guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SelectDifficulty,
    ConfigureParticipant,
    VerifyLocation,
    StartGame,
    SubmitAnswer,
    StartTimer,
    CompleteSegment,
    MoveFragment,
    Recommend,
    RespondToRecommendation,
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::SelectDifficulty => "difficulty selection",
            Action::ConfigureParticipant => "lobby configuration",
            Action::VerifyLocation => "location verification",
            Action::StartGame => "game start",
            Action::SubmitAnswer => "trivia answer",
            Action::StartTimer => "puzzle timer start",
            Action::CompleteSegment => "segment completion",
            Action::MoveFragment => "fragment move",
            Action::Recommend => "piece recommendation",
            Action::RespondToRecommendation => "recommendation response",
        }
    }

    pub fn permitted_phases(&self) -> &'static [Phase] {
        match self {
            Action::SelectDifficulty | Action::ConfigureParticipant | Action::StartGame => {
                &[Phase::Setup]
            }
            Action::VerifyLocation => &[Phase::Setup, Phase::ResourceGathering],
            Action::SubmitAnswer => &[Phase::ResourceGathering],
            Action::StartTimer
            | Action::CompleteSegment
            | Action::MoveFragment
            | Action::Recommend
            | Action::RespondToRecommendation => &[Phase::Assembly],
        }
    }
}

/// Fails with a phase mismatch unless `action` is admitted in `phase`.
pub fn ensure(phase: Phase, action: Action) -> SessionResult<()> {
    if action.permitted_phases().contains(&phase) {
        Ok(())
    } else {
        Err(SessionError::PhaseMismatch {
            action: action.label(),
            phase,
        })
    }
}
