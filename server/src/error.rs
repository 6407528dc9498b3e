//! Error taxonomy for the session core.
//!
//! None of these are fatal to the process. Validation, phase and lookup
//! failures go back to the sender as an `error` message; capacity failures are
//! returned before the websocket upgrade; transport failures only tear down the
//! connection that produced them.

use mosaic_shared::protocol::ErrorPayload;
use mosaic_shared::{Phase, UnknownValue};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("{action} is not allowed during the {phase} phase")]
    PhaseMismatch { action: &'static str, phase: Phase },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("position ({x}, {y}) is outside the {grid_size}x{grid_size} grid")]
    OutOfBounds { x: i32, y: i32, grid_size: u32 },

    #[error("{0}")]
    Forbidden(String),

    #[error("a host is already connected")]
    HostTaken,

    #[error("session is full ({0} players)")]
    SessionFull(usize),

    #[error("session is not accepting new players during the {0} phase")]
    NotAccepting(Phase),

    #[error("cannot start: {0}")]
    NotEligible(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SessionError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        SessionError::Forbidden(message.into())
    }

    /// Short machine-readable kind sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation",
            SessionError::PhaseMismatch { .. } => "phase_mismatch",
            SessionError::NotFound { .. } => "not_found",
            SessionError::OutOfBounds { .. } => "out_of_bounds",
            SessionError::Forbidden(_) => "forbidden",
            SessionError::HostTaken => "host_taken",
            SessionError::SessionFull(_) => "session_full",
            SessionError::NotAccepting(_) => "not_accepting",
            SessionError::NotEligible(_) => "not_eligible",
            SessionError::Transport(_) => "transport",
        }
    }

    /// True for failures that are refused before a connection is upgraded.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            SessionError::HostTaken | SessionError::SessionFull(_) | SessionError::NotAccepting(_)
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Validation(err.to_string())
    }
}

impl From<UnknownValue> for SessionError {
    fn from(err: UnknownValue) -> Self {
        SessionError::Validation(err.to_string())
    }
}
