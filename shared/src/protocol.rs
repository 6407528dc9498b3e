//! JSON wire protocol.
//!
//! Every frame in either direction is an [`Envelope`] `{type, payload}`.
//! Inbound payloads are additionally wrapped as `{auth: {playerId}, payload}`
//! so the server can check the claimed identity against the connection.

use crate::GridPos;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    #[serde(rename = "playerId")]
    pub participant_id: String,
}

/// Identity wrapper around every inbound payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedPayload {
    pub auth: Auth,
    #[serde(default)]
    pub payload: Value,
}

/// Message types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    RoleSelection,
    SpecialtySelection,
    PlayerReady,
    LocationVerified,
    TriviaAnswer,
    SegmentCompleted,
    FragmentMoveRequest,
    HostStartGame,
    HostStartPuzzle,
    RecommendationRequest,
    RecommendationResponse,
}

impl InboundKind {
    pub const ALL: [InboundKind; 11] = [
        InboundKind::RoleSelection,
        InboundKind::SpecialtySelection,
        InboundKind::PlayerReady,
        InboundKind::LocationVerified,
        InboundKind::TriviaAnswer,
        InboundKind::SegmentCompleted,
        InboundKind::FragmentMoveRequest,
        InboundKind::HostStartGame,
        InboundKind::HostStartPuzzle,
        InboundKind::RecommendationRequest,
        InboundKind::RecommendationResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::RoleSelection => "role_selection",
            InboundKind::SpecialtySelection => "trivia_specialty_selection",
            InboundKind::PlayerReady => "player_ready",
            InboundKind::LocationVerified => "resource_location_verified",
            InboundKind::TriviaAnswer => "trivia_answer",
            InboundKind::SegmentCompleted => "segment_completed",
            InboundKind::FragmentMoveRequest => "fragment_move_request",
            InboundKind::HostStartGame => "host_start_game",
            InboundKind::HostStartPuzzle => "host_start_puzzle",
            InboundKind::RecommendationRequest => "piece_recommendation_request",
            InboundKind::RecommendationResponse => "piece_recommendation_response",
        }
    }

    pub fn from_tag(tag: &str) -> Option<InboundKind> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

/// Message types the server sends. Disjoint from [`InboundKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    AvailableRoles,
    LobbyStatus,
    ResourcePhaseStart,
    TriviaQuestion,
    TeamProgress,
    PuzzlePhaseLoad,
    PuzzlePhaseStart,
    ImagePreview,
    GuideHighlight,
    SegmentCompletionAck,
    FragmentMoveResponse,
    CentralPuzzleState,
    PieceRecommendation,
    RecommendationResult,
    GameAnalytics,
    GameReset,
    HostUpdate,
    Error,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::AvailableRoles => "available_roles",
            OutboundKind::LobbyStatus => "game_lobby_status",
            OutboundKind::ResourcePhaseStart => "resource_phase_start",
            OutboundKind::TriviaQuestion => "trivia_question",
            OutboundKind::TeamProgress => "team_progress_update",
            OutboundKind::PuzzlePhaseLoad => "puzzle_phase_load",
            OutboundKind::PuzzlePhaseStart => "puzzle_phase_start",
            OutboundKind::ImagePreview => "image_preview",
            OutboundKind::GuideHighlight => "guide_highlight",
            OutboundKind::SegmentCompletionAck => "segment_completion_ack",
            OutboundKind::FragmentMoveResponse => "fragment_move_response",
            OutboundKind::CentralPuzzleState => "central_puzzle_state",
            OutboundKind::PieceRecommendation => "piece_recommendation",
            OutboundKind::RecommendationResult => "piece_recommendation_result",
            OutboundKind::GameAnalytics => "game_analytics",
            OutboundKind::GameReset => "game_reset",
            OutboundKind::HostUpdate => "host_update",
            OutboundKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSelection {
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecialtySelection {
    pub specialties: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyToggle {
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationVerified {
    pub verified_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriviaAnswer {
    pub question_id: String,
    pub answer: String,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCompleted {
    pub segment_id: String,
    #[serde(default)]
    pub completion_timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMoveRequest {
    pub fragment_id: String,
    pub new_position: GridPos,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostStartGame {
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    pub to_player_id: String,
    pub from_fragment_id: String,
    pub to_fragment_id: String,
    pub suggested_from_pos: GridPos,
    pub suggested_to_pos: GridPos,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub recommendation_id: String,
    pub accepted: bool,
}

/// Body of an outbound `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}
