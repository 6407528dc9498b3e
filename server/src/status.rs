//! Read-only status endpoints for monitoring.
//!
//! Both reports are taken under the session read lock so phase, counts and
//! tokens describe the same instant.

use crate::network::Gateway;
use crate::orchestrator::Orchestrator;
use crate::puzzle::ThresholdCounts;
use axum::extract::State;
use axum::Json;
use mosaic_shared::{Difficulty, Phase, Role, TeamTokens};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCounts {
    pub total: usize,
    pub connected: usize,
    pub ready: usize,
    pub has_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub phase: Phase,
    pub participants: ParticipantCounts,
    /// Only reported once a game is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_tokens: Option<TeamTokens>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub phase: Phase,
    pub difficulty: Difficulty,
    pub round: u32,
    pub total_rounds: u32,
    pub team_tokens: TeamTokens,
    pub thresholds: ThresholdCounts,
    pub grid_size: u32,
    pub puzzle_image: Option<String>,
    pub roles: HashMap<Role, usize>,
    pub question_count: usize,
    pub uptime_secs: u64,
}

pub async fn health_report(orchestrator: &Orchestrator) -> HealthReport {
    let registry = orchestrator.registry();
    orchestrator
        .snapshot(|state| {
            let active = state.phase() != Phase::Setup;
            HealthReport {
                status: "ok",
                phase: state.phase(),
                participants: ParticipantCounts {
                    total: registry.len(),
                    connected: registry.connected().len(),
                    ready: registry.ready_players().len(),
                    has_host: registry.connected_host().is_some(),
                },
                round: active.then(|| state.round()),
                team_tokens: active.then(|| state.tokens()),
            }
        })
        .await
}

pub async fn stats_report(orchestrator: &Orchestrator, started_at: Instant) -> StatsReport {
    let registry = orchestrator.registry();
    let total_rounds = orchestrator.timings().rounds;
    let question_count = orchestrator.question_count();
    orchestrator
        .snapshot(|state| StatsReport {
            phase: state.phase(),
            difficulty: state.difficulty(),
            round: state.round(),
            total_rounds,
            team_tokens: state.tokens(),
            thresholds: state.thresholds(),
            grid_size: state.grid_size(),
            puzzle_image: state.puzzle_image().map(str::to_string),
            roles: registry.role_distribution(),
            question_count,
            uptime_secs: started_at.elapsed().as_secs(),
        })
        .await
}

pub async fn health(State(gateway): State<Arc<Gateway>>) -> Json<HealthReport> {
    Json(health_report(gateway.orchestrator()).await)
}

pub async fn stats(State(gateway): State<Arc<Gateway>>) -> Json<StatsReport> {
    Json(stats_report(gateway.orchestrator(), gateway.started_at()).await)
}
