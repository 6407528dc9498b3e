//! Post-game scoring.
//!
//! Per-player counters are accumulated in the session state while the game
//! runs; this module turns them into the report broadcast at the end.

use crate::puzzle::ThresholdCounts;
use crate::registry::{ParticipantId, ParticipantView};
use mosaic_shared::{Role, TeamTokens};
use serde::Serialize;

const POINTS_PER_CORRECT: u32 = 10;
const POINTS_PER_SPECIALTY_CORRECT: u32 = 20;
const POINTS_FOR_SOLVED_FRAGMENT: u32 = 100;
const SPEED_BONUS_WINDOW_SECS: u64 = 300;
const POINTS_PER_MOVE: u32 = 5;
const POINTS_PER_RECOMMENDATION: u32 = 3;
const POINTS_PER_ACCEPTED_RECOMMENDATION: u32 = 8;
const TEAM_BASE_SCORE: u64 = 1000;
const TEAM_PENALTY_PER_SEC: u64 = 5;

/// Running counters for one player.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerAnalytics {
    pub questions_answered: u32,
    pub correct_answers: u32,
    pub specialty_correct: u32,
    pub tokens_contributed: u32,
    pub moves_made: u32,
    pub recommendations_sent: u32,
    pub recommendations_received: u32,
    pub recommendations_accepted: u32,
    pub fragment_solved: bool,
    /// Seconds from the start of assembly until the player's segment was done
    pub solve_secs: Option<u64>,
}

impl PlayerAnalytics {
    pub fn accuracy(&self) -> f64 {
        if self.questions_answered == 0 {
            0.0
        } else {
            self.correct_answers as f64 / self.questions_answered as f64
        }
    }

    pub fn score(&self) -> u32 {
        let mut score = self.correct_answers * POINTS_PER_CORRECT
            + self.specialty_correct * POINTS_PER_SPECIALTY_CORRECT
            + self.moves_made * POINTS_PER_MOVE
            + self.recommendations_sent * POINTS_PER_RECOMMENDATION
            + self.recommendations_accepted * POINTS_PER_ACCEPTED_RECOMMENDATION;

        if self.fragment_solved {
            score += POINTS_FOR_SOLVED_FRAGMENT;
            if let Some(secs) = self.solve_secs {
                score += SPEED_BONUS_WINDOW_SECS.saturating_sub(secs) as u32;
            }
        }
        score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerReport {
    pub player_id: ParticipantId,
    pub name: String,
    pub role: Option<Role>,
    pub accuracy: f64,
    #[serde(flatten)]
    pub counters: PlayerAnalytics,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamReport {
    pub success: bool,
    pub completion_rate: f64,
    pub total_secs: u64,
    pub time_limit_secs: u64,
    pub tokens: TeamTokens,
    pub thresholds: ThresholdCounts,
    pub total_moves: usize,
    pub score: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_id: ParticipantId,
    pub name: String,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameReport {
    pub team: TeamReport,
    pub players: Vec<PlayerReport>,
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Session-level facts the report is built from.
#[derive(Debug, Clone)]
pub struct TeamFacts {
    pub success: bool,
    pub solved_fragments: usize,
    pub total_fragments: usize,
    pub total_secs: u64,
    pub time_limit_secs: u64,
    pub tokens: TeamTokens,
    pub thresholds: ThresholdCounts,
    pub total_moves: usize,
}

pub fn team_score(success: bool, total_secs: u64) -> u64 {
    if success {
        TEAM_BASE_SCORE.saturating_sub(total_secs * TEAM_PENALTY_PER_SEC)
    } else {
        0
    }
}

/// Builds the final report. The leaderboard is ordered by score, then name.
pub fn build_report(facts: &TeamFacts, players: &[(ParticipantView, PlayerAnalytics)]) -> GameReport {
    let reports: Vec<PlayerReport> = players
        .iter()
        .map(|(view, counters)| PlayerReport {
            player_id: view.id.clone(),
            name: view.name.clone(),
            role: view.role,
            accuracy: counters.accuracy(),
            counters: counters.clone(),
            score: counters.score(),
        })
        .collect();

    let mut ranked: Vec<&PlayerReport> = reports.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    let leaderboard = ranked
        .into_iter()
        .enumerate()
        .map(|(index, report)| LeaderboardEntry {
            rank: index + 1,
            player_id: report.player_id.clone(),
            name: report.name.clone(),
            score: report.score,
        })
        .collect();

    let completion_rate = if facts.total_fragments == 0 {
        0.0
    } else {
        facts.solved_fragments as f64 / facts.total_fragments as f64
    };

    GameReport {
        team: TeamReport {
            success: facts.success,
            completion_rate,
            total_secs: facts.total_secs,
            time_limit_secs: facts.time_limit_secs,
            tokens: facts.tokens,
            thresholds: facts.thresholds,
            total_moves: facts.total_moves,
            score: team_score(facts.success, facts.total_secs),
        },
        players: reports,
        leaderboard,
    }
}
