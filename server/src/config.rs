//! Command line and environment configuration.

use clap::Parser;
use mosaic_shared::{
    Difficulty, FRAGMENT_MOVE_COOLDOWN_MS, MAX_PLAYERS, MIN_PLAYERS, PING_INTERVAL_SECS,
    PONG_TIMEOUT_SECS, POST_GAME_DISPLAY_SECS, PROGRESS_TICK_SECS, PUZZLE_ASSEMBLY_BASE_SECS,
    RESOURCE_GATHERING_ROUNDS, RESOURCE_ROUND_DURATION_SECS, TRIVIA_QUESTION_INTERVAL_SECS,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct ServerConfig {
    /// Address to bind to
    #[clap(short = 'H', long, env = "MOSAIC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[clap(short, long, env = "MOSAIC_PORT", default_value = "8080")]
    pub port: u16,

    /// PEM certificate; enables TLS together with --key
    #[clap(long, env = "MOSAIC_TLS_CERT", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[clap(long, env = "MOSAIC_TLS_KEY", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Comma separated origins allowed to open websockets; empty allows any
    #[clap(long, env = "MOSAIC_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Secret path segment for the host endpoint; generated when absent
    #[clap(long, env = "MOSAIC_HOST_TOKEN")]
    pub host_token: Option<String>,

    /// Directory holding <category>/<difficulty>.json question files
    #[clap(long, env = "MOSAIC_TRIVIA_DIR", default_value = "trivia")]
    pub trivia_dir: PathBuf,

    /// Players required before the host may start
    #[clap(long, default_value_t = MIN_PLAYERS)]
    pub min_players: usize,

    /// Maximum non-host participants
    #[clap(long, default_value_t = MAX_PLAYERS)]
    pub max_players: usize,

    /// Difficulty used when the host does not pick one
    #[clap(long, env = "MOSAIC_DIFFICULTY", default_value = "medium")]
    pub difficulty: Difficulty,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            timings: GameTimings::default(),
            min_players: self.min_players,
            max_players: self.max_players,
            default_difficulty: self.difficulty,
        }
    }

    /// Origins with surrounding whitespace and empty entries removed.
    pub fn origins(&self) -> Vec<String> {
        self.allowed_origins
            .iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }
}

/// Every duration the orchestrator and gateway wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameTimings {
    pub rounds: u32,
    pub round_duration: Duration,
    pub question_interval: Duration,
    pub assembly_base: Duration,
    pub progress_tick: Duration,
    pub post_game_display: Duration,
    pub move_cooldown: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for GameTimings {
    fn default() -> Self {
        Self {
            rounds: RESOURCE_GATHERING_ROUNDS,
            round_duration: Duration::from_secs(RESOURCE_ROUND_DURATION_SECS),
            question_interval: Duration::from_secs(TRIVIA_QUESTION_INTERVAL_SECS),
            assembly_base: Duration::from_secs(PUZZLE_ASSEMBLY_BASE_SECS),
            progress_tick: Duration::from_secs(PROGRESS_TICK_SECS),
            post_game_display: Duration::from_secs(POST_GAME_DISPLAY_SECS),
            move_cooldown: Duration::from_millis(FRAGMENT_MOVE_COOLDOWN_MS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(PONG_TIMEOUT_SECS),
        }
    }
}

impl GameTimings {
    /// Questions dispatched per round, at least one.
    pub fn questions_per_round(&self) -> u32 {
        let interval = self.question_interval.as_millis().max(1);
        ((self.round_duration.as_millis() / interval) as u32).max(1)
    }
}

/// Game rules that stay fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub timings: GameTimings,
    pub min_players: usize,
    pub max_players: usize,
    pub default_difficulty: Difficulty,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timings: GameTimings::default(),
            min_players: MIN_PLAYERS,
            max_players: MAX_PLAYERS,
            default_difficulty: Difficulty::default(),
        }
    }
}
