//! Domain vocabulary and game-balance constants shared by the session server,
//! its smoke client and the cross-crate tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod protocol;

pub const MIN_PLAYERS: usize = 4;
pub const MAX_PLAYERS: usize = 64;

pub const ROLE_RESOURCE_MULTIPLIER: f64 = 1.5;
pub const SPECIALTY_POINT_MULTIPLIER: f64 = 2.0;
pub const BASE_TOKENS_PER_CORRECT_ANSWER: u32 = 10;
pub const TRIVIA_ANSWER_TIMEOUT_SECS: u64 = 30;
pub const MAX_SPECIALTIES_PER_PLAYER: usize = 2;

pub const TOKENS_PER_THRESHOLD: u32 = 5;
pub const MAX_TOKEN_THRESHOLDS: u32 = 5;
pub const CHRONOS_TIME_BONUS_SECS: u64 = 20;
pub const CLARITY_PREVIEW_SECS: u64 = 1;

pub const FRAGMENT_MOVE_COOLDOWN_MS: u64 = 1000;
pub const INDIVIDUAL_PUZZLE_PIECES: u32 = 16;
pub const MAX_UNASSIGNED_FRAGMENTS: usize = 3;
pub const AVAILABLE_PUZZLE_IMAGES: u32 = 10;

pub const RESOURCE_GATHERING_ROUNDS: u32 = 5;
pub const RESOURCE_ROUND_DURATION_SECS: u64 = 180;
pub const TRIVIA_QUESTION_INTERVAL_SECS: u64 = 60;
pub const PUZZLE_ASSEMBLY_BASE_SECS: u64 = 300;
pub const PROGRESS_TICK_SECS: u64 = 5;
pub const POST_GAME_DISPLAY_SECS: u64 = 60;

pub const PING_INTERVAL_SECS: u64 = 30;
pub const PONG_TIMEOUT_SECS: u64 = 60;
pub const BROADCAST_QUEUE_CAPACITY: usize = 256;
pub const CONNECTION_QUEUE_CAPACITY: usize = 64;
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Inclusive player-count ranges and the grid dimension used for them.
pub const GRID_BREAKPOINTS: [(usize, usize, u32); 6] = [
    (1, 9, 3),
    (10, 16, 4),
    (17, 25, 5),
    (26, 36, 6),
    (37, 49, 7),
    (50, 64, 8),
];

/// Fraction of the grid highlighted at each guide precision level.
pub const GUIDE_HIGHLIGHT_COVERAGE: [f64; 6] = [0.25, 0.20, 0.15, 0.10, 0.05, 0.02];
pub const MIN_HIGHLIGHT_CANDIDATES: usize = 2;

/// Error returned when a wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownValue {}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(UnknownValue { kind: $label, value: s.to_string() }),
                }
            }
        }
    };
}

wire_enum!(
    /// Ordered stages of a session. Only a full reset moves backwards.
    Phase, "phase" {
        Setup => "setup",
        ResourceGathering => "resource_gathering",
        Assembly => "puzzle_assembly",
        PostGame => "post_game",
    }
);

wire_enum!(
    /// Gameplay role picked during setup.
    Role, "role" {
        ArtEnthusiast => "art_enthusiast",
        Detective => "detective",
        Tourist => "tourist",
        Janitor => "janitor",
    }
);

wire_enum!(
    /// The four shared resource counters.
    TokenKind, "token type" {
        Anchor => "anchor",
        Chronos => "chronos",
        Guide => "guide",
        Clarity => "clarity",
    }
);

wire_enum!(
    /// Trivia categories a player can specialise in.
    Category, "category" {
        General => "general",
        Geography => "geography",
        History => "history",
        Music => "music",
        Science => "science",
        VideoGames => "video_games",
    }
);

wire_enum!(
    /// Named difficulty presets.
    Difficulty, "difficulty" {
        Easy => "easy",
        Medium => "medium",
        Hard => "hard",
    }
);

impl Role {
    /// Token type this role earns a bonus on.
    pub fn bonus_token(&self) -> TokenKind {
        match self {
            Role::ArtEnthusiast => TokenKind::Clarity,
            Role::Detective => TokenKind::Guide,
            Role::Tourist => TokenKind::Chronos,
            Role::Janitor => TokenKind::Anchor,
        }
    }
}

impl TokenKind {
    /// Code printed at the physical station that collects this token.
    pub fn station_hash(&self) -> &'static str {
        match self {
            TokenKind::Anchor => "HASH_ANCHOR_STATION_2025",
            TokenKind::Chronos => "HASH_CHRONOS_STATION_2025",
            TokenKind::Guide => "HASH_GUIDE_STATION_2025",
            TokenKind::Clarity => "HASH_CLARITY_STATION_2025",
        }
    }

    pub fn from_station_hash(hash: &str) -> Option<TokenKind> {
        TokenKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.station_hash() == hash)
    }
}

/// Multipliers applied by a difficulty preset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyModifiers {
    pub trivia: f64,
    pub time_limit: f64,
    pub token_threshold: f64,
}

impl Difficulty {
    pub fn modifiers(&self) -> DifficultyModifiers {
        match self {
            Difficulty::Easy => DifficultyModifiers {
                trivia: 0.7,
                time_limit: 1.3,
                token_threshold: 0.8,
            },
            Difficulty::Medium => DifficultyModifiers {
                trivia: 1.0,
                time_limit: 1.0,
                token_threshold: 1.0,
            },
            Difficulty::Hard => DifficultyModifiers {
                trivia: 1.4,
                time_limit: 0.7,
                token_threshold: 1.3,
            },
        }
    }

    /// Probability that a dispatched question comes from a player's specialty.
    pub fn specialty_chance(&self) -> f64 {
        match self {
            Difficulty::Easy => 0.2,
            Difficulty::Medium => 0.3,
            Difficulty::Hard => 0.4,
        }
    }

    /// One level up, saturating at hard.
    pub fn harder(&self) -> Difficulty {
        match self {
            Difficulty::Easy => Difficulty::Medium,
            Difficulty::Medium | Difficulty::Hard => Difficulty::Hard,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::Medium
    }
}

/// Cell coordinate on the shared puzzle grid. Column `x`, row `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn from_index(index: usize, grid_size: u32) -> Self {
        let size = grid_size.max(1) as usize;
        Self {
            x: (index % size) as i32,
            y: (index / size) as i32,
        }
    }

    /// Row-major index, or None when the cell lies outside the grid.
    pub fn index(&self, grid_size: u32) -> Option<usize> {
        if self.in_bounds(grid_size) {
            Some(self.y as usize * grid_size as usize + self.x as usize)
        } else {
            None
        }
    }

    pub fn in_bounds(&self, grid_size: u32) -> bool {
        let size = grid_size as i64;
        (0..size).contains(&(self.x as i64)) && (0..size).contains(&(self.y as i64))
    }
}

/// Shared team resource tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TeamTokens {
    pub anchor: u32,
    pub chronos: u32,
    pub guide: u32,
    pub clarity: u32,
}

impl TeamTokens {
    pub fn get(&self, kind: TokenKind) -> u32 {
        match kind {
            TokenKind::Anchor => self.anchor,
            TokenKind::Chronos => self.chronos,
            TokenKind::Guide => self.guide,
            TokenKind::Clarity => self.clarity,
        }
    }

    pub fn credit(&mut self, kind: TokenKind, amount: u32) {
        let slot = match kind {
            TokenKind::Anchor => &mut self.anchor,
            TokenKind::Chronos => &mut self.chronos,
            TokenKind::Guide => &mut self.guide,
            TokenKind::Clarity => &mut self.clarity,
        };
        *slot = slot.saturating_add(amount);
    }

    pub fn total(&self) -> u32 {
        TokenKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }
}
