//! # Mosaic Session Server
//!
//! Authoritative coordinator for a live party game: players join over
//! websockets, pick roles and trivia specialties, gather tokens by answering
//! questions at physical stations, and then assemble a shared picture puzzle
//! whose difficulty depends on the tokens they earned.
//!
//! ## Core Responsibilities
//!
//! ### Session Registry (`registry`)
//! Tracks every participant, enforces host exclusivity and the player cap, and
//! keeps roles, specialties, readiness and location across reconnections.
//!
//! ### Broadcast Dispatcher (`broadcast`)
//! A bounded queue with a single consumer that fans envelopes out to the
//! participants an audience filter accepts, preserving per-recipient order.
//!
//! ### Phase Orchestrator (`orchestrator`)
//! Runs `setup → resource_gathering → puzzle_assembly → post_game` and back to
//! setup. It owns the session state behind one lock and drives the round loop,
//! the assembly clock and the post-game countdown on timer tasks.
//!
//! ### Connection Gateway (`network`)
//! Accepts websocket handshakes, admits or rejects them, and runs a reader and
//! a writer task per connection. Inbound frames are validated, checked
//! against the connection's identity and routed by message type.
//!
//! ## Supporting Modules
//!
//! - `game`: the session state and every rule that mutates it
//! - `phase`: the transition table and which actions each phase admits
//! - `puzzle`: grid sizing, thresholds and guide highlight geometry
//! - `trivia`: the question provider trait and the file-backed bank
//! - `analytics`: per-player counters and the post-game report
//! - `status`: `/health` and `/stats`
//! - `config`: command line options and game timings
//! - `coordinator`: wiring and the HTTP server
//!
//! ## Concurrency Model
//!
//! Session state mutations happen under a single async lock that is released
//! before anything is queued for delivery. Participant attributes sit behind
//! their own locks. Timer tasks carry the epoch they were started for and do
//! nothing once a reset has replaced the session.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mosaic_server::config::SessionSettings;
//! use mosaic_server::coordinator::Coordinator;
//! use mosaic_server::trivia::QuestionBank;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let questions = QuestionBank::load_dir(std::path::Path::new("trivia"))?;
//!     let coordinator = Coordinator::new(
//!         SessionSettings::default(),
//!         Arc::new(questions),
//!         "host-secret".to_string(),
//!         Vec::new(),
//!     );
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     coordinator.serve(listener).await?;
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod game;
pub mod network;
pub mod orchestrator;
pub mod phase;
pub mod puzzle;
pub mod registry;
pub mod status;
pub mod trivia;
pub mod utils;
