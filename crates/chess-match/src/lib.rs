//! Chess Match - concurrent engine-vs-engine matches.
//!
//! This crate plays many games between two chess engines at once, estimates
//! the Elo difference between them, optionally stops early with a sequential
//! probability ratio test, and persists results and PGN as it goes.
//!
//! # Modules
//!
//! - [`config`] - Command-line/TOML settings and the validated match configuration
//! - [`openings`] - Sequential opening positions from a FEN file
//! - [`cores`] - CPU core pools and per-game allocation
//! - [`sprt`] - Sequential probability ratio test
//! - [`results`] - Elo estimate, results snapshot and log
//! - [`pgn`] - Per-game PGN text and the PGN flusher
//! - [`slot`] - Per-slot counters and flags shared with workers
//! - [`engine`] - Engine process client for UCI and xboard
//! - [`game`] - Referee and the engine game worker
//! - [`scheduler`] - The match control loop
//! - [`shutdown`] - Engine shutdown and user abort handling
//! - [`runner`] - Match startup and teardown

pub mod config;
pub mod cores;
pub mod engine;
pub mod game;
pub mod openings;
pub mod pgn;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod slot;
pub mod sprt;
