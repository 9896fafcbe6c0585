//! Match configuration.
//!
//! Settings come from three layers: command-line flags, an optional TOML
//! file, and built-in defaults. Both outer layers deserialize into
//! [`Settings`], where every field is optional; [`Settings::or`] overlays
//! them and [`MatchConfig::from_settings`] fills the defaults and validates
//! the result into the immutable configuration shared by the whole match.

use crate::cores::{parse_core_list, CoreListError, CoreLists};
use engine_protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on concurrently running games.
pub const MAX_THREADS: u32 = 32;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    /// One of the two engines was not given.
    #[error("Must specify two engines (missing {0})")]
    MissingEngine(&'static str),
    /// Both PGN and PGN4 output were requested.
    #[error("Must not choose both PGN and PGN4 output")]
    ConflictingOutputs,
    /// A feature the built-in referee cannot play.
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Unknown or unsupported chess variant.
    #[error("Unsupported variant: {0}")]
    UnsupportedVariant(String),
    /// SPRT parameters that do not describe a valid test.
    #[error("Invalid SPRT parameters: {0}")]
    InvalidSprt(String),
    /// A core list could not be parsed or overlaps another.
    #[error("Invalid core list: {0}")]
    CoreList(#[from] CoreListError),
}

/// Every configurable value, all optional so layers can be merged.
///
/// TOML keys match the long command-line flag names.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub e1: Option<PathBuf>,
    pub e2: Option<PathBuf>,
    pub x1: Option<bool>,
    pub x2: Option<bool>,
    pub cores1: Option<u32>,
    pub cores2: Option<u32>,
    pub mem1: Option<u32>,
    pub mem2: Option<u32>,
    pub custom1: Option<Vec<String>>,
    pub custom2: Option<Vec<String>>,
    pub debug1: Option<bool>,
    pub debug2: Option<bool>,
    pub ponder1: Option<bool>,
    pub ponder2: Option<bool>,
    pub tc: Option<u64>,
    pub inc: Option<u64>,
    pub fixed: Option<u64>,
    pub margin: Option<u64>,
    pub games: Option<u32>,
    pub threads: Option<u32>,
    pub maxmoves: Option<u32>,
    pub earlywin: Option<bool>,
    pub earlydraw: Option<bool>,
    pub drawscore: Option<u32>,
    pub drawmoves: Option<u32>,
    pub fens: Option<PathBuf>,
    pub repeat: Option<bool>,
    pub variant: Option<String>,
    #[serde(rename = "4pc")]
    pub four_player: Option<bool>,
    #[serde(rename = "continue")]
    pub continue_on_error: Option<bool>,
    pub pmoves: Option<bool>,
    pub pgn: Option<PathBuf>,
    pub pgn4: Option<PathBuf>,
    pub sprt: Option<bool>,
    #[serde(rename = "sprt-elo0")]
    pub sprt_elo0: Option<f64>,
    #[serde(rename = "sprt-elo1")]
    pub sprt_elo1: Option<f64>,
    #[serde(rename = "sprt-alpha")]
    pub sprt_alpha: Option<f64>,
    #[serde(rename = "sprt-beta")]
    pub sprt_beta: Option<f64>,
    pub pcores: Option<String>,
    pub lcores: Option<String>,
    pub ecores: Option<String>,
    pub gcores: Option<String>,
    pub results: Option<PathBuf>,
    #[serde(rename = "results-log")]
    pub results_log: Option<PathBuf>,
    #[serde(rename = "poll-ms")]
    pub poll_ms: Option<u64>,
}

macro_rules! overlay {
    ($top:ident, $base:ident, $($field:ident),+ $(,)?) => {
        Settings {
            $($field: $top.$field.or($base.$field),)+
        }
    };
}

impl Settings {
    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadError`] if the file cannot be read, or
    /// [`ConfigError::ParseError`] if it is not valid TOML for [`Settings`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Values set in `self` win; unset ones are taken from `base`.
    pub fn or(self, base: Settings) -> Settings {
        let top = self;
        overlay!(
            top, base, e1, e2, x1, x2, cores1, cores2, mem1, mem2, custom1, custom2, debug1,
            debug2, ponder1, ponder2, tc, inc, fixed, margin, games, threads, maxmoves,
            earlywin, earlydraw, drawscore, drawmoves, fens, repeat, variant, four_player,
            continue_on_error, pmoves, pgn, pgn4, sprt, sprt_elo0, sprt_elo1, sprt_alpha,
            sprt_beta, pcores, lcores, ecores, gcores, results, results_log, poll_ms,
        )
    }
}

/// Per-engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Path to the engine executable.
    pub path: PathBuf,
    pub protocol: Protocol,
    /// Search threads; 0 leaves the engine default.
    pub cores: u32,
    /// Hash size in MB; 0 leaves the engine default.
    pub memory_mb: u32,
    /// Sent verbatim after the standard options.
    pub custom_commands: Vec<String>,
    /// Log this engine's traffic at info level.
    pub debug: bool,
    pub ponder: bool,
}

/// Clock settings in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeControl {
    pub base_ms: u64,
    pub inc_ms: u64,
    /// Fixed time per move; when non-zero the clocks are not used.
    pub fixed_ms: u64,
    /// How far below zero a clock may go before the game is lost on time.
    pub margin_ms: u64,
}

impl TimeControl {
    /// Short human-readable form: `10+0.10` or `0.25s` for fixed time.
    pub fn label(&self) -> String {
        if self.fixed_ms > 0 {
            format!("{:.2}s", self.fixed_ms as f64 / 1000.0)
        } else {
            format!("{}+{:.2}", self.base_ms / 1000, self.inc_ms as f64 / 1000.0)
        }
    }

    /// PGN `TimeControl` tag value.
    pub fn pgn_tag(&self) -> String {
        let secs = |ms: u64| {
            if ms % 1000 == 0 {
                format!("{}", ms / 1000)
            } else {
                format!("{}", ms as f64 / 1000.0)
            }
        };
        if self.fixed_ms > 0 {
            format!("1/{}", secs(self.fixed_ms))
        } else {
            format!("{}+{}", secs(self.base_ms), secs(self.inc_ms))
        }
    }
}

/// Game adjudication thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjudication {
    /// Plies after which a game is drawn regardless of scores.
    pub max_moves: u32,
    pub early_win: bool,
    pub early_draw: bool,
    /// Centipawn window for early draws.
    pub draw_score: u32,
    /// Consecutive plies inside the window before a draw is declared.
    pub draw_moves: u32,
}

/// SPRT hypotheses and error rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtConfig {
    pub elo0: f64,
    pub elo1: f64,
    pub alpha: f64,
    pub beta: f64,
}

/// Chess variants the referee can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    Standard,
    Chess960,
}

impl Variant {
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedVariant`] for anything other than
    /// standard chess or Chess960.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "chess" | "standard" | "normal" => Ok(Variant::Standard),
            "chess960" | "960" | "fischerandom" | "fischerrandom" => Ok(Variant::Chess960),
            _ => Err(ConfigError::UnsupportedVariant(name.to_string())),
        }
    }
}

/// Immutable, validated match configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    pub engine1: EngineConfig,
    pub engine2: EngineConfig,
    pub time: TimeControl,
    /// Number of games to play.
    pub games: u32,
    /// Number of concurrent games, already clamped.
    pub threads: u32,
    pub adjudication: Adjudication,
    /// Opening positions, one FEN per line.
    pub openings: Option<PathBuf>,
    /// Play each opening twice with colours reversed.
    pub repeat_openings: bool,
    pub variant: Variant,
    pub continue_on_error: bool,
    pub print_moves: bool,
    pub pgn: Option<PathBuf>,
    pub sprt: Option<SprtConfig>,
    pub cores: CoreLists,
    pub results_path: PathBuf,
    pub results_log_path: PathBuf,
    /// Scheduler wake-up interval.
    pub poll_interval: Duration,
}

impl MatchConfig {
    /// Fills defaults into `settings` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn from_settings(s: Settings) -> Result<Self, ConfigError> {
        let engine1 = EngineConfig {
            path: s.e1.ok_or(ConfigError::MissingEngine("--e1"))?,
            protocol: protocol(s.x1),
            cores: s.cores1.unwrap_or(1),
            memory_mb: s.mem1.unwrap_or(128),
            custom_commands: s.custom1.unwrap_or_default(),
            debug: s.debug1.unwrap_or(false),
            ponder: s.ponder1.unwrap_or(false),
        };
        let engine2 = EngineConfig {
            path: s.e2.ok_or(ConfigError::MissingEngine("--e2"))?,
            protocol: protocol(s.x2),
            cores: s.cores2.unwrap_or(1),
            memory_mb: s.mem2.unwrap_or(128),
            custom_commands: s.custom2.unwrap_or_default(),
            debug: s.debug2.unwrap_or(false),
            ponder: s.ponder2.unwrap_or(false),
        };

        if s.pgn.is_some() && s.pgn4.is_some() {
            return Err(ConfigError::ConflictingOutputs);
        }
        if s.pgn4.is_some() {
            return Err(ConfigError::Unsupported("PGN4 output".to_string()));
        }
        if s.four_player.unwrap_or(false) {
            return Err(ConfigError::Unsupported("four-player chess".to_string()));
        }
        let variant = match &s.variant {
            Some(name) => Variant::parse(name)?,
            None => Variant::Standard,
        };

        let sprt = if s.sprt.unwrap_or(false) {
            let sprt = SprtConfig {
                elo0: s.sprt_elo0.unwrap_or(0.0),
                elo1: s.sprt_elo1.unwrap_or(5.0),
                alpha: s.sprt_alpha.unwrap_or(0.05),
                beta: s.sprt_beta.unwrap_or(0.05),
            };
            validate_sprt(&sprt)?;
            Some(sprt)
        } else {
            None
        };

        let core_list = |text: &Option<String>| match text {
            Some(text) => parse_core_list(text),
            None => Ok(Vec::new()),
        };
        let cores = CoreLists {
            physical_fast: core_list(&s.pcores)?,
            logical_fast: core_list(&s.lcores)?,
            efficiency: core_list(&s.ecores)?,
            generic: core_list(&s.gcores)?,
        };
        cores.ensure_disjoint()?;

        let games = s.games.unwrap_or(1_000_000);
        let threads = s.threads.unwrap_or(1).clamp(1, MAX_THREADS).min(games.max(1));

        Ok(Self {
            engine1,
            engine2,
            time: TimeControl {
                base_ms: s.tc.unwrap_or(10_000),
                inc_ms: s.inc.unwrap_or(100),
                fixed_ms: s.fixed.unwrap_or(0),
                margin_ms: s.margin.unwrap_or(50),
            },
            games,
            threads,
            adjudication: Adjudication {
                max_moves: s.maxmoves.unwrap_or(1000),
                early_win: s.earlywin.unwrap_or(false),
                early_draw: s.earlydraw.unwrap_or(false),
                draw_score: s.drawscore.unwrap_or(25),
                draw_moves: s.drawmoves.unwrap_or(20),
            },
            openings: s.fens,
            repeat_openings: s.repeat.unwrap_or(false),
            variant,
            continue_on_error: s.continue_on_error.unwrap_or(false),
            print_moves: s.pmoves.unwrap_or(false),
            pgn: s.pgn,
            sprt,
            cores,
            results_path: s.results.unwrap_or_else(|| PathBuf::from("results.txt")),
            results_log_path: s
                .results_log
                .unwrap_or_else(|| PathBuf::from("results_log.txt")),
            poll_interval: Duration::from_millis(s.poll_ms.unwrap_or(500).max(1)),
        })
    }

    /// Cores one game needs: both engines' when either ponders, otherwise
    /// the larger of the two.
    pub fn cores_per_game(&self) -> usize {
        let (c1, c2) = (self.engine1.cores as usize, self.engine2.cores as usize);
        if self.engine1.ponder || self.engine2.ponder {
            c1 + c2
        } else {
            c1.max(c2).max(1)
        }
    }
}

fn protocol(xboard: Option<bool>) -> Protocol {
    if xboard.unwrap_or(false) {
        Protocol::Xboard
    } else {
        Protocol::Uci
    }
}

fn validate_sprt(sprt: &SprtConfig) -> Result<(), ConfigError> {
    let unit = |p: f64| p > 0.0 && p < 1.0;
    if !unit(sprt.alpha) || !unit(sprt.beta) {
        return Err(ConfigError::InvalidSprt(format!(
            "alpha and beta must be in (0, 1), got {} and {}",
            sprt.alpha, sprt.beta
        )));
    }
    if sprt.elo0 >= sprt.elo1 {
        return Err(ConfigError::InvalidSprt(format!(
            "elo0 ({}) must be less than elo1 ({})",
            sprt.elo0, sprt.elo1
        )));
    }
    Ok(())
}
