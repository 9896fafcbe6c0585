//! Controller-side vocabulary for the two chess engine protocols a match
//! controller has to speak.
//!
//! The crate does not own any processes. It renders commands into the exact
//! text lines a given protocol expects and classifies the lines an engine
//! writes back.
//!
//! # Supported protocols
//!
//! - **UCI** - `uci`/`uciok`, `isready`/`readyok`, `setoption`, `position`,
//!   `go`, `bestmove`.
//! - **xboard** (CECP v2) - `xboard`/`protover 2`, `feature ... done=1`,
//!   `ping`/`pong`, `memory`, `cores`, `setboard`, `time`/`otim`, `move`.

mod command;
mod info;

pub use command::{Clock, GuiCommand};
pub use info::{Score, SearchInfo};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown engine protocol: {0}")]
    UnknownProtocol(String),
}

/// The text protocol an engine process speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Protocol {
    /// Universal Chess Interface.
    #[default]
    Uci,
    /// The legacy xboard/WinBoard protocol (CECP).
    Xboard,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Uci => write!(f, "uci"),
            Protocol::Xboard => write!(f, "xboard"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uci" => Ok(Protocol::Uci),
            "xboard" | "cecp" | "winboard" => Ok(Protocol::Xboard),
            other => Err(ProtocolError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Messages sent from engine to controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// UCI engine identification (`id name`).
    Id { name: String },
    /// UCI initialization complete.
    UciOk,
    /// An xboard `feature` line. `done` is set by `done=1`.
    Features { name: Option<String>, done: bool },
    /// UCI `readyok`.
    ReadyOk,
    /// xboard `pong N`.
    Pong(u32),
    /// Search information.
    Info(SearchInfo),
    /// The engine's chosen move.
    BestMove { mv: String, ponder: Option<String> },
    /// xboard `resign`.
    Resign,
    /// Anything the controller does not need to act on.
    Unknown(String),
}

impl EngineMessage {
    /// Classify one line of engine output.
    pub fn parse(protocol: Protocol, line: &str) -> Self {
        let line = line.trim();
        match protocol {
            Protocol::Uci => Self::parse_uci(line),
            Protocol::Xboard => Self::parse_xboard(line),
        }
    }

    fn parse_uci(line: &str) -> Self {
        if let Some(name) = line.strip_prefix("id name ") {
            return EngineMessage::Id {
                name: name.trim().to_string(),
            };
        }
        match line {
            "uciok" => return EngineMessage::UciOk,
            "readyok" => return EngineMessage::ReadyOk,
            _ => {}
        }
        if line == "bestmove" || line.starts_with("bestmove ") {
            let mut parts = line.split_whitespace().skip(1);
            let mv = parts.next().unwrap_or("").to_string();
            let ponder = match (parts.next(), parts.next()) {
                (Some("ponder"), Some(p)) => Some(p.to_string()),
                _ => None,
            };
            return EngineMessage::BestMove { mv, ponder };
        }
        if let Some(info) = SearchInfo::parse_uci(line) {
            return EngineMessage::Info(info);
        }
        EngineMessage::Unknown(line.to_string())
    }

    fn parse_xboard(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix("feature ") {
            return EngineMessage::Features {
                name: feature_value(rest, "myname"),
                done: feature_value(rest, "done").as_deref() == Some("1"),
            };
        }
        if let Some(rest) = line.strip_prefix("pong") {
            if let Ok(n) = rest.trim().parse() {
                return EngineMessage::Pong(n);
            }
        }
        if let Some(mv) = line.strip_prefix("move ") {
            return EngineMessage::BestMove {
                mv: mv.trim().to_string(),
                ponder: None,
            };
        }
        if line == "resign" || line.starts_with("resign ") {
            return EngineMessage::Resign;
        }
        if let Some(info) = SearchInfo::parse_xboard(line) {
            return EngineMessage::Info(info);
        }
        EngineMessage::Unknown(line.to_string())
    }
}

/// Extract `key=value` or `key="quoted value"` from an xboard feature line.
fn feature_value(features: &str, key: &str) -> Option<String> {
    let needle = format!("{}=", key);
    let mut search = features;
    while let Some(pos) = search.find(&needle) {
        let at_boundary = pos == 0 || search.as_bytes()[pos - 1].is_ascii_whitespace();
        let rest = &search[pos + needle.len()..];
        if at_boundary {
            if let Some(quoted) = rest.strip_prefix('"') {
                return quoted.find('"').map(|end| quoted[..end].to_string());
            }
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            return Some(rest[..end].to_string());
        }
        search = rest;
    }
    None
}
