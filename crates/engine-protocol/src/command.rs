//! Controller-to-engine commands.

use crate::Protocol;

/// Remaining clock state handed to an engine when it is asked to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Clock {
    /// White time remaining in milliseconds.
    pub white_ms: u64,
    /// Black time remaining in milliseconds.
    pub black_ms: u64,
    /// Increment per move in milliseconds.
    pub inc_ms: u64,
    /// Fixed time per move; overrides the clocks when set.
    pub movetime_ms: Option<u64>,
    /// Whether the engine being asked to move plays white.
    pub white_to_move: bool,
}

/// Commands sent from controller to engine.
///
/// Not every command exists in both protocols; [`GuiCommand::lines`] returns
/// no lines for a command the protocol has no equivalent for.
#[derive(Debug, Clone, PartialEq)]
pub enum GuiCommand {
    /// Enter protocol mode (`uci` / `xboard` + `protover 2`).
    Handshake,
    /// Synchronize (`isready` / `ping N`).
    Ping(u32),
    /// Reset for a new game. xboard engines are left in force mode.
    NewGame,
    /// Hash table size in MB.
    Memory(u32),
    /// Number of search threads.
    Cores(u32),
    /// Allow thinking on the opponent's time.
    Ponder(bool),
    /// Switch to Chess960 castling rules.
    Chess960,
    /// Set the position. xboard engines receive the moves one by one.
    Position { fen: Option<String>, moves: Vec<String> },
    /// xboard `level` for incremental time controls.
    Level { base_ms: u64, inc_ms: u64 },
    /// xboard `st` for a fixed time per move.
    FixedTime { ms: u64 },
    /// Start thinking with the given clocks.
    Go(Clock),
    /// A move played on the board (xboard force mode).
    Move(String),
    /// Keep the engine from moving on its own (xboard).
    Force,
    /// Exit the engine.
    Quit,
    /// Free text sent verbatim.
    Raw(String),
}

impl GuiCommand {
    /// Render the command as the wire lines for `protocol`.
    pub fn lines(&self, protocol: Protocol) -> Vec<String> {
        match protocol {
            Protocol::Uci => self.uci_lines(),
            Protocol::Xboard => self.xboard_lines(),
        }
    }

    fn uci_lines(&self) -> Vec<String> {
        match self {
            GuiCommand::Handshake => vec!["uci".to_string()],
            GuiCommand::Ping(_) => vec!["isready".to_string()],
            GuiCommand::NewGame => vec!["ucinewgame".to_string()],
            GuiCommand::Memory(mb) => vec![format!("setoption name Hash value {}", mb)],
            GuiCommand::Cores(n) => vec![format!("setoption name Threads value {}", n)],
            GuiCommand::Ponder(on) => vec![format!("setoption name Ponder value {}", on)],
            GuiCommand::Chess960 => vec!["setoption name UCI_Chess960 value true".to_string()],
            GuiCommand::Position { fen, moves } => {
                let mut line = match fen {
                    Some(fen) => format!("position fen {}", fen),
                    None => "position startpos".to_string(),
                };
                if !moves.is_empty() {
                    line.push_str(" moves ");
                    line.push_str(&moves.join(" "));
                }
                vec![line]
            }
            GuiCommand::Level { .. } | GuiCommand::FixedTime { .. } => Vec::new(),
            GuiCommand::Go(clock) => match clock.movetime_ms {
                Some(ms) => vec![format!("go movetime {}", ms)],
                None => vec![format!(
                    "go wtime {} btime {} winc {} binc {}",
                    clock.white_ms, clock.black_ms, clock.inc_ms, clock.inc_ms
                )],
            },
            GuiCommand::Move(_) | GuiCommand::Force => Vec::new(),
            GuiCommand::Quit => vec!["quit".to_string()],
            GuiCommand::Raw(text) => vec![text.clone()],
        }
    }

    fn xboard_lines(&self) -> Vec<String> {
        match self {
            GuiCommand::Handshake => vec!["xboard".to_string(), "protover 2".to_string()],
            GuiCommand::Ping(n) => vec![format!("ping {}", n)],
            GuiCommand::NewGame => vec!["new".to_string(), "force".to_string()],
            GuiCommand::Memory(mb) => vec![format!("memory {}", mb)],
            GuiCommand::Cores(n) => vec![format!("cores {}", n)],
            GuiCommand::Ponder(on) => vec![if *on { "hard" } else { "easy" }.to_string()],
            GuiCommand::Chess960 => vec!["variant fischerandom".to_string()],
            GuiCommand::Position { fen, moves } => {
                let mut lines = Vec::new();
                if let Some(fen) = fen {
                    lines.push(format!("setboard {}", fen));
                }
                lines.extend(moves.iter().cloned());
                lines
            }
            GuiCommand::Level { base_ms, inc_ms } => {
                let secs = base_ms / 1000;
                let base = if secs % 60 == 0 {
                    format!("{}", secs / 60)
                } else {
                    format!("{}:{:02}", secs / 60, secs % 60)
                };
                vec![format!("level 0 {} {}", base, format_seconds(*inc_ms))]
            }
            GuiCommand::FixedTime { ms } => vec![format!("st {}", (ms + 999) / 1000)],
            GuiCommand::Go(clock) => {
                let (own, other) = if clock.white_to_move {
                    (clock.white_ms, clock.black_ms)
                } else {
                    (clock.black_ms, clock.white_ms)
                };
                let mut lines = Vec::new();
                if clock.movetime_ms.is_none() {
                    lines.push(format!("time {}", own / 10));
                    lines.push(format!("otim {}", other / 10));
                }
                lines.push("go".to_string());
                lines
            }
            GuiCommand::Move(mv) => vec![mv.clone()],
            GuiCommand::Force => vec!["force".to_string()],
            GuiCommand::Quit => vec!["quit".to_string()],
            GuiCommand::Raw(text) => vec![text.clone()],
        }
    }
}

fn format_seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}", ms / 1000)
    } else {
        let s = format!("{:.3}", ms as f64 / 1000.0);
        s.trim_end_matches('0').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uci_engine_setup_verbs() {
        assert_eq!(
            GuiCommand::Memory(128).lines(Protocol::Uci),
            vec!["setoption name Hash value 128"]
        );
        assert_eq!(
            GuiCommand::Cores(4).lines(Protocol::Uci),
            vec!["setoption name Threads value 4"]
        );
        assert_eq!(GuiCommand::Quit.lines(Protocol::Uci), vec!["quit"]);
    }

    #[test]
    fn xboard_engine_setup_verbs() {
        assert_eq!(GuiCommand::Memory(128).lines(Protocol::Xboard), vec!["memory 128"]);
        assert_eq!(GuiCommand::Cores(4).lines(Protocol::Xboard), vec!["cores 4"]);
        assert_eq!(
            GuiCommand::Handshake.lines(Protocol::Xboard),
            vec!["xboard", "protover 2"]
        );
    }

    #[test]
    fn uci_position_with_fen_and_moves() {
        let cmd = GuiCommand::Position {
            fen: Some("8/8/8/8/8/8/k7/K7 w - - 0 1".to_string()),
            moves: vec!["a1b1".to_string()],
        };
        assert_eq!(
            cmd.lines(Protocol::Uci),
            vec!["position fen 8/8/8/8/8/8/k7/K7 w - - 0 1 moves a1b1"]
        );
        let start = GuiCommand::Position {
            fen: None,
            moves: vec![],
        };
        assert_eq!(start.lines(Protocol::Uci), vec!["position startpos"]);
    }

    #[test]
    fn go_with_clocks() {
        let clock = Clock {
            white_ms: 9_500,
            black_ms: 10_000,
            inc_ms: 100,
            movetime_ms: None,
            white_to_move: false,
        };
        assert_eq!(
            GuiCommand::Go(clock).lines(Protocol::Uci),
            vec!["go wtime 9500 btime 10000 winc 100 binc 100"]
        );
        assert_eq!(
            GuiCommand::Go(clock).lines(Protocol::Xboard),
            vec!["time 1000", "otim 950", "go"]
        );
    }

    #[test]
    fn go_with_fixed_time() {
        let clock = Clock {
            movetime_ms: Some(250),
            ..Clock::default()
        };
        assert_eq!(GuiCommand::Go(clock).lines(Protocol::Uci), vec!["go movetime 250"]);
        assert_eq!(GuiCommand::Go(clock).lines(Protocol::Xboard), vec!["go"]);
        assert_eq!(
            GuiCommand::FixedTime { ms: 250 }.lines(Protocol::Xboard),
            vec!["st 1"]
        );
    }

    #[test]
    fn xboard_level_formats() {
        assert_eq!(
            GuiCommand::Level {
                base_ms: 10_000,
                inc_ms: 100
            }
            .lines(Protocol::Xboard),
            vec!["level 0 0:10 0.1"]
        );
        assert_eq!(
            GuiCommand::Level {
                base_ms: 300_000,
                inc_ms: 2_000
            }
            .lines(Protocol::Xboard),
            vec!["level 0 5 2"]
        );
    }

    #[test]
    fn protocol_only_commands_are_empty_elsewhere() {
        assert!(GuiCommand::Force.lines(Protocol::Uci).is_empty());
        assert!(GuiCommand::Level {
            base_ms: 1,
            inc_ms: 1
        }
        .lines(Protocol::Uci)
        .is_empty());
        assert_eq!(
            GuiCommand::Move("e2e4".to_string()).lines(Protocol::Xboard),
            vec!["e2e4"]
        );
    }
}
