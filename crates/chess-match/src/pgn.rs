//! PGN (Portable Game Notation) output.
//!
//! Workers format each finished game with [`format_pgn`] and queue the text
//! on their slot. The scheduler thread owns the output file and drains the
//! slots into it with a [`PgnFlusher`], so only one thread ever writes the
//! file.

use crate::game::GameResult;
use crate::slot::GameSlot;
use chrono::Local;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LINE_WIDTH: usize = 80;

/// Everything needed to write one game.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub round: u32,
    pub white: String,
    pub black: String,
    pub result: GameResult,
    /// Human-readable reason the game ended.
    pub termination: String,
    /// Set when the game did not start from the initial position.
    pub start_fen: Option<String>,
    pub chess960: bool,
    pub time_control: String,
    /// Full-move number of the first move.
    pub first_move_number: u32,
    /// Whether black made the first move.
    pub black_moves_first: bool,
    /// Moves in SAN.
    pub moves: Vec<String>,
}

impl GameResult {
    /// The PGN result token.
    pub fn pgn_token(self) -> &'static str {
        match self {
            GameResult::WhiteWins => "1-0",
            GameResult::BlackWins => "0-1",
            GameResult::Draw => "1/2-1/2",
        }
    }
}

/// Renders a game as PGN text, terminated by a blank line.
///
/// Movetext is wrapped at 80 columns without splitting tokens.
pub fn format_pgn(record: &GameRecord) -> String {
    let result = record.result.pgn_token();
    let mut out = String::new();
    let mut tag = |name: &str, value: &str| {
        let _ = writeln!(out, "[{} \"{}\"]", name, value.replace('\\', "\\\\").replace('"', "\\\""));
    };
    tag("Event", "Engine Match");
    tag("Site", "local");
    tag("Date", &Local::now().format("%Y.%m.%d").to_string());
    tag("Round", &record.round.to_string());
    tag("White", &record.white);
    tag("Black", &record.black);
    tag("Result", result);
    if record.chess960 {
        tag("Variant", "Chess960");
    }
    if let Some(fen) = &record.start_fen {
        tag("SetUp", "1");
        tag("FEN", fen);
    }
    tag("TimeControl", &record.time_control);
    tag("PlyCount", &record.moves.len().to_string());
    tag("Termination", &record.termination);
    out.push('\n');

    let mut tokens = Vec::with_capacity(record.moves.len() * 3 / 2 + 1);
    let mut number = record.first_move_number.max(1);
    let mut white_to_move = !record.black_moves_first;
    for (i, san) in record.moves.iter().enumerate() {
        if white_to_move {
            tokens.push(format!("{}.", number));
        } else if i == 0 {
            tokens.push(format!("{}...", number));
        }
        tokens.push(san.clone());
        if !white_to_move {
            number += 1;
        }
        white_to_move = !white_to_move;
    }
    tokens.push(result.to_string());

    let mut line = String::new();
    for token in tokens {
        if !line.is_empty() && line.len() + 1 + token.len() > LINE_WIDTH {
            out.push_str(&line);
            out.push('\n');
            line.clear();
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&token);
    }
    out.push_str(&line);
    out.push_str("\n\n");
    out
}

/// Appends queued game text from the slots to the PGN file.
pub struct PgnFlusher {
    file: File,
    path: PathBuf,
}

impl PgnFlusher {
    /// Creates (or truncates) the PGN file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be created.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every slot's ready text and returns how many slots had some.
    /// Slots that are not ready are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first write error; text already taken from a slot is lost
    /// in that case.
    pub fn flush_slots(&mut self, slots: &[GameSlot]) -> io::Result<usize> {
        let mut flushed = 0;
        for slot in slots {
            if let Some(text) = slot.take_pgn() {
                self.file.write_all(text.as_bytes())?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            self.file.flush()?;
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(moves: &[&str], result: GameResult) -> GameRecord {
        GameRecord {
            round: 3,
            white: "TestEngineWhite".to_string(),
            black: "TestEngineBlack".to_string(),
            result,
            termination: "checkmate".to_string(),
            start_fen: None,
            chess960: false,
            time_control: "10+0.1".to_string(),
            first_move_number: 1,
            black_moves_first: false,
            moves: moves.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_format_pgn_headers() {
        let text = format_pgn(&record(&["f3", "e5", "g4", "Qh4#"], GameResult::BlackWins));
        assert!(text.starts_with("[Event \"Engine Match\"]\n"));
        assert!(text.contains("[Round \"3\"]"));
        assert!(text.contains("[White \"TestEngineWhite\"]"));
        assert!(text.contains("[Black \"TestEngineBlack\"]"));
        assert!(text.contains("[Result \"0-1\"]"));
        assert!(text.contains("[TimeControl \"10+0.1\"]"));
        assert!(text.contains("[PlyCount \"4\"]"));
        assert!(!text.contains("[FEN"));
    }

    #[test]
    fn test_format_pgn_movetext() {
        let text = format_pgn(&record(&["f3", "e5", "g4", "Qh4#"], GameResult::BlackWins));
        assert!(text.ends_with("\n\n1. f3 e5 2. g4 Qh4# 0-1\n\n"));
    }

    #[test]
    fn test_format_pgn_from_fen_with_black_to_move() {
        let mut game = record(&["Kb1", "Kb3"], GameResult::Draw);
        game.start_fen = Some("8/8/8/8/8/k7/8/K7 b - - 0 40".to_string());
        game.first_move_number = 40;
        game.black_moves_first = true;
        let text = format_pgn(&game);
        assert!(text.contains("[SetUp \"1\"]\n[FEN \"8/8/8/8/8/k7/8/K7 b - - 0 40\"]"));
        assert!(text.contains("40... Kb1 41. Kb3 1/2-1/2"));
    }

    #[test]
    fn test_format_pgn_wraps_lines() {
        let moves: Vec<&str> = ["Nf3", "Nf6", "Ng1", "Ng8"].iter().cycle().take(80).copied().collect();
        let text = format_pgn(&record(&moves, GameResult::Draw));
        let movetext = text.split("\n\n").nth(1).unwrap();
        assert!(movetext.lines().count() > 1);
        assert!(movetext.lines().all(|l| l.len() <= LINE_WIDTH));
    }

    #[test]
    fn test_format_pgn_escapes_tags() {
        let mut game = record(&[], GameResult::Draw);
        game.white = "My \"Engine\"".to_string();
        let text = format_pgn(&game);
        assert!(text.contains("[White \"My \\\"Engine\\\"\"]"));
        assert!(text.ends_with("\n\n1/2-1/2\n\n"));
    }

    #[test]
    fn test_flusher_drains_ready_slots_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.pgn");
        let mut flusher = PgnFlusher::create(&path).unwrap();
        let slots: Vec<GameSlot> = (0..3).map(GameSlot::new).collect();
        slots[0].push_pgn("first\n");
        slots[2].push_pgn("second\n");

        assert_eq!(flusher.flush_slots(&slots).unwrap(), 2);
        assert_eq!(flusher.flush_slots(&slots).unwrap(), 0);
        slots[0].push_pgn("third\n");
        assert_eq!(flusher.flush_slots(&slots).unwrap(), 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\nthird\n");
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.pgn");
        std::fs::write(&path, "old games").unwrap();
        let flusher = PgnFlusher::create(&path).unwrap();
        assert_eq!(flusher.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
