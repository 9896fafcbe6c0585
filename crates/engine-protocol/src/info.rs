//! Search information reported by engines while thinking.

/// Score in centipawns or mate distance, from the mover's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// Centipawn score (100 = 1 pawn advantage).
    Cp(i32),
    /// Mate in N moves (positive = engine winning, negative = engine losing).
    Mate(i32),
}

impl Score {
    /// xboard engines encode mate as a huge centipawn value.
    const XBOARD_MATE: i32 = 100_000;
    const XBOARD_MATE_THRESHOLD: i32 = 90_000;

    fn from_xboard(value: i32) -> Self {
        if value.abs() >= Self::XBOARD_MATE_THRESHOLD {
            let plies = Self::XBOARD_MATE - value.abs();
            let moves = (plies + 1) / 2;
            Score::Mate(if value > 0 { moves.max(1) } else { -moves.max(1) })
        } else {
            Score::Cp(value)
        }
    }

    /// True for mate scores.
    pub fn is_mate(&self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

/// The subset of engine search output a match controller uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchInfo {
    /// Search depth in plies.
    pub depth: Option<u32>,
    /// Score evaluation.
    pub score: Option<Score>,
    /// Nodes searched.
    pub nodes: Option<u64>,
    /// Time spent in milliseconds.
    pub time_ms: Option<u64>,
    /// Principal variation (best line found).
    pub pv: Vec<String>,
}

impl SearchInfo {
    /// Parse a UCI `info` line.
    pub fn parse_uci(line: &str) -> Option<Self> {
        let line = line.trim();
        if line != "info" && !line.starts_with("info ") {
            return None;
        }

        let mut info = SearchInfo::default();
        let parts: Vec<&str> = line.split_whitespace().collect();
        let mut i = 1; // Skip "info"

        while i < parts.len() {
            match parts[i] {
                "depth" => {
                    i += 1;
                    if i < parts.len() {
                        info.depth = parts[i].parse().ok();
                    }
                }
                "score" => {
                    // score cp <x> | score mate <y> [lowerbound|upperbound]
                    if i + 2 < parts.len() {
                        let value = parts[i + 2].parse().ok();
                        info.score = match (parts[i + 1], value) {
                            ("cp", Some(v)) => Some(Score::Cp(v)),
                            ("mate", Some(v)) => Some(Score::Mate(v)),
                            _ => info.score,
                        };
                        i += 2;
                    }
                }
                "nodes" => {
                    i += 1;
                    if i < parts.len() {
                        info.nodes = parts[i].parse().ok();
                    }
                }
                "time" => {
                    i += 1;
                    if i < parts.len() {
                        info.time_ms = parts[i].parse().ok();
                    }
                }
                "pv" => {
                    info.pv = parts[i + 1..].iter().map(|s| s.to_string()).collect();
                    break;
                }
                // "string" swallows the rest of the line
                "string" => break,
                _ => {}
            }
            i += 1;
        }

        Some(info)
    }

    /// Parse an xboard thinking line: `ply score time nodes pv...`.
    ///
    /// The score is in centipawns and the time in centiseconds.
    pub fn parse_xboard(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let depth: u32 = parts.next()?.trim_end_matches(['.', '&']).parse().ok()?;
        let score: i32 = parts.next()?.parse().ok()?;
        let time_cs: u64 = parts.next()?.parse().ok()?;
        let nodes: u64 = parts.next()?.parse().ok()?;
        Some(SearchInfo {
            depth: Some(depth),
            score: Some(Score::from_xboard(score)),
            nodes: Some(nodes),
            time_ms: Some(time_cs * 10),
            pv: parts.map(|s| s.to_string()).collect(),
        })
    }
}
