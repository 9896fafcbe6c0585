//! Plays one game between two engine processes.
//!
//! [`Referee`] keeps the authoritative position with `shakmaty` and decides
//! when the rules end the game. [`EngineGamePlayer`] is the worker the
//! scheduler runs on each slot: it pins the slot's engines to their cores,
//! runs the clocks, applies adjudication and writes the outcome, failure
//! flags and PGN text back to the slot.

use crate::config::{Adjudication, MatchConfig, TimeControl, Variant};
use crate::cores::{set_process_affinity, CoreAllocator};
use crate::engine::{EngineError, EngineProcess, EngineReply};
use crate::openings::Opening;
use crate::pgn::{format_pgn, GameRecord};
use crate::scheduler::{GameAssignment, GamePlayer};
use crate::slot::{EngineId, GameOutcome, GameSlot, SlotFailure};
use engine_protocol::{Clock, Score};
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Extra time an engine gets past its clock before it counts as hung.
pub const UNRESPONSIVE_GRACE: Duration = Duration::from_secs(10);

/// The outcome of a chess game by colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    WhiteWins,
    BlackWins,
    Draw,
}

impl GameResult {
    fn win_for(color: Color) -> Self {
        match color {
            Color::White => GameResult::WhiteWins,
            Color::Black => GameResult::BlackWins,
        }
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    FiftyMoves,
    Repetition,
    MaxMoves,
    AdjudicatedWin,
    AdjudicatedDraw,
    Resignation,
    /// The named engine ran out of time.
    TimeForfeit(EngineId),
    /// The named engine sent an illegal move.
    IllegalMove(EngineId),
}

impl Termination {
    /// Value for the PGN `Termination` tag.
    pub fn pgn_tag(self) -> &'static str {
        match self {
            Termination::MaxMoves
            | Termination::AdjudicatedWin
            | Termination::AdjudicatedDraw => "adjudication",
            Termination::TimeForfeit(_) => "time forfeit",
            Termination::IllegalMove(_) => "rules infraction",
            _ => "normal",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Checkmate => write!(f, "checkmate"),
            Termination::Stalemate => write!(f, "stalemate"),
            Termination::InsufficientMaterial => write!(f, "insufficient material"),
            Termination::FiftyMoves => write!(f, "fifty-move rule"),
            Termination::Repetition => write!(f, "threefold repetition"),
            Termination::MaxMoves => write!(f, "move limit"),
            Termination::AdjudicatedWin => write!(f, "adjudicated win"),
            Termination::AdjudicatedDraw => write!(f, "adjudicated draw"),
            Termination::Resignation => write!(f, "resignation"),
            Termination::TimeForfeit(id) => write!(f, "{:?} engine lost on time", id),
            Termination::IllegalMove(id) => write!(f, "{:?} engine played an illegal move", id),
        }
    }
}

/// Errors from the referee.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RefereeError {
    #[error("Invalid FEN {0:?}: {1}")]
    InvalidFen(String, String),
    #[error("Illegal move: {0}")]
    IllegalMove(String),
}

/// The authoritative game state.
#[derive(Debug, Clone)]
pub struct Referee {
    position: Chess,
    start_fen: Option<String>,
    first_move_number: u32,
    black_moves_first: bool,
    uci_moves: Vec<String>,
    san_moves: Vec<String>,
    seen: HashMap<String, u32>,
}

impl Referee {
    /// Sets up the opening position.
    ///
    /// # Errors
    ///
    /// Returns [`RefereeError::InvalidFen`] if the FEN does not parse or
    /// describes an impossible position.
    pub fn new(opening: &Opening, variant: Variant) -> Result<Self, RefereeError> {
        let mode = match variant {
            Variant::Standard => CastlingMode::Standard,
            Variant::Chess960 => CastlingMode::Chess960,
        };
        let position: Chess = match opening.fen() {
            None => Chess::default(),
            Some(text) => {
                let invalid = |e: &dyn fmt::Display| {
                    RefereeError::InvalidFen(text.to_string(), e.to_string())
                };
                let fen: Fen = text.parse().map_err(|e| invalid(&e))?;
                fen.into_position(mode).map_err(|e| invalid(&e))?
            }
        };
        let mut referee = Self {
            first_move_number: position.fullmoves().get(),
            black_moves_first: position.turn() == Color::Black,
            position,
            start_fen: opening.fen().map(str::to_string),
            uci_moves: Vec::new(),
            san_moves: Vec::new(),
            seen: HashMap::new(),
        };
        referee.remember_position();
        Ok(referee)
    }

    fn repetition_key(&self) -> String {
        format!(
            "{} {:?} {:?} {:?}",
            self.position.board(),
            self.position.turn(),
            self.position.castles().castling_rights(),
            self.position.ep_square(EnPassantMode::Legal)
        )
    }

    fn remember_position(&mut self) {
        *self.seen.entry(self.repetition_key()).or_insert(0) += 1;
    }

    pub fn white_to_move(&self) -> bool {
        self.position.turn() == Color::White
    }

    pub fn start_fen(&self) -> Option<&str> {
        self.start_fen.as_deref()
    }

    /// Moves played so far in UCI notation.
    pub fn uci_moves(&self) -> &[String] {
        &self.uci_moves
    }

    /// Moves played so far in SAN.
    pub fn san_moves(&self) -> &[String] {
        &self.san_moves
    }

    pub fn plies(&self) -> usize {
        self.uci_moves.len()
    }

    /// Plays a move given in UCI notation and returns its SAN.
    ///
    /// # Errors
    ///
    /// Returns [`RefereeError::IllegalMove`] if the text is not a legal move
    /// in the current position. The position is unchanged in that case.
    pub fn play_uci(&mut self, text: &str) -> Result<String, RefereeError> {
        let illegal = || RefereeError::IllegalMove(text.to_string());
        let uci: UciMove = text.parse().map_err(|_| illegal())?;
        let m = uci.to_move(&self.position).map_err(|_| illegal())?;
        let san = SanPlus::from_move_and_play_unchecked(&mut self.position, &m).to_string();
        self.uci_moves.push(text.to_string());
        self.san_moves.push(san.clone());
        self.remember_position();
        Ok(san)
    }

    /// The result if the rules have ended the game.
    pub fn outcome(&self) -> Option<(GameResult, Termination)> {
        if self.position.is_checkmate() {
            let winner = self.position.turn().other();
            return Some((GameResult::win_for(winner), Termination::Checkmate));
        }
        let termination = if self.position.is_stalemate() {
            Termination::Stalemate
        } else if self.position.is_insufficient_material() {
            Termination::InsufficientMaterial
        } else if self.position.halfmoves() >= 100 {
            Termination::FiftyMoves
        } else if self.seen.get(&self.repetition_key()).copied().unwrap_or(0) >= 3 {
            Termination::Repetition
        } else {
            return None;
        };
        Some((GameResult::Draw, termination))
    }
}

/// A game that reached a result.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedGame {
    pub result: GameResult,
    pub termination: Termination,
    pub white: EngineId,
    pub record: GameRecord,
}

impl FinishedGame {
    /// The result in terms of the configured engines.
    pub fn outcome(&self) -> GameOutcome {
        match self.result {
            GameResult::WhiteWins => GameOutcome::Win(self.white),
            GameResult::BlackWins => GameOutcome::Win(self.white.other()),
            GameResult::Draw => GameOutcome::Draw,
        }
    }
}

/// Errors that stop a game without a result.
#[derive(Error, Debug)]
pub enum GameError {
    #[error("{engine:?} engine: {source}")]
    Engine {
        engine: EngineId,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Opening(#[from] RefereeError),
}

impl GameError {
    /// The slot flag this error raises.
    pub fn slot_failure(&self) -> SlotFailure {
        match self {
            GameError::Engine {
                source: EngineError::Timeout(_),
                ..
            } => SlotFailure::Unresponsive,
            GameError::Engine { .. } => SlotFailure::Disconnected,
            GameError::Opening(_) => SlotFailure::Error,
        }
    }
}

/// Tracks the early win and early draw rules.
#[derive(Debug, Default)]
struct Adjudicator {
    last_scores: [Option<Score>; 2],
    quiet_plies: u32,
}

impl Adjudicator {
    /// Feeds the mover's score and returns a verdict if one is due.
    fn observe(
        &mut self,
        rules: &Adjudication,
        mover: Color,
        score: Option<Score>,
    ) -> Option<(GameResult, Termination)> {
        let idx = usize::from(mover == Color::Black);
        self.last_scores[idx] = score;

        if rules.early_win {
            if let (Some(Score::Mate(own)), Some(Score::Mate(theirs))) =
                (self.last_scores[idx], self.last_scores[1 - idx])
            {
                if own > 0 && theirs < 0 {
                    return Some((GameResult::win_for(mover), Termination::AdjudicatedWin));
                }
                if own < 0 && theirs > 0 {
                    return Some((GameResult::win_for(mover.other()), Termination::AdjudicatedWin));
                }
            }
        }

        if rules.early_draw && rules.draw_moves > 0 {
            let limit = i64::from(rules.draw_score);
            match score {
                Some(Score::Cp(cp)) if i64::from(cp).abs() <= limit => self.quiet_plies += 1,
                _ => self.quiet_plies = 0,
            }
            if self.quiet_plies >= rules.draw_moves {
                return Some((GameResult::Draw, Termination::AdjudicatedDraw));
            }
        }
        None
    }
}

/// Remaining time for both sides.
#[derive(Debug, Clone, Copy)]
struct GameClock {
    time: TimeControl,
    remaining_ms: [i64; 2],
}

impl GameClock {
    fn new(time: TimeControl) -> Self {
        let base = time.base_ms as i64;
        Self {
            time,
            remaining_ms: [base, base],
        }
    }

    fn for_engine(&self, white_to_move: bool) -> Clock {
        let clamp = |ms: i64| ms.max(0) as u64;
        Clock {
            white_ms: clamp(self.remaining_ms[0]),
            black_ms: clamp(self.remaining_ms[1]),
            inc_ms: self.time.inc_ms,
            movetime_ms: (self.time.fixed_ms > 0).then_some(self.time.fixed_ms),
            white_to_move,
        }
    }

    /// How long to wait for the mover before calling it unresponsive.
    fn deadline(&self, mover: Color) -> Duration {
        let budget = if self.time.fixed_ms > 0 {
            self.time.fixed_ms as i64
        } else {
            self.remaining_ms[usize::from(mover == Color::Black)].max(0)
        };
        Duration::from_millis((budget as u64).saturating_add(self.time.margin_ms))
            + UNRESPONSIVE_GRACE
    }

    /// Charges `elapsed` to the mover. Returns false if it lost on time.
    fn charge(&mut self, mover: Color, elapsed: Duration) -> bool {
        let elapsed = elapsed.as_millis() as i64;
        let margin = self.time.margin_ms as i64;
        if self.time.fixed_ms > 0 {
            return elapsed <= self.time.fixed_ms as i64 + margin;
        }
        let remaining = &mut self.remaining_ms[usize::from(mover == Color::Black)];
        *remaining -= elapsed;
        if *remaining < -margin {
            return false;
        }
        *remaining += self.time.inc_ms as i64;
        true
    }
}

/// The two engines owned by one slot.
pub struct EnginePair {
    pub first: Arc<EngineProcess>,
    pub second: Arc<EngineProcess>,
}

impl EnginePair {
    fn get(&self, id: EngineId) -> &EngineProcess {
        match id {
            EngineId::First => self.first.as_ref(),
            EngineId::Second => self.second.as_ref(),
        }
    }
}

/// Plays one game on `pair` and returns its result.
///
/// # Errors
///
/// Returns [`GameError`] if the opening is invalid or an engine disconnects
/// or stops answering. Illegal moves and time losses are results, not errors.
pub fn play_game(
    config: &MatchConfig,
    pair: &EnginePair,
    game: &GameAssignment,
) -> Result<FinishedGame, GameError> {
    let mut referee = Referee::new(&game.opening, config.variant)?;
    let white = if game.swapped {
        EngineId::Second
    } else {
        EngineId::First
    };
    for id in [EngineId::First, EngineId::Second] {
        pair.get(id)
            .new_game(&game.opening, &config.time, config.variant)
            .map_err(|source| GameError::Engine { engine: id, source })?;
    }

    let mut clock = GameClock::new(config.time);
    let mut adjudicator = Adjudicator::default();
    let max_plies = config.adjudication.max_moves as usize;

    let (result, termination) = loop {
        if let Some(end) = referee.outcome() {
            break end;
        }
        if max_plies > 0 && referee.plies() >= max_plies {
            break (GameResult::Draw, Termination::MaxMoves);
        }

        let mover = if referee.white_to_move() {
            Color::White
        } else {
            Color::Black
        };
        let id = if mover == Color::White {
            white
        } else {
            white.other()
        };
        let engine = pair.get(id);

        let started = Instant::now();
        let reply = engine
            .request_move(
                referee.start_fen(),
                referee.uci_moves(),
                clock.for_engine(referee.white_to_move()),
                clock.deadline(mover),
            )
            .map_err(|source| GameError::Engine { engine: id, source })?;
        let in_time = clock.charge(mover, started.elapsed());

        let (mv, score) = match reply {
            EngineReply::Resign => {
                break (GameResult::win_for(mover.other()), Termination::Resignation)
            }
            EngineReply::Move { mv, score } => (mv, score),
        };
        if !in_time {
            break (
                GameResult::win_for(mover.other()),
                Termination::TimeForfeit(id),
            );
        }
        let san = match referee.play_uci(&mv) {
            Ok(san) => san,
            Err(e) => {
                tracing::warn!("Game {}: {} sent {}", game.number, engine.name(), e);
                break (
                    GameResult::win_for(mover.other()),
                    Termination::IllegalMove(id),
                );
            }
        };

        if config.print_moves {
            match score {
                Some(score) => tracing::info!(
                    "Game {}: {}. {} {:?}",
                    game.number,
                    referee.plies(),
                    san,
                    score
                ),
                None => tracing::info!("Game {}: {}. {}", game.number, referee.plies(), san),
            }
        }

        if let Some(verdict) = adjudicator.observe(&config.adjudication, mover, score) {
            break verdict;
        }
    };

    let (white_engine, black_engine) = (pair.get(white), pair.get(white.other()));
    tracing::debug!(
        "Game {} finished: {:?} by {}",
        game.number,
        result,
        termination
    );
    let record = GameRecord {
        round: game.number,
        white: white_engine.name().to_string(),
        black: black_engine.name().to_string(),
        result,
        termination: termination.pgn_tag().to_string(),
        start_fen: referee.start_fen().map(str::to_string),
        chess960: config.variant == Variant::Chess960,
        time_control: config.time.pgn_tag(),
        first_move_number: referee.first_move_number,
        black_moves_first: referee.black_moves_first,
        moves: referee.san_moves().to_vec(),
    };
    Ok(FinishedGame {
        result,
        termination,
        white,
        record,
    })
}

/// The worker that plays real engine games on the scheduler's slots.
pub struct EngineGamePlayer {
    config: Arc<MatchConfig>,
    pairs: Vec<EnginePair>,
    cores: Arc<CoreAllocator>,
}

impl EngineGamePlayer {
    /// `pairs[i]` belongs to slot `i`.
    pub fn new(config: Arc<MatchConfig>, pairs: Vec<EnginePair>, cores: Arc<CoreAllocator>) -> Self {
        Self {
            config,
            pairs,
            cores,
        }
    }

    fn pin(&self, pair: &EnginePair, cores: &[usize]) {
        if cores.is_empty() {
            return;
        }
        for engine in [&pair.first, &pair.second] {
            if let Err(e) = set_process_affinity(engine.pid(), cores) {
                tracing::warn!("Could not set affinity for {}: {}", engine.name(), e);
            }
        }
    }
}

impl GamePlayer for EngineGamePlayer {
    fn play(&self, slot: &GameSlot, game: GameAssignment) {
        let Some(pair) = self.pairs.get(slot.index()) else {
            tracing::error!("No engines loaded for slot {}", slot.index());
            slot.flag(SlotFailure::Error);
            return;
        };

        let count = if self.cores.is_enabled() {
            self.config.cores_per_game()
        } else {
            0
        };
        let cores = self.cores.allocate(count);
        self.pin(pair, &cores);

        let played = play_game(&self.config, pair, &game);
        drop(cores);

        match played {
            Ok(finished) => {
                match finished.termination {
                    Termination::TimeForfeit(loser) => slot.record_time_loss(loser),
                    Termination::IllegalMove(_) => {
                        slot.record_illegal_move();
                        slot.flag(SlotFailure::Error);
                    }
                    _ => {}
                }
                if self.config.pgn.is_some() {
                    slot.push_pgn(&format_pgn(&finished.record));
                }
                slot.record_outcome(finished.outcome());
            }
            Err(e) => {
                tracing::error!("Game {} on slot {} failed: {}", game.number, slot.index(), e);
                slot.flag(e.slot_failure());
            }
        }
    }
}
