//! Per-game slot state shared between the scheduler and one worker.
//!
//! A slot is lent to exactly one worker while `running` is set. The worker
//! writes the counters, the failure flags and the pending PGN text; the
//! scheduler only reads them. Cross-thread visibility of the counters is
//! carried by `running`: the worker clears it with release ordering after
//! its last write and the scheduler loads it with acquire ordering.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Which of the two configured engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    First,
    Second,
}

impl EngineId {
    pub fn other(self) -> Self {
        match self {
            EngineId::First => EngineId::Second,
            EngineId::Second => EngineId::First,
        }
    }
}

/// Result of a game in terms of the configured engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Win(EngineId),
    Draw,
}

/// Snapshot of a slot's (or the whole match's) counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounters {
    pub engine1_wins: u32,
    pub engine2_wins: u32,
    pub draws: u32,
    pub illegal_move_games: u32,
    pub engine1_time_losses: u32,
    pub engine2_time_losses: u32,
}

impl SlotCounters {
    /// Games with a recorded result.
    pub fn games(&self) -> u32 {
        self.engine1_wins + self.engine2_wins + self.draws
    }
}

impl std::ops::AddAssign for SlotCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.engine1_wins += rhs.engine1_wins;
        self.engine2_wins += rhs.engine2_wins;
        self.draws += rhs.draws;
        self.illegal_move_games += rhs.illegal_move_games;
        self.engine1_time_losses += rhs.engine1_time_losses;
        self.engine2_time_losses += rhs.engine2_time_losses;
    }
}

impl std::iter::Sum for SlotCounters {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SlotCounters::default(), |mut acc, c| {
            acc += c;
            acc
        })
    }
}

/// A flag that ends the match when the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFailure {
    Disconnected,
    Unresponsive,
    Error,
}

/// One reusable game slot.
#[derive(Debug)]
pub struct GameSlot {
    index: usize,
    running: AtomicBool,
    engine1_wins: AtomicU32,
    engine2_wins: AtomicU32,
    draws: AtomicU32,
    illegal_move_games: AtomicU32,
    engine1_time_losses: AtomicU32,
    engine2_time_losses: AtomicU32,
    disconnected: AtomicBool,
    unresponsive: AtomicBool,
    error: AtomicBool,
    pgn: Mutex<String>,
    pgn_ready: AtomicBool,
}

impl GameSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            running: AtomicBool::new(false),
            engine1_wins: AtomicU32::new(0),
            engine2_wins: AtomicU32::new(0),
            draws: AtomicU32::new(0),
            illegal_move_games: AtomicU32::new(0),
            engine1_time_losses: AtomicU32::new(0),
            engine2_time_losses: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            error: AtomicBool::new(false),
            pgn: Mutex::new(String::new()),
            pgn_ready: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Called by the scheduler before handing the slot to a worker.
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Called by the worker after its last write to the slot.
    pub fn mark_finished(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn record_outcome(&self, outcome: GameOutcome) {
        let counter = match outcome {
            GameOutcome::Win(EngineId::First) => &self.engine1_wins,
            GameOutcome::Win(EngineId::Second) => &self.engine2_wins,
            GameOutcome::Draw => &self.draws,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_illegal_move(&self) {
        self.illegal_move_games.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_time_loss(&self, loser: EngineId) {
        let counter = match loser {
            EngineId::First => &self.engine1_time_losses,
            EngineId::Second => &self.engine2_time_losses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> SlotCounters {
        SlotCounters {
            engine1_wins: self.engine1_wins.load(Ordering::Relaxed),
            engine2_wins: self.engine2_wins.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            illegal_move_games: self.illegal_move_games.load(Ordering::Relaxed),
            engine1_time_losses: self.engine1_time_losses.load(Ordering::Relaxed),
            engine2_time_losses: self.engine2_time_losses.load(Ordering::Relaxed),
        }
    }

    pub fn flag(&self, failure: SlotFailure) {
        let flag = match failure {
            SlotFailure::Disconnected => &self.disconnected,
            SlotFailure::Unresponsive => &self.unresponsive,
            SlotFailure::Error => &self.error,
        };
        flag.store(true, Ordering::Release);
    }

    /// The first flag that should end the match. The error flag only counts
    /// when errors are not being tolerated.
    pub fn failure(&self, continue_on_error: bool) -> Option<SlotFailure> {
        if self.disconnected.load(Ordering::Acquire) {
            Some(SlotFailure::Disconnected)
        } else if self.unresponsive.load(Ordering::Acquire) {
            Some(SlotFailure::Unresponsive)
        } else if !continue_on_error && self.error.load(Ordering::Acquire) {
            Some(SlotFailure::Error)
        } else {
            None
        }
    }

    /// Queues a finished game's PGN text for the flusher.
    pub fn push_pgn(&self, text: &str) {
        self.pgn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_str(text);
        self.pgn_ready.store(true, Ordering::Release);
    }

    /// Takes the queued PGN text if the producer has marked it ready.
    pub fn take_pgn(&self) -> Option<String> {
        if !self.pgn_ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        let text = std::mem::take(&mut *self.pgn.lock().unwrap_or_else(|e| e.into_inner()));
        Some(text)
    }
}

/// Sums the counters of every slot.
pub fn total_counters(slots: &[GameSlot]) -> SlotCounters {
    slots.iter().map(GameSlot::counters).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_outcomes() {
        let slot = GameSlot::new(0);
        slot.record_outcome(GameOutcome::Win(EngineId::First));
        slot.record_outcome(GameOutcome::Win(EngineId::First));
        slot.record_outcome(GameOutcome::Win(EngineId::Second));
        slot.record_outcome(GameOutcome::Draw);
        slot.record_time_loss(EngineId::Second);
        slot.record_illegal_move();
        let c = slot.counters();
        assert_eq!(c.engine1_wins, 2);
        assert_eq!(c.engine2_wins, 1);
        assert_eq!(c.draws, 1);
        assert_eq!(c.engine2_time_losses, 1);
        assert_eq!(c.illegal_move_games, 1);
        assert_eq!(c.games(), 4);
    }

    #[test]
    fn test_total_counters() {
        let slots: Vec<GameSlot> = (0..3).map(GameSlot::new).collect();
        slots[0].record_outcome(GameOutcome::Draw);
        slots[2].record_outcome(GameOutcome::Win(EngineId::Second));
        let total = total_counters(&slots);
        assert_eq!(total.draws, 1);
        assert_eq!(total.engine2_wins, 1);
        assert_eq!(total.games(), 2);
    }

    #[test]
    fn test_failure_respects_continue_on_error() {
        let slot = GameSlot::new(0);
        assert_eq!(slot.failure(false), None);
        slot.flag(SlotFailure::Error);
        assert_eq!(slot.failure(false), Some(SlotFailure::Error));
        assert_eq!(slot.failure(true), None);
        slot.flag(SlotFailure::Disconnected);
        assert_eq!(slot.failure(true), Some(SlotFailure::Disconnected));
    }

    #[test]
    fn test_pgn_is_taken_once_per_ready() {
        let slot = GameSlot::new(0);
        assert_eq!(slot.take_pgn(), None);
        slot.push_pgn("game one\n");
        assert_eq!(slot.take_pgn().as_deref(), Some("game one\n"));
        assert_eq!(slot.take_pgn(), None);
        slot.push_pgn("game two\n");
        slot.push_pgn("game three\n");
        assert_eq!(slot.take_pgn().as_deref(), Some("game two\ngame three\n"));
    }

    #[test]
    fn test_running_flag() {
        let slot = GameSlot::new(4);
        assert_eq!(slot.index(), 4);
        assert!(!slot.is_running());
        slot.mark_running();
        assert!(slot.is_running());
        slot.mark_finished();
        assert!(!slot.is_running());
    }

    #[test]
    fn test_engine_id_other() {
        assert_eq!(EngineId::First.other(), EngineId::Second);
        assert_eq!(EngineId::Second.other(), EngineId::First);
    }
}
