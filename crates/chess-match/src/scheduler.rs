//! The match control loop.
//!
//! The scheduler owns a fixed array of [`GameSlot`]s and lends each idle slot
//! to one worker thread per game. Between starts it sleeps on a fixed cadence,
//! refreshes the results snapshot, drains finished PGN text and watches the
//! slots for failures and the [`AbortSignal`] for a user abort.

use crate::config::MatchConfig;
use crate::openings::{Opening, OpeningFeeder};
use crate::pgn::PgnFlusher;
use crate::results::ResultsReporter;
use crate::shutdown::{AbortSignal, ShutdownCoordinator};
use crate::slot::{total_counters, GameSlot, SlotCounters, SlotFailure};
use crate::sprt::SprtVerdict;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

/// Plays one game on a slot. Implementations record the outcome, failure
/// flags and PGN text on the slot; they must not touch `running`.
pub trait GamePlayer: Sync {
    fn play(&self, slot: &GameSlot, game: GameAssignment);
}

/// What a worker is asked to play.
#[derive(Debug, Clone, PartialEq)]
pub struct GameAssignment {
    /// 1-based game number in start order.
    pub number: u32,
    pub opening: Opening,
    /// The second engine plays white.
    pub swapped: bool,
}

/// Loop parameters taken from the match configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub threads: usize,
    pub target_games: u32,
    pub continue_on_error: bool,
    pub repeat_openings: bool,
    pub poll_interval: Duration,
    /// Pause after the wait loop before slots are scanned again.
    pub settle_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &MatchConfig) -> Self {
        Self {
            threads: config.threads as usize,
            target_games: config.games,
            continue_on_error: config.continue_on_error,
            repeat_openings: config.repeat_openings,
            poll_interval: config.poll_interval,
            settle_interval: Duration::from_millis(50),
        }
    }
}

/// Why the control loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// All games finished, or the SPRT reached a verdict and the running
    /// games finished.
    Completed,
    /// The user asked to stop.
    Aborted,
    /// A slot reported a failure that ends the match.
    EngineFailure { slot: usize, failure: SlotFailure },
}

/// Final state of a match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSummary {
    pub outcome: SchedulerOutcome,
    pub totals: SlotCounters,
    pub games_started: u32,
    pub verdict: Option<SprtVerdict>,
}

struct LoopState {
    feeder: OpeningFeeder,
    reporter: ResultsReporter,
    pgn: Option<PgnFlusher>,
    started: u32,
    target: u32,
    swap: bool,
    last_opening: Opening,
}

impl LoopState {
    fn can_start_new_game(&self, slots: &[GameSlot], threads: usize) -> bool {
        if self.reporter.sprt_finished() {
            return false;
        }
        self.started < self.target && running(slots) < threads
    }

    fn match_completed(&self, slots: &[GameSlot]) -> bool {
        let idle = running(slots) == 0;
        if self.reporter.sprt_finished() {
            idle
        } else {
            self.started >= self.target && idle
        }
    }

    fn refresh(&mut self, slots: &[GameSlot], force: bool) {
        let completed = self.started.saturating_sub(running(slots) as u32);
        self.reporter
            .refresh(&total_counters(slots), completed, force);
        if let Some(pgn) = self.pgn.as_mut() {
            if let Err(e) = pgn.flush_slots(slots) {
                tracing::error!("Failed to write {}: {}", pgn.path().display(), e);
            }
        }
    }
}

fn running(slots: &[GameSlot]) -> usize {
    slots.iter().filter(|s| s.is_running()).count()
}

/// Runs a match over a fixed pool of game slots.
pub struct MatchScheduler<'a> {
    settings: SchedulerSettings,
    slots: Vec<GameSlot>,
    state: LoopState,
    player: &'a dyn GamePlayer,
    abort: &'a AbortSignal,
    shutdown: &'a ShutdownCoordinator,
}

impl<'a> MatchScheduler<'a> {
    pub fn new(
        settings: SchedulerSettings,
        feeder: OpeningFeeder,
        reporter: ResultsReporter,
        pgn: Option<PgnFlusher>,
        player: &'a dyn GamePlayer,
        abort: &'a AbortSignal,
        shutdown: &'a ShutdownCoordinator,
    ) -> Self {
        let slots = (0..settings.threads.max(1)).map(GameSlot::new).collect();
        let target = settings.target_games;
        Self {
            settings,
            slots,
            state: LoopState {
                feeder,
                reporter,
                pgn,
                started: 0,
                target,
                swap: false,
                last_opening: Opening::StartPosition,
            },
            player,
            abort,
            shutdown,
        }
    }

    pub fn games_started(&self) -> u32 {
        self.state.started
    }

    /// Current target; lower than configured once the openings ran out.
    pub fn target_games(&self) -> u32 {
        self.state.target
    }

    /// Whether a new game may start now.
    pub fn can_start_new_game(&self) -> bool {
        self.state
            .can_start_new_game(&self.slots, self.settings.threads)
    }

    /// Whether the match is over and no game is running.
    pub fn match_completed(&self) -> bool {
        self.state.match_completed(&self.slots)
    }

    /// Runs the match to its end, shuts the engines down, joins the workers
    /// and writes the final results and PGN.
    pub fn run(mut self) -> MatchSummary {
        let settings = &self.settings;
        let slots = &self.slots;
        let state = &mut self.state;
        let player = self.player;
        let abort = self.abort;

        let outcome = thread::scope(|scope| {
            let outcome = run_loop(settings, slots, state, player, abort, scope);
            match outcome {
                SchedulerOutcome::Completed => tracing::info!("Match completed"),
                SchedulerOutcome::Aborted => tracing::info!("Match aborted"),
                SchedulerOutcome::EngineFailure { slot, failure } => {
                    tracing::error!("Stopping match: slot {} reported {:?}", slot, failure)
                }
            }
            self.shutdown.shutdown_engines();
            outcome
        });

        self.state.refresh(&self.slots, true);
        MatchSummary {
            outcome,
            totals: total_counters(&self.slots),
            games_started: self.state.started,
            verdict: self.state.reporter.sprt().map(|s| s.verdict()),
        }
    }
}

fn run_loop<'scope, 'env>(
    settings: &'env SchedulerSettings,
    slots: &'env [GameSlot],
    state: &mut LoopState,
    player: &'env dyn GamePlayer,
    abort: &AbortSignal,
    scope: &'scope thread::Scope<'scope, 'env>,
) -> SchedulerOutcome {
    let threads = settings.threads;
    while !state.match_completed(slots) {
        if abort.is_raised() {
            return SchedulerOutcome::Aborted;
        }
        if let Some(failed) = first_failure(slots, settings.continue_on_error) {
            return failed;
        }

        for slot in slots {
            if slot.is_running() {
                continue;
            }
            if !state.can_start_new_game(slots, threads) {
                break;
            }
            let opening = if settings.repeat_openings && state.swap {
                state.last_opening.clone()
            } else {
                match state.feeder.next_opening() {
                    Some(opening) => opening,
                    None => {
                        state.target = state.started;
                        break;
                    }
                }
            };
            state.last_opening = opening.clone();

            let game = GameAssignment {
                number: state.started + 1,
                opening,
                swapped: state.swap,
            };
            state.swap = !state.swap;
            state.started += 1;
            start_worker(slot, game, player, scope);
        }

        while !state.can_start_new_game(slots, threads) && !state.match_completed(slots) {
            thread::sleep(settings.poll_interval);
            state.refresh(slots, false);
            if abort.is_raised() {
                return SchedulerOutcome::Aborted;
            }
            if let Some(failed) = first_failure(slots, settings.continue_on_error) {
                return failed;
            }
        }
        thread::sleep(settings.settle_interval);
    }
    SchedulerOutcome::Completed
}

fn first_failure(slots: &[GameSlot], continue_on_error: bool) -> Option<SchedulerOutcome> {
    slots.iter().find_map(|s| {
        s.failure(continue_on_error)
            .map(|failure| SchedulerOutcome::EngineFailure {
                slot: s.index(),
                failure,
            })
    })
}

fn start_worker<'scope, 'env>(
    slot: &'env GameSlot,
    game: GameAssignment,
    player: &'env dyn GamePlayer,
    scope: &'scope thread::Scope<'scope, 'env>,
) {
    tracing::debug!("Starting game {} on slot {}", game.number, slot.index());
    slot.mark_running();
    let spawned = thread::Builder::new()
        .name(format!("game-{}", slot.index()))
        .spawn_scoped(scope, move || {
            let number = game.number;
            if panic::catch_unwind(AssertUnwindSafe(|| player.play(slot, game))).is_err() {
                tracing::error!("Game {} panicked", number);
                slot.flag(SlotFailure::Error);
            }
            slot.mark_finished();
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start worker for slot {}: {}", slot.index(), e);
        slot.flag(SlotFailure::Error);
        slot.mark_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ReportHeader;
    use crate::slot::{EngineId, GameOutcome};

    struct DrawEverything;

    impl GamePlayer for DrawEverything {
        fn play(&self, slot: &GameSlot, _game: GameAssignment) {
            slot.record_outcome(GameOutcome::Draw);
        }
    }

    struct Panics;

    impl GamePlayer for Panics {
        fn play(&self, _slot: &GameSlot, _game: GameAssignment) {
            panic!("worker failure");
        }
    }

    fn settings(threads: usize, games: u32) -> SchedulerSettings {
        SchedulerSettings {
            threads,
            target_games: games,
            continue_on_error: false,
            repeat_openings: false,
            poll_interval: Duration::from_millis(2),
            settle_interval: Duration::from_millis(1),
        }
    }

    fn reporter(dir: &tempfile::TempDir) -> ResultsReporter {
        let header = ReportHeader {
            engine1: "a".to_string(),
            engine2: "b".to_string(),
            time_control: "10+0.10".to_string(),
            threads: 1,
            hash_mb: 128,
        };
        ResultsReporter::new(
            header,
            None,
            dir.path().join("results.txt"),
            &dir.path().join("results_log.txt"),
        )
        .with_console(false)
    }

    #[test]
    fn test_fresh_scheduler_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        let shutdown = ShutdownCoordinator::new(Vec::new());
        let scheduler = MatchScheduler::new(
            settings(2, 3),
            OpeningFeeder::unlimited(),
            reporter(&dir),
            None,
            &DrawEverything,
            &abort,
            &shutdown,
        );
        assert!(scheduler.can_start_new_game());
        assert!(!scheduler.match_completed());
        assert_eq!(scheduler.target_games(), 3);
    }

    #[test]
    fn test_zero_games_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        let shutdown = ShutdownCoordinator::new(Vec::new());
        let scheduler = MatchScheduler::new(
            settings(1, 0),
            OpeningFeeder::unlimited(),
            reporter(&dir),
            None,
            &DrawEverything,
            &abort,
            &shutdown,
        );
        assert!(scheduler.match_completed());
        let summary = scheduler.run();
        assert_eq!(summary.outcome, SchedulerOutcome::Completed);
        assert_eq!(summary.games_started, 0);
    }

    #[test]
    fn test_panicking_worker_flags_error() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        let shutdown = ShutdownCoordinator::new(Vec::new());
        let summary = MatchScheduler::new(
            settings(1, 5),
            OpeningFeeder::unlimited(),
            reporter(&dir),
            None,
            &Panics,
            &abort,
            &shutdown,
        )
        .run();
        assert_eq!(
            summary.outcome,
            SchedulerOutcome::EngineFailure {
                slot: 0,
                failure: SlotFailure::Error
            }
        );
        assert_eq!(summary.totals.games(), 0);
    }

    #[test]
    fn test_abort_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        abort.raise();
        let shutdown = ShutdownCoordinator::new(Vec::new());
        let summary = MatchScheduler::new(
            settings(1, 5),
            OpeningFeeder::unlimited(),
            reporter(&dir),
            None,
            &DrawEverything,
            &abort,
            &shutdown,
        )
        .run();
        assert_eq!(summary.outcome, SchedulerOutcome::Aborted);
        assert_eq!(summary.games_started, 0);
        assert_eq!(
            shutdown.state(),
            crate::shutdown::ShutdownState::Terminated
        );
    }

    #[test]
    fn test_outcomes_are_summed() {
        struct FirstWins;
        impl GamePlayer for FirstWins {
            fn play(&self, slot: &GameSlot, _game: GameAssignment) {
                slot.record_outcome(GameOutcome::Win(EngineId::First));
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        let shutdown = ShutdownCoordinator::new(Vec::new());
        let summary = MatchScheduler::new(
            settings(3, 7),
            OpeningFeeder::unlimited(),
            reporter(&dir),
            None,
            &FirstWins,
            &abort,
            &shutdown,
        )
        .run();
        assert_eq!(summary.outcome, SchedulerOutcome::Completed);
        assert_eq!(summary.games_started, 7);
        assert_eq!(summary.totals.engine1_wins, 7);
        assert_eq!(summary.verdict, None);
    }
}
