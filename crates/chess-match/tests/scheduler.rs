//! Scheduler scenarios driven by a scripted in-process game player.

use chess_match::config::SprtConfig;
use chess_match::openings::{Opening, OpeningFeeder};
use chess_match::pgn::PgnFlusher;
use chess_match::results::{ReportHeader, ResultsReporter};
use chess_match::scheduler::{
    GameAssignment, GamePlayer, MatchScheduler, MatchSummary, SchedulerOutcome, SchedulerSettings,
};
use chess_match::shutdown::{AbortSignal, EngineControl, ShutdownCoordinator, ShutdownState};
use chess_match::slot::{EngineId, GameOutcome, GameSlot, SlotFailure};
use chess_match::sprt::{Sprt, SprtVerdict};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Script = Box<dyn Fn(&GameSlot, &GameAssignment) + Sync>;

/// Records every assignment, tracks concurrency and runs a per-game script.
struct ScriptedPlayer {
    games: Mutex<Vec<(usize, GameAssignment)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    game_time: Duration,
    script: Script,
}

impl ScriptedPlayer {
    fn new(game_time: Duration, script: impl Fn(&GameSlot, &GameAssignment) + Sync + 'static) -> Self {
        Self {
            games: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            game_time,
            script: Box::new(script),
        }
    }

    fn draws() -> Self {
        Self::new(Duration::from_millis(1), |slot, _| {
            slot.record_outcome(GameOutcome::Draw)
        })
    }

    fn games(&self) -> Vec<(usize, GameAssignment)> {
        let mut games = self.games.lock().unwrap().clone();
        games.sort_by_key(|(_, g)| g.number);
        games
    }
}

impl GamePlayer for ScriptedPlayer {
    fn play(&self, slot: &GameSlot, game: GameAssignment) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.game_time);
        (self.script)(slot, &game);
        self.games.lock().unwrap().push((slot.index(), game));
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeEngine {
    quits: AtomicU32,
    running: AtomicBool,
}

impl EngineControl for FakeEngine {
    fn label(&self) -> &str {
        "fake"
    }

    fn send_quit(&self) {
        self.quits.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn force_exit(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Harness {
    dir: TempDir,
    settings: SchedulerSettings,
    feeder: Option<OpeningFeeder>,
    sprt: Option<SprtConfig>,
    pgn: bool,
    abort: Arc<AbortSignal>,
    shutdown: ShutdownCoordinator,
}

impl Harness {
    fn new(threads: usize, games: u32) -> Self {
        Self::with_engines(threads, games, Vec::new())
    }

    fn with_engines(threads: usize, games: u32, engines: Vec<Arc<dyn EngineControl>>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            settings: SchedulerSettings {
                threads,
                target_games: games,
                continue_on_error: false,
                repeat_openings: false,
                poll_interval: Duration::from_millis(2),
                settle_interval: Duration::from_millis(1),
            },
            feeder: None,
            sprt: None,
            pgn: false,
            abort: Arc::new(AbortSignal::new()),
            shutdown: ShutdownCoordinator::new(engines).with_grace(2, Duration::from_millis(1)),
        }
    }

    fn run(&mut self, player: &ScriptedPlayer) -> MatchSummary {
        let header = ReportHeader {
            engine1: "engine-a".to_string(),
            engine2: "engine-b".to_string(),
            time_control: "10+0.10".to_string(),
            threads: self.settings.threads as u32,
            hash_mb: 128,
        };
        let reporter = ResultsReporter::new(
            header,
            self.sprt.map(Sprt::new),
            self.dir.path().join("results.txt"),
            &self.dir.path().join("results_log.txt"),
        )
        .with_console(false);
        let pgn = self
            .pgn
            .then(|| PgnFlusher::create(&self.dir.path().join("games.pgn")).unwrap());
        let feeder = self.feeder.take().unwrap_or_else(OpeningFeeder::unlimited);
        MatchScheduler::new(
            self.settings.clone(),
            feeder,
            reporter,
            pgn,
            player,
            &self.abort,
            &self.shutdown,
        )
        .run()
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap()
    }
}

#[test]
fn test_single_thread_plays_games_one_after_another() {
    let mut harness = Harness::new(1, 4);
    let player = ScriptedPlayer::draws();
    let summary = harness.run(&player);

    assert_eq!(summary.outcome, SchedulerOutcome::Completed);
    assert_eq!(summary.games_started, 4);
    assert_eq!(summary.totals.games(), 4);
    assert_eq!(summary.totals.draws, 4);
    assert_eq!(player.max_running.load(Ordering::SeqCst), 1);
    let games = player.games();
    assert_eq!(games.len(), 4);
    assert!(games.iter().all(|(slot, _)| *slot == 0));
    let numbers: Vec<u32> = games.iter().map(|(_, g)| g.number).collect();
    assert_eq!(numbers, [1, 2, 3, 4]);
}

#[test]
fn test_concurrency_never_exceeds_threads() {
    let mut harness = Harness::new(3, 20);
    let player = ScriptedPlayer::new(Duration::from_millis(5), |slot, _| {
        slot.record_outcome(GameOutcome::Win(EngineId::First))
    });
    let summary = harness.run(&player);

    assert_eq!(summary.outcome, SchedulerOutcome::Completed);
    assert_eq!(summary.games_started, 20);
    assert_eq!(summary.totals.engine1_wins, 20);
    assert!(player.max_running.load(Ordering::SeqCst) <= 3);
    assert!(player.games().iter().all(|(slot, _)| *slot < 3));
}

#[test]
fn test_exhausted_openings_clamp_target() {
    let mut harness = Harness::new(2, 10);
    harness.feeder = Some(OpeningFeeder::from_lines(["fen-a", "fen-b", "fen-c"]));
    let player = ScriptedPlayer::draws();
    let summary = harness.run(&player);

    assert_eq!(summary.outcome, SchedulerOutcome::Completed);
    assert_eq!(summary.games_started, 3);
    assert_eq!(summary.totals.games(), 3);
    let openings: Vec<Opening> = player.games().into_iter().map(|(_, g)| g.opening).collect();
    assert_eq!(
        openings,
        [
            Opening::Fen("fen-a".to_string()),
            Opening::Fen("fen-b".to_string()),
            Opening::Fen("fen-c".to_string()),
        ]
    );
}

#[test]
fn test_sides_alternate_between_starts() {
    let mut harness = Harness::new(1, 6);
    let player = ScriptedPlayer::draws();
    harness.run(&player);
    let swapped: Vec<bool> = player.games().iter().map(|(_, g)| g.swapped).collect();
    assert_eq!(swapped, [false, true, false, true, false, true]);
}

#[test]
fn test_repeat_plays_each_opening_with_both_colours() {
    let mut harness = Harness::new(1, 100);
    harness.settings.repeat_openings = true;
    harness.feeder = Some(OpeningFeeder::from_lines(["fen-a", "fen-b"]));
    let player = ScriptedPlayer::draws();
    let summary = harness.run(&player);

    assert_eq!(summary.games_started, 4);
    let games: Vec<(String, bool)> = player
        .games()
        .into_iter()
        .map(|(_, g)| (g.opening.fen().unwrap_or("").to_string(), g.swapped))
        .collect();
    assert_eq!(
        games,
        [
            ("fen-a".to_string(), false),
            ("fen-a".to_string(), true),
            ("fen-b".to_string(), false),
            ("fen-b".to_string(), true),
        ]
    );
}

#[test]
fn test_disconnect_ends_match_despite_continue_on_error() {
    let mut harness = Harness::new(1, 50);
    harness.settings.continue_on_error = true;
    let player = ScriptedPlayer::new(Duration::from_millis(1), |slot, game| {
        if game.number == 2 {
            slot.flag(SlotFailure::Disconnected);
        } else {
            slot.record_outcome(GameOutcome::Draw);
        }
    });
    let summary = harness.run(&player);

    assert_eq!(
        summary.outcome,
        SchedulerOutcome::EngineFailure {
            slot: 0,
            failure: SlotFailure::Disconnected
        }
    );
    assert!(summary.games_started < 50);
}

#[test]
fn test_recoverable_error_respects_continue_on_error() {
    let script = |slot: &GameSlot, game: &GameAssignment| {
        if game.number == 2 {
            slot.record_illegal_move();
            slot.flag(SlotFailure::Error);
        }
        slot.record_outcome(GameOutcome::Win(EngineId::Second));
    };

    let mut tolerant = Harness::new(1, 5);
    tolerant.settings.continue_on_error = true;
    let summary = tolerant.run(&ScriptedPlayer::new(Duration::from_millis(1), script));
    assert_eq!(summary.outcome, SchedulerOutcome::Completed);
    assert_eq!(summary.totals.engine2_wins, 5);
    assert_eq!(summary.totals.illegal_move_games, 1);

    let mut strict = Harness::new(1, 5);
    let summary = strict.run(&ScriptedPlayer::new(Duration::from_millis(1), script));
    assert_eq!(
        summary.outcome,
        SchedulerOutcome::EngineFailure {
            slot: 0,
            failure: SlotFailure::Error
        }
    );
}

#[test]
fn test_fatal_flag_from_a_finished_game_stops_before_next_start() {
    let mut harness = Harness::new(1, 10);
    harness.settings.poll_interval = Duration::from_millis(50);
    let player = ScriptedPlayer::new(Duration::ZERO, |slot, _| {
        slot.record_outcome(GameOutcome::Draw);
        slot.flag(SlotFailure::Error);
    });

    let summary = harness.run(&player);

    assert_eq!(
        summary.outcome,
        SchedulerOutcome::EngineFailure {
            slot: 0,
            failure: SlotFailure::Error
        }
    );
    assert_eq!(summary.games_started, 1);
    assert_eq!(player.games().len(), 1);
}

#[test]
fn test_sprt_verdict_stops_new_games() {
    let mut harness = Harness::new(4, 100_000);
    harness.sprt = Some(SprtConfig {
        elo0: 0.0,
        elo1: 5.0,
        alpha: 0.05,
        beta: 0.05,
    });
    let player = ScriptedPlayer::new(Duration::from_millis(1), |slot, _| {
        slot.record_outcome(GameOutcome::Win(EngineId::First))
    });
    let summary = harness.run(&player);

    assert_eq!(summary.outcome, SchedulerOutcome::Completed);
    assert_eq!(summary.verdict, Some(SprtVerdict::AcceptH1));
    assert!(summary.games_started < 100_000);
    assert_eq!(summary.totals.games(), summary.games_started);
    assert!(harness.read("results.txt").contains("H1 accepted"));
}

#[test]
fn test_abort_stops_scheduling() {
    let mut harness = Harness::new(1, 1000);
    let abort = Arc::clone(&harness.abort);
    let player = ScriptedPlayer::new(Duration::from_millis(1), move |slot, game| {
        slot.record_outcome(GameOutcome::Draw);
        if game.number == 3 {
            abort.raise();
        }
    });
    let summary = harness.run(&player);

    assert_eq!(summary.outcome, SchedulerOutcome::Aborted);
    assert!(summary.games_started < 1000);
    assert!(summary.totals.games() >= 3);
    assert_eq!(harness.shutdown.state(), ShutdownState::Terminated);
}

#[test]
fn test_engines_are_shut_down_once_at_the_end() {
    let engines: Vec<Arc<FakeEngine>> = (0..2)
        .map(|_| {
            Arc::new(FakeEngine {
                quits: AtomicU32::new(0),
                running: AtomicBool::new(true),
            })
        })
        .collect();
    let controls = engines
        .iter()
        .map(|e| Arc::clone(e) as Arc<dyn EngineControl>)
        .collect();
    let mut harness = Harness::with_engines(1, 3, controls);
    harness.run(&ScriptedPlayer::draws());

    assert_eq!(harness.shutdown.state(), ShutdownState::Terminated);
    assert!(!harness.shutdown.shutdown_engines());
    for engine in &engines {
        assert_eq!(engine.quits.load(Ordering::SeqCst), 1);
        assert!(!engine.is_running());
    }
}

#[test]
fn test_results_and_pgn_are_persisted() {
    let mut harness = Harness::new(2, 6);
    harness.pgn = true;
    let player = ScriptedPlayer::new(Duration::from_millis(3), |slot, game| {
        slot.push_pgn(&format!("[Round \"{}\"]\n\n", game.number));
        slot.record_outcome(GameOutcome::Draw);
    });
    let summary = harness.run(&player);
    assert_eq!(summary.totals.games(), 6);

    let pgn = harness.read("games.pgn");
    for n in 1..=6 {
        assert_eq!(pgn.matches(&format!("[Round \"{}\"]", n)).count(), 1);
    }

    let snapshot = harness.read("results.txt");
    assert!(snapshot.contains("Games | N: 6 W: 0 L: 0 D: 6"));
    let log = harness.read("results_log.txt");
    assert!(log.ends_with(&snapshot));
}
