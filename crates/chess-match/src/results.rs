//! Match results: Elo estimate, SPRT progress and persistence.
//!
//! Every refresh renders one text snapshot that overwrites the results file,
//! is appended to the results log and replaces the console contents. A
//! refresh is skipped while the number of completed games is unchanged.

use crate::config::MatchConfig;
use crate::slot::SlotCounters;
use crate::sprt::{Sprt, SprtVerdict};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Separates consecutive entries in the results log.
pub const LOG_DELIMITER: &str = "\n-------------------------------------------------\n\n";

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[1;1H";

/// Elo difference of the first engine over the second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EloEstimate {
    /// Difference with the half-width of its 95% confidence interval.
    Finite { diff: f64, margin: f64 },
    /// Every game won by the first engine.
    PlusInfinity,
    /// Every game lost by the first engine.
    MinusInfinity,
}

impl EloEstimate {
    /// Estimates Elo from results; `None` when no game has a result.
    pub fn from_results(wins: u32, losses: u32, draws: u32) -> Option<Self> {
        let n = f64::from(wins + losses + draws);
        if n == 0.0 {
            return None;
        }
        let score = (f64::from(wins) + f64::from(draws) / 2.0) / n;
        if score <= 1e-9 || score >= 1.0 - 1e-9 {
            return Some(if score > 0.5 {
                EloEstimate::PlusInfinity
            } else {
                EloEstimate::MinusInfinity
            });
        }
        let diff = -400.0 * (1.0 / score - 1.0).log10();
        let win_frac = f64::from(wins) / n;
        let draw_frac = f64::from(draws) / n;
        let variance = (win_frac + 0.25 * draw_frac - score * score).max(0.0);
        let std_error = (variance / n).sqrt();
        let elo_per_score = 400.0 / (score * (1.0 - score) * std::f64::consts::LN_10);
        Some(EloEstimate::Finite {
            diff,
            margin: 1.96 * elo_per_score * std_error,
        })
    }
}

/// Static facts printed in every snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportHeader {
    pub engine1: String,
    pub engine2: String,
    pub time_control: String,
    pub threads: u32,
    pub hash_mb: u32,
}

impl ReportHeader {
    pub fn from_config(config: &MatchConfig) -> Self {
        Self {
            engine1: config.engine1.path.display().to_string(),
            engine2: config.engine2.path.display().to_string(),
            time_control: config.time.label(),
            threads: config.threads,
            hash_mb: config.engine1.memory_mb,
        }
    }
}

/// Renders, persists and prints match snapshots.
pub struct ResultsReporter {
    header: ReportHeader,
    sprt: Option<Sprt>,
    snapshot_path: PathBuf,
    log: Option<File>,
    log_entries: usize,
    last_completed: Option<u32>,
    console: bool,
}

impl ResultsReporter {
    /// Creates a reporter and truncates the results log.
    ///
    /// A log that cannot be opened is reported and then skipped; the match
    /// still runs.
    pub fn new(
        header: ReportHeader,
        sprt: Option<Sprt>,
        snapshot_path: impl Into<PathBuf>,
        log_path: &Path,
    ) -> Self {
        let log = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path)
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Could not open {} for writing: {}", log_path.display(), e);
                None
            }
        };
        Self {
            header,
            sprt,
            snapshot_path: snapshot_path.into(),
            log,
            log_entries: 0,
            last_completed: None,
            console: true,
        }
    }

    /// Turns console output on or off.
    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn sprt(&self) -> Option<&Sprt> {
        self.sprt.as_ref()
    }

    /// Whether an SPRT is running and has reached a verdict.
    pub fn sprt_finished(&self) -> bool {
        self.sprt.as_ref().is_some_and(Sprt::is_finished)
    }

    /// Refreshes the snapshot.
    ///
    /// Unless `force` is set, nothing happens when `completed` equals the
    /// count seen at the previous refresh and at least one game has a result.
    /// Returns the rendered text when a refresh happened.
    pub fn refresh(&mut self, totals: &SlotCounters, completed: u32, force: bool) -> Option<String> {
        if !force && self.last_completed == Some(completed) && totals.games() > 0 {
            return None;
        }
        self.last_completed = Some(completed);

        if let Some(sprt) = self.sprt.as_mut() {
            sprt.update(totals.engine1_wins, totals.engine2_wins, totals.draws);
        }

        let text = self.render(totals);
        if let Err(e) = std::fs::write(&self.snapshot_path, &text) {
            tracing::warn!("Failed to write {}: {}", self.snapshot_path.display(), e);
        }
        if let Err(e) = self.append_log(&text) {
            tracing::warn!("Failed to append to results log: {}", e);
        }
        if self.console {
            let mut stdout = io::stdout().lock();
            let _ = write!(stdout, "{}{}", CLEAR_SCREEN, text);
            let _ = stdout.flush();
        }
        Some(text)
    }

    fn append_log(&mut self, text: &str) -> io::Result<()> {
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };
        if self.log_entries > 0 {
            log.write_all(LOG_DELIMITER.as_bytes())?;
        }
        log.write_all(text.as_bytes())?;
        log.flush()?;
        self.log_entries += 1;
        Ok(())
    }

    /// Renders the snapshot text without side effects.
    pub fn render(&self, totals: &SlotCounters) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "Engine1: {} vs Engine2: {}\n\n",
            self.header.engine1, self.header.engine2
        );

        let Some(elo) =
            EloEstimate::from_results(totals.engine1_wins, totals.engine2_wins, totals.draws)
        else {
            out.push_str("No games completed yet.\n");
            return out;
        };

        match elo {
            EloEstimate::Finite { diff, margin } => {
                let _ = writeln!(out, "Elo   | {:.2} +- {:.2} (95%)", diff, margin);
            }
            EloEstimate::PlusInfinity => out.push_str("Elo   | +inf\n"),
            EloEstimate::MinusInfinity => out.push_str("Elo   | -inf\n"),
        }

        if let Some(sprt) = &self.sprt {
            let config = sprt.config();
            let (lower, upper) = sprt.bounds();
            let _ = writeln!(
                out,
                "SPRT  | {:.2} {} Threads={} Hash={}MB",
                config.elo1, self.header.time_control, self.header.threads, self.header.hash_mb
            );
            let _ = writeln!(
                out,
                "LLR   | {:.2} ({:.2}, {:.2}) [{:.2}, {:.2}]",
                sprt.llr(),
                lower,
                upper,
                config.elo0,
                config.elo1
            );
        }

        let _ = writeln!(
            out,
            "Games | N: {} W: {} L: {} D: {}",
            totals.games(),
            totals.engine1_wins,
            totals.engine2_wins,
            totals.draws
        );

        let mut info = String::new();
        if totals.illegal_move_games != 0 {
            let _ = write!(info, "  [Illegal Moves: {}]", totals.illegal_move_games);
        }
        if totals.engine1_time_losses != 0 || totals.engine2_time_losses != 0 {
            let _ = write!(
                info,
                "  [Timeouts: {} / {}]",
                totals.engine1_time_losses, totals.engine2_time_losses
            );
        }
        if !info.is_empty() {
            let _ = writeln!(out, "Info  |{}", info);
        }

        if let Some(sprt) = &self.sprt {
            match sprt.verdict() {
                SprtVerdict::AcceptH1 => {
                    out.push_str("\nSPRT test finished: H1 accepted (engine 1 is stronger).\n")
                }
                SprtVerdict::AcceptH0 => {
                    out.push_str("\nSPRT test finished: H0 accepted (elo is within bounds).\n")
                }
                SprtVerdict::Pending => {}
            }
        }
        out
    }
}
