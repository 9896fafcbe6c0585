//! Match startup and teardown.
//!
//! [`run_match`] turns a validated [`MatchConfig`] into a running match:
//! it opens the input and output files, loads two engines per slot, hands
//! the shutdown coordinator to the abort signal and runs the scheduler.
//! Anything that fails before the first game is a [`MatchError`].

use crate::config::{ConfigError, MatchConfig};
use crate::cores::CoreAllocator;
use crate::engine::{EngineError, EngineProcess};
use crate::game::{EngineGamePlayer, EnginePair};
use crate::openings::OpeningFeeder;
use crate::pgn::PgnFlusher;
use crate::results::{ReportHeader, ResultsReporter};
use crate::scheduler::{MatchScheduler, MatchSummary, SchedulerOutcome, SchedulerSettings};
use crate::shutdown::{AbortSignal, EngineControl, ShutdownCoordinator};
use crate::sprt::Sprt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that stop a match before it starts.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An input or output file could not be opened.
    #[error("Cannot open {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// An engine failed to start or to accept its settings.
    #[error("Failed to load {label}: {source}")]
    EngineLoad {
        label: String,
        #[source]
        source: EngineError,
    },
}

impl MatchError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MatchError::Config(_) | MatchError::File { .. } => 1,
            MatchError::EngineLoad { .. } => 2,
        }
    }
}

/// Process exit status for a match that ran.
pub fn exit_code(outcome: SchedulerOutcome) -> u8 {
    match outcome {
        SchedulerOutcome::Completed => 0,
        SchedulerOutcome::Aborted => 3,
        SchedulerOutcome::EngineFailure { .. } => 4,
    }
}

fn file_error(path: &Path) -> impl FnOnce(io::Error) -> MatchError + '_ {
    move |source| MatchError::File {
        path: path.to_path_buf(),
        source,
    }
}

fn start_engines(
    config: &MatchConfig,
    loaded: &mut Vec<Arc<EngineProcess>>,
) -> Result<(), MatchError> {
    for slot in 0..config.threads {
        for (n, engine) in [(1, &config.engine1), (2, &config.engine2)] {
            let label = format!("engine{}[{}]", n, slot);
            let process = EngineProcess::load(engine, label.clone())
                .map_err(|source| MatchError::EngineLoad { label, source })?;
            loaded.push(Arc::new(process));
        }
    }
    // Options go out only once every engine is up.
    for (i, process) in loaded.iter().enumerate() {
        let engine = if i % 2 == 0 {
            &config.engine1
        } else {
            &config.engine2
        };
        process
            .configure(engine, config.variant)
            .map_err(|source| MatchError::EngineLoad {
                label: process.label().to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Loads two engines per slot and sends them their settings.
///
/// On failure every engine loaded so far is shut down before returning.
fn load_engines(config: &MatchConfig) -> Result<Vec<EnginePair>, MatchError> {
    let mut loaded: Vec<Arc<EngineProcess>> = Vec::new();
    if let Err(e) = start_engines(config, &mut loaded) {
        let engines = loaded
            .into_iter()
            .map(|p| p as Arc<dyn EngineControl>)
            .collect();
        ShutdownCoordinator::new(engines).shutdown_engines();
        return Err(e);
    }

    let mut pairs = Vec::with_capacity(loaded.len() / 2);
    let mut processes = loaded.into_iter();
    while let (Some(first), Some(second)) = (processes.next(), processes.next()) {
        pairs.push(EnginePair { first, second });
    }
    Ok(pairs)
}

/// Runs a whole match and returns its final state.
///
/// # Errors
///
/// Returns a [`MatchError`] if a file cannot be opened, the core lists are
/// invalid, or an engine fails to load. No game has started in that case.
pub fn run_match(config: MatchConfig, abort: &AbortSignal) -> Result<MatchSummary, MatchError> {
    let config = Arc::new(config);

    let feeder = match &config.openings {
        Some(path) => OpeningFeeder::open(path).map_err(file_error(path))?,
        None => OpeningFeeder::unlimited(),
    };
    let pgn = match &config.pgn {
        Some(path) => Some(PgnFlusher::create(path).map_err(file_error(path))?),
        None => None,
    };
    let cores = Arc::new(CoreAllocator::new(config.cores.clone()).map_err(ConfigError::from)?);

    tracing::info!(
        "Loading {} x 2 engines: {} vs {}",
        config.threads,
        config.engine1.path.display(),
        config.engine2.path.display()
    );
    let pairs = load_engines(&config)?;

    let engines: Vec<Arc<dyn EngineControl>> = pairs
        .iter()
        .flat_map(|p| [Arc::clone(&p.first), Arc::clone(&p.second)])
        .map(|p| p as Arc<dyn EngineControl>)
        .collect();
    let coordinator = Arc::new(ShutdownCoordinator::new(engines));
    abort.attach(Arc::clone(&coordinator));

    let reporter = ResultsReporter::new(
        ReportHeader::from_config(&config),
        config.sprt.map(Sprt::new),
        config.results_path.clone(),
        &config.results_log_path,
    );
    let player = EngineGamePlayer::new(Arc::clone(&config), pairs, cores);
    let scheduler = MatchScheduler::new(
        SchedulerSettings::from_config(&config),
        feeder,
        reporter,
        pgn,
        &player,
        abort,
        &coordinator,
    );

    let summary = scheduler.run();
    tracing::info!(
        "{} games started, {} finished with a result",
        summary.games_started,
        summary.totals.games()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::slot::SlotFailure;

    fn config(e1: &str, e2: &str) -> MatchConfig {
        MatchConfig::from_settings(Settings {
            e1: Some(PathBuf::from(e1)),
            e2: Some(PathBuf::from(e2)),
            games: Some(2),
            ..Settings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(SchedulerOutcome::Completed), 0);
        assert_eq!(exit_code(SchedulerOutcome::Aborted), 3);
        assert_eq!(
            exit_code(SchedulerOutcome::EngineFailure {
                slot: 0,
                failure: SlotFailure::Disconnected
            }),
            4
        );
        assert_eq!(
            MatchError::Config(ConfigError::ConflictingOutputs).exit_code(),
            1
        );
    }

    #[test]
    fn test_missing_engine_is_load_error() {
        let abort = AbortSignal::new();
        let err = run_match(
            config("/nonexistent/engine-a", "/nonexistent/engine-b"),
            &abort,
        )
        .unwrap_err();
        assert!(matches!(err, MatchError::EngineLoad { ref label, .. } if label == "engine1[0]"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_openings_file_is_config_error() {
        let mut config = config("/nonexistent/engine-a", "/nonexistent/engine-b");
        config.openings = Some(PathBuf::from("/nonexistent/openings.epd"));
        let abort = AbortSignal::new();
        let err = run_match(config, &abort).unwrap_err();
        assert!(matches!(err, MatchError::File { .. }));
        assert_eq!(err.exit_code(), 1);
    }
}
