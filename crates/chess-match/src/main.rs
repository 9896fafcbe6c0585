use chess_match::config::{ConfigError, MatchConfig, Settings};
use chess_match::runner::{exit_code, run_match};
use chess_match::shutdown::AbortSignal;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Plays a match between two chess engines.
#[derive(Parser, Debug)]
#[command(name = "chess-match")]
#[command(about = "Engine-vs-engine chess matches with Elo and SPRT reporting")]
struct Cli {
    /// TOML file with default settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// First engine executable
    #[arg(long)]
    e1: Option<PathBuf>,
    /// Second engine executable
    #[arg(long)]
    e2: Option<PathBuf>,
    /// First engine speaks xboard instead of UCI
    #[arg(long)]
    x1: bool,
    /// Second engine speaks xboard instead of UCI
    #[arg(long)]
    x2: bool,
    /// Search threads for the first engine [default: 1]
    #[arg(long)]
    cores1: Option<u32>,
    /// Search threads for the second engine [default: 1]
    #[arg(long)]
    cores2: Option<u32>,
    /// Hash size in MB for the first engine [default: 128]
    #[arg(long)]
    mem1: Option<u32>,
    /// Hash size in MB for the second engine [default: 128]
    #[arg(long)]
    mem2: Option<u32>,
    /// Command sent verbatim to the first engine (repeatable)
    #[arg(long)]
    custom1: Vec<String>,
    /// Command sent verbatim to the second engine (repeatable)
    #[arg(long)]
    custom2: Vec<String>,
    /// Log the first engine's traffic
    #[arg(long)]
    debug1: bool,
    /// Log the second engine's traffic
    #[arg(long)]
    debug2: bool,
    /// Enable pondering for the first engine
    #[arg(long)]
    ponder1: bool,
    /// Enable pondering for the second engine
    #[arg(long)]
    ponder2: bool,

    /// Base time in ms [default: 10000]
    #[arg(long)]
    tc: Option<u64>,
    /// Increment in ms [default: 100]
    #[arg(long)]
    inc: Option<u64>,
    /// Fixed time per move in ms; overrides tc and inc
    #[arg(long)]
    fixed: Option<u64>,
    /// An engine loses on time once its clock is this far below zero, in ms [default: 50]
    #[arg(long)]
    margin: Option<u64>,

    /// Number of games [default: 1000000]
    #[arg(long)]
    games: Option<u32>,
    /// Concurrent games [default: 1]
    #[arg(long)]
    threads: Option<u32>,
    /// Plies before a game is adjudicated a draw [default: 1000]
    #[arg(long)]
    maxmoves: Option<u32>,
    /// Adjudicate a win once both engines report mate scores
    #[arg(long)]
    earlywin: bool,
    /// Adjudicate a draw once scores stay within drawscore for drawmoves plies
    #[arg(long)]
    earlydraw: bool,
    /// Centipawn window for earlydraw [default: 25]
    #[arg(long)]
    drawscore: Option<u32>,
    /// Plies for earlydraw [default: 20]
    #[arg(long)]
    drawmoves: Option<u32>,

    /// Opening file, one FEN per line
    #[arg(long)]
    fens: Option<PathBuf>,
    /// Play each opening twice with colours reversed
    #[arg(long)]
    repeat: bool,
    /// Variant: chess or chess960
    #[arg(long)]
    variant: Option<String>,
    /// Four-player chess
    #[arg(long = "4pc")]
    four_player: bool,
    /// Keep going after illegal moves and other recoverable errors
    #[arg(long = "continue")]
    continue_on_error: bool,
    /// Log every move
    #[arg(long)]
    pmoves: bool,
    /// PGN output file
    #[arg(long)]
    pgn: Option<PathBuf>,
    /// PGN4 output file
    #[arg(long)]
    pgn4: Option<PathBuf>,

    /// Stop early with a sequential probability ratio test
    #[arg(long)]
    sprt: bool,
    /// SPRT null hypothesis Elo [default: 0]
    #[arg(long)]
    sprt_elo0: Option<f64>,
    /// SPRT alternative hypothesis Elo [default: 5]
    #[arg(long)]
    sprt_elo1: Option<f64>,
    /// SPRT false positive rate [default: 0.05]
    #[arg(long)]
    sprt_alpha: Option<f64>,
    /// SPRT false negative rate [default: 0.05]
    #[arg(long)]
    sprt_beta: Option<f64>,

    /// Physical performance cores, e.g. 0,2,4-7
    #[arg(long)]
    pcores: Option<String>,
    /// Hyperthread siblings of the performance cores
    #[arg(long)]
    lcores: Option<String>,
    /// Efficiency cores
    #[arg(long)]
    ecores: Option<String>,
    /// Other cores
    #[arg(long)]
    gcores: Option<String>,

    /// Results snapshot file [default: results.txt]
    #[arg(long)]
    results: Option<PathBuf>,
    /// Results log file [default: results_log.txt]
    #[arg(long)]
    results_log: Option<PathBuf>,
    /// Results refresh interval in ms [default: 500]
    #[arg(long)]
    poll_ms: Option<u64>,
}

fn flag(set: bool) -> Option<bool> {
    set.then_some(true)
}

fn list(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            e1: self.e1,
            e2: self.e2,
            x1: flag(self.x1),
            x2: flag(self.x2),
            cores1: self.cores1,
            cores2: self.cores2,
            mem1: self.mem1,
            mem2: self.mem2,
            custom1: list(self.custom1),
            custom2: list(self.custom2),
            debug1: flag(self.debug1),
            debug2: flag(self.debug2),
            ponder1: flag(self.ponder1),
            ponder2: flag(self.ponder2),
            tc: self.tc,
            inc: self.inc,
            fixed: self.fixed,
            margin: self.margin,
            games: self.games,
            threads: self.threads,
            maxmoves: self.maxmoves,
            earlywin: flag(self.earlywin),
            earlydraw: flag(self.earlydraw),
            drawscore: self.drawscore,
            drawmoves: self.drawmoves,
            fens: self.fens,
            repeat: flag(self.repeat),
            variant: self.variant,
            four_player: flag(self.four_player),
            continue_on_error: flag(self.continue_on_error),
            pmoves: flag(self.pmoves),
            pgn: self.pgn,
            pgn4: self.pgn4,
            sprt: flag(self.sprt),
            sprt_elo0: self.sprt_elo0,
            sprt_elo1: self.sprt_elo1,
            sprt_alpha: self.sprt_alpha,
            sprt_beta: self.sprt_beta,
            pcores: self.pcores,
            lcores: self.lcores,
            ecores: self.ecores,
            gcores: self.gcores,
            results: self.results,
            results_log: self.results_log,
            poll_ms: self.poll_ms,
        }
    }
}

fn load_config(mut cli: Cli) -> Result<MatchConfig, ConfigError> {
    let file = match cli.config.take() {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };
    MatchConfig::from_settings(cli.into_settings().or(file))
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(anyhow::Error::msg)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    let abort = Arc::new(AbortSignal::new());
    if let Err(e) = abort.install_ctrlc_handler() {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(1);
        }
    };

    abort.watch_keypress();
    match run_match(config, &abort) {
        Ok(summary) => ExitCode::from(exit_code(summary.outcome)),
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use engine_protocol::Protocol;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chess-match").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_full_command_line() {
        let cli = parse(&[
            "--e1", "./a", "--e2", "./b", "--x2", "--games", "200", "--threads", "4", "--tc",
            "5000", "--inc", "50", "--custom1", "setoption name Style value Solid", "--custom1",
            "setoption name Contempt value 0", "--sprt", "--sprt-elo1", "10", "--4pc",
            "--continue", "--poll-ms", "100",
        ]);
        let settings = cli.into_settings();
        assert_eq!(settings.e1, Some(PathBuf::from("./a")));
        assert_eq!(settings.x1, None);
        assert_eq!(settings.x2, Some(true));
        assert_eq!(settings.games, Some(200));
        assert_eq!(settings.custom1.as_ref().map(Vec::len), Some(2));
        assert_eq!(settings.custom2, None);
        assert_eq!(settings.sprt, Some(true));
        assert_eq!(settings.sprt_elo1, Some(10.0));
        assert_eq!(settings.four_player, Some(true));
        assert_eq!(settings.continue_on_error, Some(true));
        assert_eq!(settings.poll_ms, Some(100));
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "e1 = \"/opt/a\"\ne2 = \"/opt/b\"\ngames = 50\nthreads = 2\nx1 = true"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();
        let config = load_config(parse(&["--config", path, "--games", "10"])).unwrap();
        assert_eq!(config.games, 10);
        assert_eq!(config.threads, 2);
        assert_eq!(config.engine1.protocol, Protocol::Xboard);
        assert_eq!(config.engine2.protocol, Protocol::Uci);
    }

    #[test]
    fn test_missing_engine_is_reported() {
        assert!(matches!(
            load_config(parse(&["--e1", "./a"])),
            Err(ConfigError::MissingEngine(_))
        ));
    }

    #[test]
    fn test_pgn_and_pgn4_conflict() {
        assert!(matches!(
            load_config(parse(&["--e1", "a", "--e2", "b", "--pgn", "x.pgn", "--pgn4", "y.pgn4"])),
            Err(ConfigError::ConflictingOutputs)
        ));
    }
}
