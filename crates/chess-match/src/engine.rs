//! Engine process client for UCI and xboard engines.
//!
//! This module spawns an engine as a subprocess and talks to it through its
//! stdin/stdout pipes. A reader thread forwards stdout lines over a channel,
//! so every read has a timeout and a hung engine can be detected.
//!
//! # Lifecycle
//!
//! 1. Start the engine with [`EngineProcess::load`], which also performs the
//!    protocol handshake.
//! 2. Send the per-side options with [`EngineProcess::configure`].
//! 3. For every game call [`EngineProcess::new_game`], then
//!    [`EngineProcess::request_move`] whenever it is the engine's turn.
//! 4. Shut it down through [`EngineControl`]; dropping the process kills it
//!    if it is still running.

use crate::config::{EngineConfig, TimeControl, Variant};
use crate::openings::Opening;
use crate::shutdown::EngineControl;
use engine_protocol::{Clock, EngineMessage, GuiCommand, Protocol, Score};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long an engine gets to answer the handshake and readiness checks.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// xboard engines that never send `feature done=1` are given this long.
const FEATURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur when communicating with an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine executable could not be started.
    #[error("Failed to spawn {path}: {source}")]
    SpawnError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Writing to the engine failed.
    #[error("Engine I/O error: {0}")]
    IoError(#[from] io::Error),
    /// The engine closed its output or exited.
    #[error("Engine disconnected")]
    Disconnected,
    /// The engine did not answer in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

/// The engine's answer to a move request.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineReply {
    /// A move in coordinate notation, with the last score seen while thinking.
    Move { mv: String, score: Option<Score> },
    /// The engine gave up (xboard).
    Resign,
}

/// A running engine process.
pub struct EngineProcess {
    label: String,
    protocol: Protocol,
    debug: bool,
    name: OnceLock<String>,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    lines: Mutex<Receiver<String>>,
    ping: AtomicU32,
    /// Moves an xboard engine already has on its board.
    synced_moves: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EngineProcess {
    /// Spawns an engine without talking to it yet.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the engine executable.
    /// * `protocol` - The protocol the engine speaks.
    /// * `label` - Name used in log messages, e.g. `engine1[slot 0]`.
    /// * `debug` - Log the engine's traffic at info level instead of trace.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SpawnError`] if the process cannot be started.
    pub fn spawn(
        path: &Path,
        protocol: Protocol,
        label: impl Into<String>,
        debug: bool,
    ) -> Result<Self, EngineError> {
        let label = label.into();
        let spawn_error = |source| EngineError::SpawnError {
            path: path.to_path_buf(),
            source,
        };
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(spawn_error(io::Error::other("engine pipes unavailable")));
            }
        };

        let (tx, rx) = mpsc::channel::<String>();
        let reader = std::thread::Builder::new()
            .name(format!("{}-stdout", label))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(l) => {
                            if tx.send(l).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        if let Err(e) = reader {
            let _ = child.kill();
            return Err(spawn_error(e));
        }

        Ok(Self {
            label,
            protocol,
            debug,
            name: OnceLock::new(),
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            lines: Mutex::new(rx),
            ping: AtomicU32::new(0),
            synced_moves: AtomicUsize::new(0),
        })
    }

    /// Spawns an engine and completes the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine cannot be started or does not
    /// complete the handshake within [`HANDSHAKE_TIMEOUT`].
    pub fn load(config: &EngineConfig, label: impl Into<String>) -> Result<Self, EngineError> {
        let engine = Self::spawn(&config.path, config.protocol, label, config.debug)?;
        engine.handshake(HANDSHAKE_TIMEOUT)?;
        tracing::info!("{} loaded: {}", engine.label, engine.name());
        Ok(engine)
    }

    /// The name the engine reported, or its label if it reported none.
    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or(&self.label)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends a command rendered for this engine's protocol.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IoError`] if writing to stdin fails.
    pub fn send(&self, command: &GuiCommand) -> Result<(), EngineError> {
        for line in command.lines(self.protocol) {
            self.send_line(&line)?;
        }
        Ok(())
    }

    /// Sends one line verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IoError`] if writing to stdin fails.
    pub fn send_line(&self, line: &str) -> Result<(), EngineError> {
        if self.debug {
            tracing::info!("{} <- {}", self.label, line);
        } else {
            tracing::trace!("{} <- {}", self.label, line);
        }
        let mut stdin = lock(&self.stdin);
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }

    fn read_message(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<EngineMessage, EngineError> {
        let line = match lock(&self.lines).recv_timeout(timeout) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => return Err(EngineError::Timeout(waiting_for)),
            Err(RecvTimeoutError::Disconnected) => return Err(EngineError::Disconnected),
        };
        if self.debug {
            tracing::info!("{} -> {}", self.label, line);
        } else {
            tracing::trace!("{} -> {}", self.label, line);
        }
        Ok(EngineMessage::parse(self.protocol, &line))
    }

    /// Reads messages until `accept` returns a value or `timeout` elapses.
    fn wait_for<T>(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
        mut accept: impl FnMut(EngineMessage) -> Option<T>,
    ) -> Result<T, EngineError> {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(EngineError::Timeout(waiting_for));
            }
            if let Some(value) = accept(self.read_message(remaining, waiting_for)?) {
                return Ok(value);
            }
        }
    }

    /// Enters protocol mode and waits until the engine is ready.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine exits or does not answer.
    pub fn handshake(&self, timeout: Duration) -> Result<(), EngineError> {
        self.send(&GuiCommand::Handshake)?;
        match self.protocol {
            Protocol::Uci => {
                let name = &self.name;
                self.wait_for(timeout, "uciok", |msg| match msg {
                    EngineMessage::Id { name: id } => {
                        let _ = name.set(id);
                        None
                    }
                    EngineMessage::UciOk => Some(()),
                    _ => None,
                })?;
            }
            Protocol::Xboard => {
                let name = &self.name;
                let features = self.wait_for(FEATURE_TIMEOUT, "feature done=1", |msg| match msg {
                    EngineMessage::Features { name: id, done } => {
                        if let Some(id) = id {
                            let _ = name.set(id);
                        }
                        done.then_some(())
                    }
                    _ => None,
                });
                match features {
                    Ok(()) | Err(EngineError::Timeout(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.sync(timeout)
    }

    /// Round-trips `isready`/`readyok` or `ping`/`pong`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine exits or does not answer.
    pub fn sync(&self, timeout: Duration) -> Result<(), EngineError> {
        let n = self.ping.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(&GuiCommand::Ping(n))?;
        self.wait_for(timeout, "ready", |msg| match msg {
            EngineMessage::ReadyOk if self.protocol == Protocol::Uci => Some(()),
            EngineMessage::Pong(m) if m == n => Some(()),
            _ => None,
        })
    }

    /// Sends memory, thread, ponder and variant options, then the custom
    /// commands verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IoError`] if writing fails.
    pub fn configure(&self, config: &EngineConfig, variant: Variant) -> Result<(), EngineError> {
        if config.memory_mb != 0 {
            self.send(&GuiCommand::Memory(config.memory_mb))?;
        }
        if config.cores != 0 {
            self.send(&GuiCommand::Cores(config.cores))?;
        }
        if config.ponder {
            self.send(&GuiCommand::Ponder(true))?;
        }
        if variant == Variant::Chess960 && self.protocol == Protocol::Uci {
            self.send(&GuiCommand::Chess960)?;
        }
        for command in &config.custom_commands {
            self.send(&GuiCommand::Raw(command.clone()))?;
        }
        Ok(())
    }

    /// Resets the engine for a new game from `opening`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine does not confirm readiness.
    pub fn new_game(
        &self,
        opening: &Opening,
        time: &TimeControl,
        variant: Variant,
    ) -> Result<(), EngineError> {
        self.send(&GuiCommand::NewGame)?;
        if self.protocol == Protocol::Xboard {
            if variant == Variant::Chess960 {
                self.send(&GuiCommand::Chess960)?;
            }
            if time.fixed_ms > 0 {
                self.send(&GuiCommand::FixedTime { ms: time.fixed_ms })?;
            } else {
                self.send(&GuiCommand::Level {
                    base_ms: time.base_ms,
                    inc_ms: time.inc_ms,
                })?;
            }
            self.send(&GuiCommand::Position {
                fen: opening.fen().map(str::to_string),
                moves: Vec::new(),
            })?;
            self.synced_moves.store(0, Ordering::Relaxed);
        }
        self.sync(HANDSHAKE_TIMEOUT)
    }

    /// Asks the engine for a move in the position after `moves`.
    ///
    /// # Arguments
    ///
    /// * `start_fen` - The game's starting FEN, `None` for the initial position.
    /// * `moves` - All moves played so far, in coordinate notation.
    /// * `clock` - Clock state sent with the request.
    /// * `deadline` - How long to wait before giving up on the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if no move arrives before `deadline`,
    /// or [`EngineError::Disconnected`] if the engine goes away.
    pub fn request_move(
        &self,
        start_fen: Option<&str>,
        moves: &[String],
        clock: Clock,
        deadline: Duration,
    ) -> Result<EngineReply, EngineError> {
        match self.protocol {
            Protocol::Uci => self.send(&GuiCommand::Position {
                fen: start_fen.map(str::to_string),
                moves: moves.to_vec(),
            })?,
            Protocol::Xboard => {
                let synced = self.synced_moves.load(Ordering::Relaxed).min(moves.len());
                for mv in &moves[synced..] {
                    self.send(&GuiCommand::Move(mv.clone()))?;
                }
            }
        }
        self.send(&GuiCommand::Go(clock))?;

        let mut score = None;
        let reply = self.wait_for(deadline, "move", |msg| match msg {
            EngineMessage::Info(info) => {
                if info.score.is_some() {
                    score = info.score;
                }
                None
            }
            EngineMessage::BestMove { mv, .. } => Some(EngineReply::Move { mv, score }),
            EngineMessage::Resign => Some(EngineReply::Resign),
            _ => None,
        })?;

        if self.protocol == Protocol::Xboard {
            self.send(&GuiCommand::Force)?;
            self.synced_moves.store(moves.len() + 1, Ordering::Relaxed);
        }
        Ok(reply)
    }
}

impl EngineControl for EngineProcess {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_quit(&self) {
        if let Err(e) = self.send(&GuiCommand::Quit) {
            tracing::debug!("{}: quit not delivered: {}", self.label, e);
        }
    }

    fn is_running(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    fn force_exit(&self) {
        let mut child = lock(&self.child);
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.force_exit();
    }
}
