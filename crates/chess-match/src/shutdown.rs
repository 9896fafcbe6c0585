//! Engine shutdown and user abort handling.
//!
//! [`ShutdownCoordinator`] moves through `Running -> Stopping -> Terminated`
//! exactly once, no matter how many threads ask for it. [`AbortSignal`] is
//! the small handle given to the Ctrl-C handler and the keypress watcher: it
//! records the abort and, once a coordinator is attached, stops the engines.

use std::io::{self, BufRead, IsTerminal};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

/// What the shutdown sequence needs from an engine process.
pub trait EngineControl: Send + Sync {
    /// Name used in log messages.
    fn label(&self) -> &str;
    /// Asks the engine to exit. Delivery failures are not errors.
    fn send_quit(&self);
    fn is_running(&self) -> bool;
    /// Kills the process if it is still running.
    fn force_exit(&self);
}

/// Progress of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Stopping = 1,
    Terminated = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Stopping,
            _ => ShutdownState::Terminated,
        }
    }
}

/// Number of exit polls before engines are killed.
pub const EXIT_POLLS: u32 = 10;
/// Delay between exit polls.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stops every loaded engine once.
pub struct ShutdownCoordinator {
    engines: Vec<Arc<dyn EngineControl>>,
    state: AtomicU8,
    polls: u32,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(engines: Vec<Arc<dyn EngineControl>>) -> Self {
        Self {
            engines,
            state: AtomicU8::new(ShutdownState::Running as u8),
            polls: EXIT_POLLS,
            poll_interval: EXIT_POLL_INTERVAL,
        }
    }

    /// Overrides the exit grace period (`polls` x `interval`).
    pub fn with_grace(mut self, polls: u32, interval: Duration) -> Self {
        self.polls = polls;
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sends quit to every engine, waits for them to exit and kills the rest.
    ///
    /// Only the first caller does the work and gets `true`. Later callers
    /// wait until the first one has finished and get `false`.
    pub fn shutdown_engines(&self) -> bool {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            while self.state() != ShutdownState::Terminated {
                thread::sleep(Duration::from_millis(10));
            }
            return false;
        }

        tracing::info!("Shutting down {} engines", self.engines.len());
        for engine in &self.engines {
            engine.send_quit();
        }
        for _ in 0..self.polls {
            if !self.engines.iter().any(|e| e.is_running()) {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        for engine in self.engines.iter().filter(|e| e.is_running()) {
            tracing::warn!("{} did not exit, killing it", engine.label());
            engine.force_exit();
        }

        self.state
            .store(ShutdownState::Terminated as u8, Ordering::Release);
        true
    }
}

/// Abort flag shared with the Ctrl-C handler and the keypress watcher.
#[derive(Default)]
pub struct AbortSignal {
    raised: AtomicBool,
    coordinator: OnceLock<Arc<ShutdownCoordinator>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the match as aborted without touching the engines.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Gives the signal the coordinator it should use on interrupt. Only the
    /// first call has an effect.
    pub fn attach(&self, coordinator: Arc<ShutdownCoordinator>) {
        let _ = self.coordinator.set(coordinator);
    }

    /// Raises the flag and stops the engines if they are loaded.
    pub fn interrupt(&self) {
        let repeated = self.raised.swap(true, Ordering::AcqRel);
        if repeated {
            tracing::debug!("Interrupt received while already stopping");
        } else {
            tracing::info!("Interrupted, stopping match");
        }
        if let Some(coordinator) = self.coordinator.get() {
            coordinator.shutdown_engines();
        }
    }

    /// Routes Ctrl-C to [`AbortSignal::interrupt`].
    ///
    /// # Errors
    ///
    /// Fails if a handler is already installed for this process.
    pub fn install_ctrlc_handler(self: &Arc<Self>) -> Result<(), ctrlc::Error> {
        let signal = Arc::clone(self);
        ctrlc::set_handler(move || signal.interrupt())
    }

    /// Raises the flag when Enter is pressed on an interactive terminal.
    /// Does nothing when stdin is not a terminal.
    pub fn watch_keypress(self: &Arc<Self>) {
        if !io::stdin().is_terminal() {
            return;
        }
        let signal = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("keypress".to_string())
            .spawn(move || {
                let mut line = String::new();
                if let Ok(n) = io::stdin().lock().read_line(&mut line) {
                    if n > 0 {
                        tracing::info!("Key pressed, stopping match");
                        signal.raise();
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not watch for keypresses: {}", e);
        }
    }
}
