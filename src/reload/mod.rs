//! Zero-downtime socket reloading.
//!
//! # Responsibilities
//! - Hand out listeners, adopting sockets inherited from an upgrading parent when present
//! - On upgrade: spawn a replacement that inherits every socket, wait for its readiness
//! - Tell this process when to stop serving (replacement ready, or stop requested)
//!
//! # Data Flow
//! ```text
//! parent                                   child
//!   SIGHUP → upgrade()
//!     spawn_replacement(sockets) ───────▶  listen() adopts inherited sockets
//!     wait_ready(timeout)                  ready() closes unclaimed, notifies parent
//!     ◀──────────────────────── ready byte
//!   exit() resolves HandedOff
//!   group interrupts listener actors
//!   drain and exit                         serves alone
//! ```
//!
//! # Design Decisions
//! - Inherited sockets are keyed by the configured `(network, address)` pair. A requested key
//!   that was not inherited fails closed instead of binding a fresh socket
//! - At most one upgrade is in flight; a failed upgrade leaves this process serving
//! - The mechanism is a [`Handoff`] trait object: descriptor passing on unix, unsupported
//!   elsewhere

pub mod actors;
pub mod handoff;
pub mod unsupported;
#[cfg(unix)]
pub mod unix;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::net::{BoundSocket, ListenAddress, Listener, ListenerError};

pub use actors::{ReadyActor, UpgradeActor};
pub use handoff::{Handoff, Replacement};
pub use unsupported::UnsupportedHandoff;

/// Default time a replacement process gets to report readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for socket reload operations.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("graceful reload is not supported on this platform")]
    Unsupported,

    #[error("an upgrade is already in progress")]
    UpgradeInProgress,

    #[error("the reloader has stopped")]
    Stopped,

    #[error("listener {0} was requested twice")]
    DuplicateListener(ListenAddress),

    /// The parent did not pass a socket under this key.
    #[error("listener {0} was not inherited from the parent process")]
    InheritanceMismatch(ListenAddress),

    /// The handoff environment or an inherited descriptor is unusable.
    #[error("invalid inherited state: {0}")]
    InvalidInheritance(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to duplicate listening socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] io::Error),

    #[error("replacement process {pid} failed before becoming ready: {source}")]
    ChildFailed { pid: u32, source: io::Error },

    #[error("replacement process {pid} was not ready within {timeout:?}")]
    ReadyTimeout { pid: u32, timeout: Duration },

    #[error("failed to notify parent process: {0}")]
    Notify(#[source] io::Error),
}

/// Why this process should stop serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Serving,
    /// A replacement is ready and owns the sockets now.
    HandedOff,
    Stopped,
}

impl ExitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serving => "serving",
            Self::HandedOff => "handed_off",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns every listening socket of the process and coordinates handoffs.
pub struct Reloader {
    handoff: Box<dyn Handoff>,
    sockets: Mutex<Vec<(ListenAddress, BoundSocket)>>,
    upgrading: AtomicBool,
    exit: watch::Sender<ExitState>,
    ready_timeout: Duration,
}

impl Reloader {
    /// Create a reloader using the platform's handoff mechanism.
    ///
    /// On unix this reads and clears the inheritance variables of the process environment,
    /// so call it before the async runtime starts its worker threads.
    ///
    /// # Errors
    ///
    /// Fails when this process was started as a replacement and the inherited state is
    /// unusable.
    pub fn new(ready_timeout: Duration) -> Result<Self, ReloadError> {
        Ok(Self::with_handoff(platform_handoff()?, ready_timeout))
    }

    /// Create a reloader that never hands off. Listeners are always bound fresh.
    pub fn disabled() -> Self {
        Self::with_handoff(Box::new(UnsupportedHandoff), DEFAULT_READY_TIMEOUT)
    }

    pub fn with_handoff(handoff: Box<dyn Handoff>, ready_timeout: Duration) -> Self {
        if handoff.has_parent() {
            info!("Started as a replacement, inheriting listeners from parent process");
        }
        let (exit, _) = watch::channel(ExitState::Serving);
        Self {
            handoff,
            sockets: Mutex::new(Vec::new()),
            upgrading: AtomicBool::new(false),
            exit,
            ready_timeout,
        }
    }

    /// Whether listeners came from an upgrading parent.
    pub fn is_inherited(&self) -> bool {
        self.handoff.has_parent()
    }

    pub fn is_supported(&self) -> bool {
        self.handoff.is_supported()
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Obtain a listener for `address`, inherited when this process is a replacement.
    ///
    /// Must be called inside a tokio runtime.
    pub fn listen(&self, address: &ListenAddress) -> Result<Listener, ReloadError> {
        let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
        if sockets.iter().any(|(key, _)| key == address) {
            return Err(ReloadError::DuplicateListener(address.clone()));
        }

        let socket = if self.handoff.has_parent() {
            match self.handoff.take_inherited(address)? {
                Some(socket) => {
                    info!(address = %address, local = %socket.local_addr(), "Adopted inherited listener");
                    socket
                }
                None => return Err(ReloadError::InheritanceMismatch(address.clone())),
            }
        } else {
            BoundSocket::bind(address)?
        };

        let tracked = socket.try_clone().map_err(ReloadError::Socket)?;
        let listener = socket.into_listener(address)?;
        sockets.push((address.clone(), tracked));
        Ok(listener)
    }

    /// Keys of every listener handed out so far.
    pub fn listener_keys(&self) -> Vec<ListenAddress> {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Declare that every listener is set up and this process can take traffic.
    ///
    /// Inherited sockets nobody asked for are closed. A replacement then notifies its parent.
    pub fn ready(&self) -> Result<(), ReloadError> {
        for unclaimed in self.handoff.close_unclaimed() {
            warn!(address = %unclaimed, "Closing inherited listener no one claimed");
        }
        if self.handoff.has_parent() {
            self.handoff.notify_parent()?;
            info!("Signalled readiness to parent process");
        }
        Ok(())
    }

    /// Start a replacement process and wait until it is ready.
    ///
    /// On success [`Reloader::exit`] resolves with [`ExitState::HandedOff`]. On failure the
    /// replacement is killed and this process keeps serving. Dropping the future before it
    /// completes also kills the replacement.
    pub async fn upgrade(&self) -> Result<(), ReloadError> {
        let result = self.try_upgrade().await;
        let outcome = match &result {
            Ok(()) => "success",
            Err(ReloadError::UpgradeInProgress) => "in_progress",
            Err(_) => "failure",
        };
        metrics::counter!("reload_attempts_total", "outcome" => outcome).increment(1);
        result
    }

    async fn try_upgrade(&self) -> Result<(), ReloadError> {
        if !self.handoff.is_supported() {
            return Err(ReloadError::Unsupported);
        }
        if *self.exit.borrow() != ExitState::Serving {
            return Err(ReloadError::Stopped);
        }
        if self.upgrading.swap(true, Ordering::AcqRel) {
            return Err(ReloadError::UpgradeInProgress);
        }
        let _in_flight = InFlight(&self.upgrading);

        let replacement = {
            let sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
            let passed: Vec<(&ListenAddress, &BoundSocket)> =
                sockets.iter().map(|(key, socket)| (key, socket)).collect();
            self.handoff.spawn_replacement(&passed)?
        };

        info!(
            pid = replacement.pid(),
            timeout_secs = self.ready_timeout.as_secs_f64(),
            "Spawned replacement process, waiting for readiness"
        );
        let pid = replacement.pid();
        replacement.wait_ready(self.ready_timeout).await?;

        let handed_off = self.exit.send_if_modified(|state| {
            if *state == ExitState::Serving {
                *state = ExitState::HandedOff;
                true
            } else {
                false
            }
        });
        if handed_off {
            info!(pid, "Replacement process is ready, handing over");
        }
        Ok(())
    }

    /// Resolves once this process should stop serving.
    pub async fn exit(&self) -> ExitState {
        let mut rx = self.exit.subscribe();
        let state = match rx.wait_for(|state| *state != ExitState::Serving).await {
            Ok(state) => *state,
            Err(_) => ExitState::Stopped,
        };
        state
    }

    /// Current exit state without waiting.
    pub fn state(&self) -> ExitState {
        *self.exit.borrow()
    }

    /// Stop serving without a replacement. Later upgrades are rejected.
    pub fn stop(&self) {
        self.exit.send_if_modified(|state| {
            if *state == ExitState::Serving {
                *state = ExitState::Stopped;
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader")
            .field("inherited", &self.handoff.has_parent())
            .field("supported", &self.handoff.is_supported())
            .field("state", &self.state())
            .field("ready_timeout", &self.ready_timeout)
            .finish()
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(unix)]
fn platform_handoff() -> Result<Box<dyn Handoff>, ReloadError> {
    Ok(Box::new(unix::FdHandoff::from_env()?))
}

#[cfg(not(unix))]
fn platform_handoff() -> Result<Box<dyn Handoff>, ReloadError> {
    Ok(Box::new(UnsupportedHandoff))
}
