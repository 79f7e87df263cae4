//! OS signal handling.
//!
//! # Responsibilities
//! - Register termination signal handlers (SIGINT, SIGTERM; Ctrl-C elsewhere)
//! - Turn a captured signal into a normal run group termination
//!
//! SIGHUP is not handled here: it drives the listener handoff and belongs to
//! [`crate::reload::actors::UpgradeActor`].

use tracing::{debug, info};

use super::actor::{Actor, ActorFuture, BoxError, Termination};
use super::shutdown::{Shutdown, ShutdownSignal};

/// Termination signals the actor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT (Ctrl-C in a terminal).
    Interrupt,
    /// SIGTERM (systemd, Kubernetes, `kill`).
    Terminate,
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for a termination signal.
///
/// Handlers are installed when the returned future is first polled.
#[cfg(unix)]
pub async fn wait_for_termination() -> std::io::Result<TerminationSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok(TerminationSignal::Interrupt),
        _ = sigterm.recv() => Ok(TerminationSignal::Terminate),
    }
}

/// Wait for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_termination() -> std::io::Result<TerminationSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(TerminationSignal::Interrupt)
}

/// Actor that completes when the process receives a termination signal.
#[derive(Debug)]
pub struct SignalActor {
    cancel: Shutdown,
    signal: Option<ShutdownSignal>,
}

impl SignalActor {
    pub fn new() -> Self {
        let cancel = Shutdown::new();
        let signal = Some(cancel.subscribe());
        Self { cancel, signal }
    }
}

impl Default for SignalActor {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor for SignalActor {
    fn name(&self) -> &str {
        "signals"
    }

    fn run(&mut self) -> ActorFuture {
        let mut cancelled = self.signal.take().unwrap_or_else(|| self.cancel.subscribe());
        Box::pin(async move {
            tokio::select! {
                captured = wait_for_termination() => {
                    let signal = captured.map_err(|e| Box::new(e) as BoxError)?;
                    info!(signal = %signal, "Captured signal");
                }
                _ = cancelled.wait() => {
                    debug!("Signal handler cancelled");
                }
            }
            Ok(())
        })
    }

    fn interrupt(&mut self, _cause: &Termination<'_>) {
        self.cancel.trigger();
    }
}
