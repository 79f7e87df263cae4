//! Run group actors driving the reloader.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{ExitState, ReloadError, Reloader};
use crate::lifecycle::actor::{Actor, ActorFuture, BoxError, Termination};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};

/// Starts an upgrade on every SIGHUP.
///
/// A failed upgrade is logged and the process keeps serving. On platforms without SIGHUP the
/// actor only waits to be interrupted.
#[derive(Debug)]
pub struct UpgradeActor {
    reloader: Arc<Reloader>,
    cancel: Shutdown,
    signal: Option<ShutdownSignal>,
}

impl UpgradeActor {
    pub fn new(reloader: Arc<Reloader>) -> Self {
        let cancel = Shutdown::new();
        let signal = Some(cancel.subscribe());
        Self {
            reloader,
            cancel,
            signal,
        }
    }
}

impl Actor for UpgradeActor {
    fn name(&self) -> &str {
        "upgrader"
    }

    #[cfg(unix)]
    fn run(&mut self) -> ActorFuture {
        use tokio::signal::unix::{signal, SignalKind};

        let reloader = Arc::clone(&self.reloader);
        let mut cancelled = self.signal.take().unwrap_or_else(|| self.cancel.subscribe());

        Box::pin(async move {
            let mut hangup = signal(SignalKind::hangup()).map_err(|e| Box::new(e) as BoxError)?;
            loop {
                tokio::select! {
                    received = hangup.recv() => {
                        if received.is_none() {
                            return Ok(());
                        }
                    }
                    _ = cancelled.wait() => return Ok(()),
                }

                info!("Received SIGHUP, gracefully reloading socket descriptors");
                let upgrade = reloader.upgrade();
                tokio::pin!(upgrade);

                tokio::select! {
                    result = &mut upgrade => log_upgrade_outcome(&result),
                    // Dropping the pending upgrade kills the replacement.
                    _ = cancelled.wait() => return Ok(()),
                }
            }
        })
    }

    #[cfg(not(unix))]
    fn run(&mut self) -> ActorFuture {
        let mut cancelled = self.signal.take().unwrap_or_else(|| self.cancel.subscribe());
        Box::pin(async move {
            warn!("SIGHUP reloading is not supported on this platform");
            cancelled.wait().await;
            Ok(())
        })
    }

    fn interrupt(&mut self, _cause: &Termination<'_>) {
        self.cancel.trigger();
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn log_upgrade_outcome(result: &Result<(), ReloadError>) {
    match result {
        Ok(()) => info!("Upgrade complete, replacement took over the listeners"),
        Err(ReloadError::Unsupported) => warn!("Graceful reload is unavailable, ignoring SIGHUP"),
        // A SIGHUP queued behind the handoff that just finished.
        Err(ReloadError::Stopped) => info!("Listeners already handed over, ignoring SIGHUP"),
        Err(e) => error!(error = %e, "Upgrade failed, continuing to serve"),
    }
}

/// Declares readiness once the group starts, then completes when the process should exit.
///
/// Completing is how a finished handoff stops the old process: the run group interrupts every
/// listener actor, which drain and return.
#[derive(Debug)]
pub struct ReadyActor {
    reloader: Arc<Reloader>,
}

impl ReadyActor {
    pub fn new(reloader: Arc<Reloader>) -> Self {
        Self { reloader }
    }
}

impl Actor for ReadyActor {
    fn name(&self) -> &str {
        "reloader"
    }

    fn run(&mut self) -> ActorFuture {
        let reloader = Arc::clone(&self.reloader);
        Box::pin(async move {
            if let Err(e) = reloader.ready() {
                warn!(error = %e, "Failed to signal readiness, the parent will time out and keep serving");
            }

            match reloader.exit().await {
                ExitState::HandedOff => info!("Listeners handed over, shutting down"),
                state => info!(state = %state, "Reloader stopped"),
            }
            Ok(())
        })
    }

    fn interrupt(&mut self, _cause: &Termination<'_>) {
        self.reloader.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn logged_levels(f: impl FnOnce()) -> Vec<String> {
        #[derive(Clone, Default)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = Sink::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);

        let bytes = sink.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|line| line["level"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn sighup_after_handoff_is_not_an_error() {
        assert_eq!(logged_levels(|| log_upgrade_outcome(&Err(ReloadError::Stopped))), ["INFO"]);
        assert_eq!(logged_levels(|| log_upgrade_outcome(&Err(ReloadError::Unsupported))), ["WARN"]);
        assert_eq!(
            logged_levels(|| log_upgrade_outcome(&Err(ReloadError::UpgradeInProgress))),
            ["ERROR"]
        );
    }

    #[tokio::test]
    async fn upgrade_actor_stops_on_interrupt() {
        let mut actor = UpgradeActor::new(Arc::new(Reloader::disabled()));
        let running = tokio::spawn(actor.run());
        tokio::task::yield_now().await;

        actor.interrupt(&Termination::new("other", None));
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("upgrade actor should stop promptly")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ready_actor_completes_when_stopped() {
        let reloader = Arc::new(Reloader::disabled());
        let mut actor = ReadyActor::new(Arc::clone(&reloader));
        let running = tokio::spawn(actor.run());

        actor.interrupt(&Termination::new("other", None));
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("ready actor should stop promptly")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(reloader.state(), ExitState::Stopped);
    }
}
