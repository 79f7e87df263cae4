//! The descriptor-inheritance capability and in-flight reload sessions.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tracing::warn;

use super::ReloadError;
use crate::net::{BoundSocket, ListenAddress};

/// Platform mechanism for passing listening sockets to a replacement process.
///
/// Exactly one implementation is compiled in as the platform default: descriptor passing on
/// unix, [`super::unsupported::UnsupportedHandoff`] elsewhere.
pub trait Handoff: Send + Sync + 'static {
    /// Whether a replacement process can be spawned at all.
    fn is_supported(&self) -> bool;

    /// Whether this process was spawned by an upgrading parent.
    fn has_parent(&self) -> bool;

    /// Remove and return the inherited socket registered under `address`.
    ///
    /// `Ok(None)` means nothing was inherited under that key.
    fn take_inherited(&self, address: &ListenAddress) -> Result<Option<BoundSocket>, ReloadError>;

    /// Close every inherited socket no listener claimed, returning their keys.
    fn close_unclaimed(&self) -> Vec<ListenAddress>;

    /// Start a replacement process that inherits `sockets`.
    fn spawn_replacement(&self, sockets: &[(&ListenAddress, &BoundSocket)]) -> Result<Replacement, ReloadError>;

    /// Tell the parent process this one is ready to take traffic.
    ///
    /// Does nothing without a parent or when the parent was already notified.
    fn notify_parent(&self) -> Result<(), ReloadError>;
}

type ReadyFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
type AbortFn = Box<dyn FnOnce() + Send>;

/// One in-flight upgrade: a spawned child that has not yet confirmed readiness.
///
/// The session settles when the child reports ready, after which it keeps running on its
/// own. Dropping an unsettled session aborts the child.
pub struct Replacement {
    pid: u32,
    ready: Option<ReadyFuture>,
    abort: Option<AbortFn>,
}

impl Replacement {
    pub fn new<R, A>(pid: u32, ready: R, abort: A) -> Self
    where
        R: Future<Output = io::Result<()>> + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        Self {
            pid,
            ready: Some(Box::pin(ready)),
            abort: Some(Box::new(abort)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child's readiness signal, at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ChildFailed` when the readiness channel breaks (typically the child exited)
    /// and `ReadyTimeout` when nothing arrived in time. The child is killed in both cases.
    pub async fn wait_ready(mut self, timeout: Duration) -> Result<(), ReloadError> {
        let Some(ready) = self.ready.take() else {
            return Err(ReloadError::ChildFailed {
                pid: self.pid,
                source: io::Error::new(io::ErrorKind::Other, "readiness already consumed"),
            });
        };

        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => {
                self.abort = None;
                Ok(())
            }
            Ok(Err(source)) => Err(ReloadError::ChildFailed { pid: self.pid, source }),
            Err(_) => Err(ReloadError::ReadyTimeout { pid: self.pid, timeout }),
        }
    }
}

impl Drop for Replacement {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            warn!(pid = self.pid, "Aborting replacement process");
            abort();
        }
    }
}

impl std::fmt::Debug for Replacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replacement")
            .field("pid", &self.pid)
            .field("settled", &self.abort.is_none())
            .finish()
    }
}
