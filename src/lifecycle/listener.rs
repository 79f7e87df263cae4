//! Listener actors: a server bound to an already-open listening socket.
//!
//! # Shutdown sequence
//! ```text
//! interrupt()
//!     → shutdown signal triggered (once)
//!     → server stops accepting, drains in-flight work
//!     → run() waits at most `shutdown_deadline`
//!     → deadline hit: serve future dropped, connections force-closed
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info, warn};

use super::actor::{Actor, ActorFuture, BoxError, Termination};
use super::shutdown::{Shutdown, ShutdownSignal};
use crate::net::{Listener, ListenerError};

/// Default time granted to in-flight requests once shutdown starts.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(60);

/// Errors a server can finish with.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The server was closed on request. Not a failure.
    #[error("server closed")]
    Closed,

    /// Accepting a connection failed; the listener is unusable.
    #[error(transparent)]
    Accept(#[from] ListenerError),

    /// Any other server failure.
    #[error("server failed: {0}")]
    Other(BoxError),
}

/// A `Future` that represents a running server.
pub type ServeFuture = Pin<Box<dyn Future<Output = Result<(), ServeError>> + Send + 'static>>;

/// A server that can be driven by a [`ListenerActor`].
pub trait Serve: Send + 'static {
    /// Serve connections from `listener` until `shutdown` resolves, then drain.
    ///
    /// Dropping the returned future must release the listener and abort every connection.
    fn serve(self: Box<Self>, listener: Listener, shutdown: ShutdownSignal) -> ServeFuture;
}

/// Actor wrapping a [`Serve`] implementation and its listener.
pub struct ListenerActor {
    name: String,
    parts: Option<(Listener, Box<dyn Serve>)>,
    shutdown: Shutdown,
    deadline: Duration,
}

impl ListenerActor {
    pub fn new<S: Serve>(name: impl Into<String>, listener: Listener, server: S) -> Self {
        Self {
            name: name.into(),
            parts: Some((listener, Box::new(server))),
            shutdown: Shutdown::new(),
            deadline: DEFAULT_SHUTDOWN_DEADLINE,
        }
    }

    /// Set how long in-flight work may take once shutdown starts.
    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn shutdown_deadline(&self) -> Duration {
        self.deadline
    }
}

impl Actor for ListenerActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> ActorFuture {
        let Some((listener, server)) = self.parts.take() else {
            let err: BoxError = Box::new(super::actor::AlreadyStarted(self.name.clone()));
            return Box::pin(async move { Err(err) });
        };

        let name = self.name.clone();
        let deadline = self.deadline;
        let mut interrupted = self.shutdown.subscribe();
        let server_shutdown = self.shutdown.subscribe();

        Box::pin(async move {
            info!(listener = %name, address = %listener.local_addr(), "Starting server");

            let serve = server.serve(listener, server_shutdown);
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => {
                    return match result {
                        Ok(()) | Err(ServeError::Closed) => {
                            info!(listener = %name, "Server closed");
                            Ok(())
                        }
                        Err(e) => Err(Box::new(e) as BoxError),
                    };
                }
                _ = interrupted.wait() => {}
            }

            info!(listener = %name, deadline_secs = deadline.as_secs_f64(), "Shutting server down");
            match tokio::time::timeout(deadline, serve).await {
                Ok(Ok(())) | Ok(Err(ServeError::Closed)) => info!(listener = %name, "Server stopped"),
                Ok(Err(e)) => error!(listener = %name, error = %e, "Error raised while shutting down the server"),
                Err(_) => warn!(
                    listener = %name,
                    deadline_secs = deadline.as_secs_f64(),
                    "Shutdown deadline exceeded, forcing remaining connections closed"
                ),
            }
            Ok(())
        })
    }

    fn interrupt(&mut self, _cause: &Termination<'_>) {
        if !self.shutdown.trigger() {
            return;
        }
        info!(listener = %self.name, "Server shutdown requested");
    }
}

impl std::fmt::Debug for ListenerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerActor")
            .field("name", &self.name)
            .field("started", &self.parts.is_none())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::net::ListenAddress;

    /// Accepts nothing, waits for shutdown, counts how often serve completes.
    struct Idle {
        finished: Arc<AtomicUsize>,
    }

    impl Serve for Idle {
        fn serve(self: Box<Self>, _listener: Listener, mut shutdown: ShutdownSignal) -> ServeFuture {
            Box::pin(async move {
                shutdown.wait().await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                Err(ServeError::Closed)
            })
        }
    }

    fn listener() -> Listener {
        Listener::bind(&ListenAddress::tcp("127.0.0.1:0")).unwrap()
    }

    #[tokio::test]
    async fn double_interrupt_is_harmless() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut actor = ListenerActor::new(
            "idle",
            listener(),
            Idle {
                finished: Arc::clone(&finished),
            },
        );
        let running = tokio::spawn(actor.run());

        let cause = Termination::new("other", None);
        actor.interrupt(&cause);
        actor.interrupt(&cause);

        let result = running.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_sentinel_maps_to_success() {
        struct ClosesAtOnce;
        impl Serve for ClosesAtOnce {
            fn serve(self: Box<Self>, _listener: Listener, _shutdown: ShutdownSignal) -> ServeFuture {
                Box::pin(async { Err(ServeError::Closed) })
            }
        }

        let mut actor = ListenerActor::new("closing", listener(), ClosesAtOnce);
        assert!(actor.run().await.is_ok());
    }

    #[tokio::test]
    async fn genuine_failures_surface() {
        struct Fails;
        impl Serve for Fails {
            fn serve(self: Box<Self>, _listener: Listener, _shutdown: ShutdownSignal) -> ServeFuture {
                Box::pin(async { Err(ServeError::Other("disk on fire".into())) })
            }
        }

        let mut actor = ListenerActor::new("failing", listener(), Fails);
        let err = actor.run().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ServeError>(), Some(ServeError::Other(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_server_is_forced_after_deadline() {
        struct Stuck;
        impl Serve for Stuck {
            fn serve(self: Box<Self>, _listener: Listener, _shutdown: ShutdownSignal) -> ServeFuture {
                Box::pin(std::future::pending())
            }
        }

        let mut actor =
            ListenerActor::new("stuck", listener(), Stuck).with_shutdown_deadline(Duration::from_secs(2));
        let running = tokio::spawn(actor.run());
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        actor.interrupt(&Termination::new("other", None));
        let result = running.await.unwrap();

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
