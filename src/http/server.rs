//! HTTP server driven by a listener actor.
//!
//! # Responsibilities
//! - Accept connections from a [`Listener`] (TCP or Unix) with a connection limit
//! - Serve HTTP/1.1 and HTTP/2 over an axum `Router`
//! - Track connections so draining is observable
//! - Survive transient accept failures, backing off while descriptors are exhausted
//! - On shutdown: stop accepting, ask every connection to finish, wait for them
//!
//! Connection tasks live in a `JoinSet` owned by the serve future, so dropping that future
//! (the listener actor's forced close) aborts every connection.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info};

use crate::lifecycle::listener::{Serve, ServeError, ServeFuture};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::{AcceptFailure, Connection, ConnectionGuard, ConnectionTracker, Listener, ListenerError};

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// HTTP server over an axum router.
pub struct HttpServer {
    router: Router,
    name: String,
    max_connections: usize,
    tracker: Option<ConnectionTracker>,
}

impl HttpServer {
    /// Create a server for `router`. The name labels logs and connection metrics.
    pub fn new(name: impl Into<String>, router: Router) -> Self {
        Self {
            router,
            name: name.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tracker: None,
        }
    }

    /// Limit concurrently served connections; further accepts wait for a free slot.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Bound the time a single request may take; slower requests get `408 Request Timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.router = self
            .router
            .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));
        self
    }

    /// The tracker counting this server's connections.
    pub fn tracker(&mut self) -> ConnectionTracker {
        let name = self.name.clone();
        self.tracker
            .get_or_insert_with(|| ConnectionTracker::new(name))
            .clone()
    }
}

impl Serve for HttpServer {
    fn serve(mut self: Box<Self>, listener: Listener, shutdown: ShutdownSignal) -> ServeFuture {
        let tracker = self.tracker();
        let HttpServer {
            router,
            name,
            max_connections,
            ..
        } = *self;

        let router = router.layer(TraceLayer::new_for_http());
        let service = TowerToHyperService::new(router);
        let builder = Builder::new(TokioExecutor::new());
        let limit = Arc::new(Semaphore::new(max_connections));

        Box::pin(async move {
            let mut accept_shutdown = shutdown.clone();
            let mut connections = JoinSet::new();
            let mut backoff = AcceptBackoff::default();

            info!(
                listener = %name,
                address = %listener.local_addr(),
                max_connections,
                "HTTP server accepting connections"
            );

            loop {
                let permit = tokio::select! {
                    permit = Arc::clone(&limit).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = accept_shutdown.wait() => break,
                };

                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_shutdown.wait() => break,
                };
                let connection = match accepted {
                    Ok(connection) => {
                        backoff.reset();
                        connection
                    }
                    Err(e) => match recover_accept(&name, e, &mut backoff, &mut accept_shutdown).await? {
                        ControlFlow::Continue(()) => continue,
                        ControlFlow::Break(()) => break,
                    },
                };

                debug!(listener = %name, peer = %connection.peer(), "Connection accepted");
                let guard = tracker.track();
                let conn_shutdown = shutdown.clone();
                let builder = builder.clone();
                let service = service.clone();

                match connection {
                    Connection::Tcp(stream, _) => {
                        connections.spawn(
                            serve_connection(builder, service, stream, conn_shutdown, guard, permit)
                                .with_current_subscriber(),
                        );
                    }
                    #[cfg(unix)]
                    Connection::Unix(stream) => {
                        connections.spawn(
                            serve_connection(builder, service, stream, conn_shutdown, guard, permit)
                                .with_current_subscriber(),
                        );
                    }
                }

                // Reap finished connections so the set does not grow without bound.
                while connections.try_join_next().is_some() {}
            }

            drop(listener);
            info!(
                listener = %name,
                active_connections = tracker.active_count(),
                "HTTP server stopped accepting, draining connections"
            );
            while connections.join_next().await.is_some() {}
            info!(listener = %name, "HTTP server drained");

            Err(ServeError::Closed)
        })
    }
}

/// Delay between accepts while the process is out of descriptors or memory.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    /// 5ms, doubling up to 1s.
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .current
            .map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Decide whether the accept loop goes on after `error`.
///
/// `Break` means shutdown arrived while backing off.
async fn recover_accept(
    name: &str,
    error: ListenerError,
    backoff: &mut AcceptBackoff,
    shutdown: &mut ShutdownSignal,
) -> Result<ControlFlow<()>, ServeError> {
    match error.accept_failure() {
        AcceptFailure::Connection => {
            debug!(listener = %name, error = %error, "Connection failed during accept");
            Ok(ControlFlow::Continue(()))
        }
        AcceptFailure::Exhausted => {
            let delay = backoff.next_delay();
            error!(
                listener = %name,
                error = %error,
                retry_in_ms = delay.as_millis() as u64,
                "Accept failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(ControlFlow::Continue(())),
                _ = shutdown.wait() => Ok(ControlFlow::Break(())),
            }
        }
        AcceptFailure::Fatal => Err(ServeError::Accept(error)),
    }
}

async fn serve_connection<I>(
    builder: Builder<TokioExecutor>,
    service: TowerToHyperService<Router>,
    io: I,
    mut shutdown: ShutdownSignal,
    guard: ConnectionGuard,
    _permit: OwnedSemaphorePermit,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    // Poll the connection first so a request already buffered is in flight before
    // graceful shutdown can close the connection as idle.
    let result = tokio::select! {
        biased;
        result = conn.as_mut() => result,
        _ = shutdown.wait() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(connection_id = %guard.id(), error = %e, "Connection ended with error");
    }
}
