//! Startup orchestration.
//!
//! # Responsibilities
//! - Create the socket reloader (adopting inherited listeners in a replacement process)
//! - Register instrumentation: diagnostic and metrics endpoints, runtime monitor
//! - Let the application register its own actors through a [`Context`]
//! - Register signal, upgrade and readiness actors last, then run the group
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and nothing is left running
//! - The logging dispatcher is an argument, never a process global
//! - The readiness actor is registered after every listener is bound, so a parent is only
//!   told to step down once this process can accept on every socket

use std::sync::Arc;

use axum::Router;
use tracing::instrument::WithSubscriber;
use tracing::{info, Dispatch};

use super::actor::{Actor, BoxError};
use super::group::{RunError, RunGroup};
use super::listener::{ListenerActor, Serve};
use super::signals::SignalActor;
use crate::config::PlatformConfig;
use crate::http::HttpServer;
use crate::net::{ListenAddress, ListenAddressError, Listener};
use crate::observability::{diagnostic_router, install_prometheus, metrics_router, MetricsError, ProcessInfo, RuntimeMonitor};
use crate::reload::{ReadyActor, ReloadError, Reloader, UpgradeActor};

/// Errors raised before the run group starts.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid listen address: {0}")]
    Address(#[from] ListenAddressError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The application's own registration failed.
    #[error("application setup failed: {0}")]
    Setup(BoxError),
}

/// Outcome of [`Application::run`].
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl ApplicationError {
    /// Process exit status: 1 for a failed actor, 2 for a failed bootstrap.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Run(_) => 1,
            Self::Bootstrap(_) => 2,
        }
    }
}

/// What the application's registration callback can reach.
pub struct Context<'a> {
    config: &'a PlatformConfig,
    reloader: &'a Arc<Reloader>,
    info: &'a Arc<ProcessInfo>,
    group: &'a mut RunGroup,
}

impl Context<'_> {
    pub fn config(&self) -> &PlatformConfig {
        self.config
    }

    pub fn reloader(&self) -> &Arc<Reloader> {
        self.reloader
    }

    pub fn process(&self) -> &ProcessInfo {
        self.info
    }

    /// Obtain a listener, inherited from the parent process when there is one.
    pub fn listen(&self, address: &ListenAddress) -> Result<Listener, ReloadError> {
        self.reloader.listen(address)
    }

    /// Register an actor.
    pub fn add<A: Actor>(&mut self, actor: A) -> &mut Self {
        self.group.add(actor);
        self
    }

    /// Serve `server` on `address` through a listener actor with the configured deadline.
    pub fn serve<S: Serve>(&mut self, name: &str, address: &ListenAddress, server: S) -> Result<(), ReloadError> {
        let listener = self.listen(address)?;
        let actor =
            ListenerActor::new(name, listener, server).with_shutdown_deadline(self.config.shutdown.grace_period());
        self.group.add(actor);
        Ok(())
    }

    /// Serve `router` over HTTP on `address`, limited to the configured connection count and
    /// request timeout.
    pub fn serve_http(&mut self, name: &str, address: &ListenAddress, router: Router) -> Result<(), ReloadError> {
        let server = HttpServer::new(name, router)
            .with_max_connections(self.config.server.max_connections)
            .with_request_timeout(self.config.server.request_timeout());
        self.serve(name, address, server)
    }

    /// Direct access to the run group, e.g. for [`RunGroup::add_fn`].
    pub fn group(&mut self) -> &mut RunGroup {
        self.group
    }
}

/// A process built on the run group and the socket reloader.
#[derive(Debug, Clone)]
pub struct Application {
    name: String,
    version: String,
    revision: String,
    config: PlatformConfig,
    reloader: Option<Arc<Reloader>>,
}

impl Application {
    pub fn new(name: impl Into<String>, version: impl Into<String>, config: PlatformConfig) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            revision: "unknown".to_string(),
            config,
            reloader: None,
        }
    }

    /// Source revision reported by `/debug/status`.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Use a reloader created by the caller instead of one built from `[reload]`.
    ///
    /// [`Reloader::new`] clears the inheritance variables from the process environment, which
    /// is only sound before the runtime spawns its worker threads. Binaries create it first
    /// and hand it over here.
    pub fn with_reloader(mut self, reloader: Reloader) -> Self {
        self.reloader = Some(Arc::new(reloader));
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Bootstrap, register the application's actors with `build`, and run until termination.
    ///
    /// Every log event of the bootstrap and of every actor goes to `dispatch`.
    ///
    /// # Errors
    ///
    /// [`ApplicationError::Bootstrap`] when setup fails before anything runs,
    /// [`ApplicationError::Run`] when an actor's error terminated the group.
    pub async fn run<F>(self, dispatch: Dispatch, build: F) -> Result<(), ApplicationError>
    where
        F: FnOnce(&mut Context<'_>) -> Result<(), BoxError>,
    {
        self.bootstrap(build).with_subscriber(dispatch).await
    }

    async fn bootstrap<F>(self, build: F) -> Result<(), ApplicationError>
    where
        F: FnOnce(&mut Context<'_>) -> Result<(), BoxError>,
    {
        let info = Arc::new(ProcessInfo::current(&self.name, &self.version, &self.revision));
        info!(
            app = %info.name,
            version = %info.version,
            revision = %info.revision,
            instance_id = %info.instance_id,
            pid = info.pid,
            "Starting application"
        );

        let reloader = match &self.reloader {
            Some(reloader) => Arc::clone(reloader),
            None => Arc::new(reloader_for(&self.config).map_err(BootstrapError::from)?),
        };

        let mut group = RunGroup::new();
        self.register_instrumentation(&mut group, &info, &reloader)?;

        {
            let mut context = Context {
                config: &self.config,
                reloader: &reloader,
                info: &info,
                group: &mut group,
            };
            build(&mut context).map_err(BootstrapError::Setup)?;
        }

        group.add(SignalActor::new());
        group.add(UpgradeActor::new(Arc::clone(&reloader)));
        group.add(ReadyActor::new(Arc::clone(&reloader)));

        info!(actors = ?group.names(), inherited = reloader.is_inherited(), "Application ready, running actors");
        group.run().await?;
        Ok(())
    }

    fn register_instrumentation(
        &self,
        group: &mut RunGroup,
        info: &Arc<ProcessInfo>,
        reloader: &Arc<Reloader>,
    ) -> Result<(), BootstrapError> {
        let instrumentation = &self.config.instrumentation;
        if !instrumentation.enabled {
            return Ok(());
        }

        let mut router = Router::new();
        if instrumentation.diagnostic.enabled {
            router = router.merge(diagnostic_router(Arc::clone(info), Arc::clone(reloader)));
        }
        if instrumentation.prometheus.enabled {
            let handle = install_prometheus(&instrumentation.prometheus.namespace)?;
            router = router.merge(metrics_router(handle));
        }

        let address = instrumentation.listen_address()?;
        let listener = reloader.listen(&address)?;
        info!(address = %address, local = %listener.local_addr(), "Instrumentation server listening");
        group.add(
            ListenerActor::new("instrumentation", listener, HttpServer::new("instrumentation", router))
                .with_shutdown_deadline(self.config.shutdown.grace_period()),
        );

        if instrumentation.runtime.enabled {
            group.add(RuntimeMonitor::new(instrumentation.runtime.interval(), info.started));
        }
        Ok(())
    }
}

/// The reloader `[reload]` asks for.
///
/// # Errors
///
/// Fails when this process was started as a replacement and the inherited state is unusable.
pub fn reloader_for(config: &PlatformConfig) -> Result<Reloader, ReloadError> {
    if config.reload.enabled {
        Reloader::new(config.reload.ready_timeout())
    } else {
        Ok(Reloader::disabled())
    }
}
