//! baton demo server.
//!
//! Serves a small HTTP API on the configured listener, plus the instrumentation endpoints.
//! Send SIGHUP to hand the listeners to a freshly started copy of this binary without
//! dropping a connection; SIGINT/SIGTERM shut down gracefully.
//!
//! Exit status: 0 after a clean shutdown or handoff, 1 when an actor failed, 2 when the
//! configuration or the bootstrap failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info};

use baton::config::load_or_default;
use baton::observability::build_dispatch;
use baton::lifecycle::reloader_for;
use baton::Application;

/// Longest delay `/sleep/{ms}` honours.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "baton", version, about = "Supervised HTTP server with zero-downtime reloads")]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn demo_router(pid: u32) -> Router {
    Router::new()
        .route(
            "/",
            get(move || async move { Json(json!({ "service": "baton", "pid": pid })) }),
        )
        .route(
            "/sleep/{ms}",
            get(move |Path(ms): Path<u64>| async move {
                let delay = Duration::from_millis(ms).min(MAX_SLEEP);
                tokio::time::sleep(delay).await;
                Json::<Value>(json!({ "pid": pid, "slept_ms": delay.as_millis() as u64 }))
            }),
        )
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("baton: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.check {
        println!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let dispatch = match build_dispatch(&config.logs) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            eprintln!("baton: {e}");
            return ExitCode::from(2);
        }
    };

    // Inherited listeners are picked up from the environment before any runtime thread exists.
    let reloader = match tracing::dispatcher::with_default(&dispatch, || reloader_for(&config)) {
        Ok(reloader) => reloader,
        Err(e) => {
            eprintln!("baton: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("baton: failed to start the async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    let app = Application::new("baton", env!("CARGO_PKG_VERSION"), config)
        .with_revision(option_env!("BATON_REVISION").unwrap_or("unknown"))
        .with_reloader(reloader);

    let result = runtime.block_on(app.run(dispatch.clone(), |context| {
        let address = context.config().server.listen_address()?;
        let router = demo_router(context.process().pid);
        context.serve_http("http", &address, router)?;
        Ok(())
    }));

    tracing::dispatcher::with_default(&dispatch, || match result {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Application terminated with an error");
            ExitCode::from(e.exit_code() as u8)
        }
    })
}
