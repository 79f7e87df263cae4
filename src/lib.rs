//! baton: process lifecycle supervision with zero-downtime listener handoff.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────── RunGroup ─────────────────────────────┐
//!                    │                                                                    │
//!   SIGINT/SIGTERM ──┼─▶ SignalActor                                                      │
//!   SIGHUP ──────────┼─▶ UpgradeActor ──▶ Reloader::upgrade ──▶ replacement process       │
//!                    │                       │                      │ ready byte          │
//!                    │   ReadyActor ◀─ exit ─┘◀─────────────────────┘                     │
//!                    │                                                                    │
//!   clients ─────────┼─▶ ListenerActor(HttpServer) ◀── Listener ◀── Reloader::listen      │
//!   operators ───────┼─▶ ListenerActor(instrumentation: /debug/status /healthz /metrics)  │
//!                    │   RuntimeMonitor                                                   │
//!                    └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The first actor to return stops the group: every other actor is interrupted once and
//! the group waits for all of them.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod reload;

pub use config::PlatformConfig;
pub use http::HttpServer;
pub use lifecycle::{Actor, Application, ApplicationError, RunError, RunGroup, Shutdown};
pub use net::ListenAddress;
pub use reload::Reloader;
