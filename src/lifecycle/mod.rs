//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Create reloader → Register instrumentation → Application actors
//!     → Signal, upgrade and readiness actors → RunGroup::run
//!
//! Run group (group.rs):
//!     First actor to return → interrupt every other actor once → wait for all
//!
//! Shutdown (shutdown.rs, listener.rs):
//!     Interrupt → stop accepting → drain connections → forced close after deadline
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → signal actor returns → group terminates
//!     SIGHUP → listener handoff (crate::reload)
//! ```
//!
//! # Design Decisions
//! - Every concurrent unit is an `Actor`: a run future and an interrupt
//! - The first completion, success or failure, stops the whole group
//! - Shutdown has timeout: forced close after deadline

pub mod actor;
pub mod group;
pub mod listener;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use actor::{Actor, ActorFuture, ActorPanicked, BoxError, FnActor, Termination};
pub use group::{RunError, RunGroup};
pub use listener::{ListenerActor, Serve, ServeError, ServeFuture};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::SignalActor;
pub use startup::{reloader_for, Application, ApplicationError, BootstrapError, Context};
