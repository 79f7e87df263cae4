//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenAddress (network + address, from config)
//!     → listener.rs BoundSocket (bound by the reloader, or inherited from a parent)
//!     → listener.rs Listener (async accept side)
//!     → connection.rs (per-connection tracking while served)
//! ```
//!
//! # Design Decisions
//! - The `(network, address)` pair is the socket's identity across process handoffs
//! - Unix domain sockets only exist on unix targets

pub mod addr;
pub mod connection;
pub mod listener;

pub use addr::{ListenAddress, ListenAddressError, Network};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{AcceptFailure, BoundSocket, Connection, Listener, ListenerError};
