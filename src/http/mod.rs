//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Listener (TCP/Unix)
//!     → server.rs (accept loop, connection limit, hyper auto HTTP/1 + HTTP/2)
//!     → axum Router supplied by the application
//! ```

pub mod server;

pub use server::HttpServer;
