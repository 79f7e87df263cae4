//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events, through the Dispatch built by logging.rs
//!     → metrics (counters, gauges), through the recorder installed by metrics.rs
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → GET /metrics on the instrumentation listener (Prometheus scrape)
//!     → GET /debug/status, /healthz (diagnostic.rs)
//!     → runtime.rs samples the async runtime into gauges
//! ```
//!
//! # Design Decisions
//! - No global subscriber: the dispatcher is passed explicitly
//! - Metrics are cheap no-ops until a recorder is installed

pub mod diagnostic;
pub mod logging;
pub mod metrics;
pub mod runtime;

pub use diagnostic::{diagnostic_router, metrics_router, ProcessInfo, StatusReport};
pub use logging::{build_dispatch, build_dispatch_with_writer, LoggingError};
pub use metrics::{install_prometheus, MetricsError};
pub use runtime::RuntimeMonitor;
