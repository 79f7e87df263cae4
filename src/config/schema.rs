//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every section has defaults,
//! so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::{ListenAddress, ListenAddressError};

/// Root configuration of a baton process.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    /// Application listener.
    pub server: ServerConfig,

    /// Graceful shutdown of listener actors.
    pub shutdown: ShutdownConfig,

    /// Zero-downtime socket reloading.
    pub reload: ReloadConfig,

    /// Diagnostic, metrics and runtime monitoring endpoints.
    pub instrumentation: InstrumentationConfig,

    pub logs: LogConfig,
}

/// Application listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Network family: `tcp`, `tcp4`, `tcp6` or `unix`.
    pub network: String,

    /// Address within the network, e.g. `127.0.0.1:8080` or a socket path.
    pub address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Longest time a single request may take before it is answered with 408.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: "127.0.0.1:8080".to_string(),
            max_connections: 10_000,
            request_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn listen_address(&self) -> Result<ListenAddress, ListenAddressError> {
        ListenAddress::new(&self.network, self.address.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight requests get once shutdown starts.
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_period_secs: 60 }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    /// Hand listeners to a replacement process on SIGHUP.
    pub enabled: bool,

    /// Time a replacement process gets to report readiness.
    pub ready_timeout_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ready_timeout_secs: 60,
        }
    }
}

impl ReloadConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Instrumentation listener and what it serves.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InstrumentationConfig {
    pub enabled: bool,
    pub network: String,
    pub listen: String,
    pub diagnostic: DiagnosticConfig,
    pub prometheus: PrometheusConfig,
    pub runtime: RuntimeConfig,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network: "tcp".to_string(),
            listen: "127.0.0.1:5556".to_string(),
            diagnostic: DiagnosticConfig::default(),
            prometheus: PrometheusConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl InstrumentationConfig {
    pub fn listen_address(&self) -> Result<ListenAddress, ListenAddressError> {
        ListenAddress::new(&self.network, self.listen.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticConfig {
    /// Serve `/debug/status` and `/healthz`.
    pub enabled: bool,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    pub enabled: bool,

    /// Prefix of every metric name.
    pub namespace: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "baton".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub enabled: bool,

    /// Sampling interval, at least one second.
    pub interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl RuntimeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `baton=debug,info`.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
