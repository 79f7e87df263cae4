//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML), or defaults when none is given
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → PlatformConfig (validated, immutable)
//!     → lifecycle::startup::Application
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; picking up changes means a reload (SIGHUP), which
//!   starts a replacement process that reads the file again
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{
    InstrumentationConfig, LogConfig, LogFormat, PlatformConfig, ReloadConfig, ServerConfig, ShutdownConfig,
};
pub use validation::{validate_config, ValidationError};
