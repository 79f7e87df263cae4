//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, monitor interval >= 1s)
//! - Check that addresses parse and do not collide
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PlatformConfig → Result<(), Vec<ValidationError>>

use tracing_subscriber::EnvFilter;

use super::schema::PlatformConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check every semantic rule, collecting all violations.
pub fn validate_config(config: &PlatformConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let server = match config.server.listen_address() {
        Ok(address) => Some(address),
        Err(e) => {
            errors.push(ValidationError::new("server", e.to_string()));
            None
        }
    };
    if config.server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be greater than 0"));
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::new("server.request_timeout_secs", "must be greater than 0"));
    }

    if config.shutdown.grace_period_secs == 0 {
        errors.push(ValidationError::new("shutdown.grace_period_secs", "must be greater than 0"));
    }
    if config.reload.ready_timeout_secs == 0 {
        errors.push(ValidationError::new("reload.ready_timeout_secs", "must be greater than 0"));
    }

    let instrumentation = &config.instrumentation;
    if instrumentation.enabled {
        match instrumentation.listen_address() {
            Ok(address) if server.as_ref() == Some(&address) => errors.push(ValidationError::new(
                "instrumentation.listen",
                format!("collides with the server listener {address}"),
            )),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::new("instrumentation", e.to_string())),
        }

        if instrumentation.runtime.enabled && instrumentation.runtime.interval_secs < 1 {
            errors.push(ValidationError::new(
                "instrumentation.runtime.interval_secs",
                "must be at least 1 second",
            ));
        }

        let namespace = &instrumentation.prometheus.namespace;
        if instrumentation.prometheus.enabled && !is_metric_namespace(namespace) {
            errors.push(ValidationError::new(
                "instrumentation.prometheus.namespace",
                format!("'{namespace}' is not a valid metric name prefix"),
            ));
        }
    }

    if let Err(e) = EnvFilter::try_new(&config.logs.level) {
        errors.push(ValidationError::new("logs.level", e.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_metric_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&PlatformConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = PlatformConfig::default();
        config.server.network = "udp".to_string();
        config.server.request_timeout_secs = 0;
        config.shutdown.grace_period_secs = 0;
        config.reload.ready_timeout_secs = 0;
        config.instrumentation.runtime.interval_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "server",
                "server.request_timeout_secs",
                "shutdown.grace_period_secs",
                "reload.ready_timeout_secs",
                "instrumentation.runtime.interval_secs",
            ]
        );
    }

    #[test]
    fn colliding_listeners_are_rejected() {
        let mut config = PlatformConfig::default();
        config.instrumentation.listen = config.server.address.clone();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "instrumentation.listen");
    }

    #[test]
    fn disabled_instrumentation_is_not_checked() {
        let mut config = PlatformConfig::default();
        config.instrumentation.enabled = false;
        config.instrumentation.network = "bogus".to_string();
        config.instrumentation.runtime.interval_secs = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn bad_namespace_and_level() {
        let mut config = PlatformConfig::default();
        config.instrumentation.prometheus.enabled = true;
        config.instrumentation.prometheus.namespace = "9lives".to_string();
        config.logs.level = "baton=loud".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["instrumentation.prometheus.namespace", "logs.level"]);
    }

    #[test]
    fn namespaces() {
        assert!(is_metric_namespace("baton"));
        assert!(is_metric_namespace("_svc_2"));
        assert!(!is_metric_namespace(""));
        assert!(!is_metric_namespace("my-app"));
    }
}
