//! Structured logging.
//!
//! # Responsibilities
//! - Build the `tracing` dispatcher from configuration
//! - JSON format for production, pretty format for development
//!
//! # Design Decisions
//! - The dispatcher is returned, never installed globally: the binary passes it to
//!   `Application::run`, tests pass their own
//! - `RUST_LOG` wins over the configured level when set

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogConfig, LogFormat};

/// Error type for logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },
}

/// Build a dispatcher writing to stdout.
pub fn build_dispatch(config: &LogConfig) -> Result<Dispatch, LoggingError> {
    build_dispatch_with_writer(config, std::io::stdout)
}

/// Build a dispatcher writing to `writer`.
pub fn build_dispatch_with_writer<W>(config: &LogConfig, writer: W) -> Result<Dispatch, LoggingError>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => parse_filter(&directive)?,
        _ => parse_filter(&config.level)?,
    };

    let format: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_writer(writer).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(format).with(filter);
    Ok(Dispatch::new(subscriber))
}

fn parse_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|e| LoggingError::Filter {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn json_lines_carry_fields() {
        let captured = Captured::default();
        let writer = captured.clone();
        let config = LogConfig {
            level: "info".to_string(),
            format: LogFormat::Json,
        };
        let dispatch = build_dispatch_with_writer(&config, move || writer.clone()).unwrap();

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(actor = "signals", "Actor stopped");
        });

        let text = captured.text();
        let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["fields"]["message"], "Actor stopped");
        assert_eq!(line["fields"]["actor"], "signals");
        assert_eq!(line["level"], "INFO");
    }

    #[test]
    fn dispatch_is_not_global() {
        let captured = Captured::default();
        let writer = captured.clone();
        let _dispatch = build_dispatch_with_writer(&LogConfig::default(), move || writer.clone()).unwrap();

        tracing::info!("outside the dispatcher");
        assert!(captured.text().is_empty());
    }
}
