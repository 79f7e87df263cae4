//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Install the Prometheus recorder once per process
//! - Prefix every metric with the configured namespace
//! - Render the exposition text for `GET /metrics`
//!
//! # Metrics
//! - `<ns>_actors_running` (gauge): actors of the run group still running
//! - `<ns>_actor_exits_total` (counter): actor exits by `actor`, `outcome`
//! - `<ns>_connections_active` (gauge): served connections by `listener`
//! - `<ns>_reload_attempts_total` (counter): upgrades by `outcome`
//! - `<ns>_runtime_workers`, `<ns>_runtime_alive_tasks`, `<ns>_process_uptime_seconds`
//!   (gauges): runtime monitor samples
//!
//! Without an installed recorder every update is a no-op.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Error type for metrics setup.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Recorder wrapper that puts `<namespace>_` in front of every metric name.
#[derive(Debug)]
pub struct PrefixedRecorder<R> {
    namespace: String,
    inner: R,
}

impl<R> PrefixedRecorder<R> {
    pub fn new(namespace: impl Into<String>, inner: R) -> Self {
        Self {
            namespace: namespace.into(),
            inner,
        }
    }

    fn prefix_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    fn prefix_key(&self, key: &Key) -> Key {
        Key::from_parts(self.prefix_name(key.name()), key.labels())
    }
}

impl<R: Recorder> Recorder for PrefixedRecorder<R> {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        let name = KeyName::from(self.prefix_name(key.as_str()));
        self.inner.describe_counter(name, unit, description);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        let name = KeyName::from(self.prefix_name(key.as_str()));
        self.inner.describe_gauge(name, unit, description);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        let name = KeyName::from(self.prefix_name(key.as_str()));
        self.inner.describe_histogram(name, unit, description);
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        self.inner.register_counter(&self.prefix_key(key), metadata)
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        self.inner.register_gauge(&self.prefix_key(key), metadata)
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        self.inner.register_histogram(&self.prefix_key(key), metadata)
    }
}

/// Build a namespaced Prometheus recorder and its render handle without installing it.
pub fn prometheus_recorder(namespace: &str) -> (PrefixedRecorder<PrometheusRecorder>, PrometheusHandle) {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    (PrefixedRecorder::new(namespace, recorder), handle)
}

/// Install the Prometheus recorder as the process-wide recorder.
pub fn install_prometheus(namespace: &str) -> Result<PrometheusHandle, MetricsError> {
    let (recorder, handle) = prometheus_recorder(namespace);
    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    describe_metrics();
    tracing::info!(namespace, "Prometheus recorder installed");
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_gauge!("actors_running", "Actors of the run group still running");
    metrics::describe_counter!("actor_exits_total", "Actor exits by actor and outcome");
    metrics::describe_gauge!("connections_active", "Connections being served by listener");
    metrics::describe_counter!("reload_attempts_total", "Listener handoff attempts by outcome");
    metrics::describe_gauge!("runtime_workers", "Worker threads of the async runtime");
    metrics::describe_gauge!("runtime_alive_tasks", "Tasks alive in the async runtime");
    metrics::describe_gauge!(
        "process_uptime_seconds",
        Unit::Seconds,
        "Seconds since the process started"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed() {
        let (recorder, handle) = prometheus_recorder("baton");
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("reload_attempts_total", "outcome" => "success").increment(2);
            metrics::gauge!("actors_running").set(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("baton_reload_attempts_total{outcome=\"success\"} 2"));
        assert!(rendered.contains("baton_actors_running 3"));
    }

    #[test]
    fn empty_namespace_keeps_names() {
        let (recorder, handle) = prometheus_recorder("");
        metrics::with_local_recorder(&recorder, || {
            metrics::gauge!("runtime_workers").set(4.0);
        });
        assert!(handle.render().contains("\nruntime_workers 4"));
    }
}
