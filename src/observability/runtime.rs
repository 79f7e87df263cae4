//! Periodic runtime sampling.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::lifecycle::actor::{Actor, ActorFuture, Termination};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};

/// Shortest accepted sampling interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// One sample of the runtime gauges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeSample {
    pub workers: usize,
    pub alive_tasks: usize,
    pub uptime: Duration,
}

impl RuntimeSample {
    /// Sample the current tokio runtime. Must be called inside it.
    pub fn collect(started: Instant) -> Self {
        let metrics = tokio::runtime::Handle::current().metrics();
        Self {
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
            uptime: started.elapsed(),
        }
    }

    fn record(&self) {
        metrics::gauge!("runtime_workers").set(self.workers as f64);
        metrics::gauge!("runtime_alive_tasks").set(self.alive_tasks as f64);
        metrics::gauge!("process_uptime_seconds").set(self.uptime.as_secs_f64());
    }
}

/// Actor recording runtime gauges at a fixed interval until interrupted.
#[derive(Debug)]
pub struct RuntimeMonitor {
    interval: Duration,
    started: Instant,
    cancel: Shutdown,
    signal: Option<ShutdownSignal>,
}

impl RuntimeMonitor {
    /// `interval` is raised to [`MIN_INTERVAL`] when shorter. `started` anchors the uptime gauge.
    pub fn new(interval: Duration, started: Instant) -> Self {
        let cancel = Shutdown::new();
        let signal = Some(cancel.subscribe());
        Self {
            interval: interval.max(MIN_INTERVAL),
            started,
            cancel,
            signal,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Actor for RuntimeMonitor {
    fn name(&self) -> &str {
        "runtime-monitor"
    }

    fn run(&mut self) -> ActorFuture {
        let mut cancelled = self.signal.take().unwrap_or_else(|| self.cancel.subscribe());
        let period = self.interval;
        let started = self.started;

        Box::pin(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = RuntimeSample::collect(started);
                        sample.record();
                        debug!(
                            workers = sample.workers,
                            alive_tasks = sample.alive_tasks,
                            uptime_secs = sample.uptime.as_secs(),
                            "Runtime sample"
                        );
                    }
                    _ = cancelled.wait() => return Ok(()),
                }
            }
        })
    }

    fn interrupt(&mut self, _cause: &Termination<'_>) {
        self.cancel.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::prometheus_recorder;

    #[test]
    fn interval_has_a_floor() {
        let monitor = RuntimeMonitor::new(Duration::from_millis(10), Instant::now());
        assert_eq!(monitor.interval(), MIN_INTERVAL);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sample_reports_workers() {
        let sample = RuntimeSample::collect(Instant::now());
        assert_eq!(sample.workers, 2);
        assert!(sample.alive_tasks <= 1);
    }

    #[tokio::test]
    async fn sample_lands_in_gauges() {
        let (recorder, handle) = prometheus_recorder("baton");
        let sample = RuntimeSample {
            workers: 3,
            alive_tasks: 7,
            uptime: Duration::from_secs(12),
        };
        metrics::with_local_recorder(&recorder, || sample.record());

        let rendered = handle.render();
        assert!(rendered.contains("baton_runtime_workers 3"));
        assert!(rendered.contains("baton_runtime_alive_tasks 7"));
        assert!(rendered.contains("baton_process_uptime_seconds 12"));
    }

    #[tokio::test]
    async fn stops_on_interrupt() {
        let mut monitor = RuntimeMonitor::new(Duration::from_secs(60), Instant::now());
        let running = tokio::spawn(monitor.run());
        monitor.interrupt(&Termination::new("other", None));
        let result = tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
