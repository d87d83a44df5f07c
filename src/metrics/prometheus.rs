//! Prometheus metrics registration and export.
//!
//! Each pool owns its own [`Registry`], so several pools (or tests) can run
//! in one process without colliding on metric names.

use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

use crate::scheduler::{JobKind, JobStatus};

/// Metrics recorded by one worker pool.
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Registry,
    /// Finished attempts, labeled by kind and status.
    attempts_total: CounterVec,
    /// Attempt duration in seconds, labeled by kind.
    attempt_duration: HistogramVec,
    /// Retries scheduled after a failed attempt.
    retries_total: IntCounter,
    /// Jobs waiting in the queue.
    queue_depth: Gauge,
    /// Live workers.
    workers_total: Gauge,
    /// Workers currently running a job.
    workers_busy: Gauge,
}

impl PoolMetrics {
    /// Creates and registers every pool metric.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let attempts_total = CounterVec::new(
            Opts::new(
                "compute_forge_attempts_total",
                "Total number of finished job attempts",
            ),
            &["kind", "status"],
        )?;

        let attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "compute_forge_attempt_duration_seconds",
                "Job attempt duration in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["kind"],
        )?;

        let retries_total = IntCounter::new(
            "compute_forge_retries_total",
            "Total number of retries scheduled",
        )?;

        let queue_depth = Gauge::new("compute_forge_queue_depth", "Number of jobs in queue")?;

        let workers_total = Gauge::new("compute_forge_workers", "Number of live workers")?;

        let workers_busy = Gauge::new(
            "compute_forge_workers_busy",
            "Number of workers currently running a job",
        )?;

        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(attempt_duration.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(workers_total.clone()))?;
        registry.register(Box::new(workers_busy.clone()))?;

        Ok(Self {
            registry,
            attempts_total,
            attempt_duration,
            retries_total,
            queue_depth,
            workers_total,
            workers_busy,
        })
    }

    /// Records one finished attempt.
    pub fn record_attempt(&self, kind: JobKind, status: JobStatus, duration: Duration) {
        let kind = kind.to_string();
        let status = status.to_string();
        self.attempts_total
            .with_label_values(&[kind.as_str(), status.as_str()])
            .inc();
        self.attempt_duration
            .with_label_values(&[kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    /// Updates the pool gauges.
    pub fn set_pool_state(&self, queued: usize, workers: usize, busy: usize) {
        self.queue_depth.set(queued as f64);
        self.workers_total.set(workers as f64);
        self.workers_busy.set(busy as f64);
    }

    /// Export all registered metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer).unwrap_or_else(|e| format!("# Error converting metrics: {}\n", e))
    }
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_independently() {
        // Two registries in one process must not collide.
        let first = PoolMetrics::new().expect("metrics should register");
        let second = PoolMetrics::new().expect("metrics should register");
        first.record_retry();
        assert!(!second.export().contains("compute_forge_retries_total 1"));
    }

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = PoolMetrics::new().expect("metrics should register");
        metrics.record_attempt(
            JobKind::MonteCarlo,
            JobStatus::Completed,
            Duration::from_millis(20),
        );
        metrics.record_attempt(
            JobKind::MonteCarlo,
            JobStatus::Timeout,
            Duration::from_millis(10),
        );
        metrics.record_retry();
        metrics.set_pool_state(7, 4, 3);

        let text = metrics.export();
        assert!(text.contains("compute_forge_attempts_total"));
        assert!(text.contains("kind=\"monte_carlo\""));
        assert!(text.contains("status=\"timeout\""));
        assert!(text.contains("compute_forge_retries_total 1"));
        assert!(text.contains("compute_forge_queue_depth 7"));
        assert!(text.contains("compute_forge_workers 4"));
        assert!(text.contains("compute_forge_workers_busy 3"));
    }
}
