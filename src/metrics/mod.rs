//! Prometheus metrics registration and export.
//!
//! All metrics are optional: recording helpers are no-ops until
//! `init_metrics` has run, so library embedders and tests pay nothing.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::pool::PoolStats;

/// Global Prometheus registry for all promptgrid metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total subtasks finished, labeled by outcome and pool.
pub static SUBTASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total tasks finished, labeled by final status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Image generation latency in seconds, labeled by queue.
pub static GENERATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Current pool concurrency limit, labeled by pool.
pub static POOL_LIMIT: OnceLock<GaugeVec> = OnceLock::new();

/// Units submitted and unfinished, labeled by pool.
pub static POOL_RUNNING: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; a second call returns an error from the
/// duplicate registration.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let subtasks_total = CounterVec::new(
        Opts::new("promptgrid_subtasks_total", "Total subtasks finished"),
        &["status", "pool"],
    )?;
    let tasks_total = CounterVec::new(
        Opts::new("promptgrid_tasks_total", "Total tasks finished"),
        &["status"],
    )?;
    let generation_latency = HistogramVec::new(
        HistogramOpts::new(
            "promptgrid_generation_latency_seconds",
            "Latency of one image generation attempt",
        )
        .buckets(vec![1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["queue"],
    )?;
    let pool_limit = GaugeVec::new(
        Opts::new("promptgrid_pool_limit", "Current pool concurrency limit"),
        &["pool"],
    )?;
    let pool_running = GaugeVec::new(
        Opts::new("promptgrid_pool_running", "Units submitted and unfinished"),
        &["pool"],
    )?;

    registry.register(Box::new(subtasks_total.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(pool_limit.clone()))?;
    registry.register(Box::new(pool_running.clone()))?;

    let _ = SUBTASKS_TOTAL.set(subtasks_total);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = POOL_LIMIT.set(pool_limit);
    let _ = POOL_RUNNING.set(pool_running);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Records one finished subtask.
pub fn record_subtask(status: &str, pool: &str) {
    if let Some(counter) = SUBTASKS_TOTAL.get() {
        counter.with_label_values(&[status, pool]).inc();
    }
}

/// Records one finished task.
pub fn record_task(status: &str) {
    if let Some(counter) = TASKS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Records one generation attempt's latency.
pub fn record_generation_latency(queue: &str, seconds: f64) {
    if let Some(histogram) = GENERATION_LATENCY.get() {
        histogram.with_label_values(&[queue]).observe(seconds);
    }
}

/// Publishes a pool's current gauges.
pub fn observe_pool(stats: &PoolStats) {
    if let Some(gauge) = POOL_LIMIT.get() {
        gauge.with_label_values(&[&stats.name]).set(stats.limit as f64);
    }
    if let Some(gauge) = POOL_RUNNING.get() {
        gauge
            .with_label_values(&[&stats.name])
            .set(stats.running as f64);
    }
}

/// Exports all registered metrics in the Prometheus text format.
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let registry = match REGISTRY.get() {
        Some(registry) => registry,
        None => return Ok(String::new()),
    };

    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_init_is_noop() {
        // Must not panic regardless of whether init ran first.
        record_subtask("completed", "default");
        record_task("completed");
        record_generation_latency("prod", 1.5);
    }

    #[test]
    fn test_init_and_export() {
        // init may race with other tests in the same process; both the
        // first and subsequent calls must leave the statics usable.
        let _ = init_metrics();
        record_subtask("completed", "default");
        record_subtask("failed", "lumina");
        record_task("completed");
        record_generation_latency("prod", 2.0);

        let text = export_metrics().expect("export succeeds");
        assert!(text.contains("promptgrid_subtasks_total"));
        assert!(text.contains("promptgrid_tasks_total"));
    }
}
