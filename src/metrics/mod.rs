//! Prometheus metrics for the ondol crawler
//!
//! This is the observability surface the scheduler and sweeps report into:
//! request outcomes per host, block detections by kind, permanently failed
//! tasks, sweep summaries and reconciliation throughput.
//!
//! Call `init_metrics()` once at application startup. If initialization
//! fails, metric operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, Encoder,
    GaugeVec, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all crawler metrics
struct EngineMetrics {
    requests: CounterVec,
    blocks: CounterVec,
    tasks_failed: CounterVec,
    tasks_retried: Counter,
    tasks_requeued: Counter,
    sweeps: CounterVec,
    reconciled_dates: Counter,
    delay_multiplier: GaugeVec,
}

/// Global storage for engine metrics
static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Initialize all Prometheus metrics
///
/// # Returns
///
/// `Ok(())` if all metrics were registered successfully,
/// `Err` with description if any registration failed.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = EngineMetrics {
        requests: register_counter_vec!(
            "ondol_requests_total",
            "Total fetch requests by host and outcome",
            &["host", "outcome"]
        )?,
        blocks: register_counter_vec!(
            "ondol_blocks_total",
            "Total block responses detected, by kind",
            &["kind"]
        )?,
        tasks_failed: register_counter_vec!(
            "ondol_tasks_failed_total",
            "Fetch tasks permanently failed after exhausting retries, by kind",
            &["kind"]
        )?,
        tasks_retried: register_counter!(
            "ondol_tasks_retried_total",
            "Fetch task retry attempts"
        )?,
        tasks_requeued: register_counter!(
            "ondol_tasks_requeued_total",
            "Fetch tasks requeued after a governor refusal or host cooldown"
        )?,
        sweeps: register_counter_vec!(
            "ondol_sweeps_total",
            "Completed sweep runs by kind and status",
            &["kind", "status"]
        )?,
        reconciled_dates: register_counter!(
            "ondol_reconciled_dates_total",
            "Calendar dates classified by the reconciliation engine"
        )?,
        delay_multiplier: register_gauge_vec!(
            "ondol_delay_multiplier",
            "Current adaptive delay multiplier per host",
            &["host"]
        )?,
    };

    ENGINE_METRICS
        .set(metrics)
        .map_err(|_| "metrics already initialized")?;

    Ok(())
}

/// Record a fetch request outcome ("success", "soft_block", "hard_error", "rejected")
pub fn record_request(host: &str, outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.requests.with_label_values(&[host, outcome]).inc();
    }
}

/// Record a detected block response
pub fn record_block(kind: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.blocks.with_label_values(&[kind]).inc();
    }
}

/// Record a permanently failed task
pub fn record_task_failed(kind: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.tasks_failed.with_label_values(&[kind]).inc();
    }
}

/// Record a task retry attempt
pub fn record_task_retried() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.tasks_retried.inc();
    }
}

/// Record a task requeue (governor refusal / host cooldown)
pub fn record_task_requeued() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.tasks_requeued.inc();
    }
}

/// Record a completed sweep run
pub fn record_sweep(kind: &str, status: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.sweeps.with_label_values(&[kind, status]).inc();
    }
}

/// Record classified dates
pub fn record_reconciled_dates(count: u64) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.reconciled_dates.inc_by(count as f64);
    }
}

/// Publish the current adaptive delay multiplier for a host
pub fn set_delay_multiplier(host: &str, multiplier: f64) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.delay_multiplier.with_label_values(&[host]).set(multiplier);
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
