/// Metrics and telemetry for the reputation ledger
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Ledger operations by flow and outcome
/// - Transaction durations
/// - Rank applied and grants dropped by the daily limit
/// - Notification delivery

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== Ledger Metrics ==========

    /// Ledger operations by flow (vote, accept, bonus, follow) and outcome
    pub static ref LEDGER_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_operations_total",
        "Total number of ledger operations",
        &["flow", "outcome"]
    )
    .expect("ledger_operations_total can be registered");

    /// Ledger transaction duration in seconds
    pub static ref LEDGER_TRANSACTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "ledger_transaction_duration_seconds",
        "Ledger transaction latencies in seconds",
        &["flow"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .expect("ledger_transaction_duration_seconds can be registered");

    /// Rank added to users, by sign
    pub static ref RANK_DELTA_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rank_delta_total",
        "Absolute rank applied to users",
        &["direction"]
    )
    .expect("rank_delta_total can be registered");

    /// Positive grants dropped because the user reached the daily limit
    pub static ref RANK_GRANTS_CAPPED_TOTAL: IntCounter = register_int_counter!(
        "rank_grants_capped_total",
        "Total number of grants dropped by the daily rank limit"
    )
    .expect("rank_grants_capped_total can be registered");

    // ========== Notification Metrics ==========

    /// Notifications by outcome (queued, dropped, delivered, failed)
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_notifications_total",
        "Total number of ledger notifications",
        &["outcome"]
    )
    .expect("ledger_notifications_total can be registered");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a finished ledger operation
pub fn record_ledger_operation(flow: &str, outcome: &str, duration: f64) {
    LEDGER_OPERATIONS_TOTAL
        .with_label_values(&[flow, outcome])
        .inc();
    LEDGER_TRANSACTION_DURATION_SECONDS
        .with_label_values(&[flow])
        .observe(duration);
}

/// Record an operation that needed no transaction (duplicate or validation failure)
pub fn record_ledger_skip(flow: &str, outcome: &str) {
    LEDGER_OPERATIONS_TOTAL
        .with_label_values(&[flow, outcome])
        .inc();
}

/// Record a rank delta applied to a user
pub fn record_rank_delta(delta: i64) {
    let direction = if delta >= 0 { "gain" } else { "loss" };
    RANK_DELTA_TOTAL
        .with_label_values(&[direction])
        .inc_by(delta.unsigned_abs());
}

/// Record a grant dropped by the daily limit
pub fn record_capped_grant() {
    RANK_GRANTS_CAPPED_TOTAL.inc();
}

/// Record a notification outcome
pub fn record_notification(outcome: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
}
