use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Metric name prefix for all buildgate metrics
const PREFIX: &str = "buildgate";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Change Hub Metrics
    pub static ref CHANGES_RECORDED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_changes_recorded_total"),
        "Total number of changes recorded by the change hub"
    ).expect("Failed to create changes_recorded_total metric");

    pub static ref CHANGES_PRUNED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_changes_pruned_total"),
        "Total number of changes pruned by the change horizon"
    ).expect("Failed to create changes_pruned_total metric");

    // Scheduler Metrics
    pub static ref CHANGES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_changes_received_total"), "Changes seen by a scheduler, by disposition"),
        &["scheduler", "disposition"]
    ).expect("Failed to create changes_received_total metric");

    pub static ref BUILDS_TRIGGERED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_builds_triggered_total"), "Build requests issued, by trigger path"),
        &["scheduler", "path"]
    ).expect("Failed to create builds_triggered_total metric");

    pub static ref BUILD_REQUEST_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_build_request_failures_total"), "Build requests rejected by the sink"),
        &["scheduler"]
    ).expect("Failed to create build_request_failures_total metric");

    pub static ref CHANGES_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_changes_dropped_total"), "Pending changes dropped because they no longer exist"),
        &["scheduler"]
    ).expect("Failed to create changes_dropped_total metric");

    pub static ref TIMERS_ARMED: IntGaugeVec = IntGaugeVec::new(
        Opts::new(format!("{PREFIX}_timers_armed"), "Whether a scheduler currently has an armed timer"),
        &["scheduler"]
    ).expect("Failed to create timers_armed metric");

    pub static ref SCHEDULERS_RUNNING: IntGauge = IntGauge::new(
        format!("{PREFIX}_schedulers_running"),
        "Number of running schedulers"
    ).expect("Failed to create schedulers_running metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(CHANGES_RECORDED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHANGES_PRUNED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHANGES_RECEIVED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BUILDS_TRIGGERED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BUILD_REQUEST_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHANGES_DROPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TIMERS_ARMED.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULERS_RUNNING.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_change_recorded() {
    CHANGES_RECORDED_TOTAL.inc();
}

pub fn record_changes_pruned(count: usize) {
    CHANGES_PRUNED_TOTAL.inc_by(count as u64);
}

/// Record what a scheduler did with an incoming change
pub fn record_change_disposition(scheduler: &str, disposition: &str) {
    CHANGES_RECEIVED_TOTAL
        .with_label_values(&[scheduler, disposition])
        .inc();
}

/// Record a build request; `path` is "immediate" or "timer"
pub fn record_build_triggered(scheduler: &str, path: &str) {
    BUILDS_TRIGGERED_TOTAL
        .with_label_values(&[scheduler, path])
        .inc();
}

pub fn record_build_request_failure(scheduler: &str) {
    BUILD_REQUEST_FAILURES_TOTAL
        .with_label_values(&[scheduler])
        .inc();
}

pub fn record_change_dropped(scheduler: &str) {
    CHANGES_DROPPED_TOTAL.with_label_values(&[scheduler]).inc();
}

pub fn set_timer_armed(scheduler: &str, armed: bool) {
    TIMERS_ARMED
        .with_label_values(&[scheduler])
        .set(armed as i64);
}

pub fn set_schedulers_running(count: usize) {
    SCHEDULERS_RUNNING.set(count as i64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
