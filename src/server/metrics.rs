use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all registry metrics
const PREFIX: &str = "registry";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Execution Metrics
    pub static ref JOB_RUNS_STARTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_runs_started_total"), "Job executions started"),
        &["job"]
    ).expect("Failed to create job_runs_started_total metric");

    pub static ref JOB_RUNS_SUCCEEDED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_runs_succeeded_total"), "Job executions that completed successfully"),
        &["job"]
    ).expect("Failed to create job_runs_succeeded_total metric");

    pub static ref JOB_RUNS_FAILED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_runs_failed_total"), "Job executions that failed, panicked or were cancelled"),
        &["job"]
    ).expect("Failed to create job_runs_failed_total metric");

    pub static ref JOB_RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_run_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0]),
        &["job"]
    ).expect("Failed to create job_run_duration_seconds metric");

    // Lease Metrics
    pub static ref LEASE_ACQUISITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_lease_acquisitions_total"), "Lease acquisition attempts by outcome"),
        &["lease", "outcome"]
    ).expect("Failed to create lease_acquisitions_total metric");
}

/// Initialize and register all metrics with the registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOB_RUNS_STARTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNS_SUCCEEDED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_ACQUISITIONS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record that a job execution began
pub fn record_job_started(job: &str) {
    JOB_RUNS_STARTED_TOTAL.with_label_values(&[job]).inc();
}

/// Record the outcome of a finished job execution
pub fn record_job_finished(job: &str, succeeded: bool, duration: Duration) {
    if succeeded {
        JOB_RUNS_SUCCEEDED_TOTAL.with_label_values(&[job]).inc();
    } else {
        JOB_RUNS_FAILED_TOTAL.with_label_values(&[job]).inc();
    }
    JOB_RUN_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

/// Record a lease acquisition attempt.
///
/// Outcomes: `acquired`, `contended`, `skipped`, `cancelled`, `error`.
pub fn record_lease_acquisition(lease: &str, outcome: &str) {
    LEASE_ACQUISITIONS_TOTAL
        .with_label_values(&[lease, outcome])
        .inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
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
