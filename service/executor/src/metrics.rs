//! Prometheus instrumentation. Registration against the default registry is
//! process global state, which is exactly why every collector in the executor
//! lives here behind lazy statics and nowhere else.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Invocations of each periodic task, keyed by task name.
    pub static ref TASK_RUNS: IntCounterVec = register_int_counter_vec!(
        "executor_task_runs_total",
        "Invocations of each periodic task",
        &["task"]
    )
    .unwrap();

    /// Failed invocations of each periodic task, keyed by task name and the
    /// kind of the error the task returned.
    pub static ref TASK_ERRORS: IntCounterVec = register_int_counter_vec!(
        "executor_task_errors_total",
        "Failed invocations of each periodic task",
        &["task", "kind"]
    )
    .unwrap();

    /// Wall clock duration of each periodic task invocation.
    pub static ref TASK_DURATION: HistogramVec = register_histogram_vec!(
        "executor_task_duration_seconds",
        "Wall clock duration of each periodic task invocation",
        &["task"]
    )
    .unwrap();

    /// Lifecycle events handed to the reporter, keyed by event kind.
    pub static ref EVENTS_REPORTED: IntCounterVec = register_int_counter_vec!(
        "executor_events_reported_total",
        "Lifecycle events handed to the event reporter",
        &["kind"]
    )
    .unwrap();

    /// Batches the event flusher failed to deliver, keyed by error kind.
    pub static ref EVENT_SEND_FAILURES: IntCounterVec = register_int_counter_vec!(
        "executor_event_send_failures_total",
        "Event batches that failed to deliver to the central event service",
        &["kind"]
    )
    .unwrap();

    /// Events buffered in memory awaiting delivery.
    pub static ref EVENT_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "executor_event_queue_depth",
        "Events buffered in memory awaiting delivery"
    )
    .unwrap();

    /// Jobs leased from the central queue, keyed by queue name.
    pub static ref LEASED_JOBS: IntCounterVec = register_int_counter_vec!(
        "executor_leased_jobs_total",
        "Jobs leased from the central queue service",
        &["queue"]
    )
    .unwrap();

    /// Pod submissions the cluster rejected, keyed by queue name.
    pub static ref SUBMISSION_FAILURES: IntCounterVec = register_int_counter_vec!(
        "executor_submission_failures_total",
        "Pod submissions rejected by the cluster",
        &["queue"]
    )
    .unwrap();

    /// Delete calls actually issued to the cluster.
    pub static ref POD_DELETIONS: IntCounterVec = register_int_counter_vec!(
        "executor_pod_deletions_total",
        "Delete calls issued to the cluster",
        &["outcome"]
    )
    .unwrap();

    /// Stuck pods resolved by the progress monitor, keyed by resolution.
    pub static ref STUCK_PODS: IntCounterVec = register_int_counter_vec!(
        "executor_stuck_pods_total",
        "Stuck pods resolved by the progress monitor",
        &["resolution"]
    )
    .unwrap();

    /// Sampled per-queue resource usage. Only populated when queue usage
    /// metric exposure is enabled.
    pub static ref QUEUE_USAGE: GaugeVec = register_gauge_vec!(
        "executor_queue_usage",
        "Sampled per-queue resource usage in base units",
        &["queue", "resource"]
    )
    .unwrap();
}

/// Renders every registered collector in the prometheus text exposition
/// format. This is the body of the `/metrics` endpoint.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("Failed to encode prometheus metrics: {}", err);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
