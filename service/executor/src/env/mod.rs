//! Configuration of the executor. Everything is an environment variable read
//! through one doc-commented accessor apiece. Optional values carry defaults
//! that are sane for a small development cluster; mandatory values PANIC at
//! startup because running an executor without, say, a cluster identity is not
//! a degraded mode, it is a misconfiguration.

use k8s::quantity::{parse_resource_list, ComputeResources};
use std::env::VarError;
use std::time::Duration;

fn map_empty_to_error(value: String) -> Result<String, VarError> {
    if value.trim().is_empty() {
        Err(VarError::NotPresent)
    } else {
        Ok(value)
    }
}

fn seconds(variable: &str, default: u64) -> Duration {
    let value = match std::env::var(variable).and_then(map_empty_to_error) {
        Err(_) => default,
        Ok(value) => value.parse().unwrap_or_else(|_| {
            panic!(
                "The {} environment variable must be a whole number of seconds, got '{}'",
                variable, value
            )
        }),
    };
    Duration::from_secs(value)
}

fn csv(variable: &str) -> Vec<String> {
    std::env::var(variable)
        .unwrap_or_default()
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn flag(variable: &str) -> bool {
    matches!(
        std::env::var(variable)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// The opaque identity of the cluster this executor fronts, configured under
/// the `CLUSTER_ID` environment variable. This is the identity the central
/// server books leases against, so two executors sharing a CLUSTER_ID will
/// fight over the same leases.
///
/// There is NO default. If this function is called without the environment
/// variable being set then this function will PANIC!
pub fn cluster_id() -> String {
    std::env::var("CLUSTER_ID")
        .and_then(map_empty_to_error)
        .expect("The CLUSTER_ID environment variable is mandatory")
}

/// The logical pool tag reported with lease requests and usage, configured
/// under the `POOL` environment variable. Defaults to `default`.
pub fn pool() -> String {
    std::env::var("POOL").unwrap_or_else(|_| String::from("default"))
}

/// The namespace that all batch pods are created in and watched from,
/// configured under the `NAMESPACE` environment variable. Defaults to `batch`.
pub fn namespace() -> String {
    std::env::var("NAMESPACE").unwrap_or_else(|_| String::from("batch"))
}

/// Whether pod submission should impersonate the submitting user, configured
/// under the `IMPERSONATE_USERS` environment variable. When enabled, the API
/// server's own RBAC and quota enforcement applies to the user who submitted
/// the job rather than to the executor's service account. Defaults to false.
pub fn impersonate_users() -> bool {
    flag("IMPERSONATE_USERS")
}

/// The node label keys whose values are reported up in utilisation, configured
/// as a comma separated list under the `TRACKED_NODE_LABELS` environment
/// variable. Nodes are grouped by the values of these labels in every usage
/// report. Defaults to empty (all nodes form one group).
pub fn tracked_node_labels() -> Vec<String> {
    csv("TRACKED_NODE_LABELS")
}

/// The taint keys the executor considers tolerable when deciding which nodes
/// count toward spare capacity, configured as a comma separated list under
/// the `TOLERATED_TAINTS` environment variable. A node carrying any OTHER
/// taint is invisible to capacity math. Defaults to empty.
pub fn tolerated_taints() -> Vec<String> {
    csv("TOLERATED_TAINTS")
}

/// The minimum age a pod must reach before the lease service will finalize it,
/// configured in seconds under `MINIMUM_POD_AGE_SECONDS`. Defaults to 180.
pub fn minimum_pod_age() -> Duration {
    seconds("MINIMUM_POD_AGE_SECONDS", 180)
}

/// How long a pod may sit in a failure state before it is finalized and its
/// lease released, configured in seconds under `FAILED_POD_EXPIRY_SECONDS`.
/// Defaults to 600.
pub fn failed_pod_expiry() -> Duration {
    seconds("FAILED_POD_EXPIRY_SECONDS", 600)
}

/// How long a pod may sit in a non-terminal, non-running state before the
/// progress monitor declares it stuck, configured in seconds under
/// `STUCK_POD_EXPIRY_SECONDS`. Defaults to 600.
pub fn stuck_pod_expiry() -> Duration {
    seconds("STUCK_POD_EXPIRY_SECONDS", 600)
}

/// How many consecutive CrashLoopBackOff restarts a container is allowed
/// before a stuck pod is treated as failed rather than recoverable,
/// configured under `CRASH_LOOP_RESTART_THRESHOLD`. Defaults to 3.
pub fn crash_loop_restart_threshold() -> i32 {
    std::env::var("CRASH_LOOP_RESTART_THRESHOLD")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3)
}

/// The per-resource minimum job size attached to lease requests, configured
/// under `MINIMUM_JOB_SIZE` as a resource list such as `cpu=500m,memory=1Gi`.
/// The central server will not offer jobs smaller than this. Defaults to no
/// minimum.
///
/// A malformed value PANICS at startup; silently leasing jobs of any size on
/// a cluster that was explicitly configured otherwise is far worse than
/// refusing to boot.
pub fn minimum_job_size() -> ComputeResources {
    let text = std::env::var("MINIMUM_JOB_SIZE").unwrap_or_default();
    parse_resource_list(&text).unwrap_or_else(|err| {
        panic!("The MINIMUM_JOB_SIZE environment variable is malformed: {}", err)
    })
}

/// The minimum spacing between repeated delete calls for the same pod,
/// configured in seconds under `MINIMUM_REPEAT_DELETE_PERIOD_SECONDS`.
/// Defaults to 30.
pub fn minimum_repeat_delete_period() -> Duration {
    seconds("MINIMUM_REPEAT_DELETE_PERIOD_SECONDS", 30)
}

/// How long a submitted pod may remain unobserved by the informer before the
/// cache pruner drops it, configured in seconds under
/// `TRANSIENT_POD_DEADLINE_SECONDS`. Defaults to 900.
pub fn transient_pod_deadline() -> Duration {
    seconds("TRANSIENT_POD_DEADLINE_SECONDS", 900)
}

/// The interval of the lease allocation task, in seconds under
/// `ALLOCATION_INTERVAL_SECONDS`. Defaults to 10.
pub fn allocation_interval() -> Duration {
    seconds("ALLOCATION_INTERVAL_SECONDS", 10)
}

/// The interval of the lease renewal task, in seconds under
/// `LEASE_RENEWAL_INTERVAL_SECONDS`. Defaults to 15.
pub fn lease_renewal_interval() -> Duration {
    seconds("LEASE_RENEWAL_INTERVAL_SECONDS", 15)
}

/// The interval of the cluster utilisation reporting task, in seconds under
/// `UTILISATION_INTERVAL_SECONDS`. Defaults to 30.
pub fn utilisation_interval() -> Duration {
    seconds("UTILISATION_INTERVAL_SECONDS", 30)
}

/// The interval of the per-pod usage sampling task, in seconds under
/// `QUEUE_USAGE_INTERVAL_SECONDS`. Defaults to 60.
pub fn queue_usage_interval() -> Duration {
    seconds("QUEUE_USAGE_INTERVAL_SECONDS", 60)
}

/// The interval of the stuck pod monitoring task, in seconds under
/// `STUCK_POD_INTERVAL_SECONDS`. Defaults to 30.
pub fn stuck_pod_interval() -> Duration {
    seconds("STUCK_POD_INTERVAL_SECONDS", 30)
}

/// The interval of the staged pod deletion task, in seconds under
/// `POD_DELETION_INTERVAL_SECONDS`. Defaults to 5.
pub fn pod_deletion_interval() -> Duration {
    seconds("POD_DELETION_INTERVAL_SECONDS", 5)
}

/// The interval of the missed event reconciliation task, in seconds under
/// `EVENT_RECONCILIATION_INTERVAL_SECONDS`. Defaults to 120.
pub fn event_reconciliation_interval() -> Duration {
    seconds("EVENT_RECONCILIATION_INTERVAL_SECONDS", 120)
}

/// The interval of the cache pruning task, in seconds under
/// `CACHE_PRUNE_INTERVAL_SECONDS`. Defaults to 60.
pub fn cache_prune_interval() -> Duration {
    seconds("CACHE_PRUNE_INTERVAL_SECONDS", 60)
}

/// The port the prometheus metrics endpoint listens on, configured under
/// `METRIC_PORT`. Defaults to 9001.
pub fn metric_port() -> u16 {
    std::env::var("METRIC_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(9001)
}

/// Whether per-queue usage samples are exported as prometheus gauges and
/// reported as utilisation events, configured under
/// `EXPOSE_QUEUE_USAGE_METRICS`. Defaults to false.
pub fn expose_queue_usage_metrics() -> bool {
    flag("EXPOSE_QUEUE_USAGE_METRICS")
}

/// The base URL of the central batch services, configured under the
/// `API_ENDPOINT` environment variable. All three remote services (queue,
/// usage, event) are reached under this base.
///
/// There is NO default. If this function is called without the environment
/// variable being set then this function will PANIC!
pub fn api_endpoint() -> String {
    std::env::var("API_ENDPOINT")
        .and_then(map_empty_to_error)
        .expect("The API_ENDPOINT environment variable is mandatory")
}

/// The bearer token presented to the central batch services, configured under
/// the `API_TOKEN` environment variable. Defaults to none (anonymous).
pub fn api_token() -> Option<String> {
    std::env::var("API_TOKEN").and_then(map_empty_to_error).ok()
}

/// How long the executor waits for its periodic tasks to wind down on
/// shutdown before abandoning them, in seconds under
/// `SHUTDOWN_TIMEOUT_SECONDS`. Defaults to 20.
pub fn shutdown_timeout() -> Duration {
    seconds("SHUTDOWN_TIMEOUT_SECONDS", 20)
}
