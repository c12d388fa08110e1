#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate rocket;

pub mod api;
pub mod cluster;
pub mod env;
pub mod events;
pub mod job;
pub mod metrics;
pub mod reporter;
pub mod service;
pub mod shutdown;
pub mod taskmanager;
#[cfg(test)]
mod testing;

use crate::api::event::EventApi;
use crate::api::queue::QueueApi;
use crate::api::usage::UsageApi;
use crate::api::ApiConnection;
use crate::cluster::ClusterContext;
use crate::job::JobContext;
use crate::reporter::{EventReconciler, EventReporter};
use crate::service::allocation::AllocationService;
use crate::service::lease::LeaseService;
use crate::service::progress::ProgressMonitor;
use crate::service::queue_usage::QueueUsageService;
use crate::service::utilisation::UtilisationService;
use crate::service::{CachePruneTask, DeletionTask};
use crate::shutdown::Shutdown;
use crate::taskmanager::TaskManager;
use k8s::client::{ClientProvider, PodApi};
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;

/// How many renewal intervals the central server waits for our heartbeat
/// before expiring every lease we hold.
const HEARTBEAT_INTERVALS: u32 = 4;

#[get("/metrics")]
fn metrics_endpoint() -> String {
    metrics::gather()
}

#[get("/health")]
fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    // Sets the logger to use terminal colors.
    std::env::set_var("RUST_LOG_STYLE", "always");
    env_logger::init();

    let cluster_id = env::cluster_id();
    let namespace = env::namespace();

    // Startup failures are exit code territory. An executor that cannot see
    // its cluster or name its central server has nothing to gracefully do.
    let provider = match ClientProvider::connect(&namespace, env::impersonate_users()).await {
        Ok(provider) => Arc::new(provider),
        Err(err) => {
            error!("Could not connect to the Kubernetes cluster: {}", err);
            std::process::exit(1);
        }
    };
    let connection = match ApiConnection::connect(&env::api_endpoint(), env::api_token()) {
        Ok(connection) => Arc::new(connection),
        Err(err) => {
            error!("Could not configure the central API connection: {}", err);
            std::process::exit(1);
        }
    };

    let queue_api = Arc::new(QueueApi::new(
        connection.clone(),
        cluster_id.clone(),
        env::pool(),
        env::lease_renewal_interval() * HEARTBEAT_INTERVALS,
    ));
    let usage_api = Arc::new(UsageApi::new(connection.clone()));
    let event_api = Arc::new(EventApi::new(connection));

    let pod_api: Arc<dyn PodApi> = provider.clone();
    let context =
        ClusterContext::start(&provider, pod_api, env::minimum_repeat_delete_period()).await;

    let task_shutdown = Shutdown::new();
    let reporter_shutdown = Shutdown::new();
    let (event_reporter, flusher) = EventReporter::start(event_api.clone(), reporter_shutdown.clone());
    let jobs = Arc::new(JobContext::new(context.clone()));

    let allocation = Arc::new(AllocationService::new(
        context.clone(),
        jobs.clone(),
        queue_api.clone(),
        event_reporter.clone(),
        cluster_id.clone(),
        namespace,
        env::minimum_job_size(),
        env::tolerated_taints(),
        env::allocation_interval() / 2,
    ));
    let leases = Arc::new(LeaseService::new(
        context.clone(),
        jobs,
        queue_api,
        env::minimum_pod_age(),
        env::failed_pod_expiry(),
        env::lease_renewal_interval() / 2,
    ));
    let progress = Arc::new(ProgressMonitor::new(
        context.clone(),
        leases.clone(),
        event_reporter.clone(),
        cluster_id.clone(),
        env::stuck_pod_expiry(),
        env::crash_loop_restart_threshold(),
    ));
    let queue_usage = Arc::new(QueueUsageService::new(
        provider,
        context.clone(),
        event_reporter.clone(),
        cluster_id.clone(),
        env::expose_queue_usage_metrics(),
    ));
    let utilisation = Arc::new(UtilisationService::new(
        context.clone(),
        usage_api,
        queue_usage.clone(),
        cluster_id.clone(),
        env::pool(),
        env::tracked_node_labels(),
        env::tolerated_taints(),
        env::utilisation_interval() / 2,
    ));
    let reconciler = Arc::new(EventReconciler::new(
        context.clone(),
        event_api,
        event_reporter,
        cluster_id.clone(),
    ));

    let mut manager = TaskManager::new(task_shutdown);
    manager.register("allocate_leases", env::allocation_interval(), allocation);
    manager.register("renew_leases", env::lease_renewal_interval(), leases);
    manager.register(
        "report_utilisation",
        env::utilisation_interval(),
        utilisation,
    );
    manager.register(
        "sample_queue_usage",
        env::queue_usage_interval(),
        queue_usage,
    );
    manager.register("monitor_pod_progress", env::stuck_pod_interval(), progress);
    manager.register(
        "process_pod_deletions",
        env::pod_deletion_interval(),
        Arc::new(DeletionTask::new(context.clone())),
    );
    manager.register(
        "reconcile_events",
        env::event_reconciliation_interval(),
        reconciler,
    );
    manager.register(
        "prune_caches",
        env::cache_prune_interval(),
        Arc::new(CachePruneTask::new(
            context.clone(),
            env::transient_pod_deadline(),
        )),
    );

    let rocket_config = rocket::Config {
        // If you leave it to the default then it will choose 127.0.0.1 which
        // will not be reachable when running in a container. So please leave
        // this on 0.0.0.0.
        address: std::net::IpAddr::from([0, 0, 0, 0]),
        port: env::metric_port(),
        ..rocket::Config::default()
    };
    let metrics_server = tokio::spawn(
        rocket::custom(rocket_config)
            .mount("/", routes![metrics_endpoint, health])
            .launch(),
    );

    info!(
        "The executor for cluster {} is up, metrics on port {}",
        cyan(&cluster_id),
        env::metric_port()
    );
    wait_for_signal().await;
    info!("Shutdown requested. Winding down in dependency order.");

    // Stop producing work first...
    if !manager.stop_all(env::shutdown_timeout()).await {
        warn!("Some tasks were abandoned; continuing shutdown regardless");
    }
    // ...then flush the events that work produced...
    reporter_shutdown.cancel();
    let _ = flusher.await;
    // ...then stop reading from the cluster.
    context.stop().await;
    metrics_server.abort();
    info!("Goodbye");
    std::process::exit(0);
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("could not install the SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => debug!("Caught SIGINT"),
            _ = terminate.recv() => debug!("Caught SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Keep the executor's shutdown choreography honest: these sanity checks mirror
/// the wiring in main and fail loudly if someone reorders the construction DAG
/// in a way that cannot work.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_outlives_several_renewals() {
        assert!(HEARTBEAT_INTERVALS >= 2);
    }

    #[test]
    fn metric_gathering_is_always_available() {
        // Touching a collector forces its lazy registration; a duplicate
        // registration would panic right here.
        metrics::EVENT_QUEUE_DEPTH.set(0);
        let body = metrics::gather();
        assert!(body.contains("executor_event_queue_depth"));
    }
}
