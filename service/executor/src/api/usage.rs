use super::ApiConnection;
use chrono::{DateTime, Utc};
use k8s::quantity::ComputeResources;
use result::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One group of nodes sharing the same values for the tracked node labels.
/// With no tracked labels configured the whole cluster is a single anonymous
/// group.
#[derive(Serialize, Debug, Clone)]
pub struct NodeGroupReport {
    pub labels: BTreeMap<String, String>,
    pub node_count: usize,
    pub schedulable_node_count: usize,
    pub allocatable: ComputeResources,
    pub available: ComputeResources,
}

/// Usage attributed to one queue: how many of its jobs are on the cluster and
/// how much they request. The sampled figure is real measured consumption and
/// is only present when metric sampling is enabled.
#[derive(Serialize, Debug, Clone)]
pub struct QueueUsageReport {
    pub name: String,
    pub job_count: usize,
    pub resources_requested: ComputeResources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_sampled: Option<ComputeResources>,
}

/// The full utilisation snapshot published on each tick of the cluster
/// utilisation service.
#[derive(Serialize, Debug, Clone)]
pub struct ClusterUsageReport {
    pub cluster_id: String,
    pub pool: String,
    pub reported_at: DateTime<Utc>,
    pub node_groups: Vec<NodeGroupReport>,
    pub queues: Vec<QueueUsageReport>,
}

/// The client of the central usage service.
pub struct UsageApi {
    connection: Arc<ApiConnection>,
}

impl UsageApi {
    pub fn new(connection: Arc<ApiConnection>) -> UsageApi {
        UsageApi { connection }
    }

    pub async fn report(&self, report: &ClusterUsageReport, deadline: Duration) -> Result<()> {
        self.connection.post("/v1/usage", report, deadline).await
    }
}
