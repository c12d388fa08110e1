use crate::api::usage::{ClusterUsageReport, NodeGroupReport, QueueUsageReport, UsageApi};
use crate::cluster::ClusterContext;
use crate::service::queue_usage::QueueUsageService;
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use chrono::Utc;
use k8s::quantity::ComputeResources;
use k8s::PodExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use result::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Taint effects that exclude a node from capacity reporting unless tolerated.
const EXCLUDING_TAINT_EFFECTS: [&str; 2] = ["NoSchedule", "NoExecute"];

/// The Cluster Utilisation Service publishes the cluster's shape to the
/// central usage service: how much capacity the tracked nodes offer, how much
/// is spoken for, and which queues are spending it. The central scheduler
/// prices fair shares off these reports, so they go out every tick whether or
/// not anything changed.
pub struct UtilisationService {
    cluster: Arc<ClusterContext>,
    usage_api: Arc<UsageApi>,
    queue_usage: Arc<QueueUsageService>,
    cluster_id: String,
    pool: String,
    tracked_node_labels: Vec<String>,
    tolerated_taints: Vec<String>,
    deadline: Duration,
}

impl UtilisationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<ClusterContext>,
        usage_api: Arc<UsageApi>,
        queue_usage: Arc<QueueUsageService>,
        cluster_id: String,
        pool: String,
        tracked_node_labels: Vec<String>,
        tolerated_taints: Vec<String>,
        deadline: Duration,
    ) -> UtilisationService {
        UtilisationService {
            cluster,
            usage_api,
            queue_usage,
            cluster_id,
            pool,
            tracked_node_labels,
            tolerated_taints,
            deadline,
        }
    }

    pub async fn publish(&self) -> Result<()> {
        let nodes: Vec<Node> = self
            .cluster
            .nodes()
            .into_iter()
            .filter(|node| self.tolerable(node))
            .collect();
        let pods: Vec<Pod> = self
            .cluster
            .active_batch_pods()
            .into_iter()
            .filter(|pod| !pod.is_terminal())
            .collect();
        let sampled = self.queue_usage.sampled_by_queue().await;
        let report = ClusterUsageReport {
            cluster_id: self.cluster_id.clone(),
            pool: self.pool.clone(),
            reported_at: Utc::now(),
            node_groups: self.group_nodes(&nodes, &pods),
            queues: queue_reports(&pods, sampled),
        };
        self.usage_api.report(&report, self.deadline).await
    }

    /// Nodes bucketed by the values of the tracked labels. Available capacity
    /// is the group's allocatable minus the requests of the batch pods placed
    /// on the group's nodes.
    fn group_nodes(&self, nodes: &[Node], pods: &[Pod]) -> Vec<NodeGroupReport> {
        let mut groups: BTreeMap<Vec<String>, NodeGroupReport> = BTreeMap::new();
        let mut node_to_group: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes {
            let key: Vec<String> = self
                .tracked_node_labels
                .iter()
                .map(|label| {
                    node.metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(label))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            node_to_group.insert(node.name(), key.clone());
            let group = groups.entry(key.clone()).or_insert_with(|| NodeGroupReport {
                labels: self
                    .tracked_node_labels
                    .iter()
                    .cloned()
                    .zip(key.iter().cloned())
                    .collect(),
                node_count: 0,
                schedulable_node_count: 0,
                allocatable: ComputeResources::new(),
                available: ComputeResources::new(),
            });
            group.node_count += 1;
            let schedulable = node
                .spec
                .as_ref()
                .map(|spec| spec.unschedulable != Some(true))
                .unwrap_or(false);
            if schedulable {
                group.schedulable_node_count += 1;
            }
            if let Some(allocatable) = node
                .status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref())
            {
                group.allocatable.add_quantities(allocatable);
            }
        }
        for group in groups.values_mut() {
            group.available = group.allocatable.clone();
        }
        for pod in pods {
            let node_name = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref())
                .unwrap_or("");
            if let Some(key) = node_to_group.get(node_name) {
                if let Some(group) = groups.get_mut(key) {
                    group.available.sub(&pod.requests());
                }
            }
        }
        groups.into_iter().map(|(_, group)| group).collect()
    }

    fn tolerable(&self, node: &Node) -> bool {
        node.spec
            .as_ref()
            .and_then(|spec| spec.taints.as_ref())
            .map(|taints| {
                taints.iter().all(|taint| {
                    !EXCLUDING_TAINT_EFFECTS.contains(&taint.effect.as_str())
                        || self.tolerated_taints.contains(&taint.key)
                })
            })
            .unwrap_or(true)
    }
}

fn queue_reports(
    pods: &[Pod],
    sampled: HashMap<String, ComputeResources>,
) -> Vec<QueueUsageReport> {
    let mut queues: BTreeMap<String, (HashSet<String>, ComputeResources)> = BTreeMap::new();
    for pod in pods {
        let queue = pod.queue().unwrap_or("").to_string();
        let entry = queues
            .entry(queue)
            .or_insert_with(|| (HashSet::new(), ComputeResources::new()));
        if let Some(job_id) = pod.job_id() {
            entry.0.insert(job_id.to_string());
        }
        entry.1.add(&pod.requests());
    }
    queues
        .into_iter()
        .map(|(name, (jobs, requested))| {
            let resources_sampled = sampled.get(&name).cloned();
            QueueUsageReport {
                name,
                job_count: jobs.len(),
                resources_requested: requested,
                resources_sampled,
            }
        })
        .collect()
}

#[async_trait]
impl PeriodicTask for UtilisationService {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.publish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::batch_pod;

    #[test]
    fn queues_aggregate_jobs_not_pods() {
        let mut second = batch_pod("j1", "q-j1-1", "Running");
        second
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("pod_number".to_string(), "1".to_string());
        let pods = vec![
            batch_pod("j1", "q-j1-0", "Running"),
            second,
            batch_pod("j2", "q-j2-0", "Pending"),
        ];
        let reports = queue_reports(&pods, HashMap::new());
        assert_eq!(1, reports.len());
        assert_eq!("test-queue", reports[0].name);
        // Two jobs, three pods.
        assert_eq!(2, reports[0].job_count);
        assert!(reports[0].resources_sampled.is_none());
    }

    #[test]
    fn sampled_usage_rides_along_when_present() {
        let pods = vec![batch_pod("j1", "q-j1-0", "Running")];
        let mut sampled = HashMap::new();
        let mut usage = ComputeResources::new();
        usage.insert("cpu", 0.25);
        sampled.insert("test-queue".to_string(), usage);
        let reports = queue_reports(&pods, sampled);
        assert!((reports[0].resources_sampled.as_ref().unwrap().get("cpu") - 0.25).abs() < 1e-9);
    }
}
