use crate::api::queue::{JobLease, QueueApi};
use crate::cluster::ClusterContext;
use crate::events::{Event, JobEvent, ReasonedEvent};
use crate::job::JobContext;
use crate::metrics::{LEASED_JOBS, SUBMISSION_FAILURES};
use crate::reporter::EventReporter;
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use k8s::quantity::ComputeResources;
use k8s::{PodExt, JOB_ID_LABEL, JOB_SET_ANNOTATION, OWNER_ANNOTATION, POD_NUMBER_LABEL, QUEUE_ANNOTATION};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
use kube::api::ObjectMeta;
use result::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;

/// Taint effects that keep batch pods off a node. A node carrying one of these
/// with a key we do not tolerate contributes nothing to spare capacity.
const EXCLUDING_TAINT_EFFECTS: [&str; 2] = ["NoSchedule", "NoExecute"];

/// The Cluster Allocation Service turns spare capacity into work.
///
/// Each tick measures what the cluster could still absorb, asks the central
/// queue for leases sized to exactly that, and admits the returned jobs as pod
/// submissions. Success is announced with a `leased` event; an admission
/// failure is fatal for the job, announced with a `lease_returned` event
/// carrying the error text, and recorded in the Job Context so the lease
/// service returns the lease instead of renewing it.
pub struct AllocationService {
    cluster: Arc<ClusterContext>,
    jobs: Arc<JobContext>,
    queue_api: Arc<QueueApi>,
    reporter: EventReporter,
    cluster_id: String,
    namespace: String,
    minimum_job_size: ComputeResources,
    tolerated_taints: Vec<String>,
    deadline: Duration,
}

impl AllocationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<ClusterContext>,
        jobs: Arc<JobContext>,
        queue_api: Arc<QueueApi>,
        reporter: EventReporter,
        cluster_id: String,
        namespace: String,
        minimum_job_size: ComputeResources,
        tolerated_taints: Vec<String>,
        deadline: Duration,
    ) -> AllocationService {
        AllocationService {
            cluster,
            jobs,
            queue_api,
            reporter,
            cluster_id,
            namespace,
            minimum_job_size,
            tolerated_taints,
            deadline,
        }
    }

    pub async fn allocate(&self) -> Result<()> {
        let spare = self.spare_capacity().await;
        if spare.is_empty() || spare.any_non_positive() || !spare.covers(&self.minimum_job_size) {
            debug!(
                "No allocatable headroom this tick (spare: {}); not requesting leases",
                spare
            );
            return Ok(());
        }
        let leases = self
            .queue_api
            .request_leases(&spare, &self.minimum_job_size, self.deadline)
            .await?;
        if leases.is_empty() {
            return Ok(());
        }
        info!(
            "Leased {} jobs against spare capacity {}",
            leases.len(),
            orange(format!("{}", spare))
        );
        for lease in leases {
            self.admit(lease).await;
        }
        Ok(())
    }

    /// Submits one leased job's pods and reports the outcome. Never returns an
    /// error: one unacceptable job must not block its batchmates.
    async fn admit(&self, lease: JobLease) {
        let body = JobEvent::now(
            &lease.job_id,
            &lease.job_set_id,
            &lease.queue,
            &self.cluster_id,
        );
        match self.submit_all(&lease).await {
            Ok(()) => {
                LEASED_JOBS.with_label_values(&[lease.queue.as_str()]).inc();
                self.reporter.report(Event::Leased(body));
            }
            Err(err) => {
                SUBMISSION_FAILURES
                    .with_label_values(&[lease.queue.as_str()])
                    .inc();
                let reason = format!("{}", err);
                warn!(
                    "The cluster rejected job {}: {}",
                    cyan(&lease.job_id),
                    reason
                );
                self.jobs
                    .record_submit_failure(&lease.job_id, reason.clone())
                    .await;
                self.reporter
                    .report(Event::LeaseReturned(ReasonedEvent { job: body, reason }));
            }
        }
    }

    async fn submit_all(&self, lease: &JobLease) -> Result<()> {
        for (number, spec) in lease.pod_specs.iter().enumerate() {
            let pod = self.pod_for(lease, number as u32, spec.clone());
            self.cluster.submit_pod(pod, lease.owner.as_deref()).await?;
        }
        Ok(())
    }

    /// Wraps one leased pod spec in executor metadata. The spec itself is the
    /// submitter's; only the name, labels, and annotations are ours.
    fn pod_for(&self, lease: &JobLease, number: u32, spec: PodSpec) -> Pod {
        let mut labels = lease.labels.clone();
        labels.insert(JOB_ID_LABEL.to_string(), lease.job_id.clone());
        labels.insert(POD_NUMBER_LABEL.to_string(), number.to_string());

        let mut annotations = lease.annotations.clone();
        annotations.insert(QUEUE_ANNOTATION.to_string(), lease.queue.clone());
        annotations.insert(JOB_SET_ANNOTATION.to_string(), lease.job_set_id.clone());
        if let Some(owner) = &lease.owner {
            annotations.insert(OWNER_ANNOTATION.to_string(), owner.clone());
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(names::pod_name(&lease.queue, &lease.job_id, number)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    /// Spare capacity is what schedulable nodes offer minus what every
    /// non-terminal batch pod already claims. Transient submitted pods COUNT
    /// as claims here; a lease cycle racing the informer must not hand out the
    /// same cores twice.
    async fn spare_capacity(&self) -> ComputeResources {
        let mut spare = ComputeResources::new();
        for node in self.cluster.nodes() {
            if !self.schedulable(&node) {
                continue;
            }
            if let Some(allocatable) = node
                .status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref())
            {
                spare.add_quantities(allocatable);
            }
        }
        if spare.is_empty() {
            return spare;
        }
        for pod in self.cluster.batch_pods().await {
            if !pod.is_terminal() {
                spare.sub(&pod.requests());
            }
        }
        spare
    }

    fn schedulable(&self, node: &Node) -> bool {
        let spec = match node.spec.as_ref() {
            Some(spec) => spec,
            None => return false,
        };
        if spec.unschedulable == Some(true) {
            return false;
        }
        spec.taints
            .as_ref()
            .map(|taints| {
                taints.iter().all(|taint| {
                    !EXCLUDING_TAINT_EFFECTS.contains(&taint.effect.as_str())
                        || self.tolerated_taints.contains(&taint.key)
                })
            })
            .unwrap_or(true)
    }
}

#[async_trait]
impl PeriodicTask for AllocationService {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.allocate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiConnection;
    use crate::testing::{batch_pod, FakePodApi};
    use k8s::watch::Event as WatchEvent;

    fn service() -> (Arc<FakePodApi>, AllocationService, k8s::watch::Writer<Pod>, k8s::watch::Writer<Node>) {
        let api = Arc::new(FakePodApi::new());
        let (cluster, pod_writer, node_writer) =
            ClusterContext::for_testing(api.clone(), Duration::from_secs(30));
        let connection = Arc::new(ApiConnection::connect("http://localhost:1", None).unwrap());
        let queue_api = Arc::new(QueueApi::new(
            connection.clone(),
            "cluster-1".to_string(),
            "default".to_string(),
            Duration::from_secs(60),
        ));
        let (reporter, _flusher) = EventReporter::start(
            Arc::new(crate::api::event::EventApi::new(connection)),
            Shutdown::new(),
        );
        let jobs = Arc::new(JobContext::new(cluster.clone()));
        let service = AllocationService::new(
            cluster,
            jobs,
            queue_api,
            reporter,
            "cluster-1".to_string(),
            "batch".to_string(),
            ComputeResources::new(),
            vec!["dedicated".to_string()],
            Duration::from_secs(5),
        );
        (api, service, pod_writer, node_writer)
    }

    fn node(name: &str, cpu: &str, memory: &str, extra: serde_json::Value) -> Node {
        let mut value = serde_json::json!({
            "metadata": { "name": name },
            "spec": {},
            "status": { "allocatable": { "cpu": cpu, "memory": memory } }
        });
        value["spec"] = extra;
        serde_json::from_value(value).unwrap()
    }

    fn lease(job_id: &str, pods: usize) -> JobLease {
        JobLease {
            job_id: job_id.to_string(),
            queue: "gpu".to_string(),
            job_set_id: "set-1".to_string(),
            owner: Some("alice".to_string()),
            client_id: None,
            priority: 1.0,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            pod_specs: vec![PodSpec::default(); pods],
        }
    }

    #[test]
    fn spare_capacity_subtracts_live_batch_pods() {
        tokio_test::block_on(async {
            let (_api, service, mut pod_writer, mut node_writer) = service();
            node_writer.apply_watcher_event(&WatchEvent::Applied(node(
                "n1",
                "4",
                "8Gi",
                serde_json::json!({}),
            )));
            let mut running = batch_pod("j1", "q-j1-0", "Running");
            running.spec = Some(
                serde_json::from_value(serde_json::json!({
                    "containers": [{
                        "name": "main",
                        "resources": { "requests": { "cpu": "1500m", "memory": "2Gi" } }
                    }]
                }))
                .unwrap(),
            );
            pod_writer.apply_watcher_event(&WatchEvent::Applied(running));
            // Terminal pods release their claim.
            pod_writer.apply_watcher_event(&WatchEvent::Applied(batch_pod(
                "j2", "q-j2-0", "Succeeded",
            )));

            let spare = service.spare_capacity().await;
            assert!((spare.get("cpu") - 2.5).abs() < 1e-9);
        });
    }

    #[test]
    fn unschedulable_and_foreign_tainted_nodes_offer_nothing() {
        tokio_test::block_on(async {
            let (_api, service, _pods, mut node_writer) = service();
            node_writer.apply_watcher_event(&WatchEvent::Applied(node(
                "cordoned",
                "4",
                "8Gi",
                serde_json::json!({ "unschedulable": true }),
            )));
            node_writer.apply_watcher_event(&WatchEvent::Applied(node(
                "gpu-only",
                "4",
                "8Gi",
                serde_json::json!({ "taints": [{ "key": "nvidia.com/gpu", "effect": "NoSchedule" }] }),
            )));
            // Tolerated taints and non-excluding effects still count.
            node_writer.apply_watcher_event(&WatchEvent::Applied(node(
                "ours",
                "2",
                "4Gi",
                serde_json::json!({ "taints": [
                    { "key": "dedicated", "effect": "NoSchedule" },
                    { "key": "whatever", "effect": "PreferNoSchedule" }
                ] }),
            )));
            let spare = service.spare_capacity().await;
            assert!((spare.get("cpu") - 2.0).abs() < 1e-9);
        });
    }

    #[test]
    fn leased_pods_carry_identity_and_routing() {
        tokio_test::block_on(async {
            let (_api, service, _pods, _nodes) = service();
            let lease = lease("01arz3ndektsv4rrffq69g5fav", 2);
            let pod = service.pod_for(&lease, 1, PodSpec::default());
            assert_eq!(Some("01arz3ndektsv4rrffq69g5fav"), pod.job_id());
            assert_eq!(1, pod.pod_number());
            assert_eq!(Some("gpu"), pod.queue());
            assert_eq!(Some("set-1"), pod.job_set());
            assert_eq!(Some("alice"), pod.owner());
            assert_eq!(
                Some("batch".to_string()),
                pod.metadata.namespace
            );
            assert_eq!(
                "gpu-01arz3ndektsv4rrffq69g5fav-1",
                pod.metadata.name.as_deref().unwrap()
            );
        });
    }

    #[test]
    fn admission_failure_records_and_reports() {
        tokio_test::block_on(async {
            let (api, service, _pods, _nodes) = service();
            api.fail_creates("spec is nonsense").await;
            service.admit(lease("j1", 1)).await;
            let failures = service.jobs.take_submit_failures().await;
            assert_eq!(Some(&"spec is nonsense".to_string()), failures.get("j1"));
        });
    }

    #[test]
    fn successful_admission_submits_every_pod() {
        tokio_test::block_on(async {
            let (api, service, _pods, _nodes) = service();
            service.admit(lease("j1", 2)).await;
            assert_eq!(2, api.taken().await.len());
            assert!(service.jobs.take_submit_failures().await.is_empty());
        });
    }
}
