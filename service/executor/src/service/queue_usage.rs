use crate::cluster::ClusterContext;
use crate::events::{Event, JobEvent, UtilisationEvent};
use crate::metrics::QUEUE_USAGE;
use crate::reporter::EventReporter;
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use k8s::client::ClientProvider;
use k8s::errors::ApiError;
use k8s::quantity::ComputeResources;
use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use result::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use term_colors::*;
use tokio::sync::Mutex;

/// The wire shape of `metrics.k8s.io/v1beta1` pod metrics. kube has no typed
/// client for the metrics API group, so the executor fetches it raw and
/// deserializes just the slice it needs.
#[derive(Deserialize, Debug)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetrics>,
}

#[derive(Deserialize, Debug)]
struct PodMetrics {
    metadata: ObjectMeta,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Deserialize, Debug)]
struct ContainerMetrics {
    #[serde(default)]
    usage: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone)]
struct JobSample {
    queue: String,
    job_set_id: String,
    max: ComputeResources,
    last: ComputeResources,
}

/// The Queue Utilisation Service samples what batch pods ACTUALLY consume, as
/// opposed to what they requested, from the cluster's metrics source.
///
/// Samples feed three places: the per-job peak tracked here, the per-queue
/// figure folded into cluster usage reports, and, when metric exposure is
/// enabled, prometheus gauges plus `utilisation` events on the stream.
pub struct QueueUsageService {
    provider: Arc<ClientProvider>,
    cluster: Arc<ClusterContext>,
    reporter: EventReporter,
    cluster_id: String,
    expose: bool,
    samples: Mutex<HashMap<String, JobSample>>,
}

impl QueueUsageService {
    pub fn new(
        provider: Arc<ClientProvider>,
        cluster: Arc<ClusterContext>,
        reporter: EventReporter,
        cluster_id: String,
        expose: bool,
    ) -> QueueUsageService {
        QueueUsageService {
            provider,
            cluster,
            reporter,
            cluster_id,
            expose,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub async fn sample(&self) -> Result<()> {
        let metrics = match self.fetch_pod_metrics().await {
            Ok(metrics) => metrics,
            Err(err) if err.is_not_found() => {
                // No metrics source on this cluster. Requested-resource
                // accounting still works; sampling just has nothing to say.
                debug!("The cluster exposes no metrics.k8s.io source; skipping sampling");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let pods_by_name: HashMap<String, Pod> = self
            .cluster
            .active_batch_pods()
            .into_iter()
            .map(|pod| (pod.name(), pod))
            .collect();

        let mut samples = self.samples.lock().await;
        // Jobs whose pods are gone stop being tracked.
        samples.retain(|job_id, _| {
            pods_by_name
                .values()
                .any(|pod| pod.job_id() == Some(job_id.as_str()))
        });

        for item in metrics.items {
            let name = match item.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let pod = match pods_by_name.get(name) {
                Some(pod) => pod,
                // Metrics for pods that are not ours, or that we have not
                // observed yet.
                None => continue,
            };
            let job_id = match pod.job_id() {
                Some(job_id) => job_id.to_string(),
                None => continue,
            };
            let mut usage = ComputeResources::new();
            for container in &item.containers {
                usage.add_quantities(&container.usage);
            }
            let sample = samples.entry(job_id.clone()).or_insert_with(|| JobSample {
                queue: pod.queue().unwrap_or("").to_string(),
                job_set_id: pod.job_set().unwrap_or("").to_string(),
                max: ComputeResources::new(),
                last: ComputeResources::new(),
            });
            sample.max.max(&usage);
            sample.last = usage;
        }

        if self.expose {
            self.expose_samples(&samples);
        }
        Ok(())
    }

    /// The per-queue sum of the latest samples, consumed by the cluster
    /// utilisation service when it assembles usage reports.
    pub async fn sampled_by_queue(&self) -> HashMap<String, ComputeResources> {
        let samples = self.samples.lock().await;
        let mut by_queue: HashMap<String, ComputeResources> = HashMap::new();
        for sample in samples.values() {
            by_queue
                .entry(sample.queue.clone())
                .or_insert_with(ComputeResources::new)
                .add(&sample.last);
        }
        by_queue
    }

    /// Gauges and utilisation events, gated behind the exposure flag because
    /// both multiply cardinality by queue count.
    fn expose_samples(&self, samples: &HashMap<String, JobSample>) {
        let mut by_queue: HashMap<String, ComputeResources> = HashMap::new();
        for (job_id, sample) in samples {
            by_queue
                .entry(sample.queue.clone())
                .or_insert_with(ComputeResources::new)
                .add(&sample.last);
            self.reporter.report(Event::Utilisation(UtilisationEvent {
                job: JobEvent::now(job_id, &sample.job_set_id, &sample.queue, &self.cluster_id),
                max_usage: sample.max.clone(),
                last_usage: sample.last.clone(),
            }));
        }
        for (queue, usage) in by_queue {
            for (resource, value) in usage.iter() {
                QUEUE_USAGE
                    .with_label_values(&[queue.as_str(), resource.as_str()])
                    .set(*value);
            }
        }
    }

    async fn fetch_pod_metrics(&self) -> std::result::Result<PodMetricsList, ApiError> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods",
            self.provider.namespace()
        );
        let request = http::Request::get(path.as_str())
            .body(Vec::new())
            .expect("a static metrics path is always a valid request");
        trace!("Sampling pod metrics from {}", cyan(&path));
        self.provider
            .client()
            .request::<PodMetricsList>(request)
            .await
            .map_err(ApiError::from)
    }
}

#[async_trait]
impl PeriodicTask for QueueUsageService {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.sample().await
    }
}
