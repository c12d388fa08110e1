pub mod deleted;
pub mod submitted;

use crate::metrics::POD_DELETIONS;
use crate::shutdown::Shutdown;
use backoff::backoff::Backoff;
use deleted::RecentlyDeleted;
use either::Either;
use futures_util::StreamExt;
use k8s::client::ClientProvider;
use k8s::watch::{reflector, watcher, Store, Writer};
use k8s::{PodApi, PodExt};
use k8s_openapi::api::core::v1::{Event as ClusterEvent, Node, Pod};
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use result::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use submitted::SubmittedPods;
use term_colors::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The Cluster Context owns the executor's entire view of, and write path to,
/// one Kubernetes cluster.
///
/// Reads come from informer-backed stores (pods, nodes, cluster events) plus
/// the transient submitted-pods cache that papers over informer lag. Writes
/// all go through the [PodApi] seam, with deletions flowing through a staging
/// set and the recently-deleted rate limiter rather than straight to the API
/// server.
pub struct ClusterContext {
    pod_api: Arc<dyn PodApi>,
    pod_store: Store<Pod>,
    node_store: Store<Node>,
    event_store: Store<ClusterEvent>,
    submitted: Arc<SubmittedPods>,
    recently_deleted: RecentlyDeleted,
    to_delete: Mutex<HashMap<String, Pod>>,
    stop_signal: Shutdown,
    informers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterContext {
    /// Starts the informers and returns the ready context. The context owns
    /// its own stop signal, separate from the task shutdown, because informers
    /// must outlive the tasks during a graceful wind down.
    pub async fn start(
        provider: &ClientProvider,
        pod_api: Arc<dyn PodApi>,
        minimum_repeat_delete_period: Duration,
    ) -> Arc<ClusterContext> {
        let stop_signal = Shutdown::new();
        let submitted = Arc::new(SubmittedPods::new());

        let pod_writer: Writer<Pod> = Writer::default();
        let pod_store = pod_writer.as_reader();
        let node_writer: Writer<Node> = Writer::default();
        let node_store = node_writer.as_reader();
        let event_writer: Writer<ClusterEvent> = Writer::default();
        let event_store = event_writer.as_reader();

        let mut informers = Vec::new();
        informers.push(spawn_pod_informer(
            provider.pods(),
            pod_writer,
            submitted.clone(),
            stop_signal.clone(),
        ));
        informers.push(spawn_informer(
            "node",
            provider.nodes(),
            node_writer,
            stop_signal.clone(),
        ));
        informers.push(spawn_informer(
            "cluster-event",
            provider.events(),
            event_writer,
            stop_signal.clone(),
        ));

        Arc::new(ClusterContext {
            pod_api,
            pod_store,
            node_store,
            event_store,
            submitted,
            recently_deleted: RecentlyDeleted::new(minimum_repeat_delete_period),
            to_delete: Mutex::new(HashMap::new()),
            stop_signal,
            informers: Mutex::new(informers),
        })
    }

    /// A context with hand-driven stores and no live informers, for exercising
    /// contracts against the recording fake.
    #[cfg(test)]
    pub(crate) fn for_testing(
        pod_api: Arc<dyn PodApi>,
        minimum_repeat_delete_period: Duration,
    ) -> (Arc<ClusterContext>, Writer<Pod>, Writer<Node>) {
        let pod_writer: Writer<Pod> = Writer::default();
        let node_writer: Writer<Node> = Writer::default();
        let event_writer: Writer<ClusterEvent> = Writer::default();
        let context = Arc::new(ClusterContext {
            pod_api,
            pod_store: pod_writer.as_reader(),
            node_store: node_writer.as_reader(),
            event_store: event_writer.as_reader(),
            submitted: Arc::new(SubmittedPods::new()),
            recently_deleted: RecentlyDeleted::new(minimum_repeat_delete_period),
            to_delete: Mutex::new(HashMap::new()),
            stop_signal: Shutdown::new(),
            informers: Mutex::new(Vec::new()),
        });
        (context, pod_writer, node_writer)
    }

    /// Submits one pod to the cluster, impersonating `owner` when configured.
    /// On success the created pod enters the submitted-pods cache so that read
    /// paths see it before the informer does; on failure nothing is cached and
    /// the error travels up untouched.
    pub async fn submit_pod(&self, pod: Pod, owner: Option<&str>) -> Result<Pod> {
        let created = self.pod_api.create(owner, &pod).await?;
        self.submitted.insert(created.clone()).await;
        debug!(
            "Submitted pod {} for job {}",
            cyan(created.name()),
            cyan(created.job_id().unwrap_or("<unlabeled>"))
        );
        Ok(created)
    }

    /// Merge-patches annotations onto a pod. Safe to repeat; a merge patch of
    /// values already present is a no-op on the server.
    pub async fn add_annotations(
        &self,
        pod: &Pod,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.pod_api.annotate(&pod.name(), annotations).await?;
        Ok(())
    }

    /// Stages pods for deletion. No RPC happens here; the deletion task picks
    /// the stage up on its next tick.
    pub async fn delete_pods(&self, pods: Vec<Pod>) {
        let mut staged = self.to_delete.lock().await;
        for pod in pods {
            staged.insert(pod.name(), pod);
        }
    }

    /// Issues the staged deletions, spaced by the minimum repeat period.
    ///
    /// An acknowledged delete (including NotFound, the object being gone
    /// already) is recorded so repeats within the period are suppressed. A
    /// FAILED delete is neither recorded nor forgotten: the pod goes back on
    /// the stage so the next tick tries again.
    pub async fn process_pods_to_delete(&self) {
        let staged: Vec<Pod> = {
            let mut staged = self.to_delete.lock().await;
            staged.drain().map(|(_, pod)| pod).collect()
        };
        for pod in staged {
            let name = pod.name();
            let uid = pod.uid().unwrap_or(&name).to_string();
            if self.recently_deleted.is_recent(&uid).await {
                trace!(
                    "Suppressed a repeat delete of {} inside the repeat period",
                    cyan(&name)
                );
                continue;
            }
            match self.pod_api.delete(&name).await {
                Ok(Either::Left(_)) => {
                    POD_DELETIONS.with_label_values(&["deleted"]).inc();
                    self.recently_deleted.record(&uid).await;
                    info!("Deleting pod {}", cyan(&name));
                }
                Ok(Either::Right(_)) => {
                    POD_DELETIONS.with_label_values(&["already_gone"]).inc();
                    self.recently_deleted.record(&uid).await;
                    debug!("Pod {} was already deleted", cyan(&name));
                }
                Err(err) => {
                    POD_DELETIONS.with_label_values(&["error"]).inc();
                    warn!("Failed to delete pod {}: {}", cyan(&name), err);
                    self.to_delete.lock().await.insert(name, pod);
                }
            }
        }
    }

    /// Every pod the executor knows of: the informer's view unioned with the
    /// transient submitted-pods, deduplicated by name with the informer
    /// winning.
    pub async fn all_pods(&self) -> Vec<Pod> {
        let mut by_name: HashMap<String, Pod> = self
            .pod_store
            .state()
            .into_iter()
            .map(|pod| (pod.name(), pod))
            .collect();
        for pod in self.submitted.snapshot().await {
            by_name.entry(pod.name()).or_insert(pod);
        }
        by_name.into_iter().map(|(_, pod)| pod).collect()
    }

    /// The batch subset of [all_pods](ClusterContext::all_pods): pods carrying
    /// both mandatory labels.
    pub async fn batch_pods(&self) -> Vec<Pod> {
        self.all_pods()
            .await
            .into_iter()
            .filter(|pod| pod.is_batch())
            .collect()
    }

    /// Batch pods drawn ONLY from the informer. No transient entries; this is
    /// the view for anything that needs pod status to be meaningful.
    pub fn active_batch_pods(&self) -> Vec<Pod> {
        self.pod_store
            .state()
            .into_iter()
            .filter(|pod| pod.is_batch())
            .collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.node_store.state()
    }

    /// The `kubectl describe` style cluster events attached to the given pod,
    /// used to enrich stuck-pod diagnostics.
    pub fn pod_cluster_events(&self, pod: &Pod) -> Vec<ClusterEvent> {
        let uid = match pod.uid() {
            Some(uid) => uid.to_string(),
            None => return Vec::new(),
        };
        self.event_store
            .state()
            .into_iter()
            .filter(|event| event.involved_object.uid.as_deref() == Some(uid.as_str()))
            .collect()
    }

    /// Periodic cache hygiene: transient pods the informer never observed are
    /// dropped (loudly), and delete suppressions old enough to be inert are
    /// forgotten.
    pub async fn prune_caches(&self, transient_deadline: Duration) {
        for pod in self.submitted.prune(transient_deadline).await {
            error!(
                "The informer NEVER observed pod {} for job {} within {:?} of submission. \
Dropping the transient entry; if the pod exists it will surface through the informer, \
and if it does not the lease will lapse.",
                cyan(pod.name()),
                cyan(pod.job_id().unwrap_or("<unlabeled>")),
                transient_deadline
            );
        }
        self.recently_deleted.prune().await;
    }

    /// Halts the informers. Submissions made after this will never be observed,
    /// so this is strictly the LAST step of shutdown before the process exits.
    pub async fn stop(&self) {
        self.stop_signal.cancel();
        let informers: Vec<JoinHandle<()>> = self.informers.lock().await.drain(..).collect();
        for informer in informers {
            let _ = informer.await;
        }
        debug!("The cluster context has stopped");
    }
}

/// Collapses the transient cache entry for whichever job a pod event concerns.
/// The informer is authoritative: the first time it shows us a pod, the
/// write-through copy is retired.
async fn reconcile_submitted(submitted: &SubmittedPods, event: &k8s::watch::Event<Pod>) {
    match event {
        k8s::watch::Event::Applied(pod) | k8s::watch::Event::Deleted(pod) => {
            if let Some(job_id) = pod.job_id() {
                submitted.evict(job_id).await;
            }
        }
        k8s::watch::Event::Restarted(pods) => {
            for pod in pods {
                if let Some(job_id) = pod.job_id() {
                    submitted.evict(job_id).await;
                }
            }
        }
    }
}

fn spawn_pod_informer(
    api: Api<Pod>,
    writer: Writer<Pod>,
    submitted: Arc<SubmittedPods>,
    stop: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = reflector(writer, watcher(api, ListParams::default()));
        futures_util::pin_mut!(stream);
        let mut backoff = k8s::watch::informer_backoff();
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    backoff.reset();
                    reconcile_submitted(&submitted, &event).await;
                }
                Some(Err(err)) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(300));
                    warn!(
                        "The pod informer hiccuped, retrying in {}: {}",
                        orange(format!("{:?}", delay)),
                        err
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    // Watchers re-list internally and should never end. If one
                    // does, the informer is beyond local repair.
                    error!("The pod informer stream ended permanently");
                    break;
                }
            }
        }
        debug!("The pod informer stopped");
    })
}

fn spawn_informer<K>(
    name: &'static str,
    api: Api<K>,
    writer: Writer<K>,
    stop: Shutdown,
) -> JoinHandle<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send,
{
    tokio::spawn(async move {
        let stream = reflector(writer, watcher(api, ListParams::default()));
        futures_util::pin_mut!(stream);
        let mut backoff = k8s::watch::informer_backoff();
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(_)) => backoff.reset(),
                Some(Err(err)) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(300));
                    warn!(
                        "The {} informer hiccuped, retrying in {}: {}",
                        name,
                        orange(format!("{:?}", delay)),
                        err
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    error!("The {} informer stream ended permanently", name);
                    break;
                }
            }
        }
        debug!("The {} informer stopped", name);
    })
}
