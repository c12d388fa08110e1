use crate::api::event::EventApi;
use crate::cluster::ClusterContext;
use crate::events::stream::EventStreamReader;
use crate::events::{event_for_pod, stage_of_pod, Event, Stage};
use crate::metrics::{EVENTS_REPORTED, EVENT_QUEUE_DEPTH, EVENT_SEND_FAILURES};
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use kind::Kind;
use result::Result;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The ceiling on one delivery batch. Bigger bursts simply take several trips.
const MAX_BATCH: usize = 500;

/// The deadline for one delivery attempt.
const FLUSH_DEADLINE: Duration = Duration::from_secs(30);

/// How many consecutive stream failures the reconciler tolerates per job set
/// before writing the pass off until next time.
const RECONCILE_STREAM_TOLERANCE: u32 = 3;

/// The EventReporter is the facade every service emits lifecycle events
/// through. Events enter an in-memory multi-producer queue; one flusher daemon
/// drains it, which is what guarantees per `(queue, job_set_id)` delivery in
/// submission order.
#[derive(Clone)]
pub struct EventReporter {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventReporter {
    /// Starts the flusher daemon. The returned handle joins once the daemon
    /// has flushed what it could after shutdown; hold it until the end.
    pub fn start(api: Arc<EventApi>, shutdown: Shutdown) -> (EventReporter, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let flusher = EventFlusher {
            api,
            receiver,
            shutdown,
            pending: VecDeque::new(),
            consecutive_failures: 0,
        };
        (EventReporter { sender }, tokio::spawn(flusher.run()))
    }

    /// Queues one event for delivery. Never blocks; the queue is unbounded and
    /// the cost of a deep queue is memory, not stalled control loops.
    pub fn report(&self, event: Event) {
        EVENTS_REPORTED
            .with_label_values(&[event.kind().as_str()])
            .inc();
        debug!(
            "Event {} for job {} in queue {}",
            cyan(event.kind()),
            cyan(event.job_id()),
            cyan(event.queue())
        );
        match self.sender.send(event) {
            Ok(()) => EVENT_QUEUE_DEPTH.inc(),
            // Only possible once the flusher has exited during shutdown.
            Err(err) => warn!("An event was dropped after reporter shutdown: {}", err),
        }
    }
}

struct EventFlusher {
    api: Arc<EventApi>,
    receiver: mpsc::UnboundedReceiver<Event>,
    shutdown: Shutdown,
    pending: VecDeque<Event>,
    consecutive_failures: u32,
}

impl EventFlusher {
    async fn run(mut self) {
        loop {
            if self.pending.is_empty() {
                let first = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    event = self.receiver.recv() => match event {
                        None => break,
                        Some(event) => event,
                    },
                };
                self.pending.push_back(first);
            }
            while self.pending.len() < MAX_BATCH {
                match self.receiver.try_recv() {
                    Ok(event) => self.pending.push_back(event),
                    Err(_) => break,
                }
            }
            if !self.deliver().await {
                let delay = crate::events::stream::backoff_delay(self.consecutive_failures);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        self.final_flush().await;
        debug!("The event flusher has stopped");
    }

    /// One delivery attempt of everything pending. Returns whether it landed.
    async fn deliver(&mut self) -> bool {
        let batch = coalesce(&self.pending);
        match self.api.report(&batch, FLUSH_DEADLINE).await {
            Ok(()) => {
                EVENT_QUEUE_DEPTH.sub(self.pending.len() as i64);
                self.pending.clear();
                self.consecutive_failures = 0;
                true
            }
            Err(err) => {
                self.consecutive_failures += 1;
                EVENT_SEND_FAILURES
                    .with_label_values(&[err.kind().as_str()])
                    .inc();
                warn!(
                    "Failed to deliver {} events ({} consecutive failures): {}",
                    self.pending.len(),
                    self.consecutive_failures,
                    err
                );
                false
            }
        }
    }

    /// The flush half of flush-then-stop: after shutdown, gather whatever is
    /// still queued and give it one last honest attempt.
    async fn final_flush(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.pending.push_back(event);
        }
        if self.pending.is_empty() {
            return;
        }
        let abandoned = self.pending.len();
        if !self.deliver().await {
            error!(
                "Abandoning {} undelivered events at shutdown. Reconciliation on the \
next start will re-derive what it can from the cluster.",
                abandoned
            );
        }
    }
}

/// Collapses duplicate `(job_id, variant)` pairs, keeping the FIRST
/// occurrence so that the earliest timestamp wins, while preserving overall
/// submission order.
fn coalesce(pending: &VecDeque<Event>) -> Vec<Event> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut batch = Vec::with_capacity(pending.len());
    for event in pending {
        if seen.insert((event.job_id().to_string(), event.kind())) {
            batch.push(event.clone());
        }
    }
    batch
}

/// The annotation stamped on a pod once its terminal event has been emitted,
/// so that reconciliation stops re-reading job sets for pods that are fully
/// told. Annotations survive executor restarts, which an in-memory mark would
/// not.
pub const REPORTED_DONE_ANNOTATION: &str = "reported_done";

/// The reconciler closes the gap between what the cluster says happened and
/// what the central event service has heard. Pods keep progressing while the
/// reporter is down, the process restarts, or batches get abandoned; on each
/// tick this walks the local pods, reads back the server's stream per job set,
/// and re-emits whatever the server is missing.
///
/// Emission respects the lifecycle order: the server's view may LAG ours, but
/// an event is only emitted when the server's highest stage for the job is
/// strictly behind the stage the pod is actually in, so nothing ever regresses.
pub struct EventReconciler {
    cluster: Arc<ClusterContext>,
    api: Arc<EventApi>,
    reporter: EventReporter,
    cluster_id: String,
}

impl EventReconciler {
    pub fn new(
        cluster: Arc<ClusterContext>,
        api: Arc<EventApi>,
        reporter: EventReporter,
        cluster_id: String,
    ) -> EventReconciler {
        EventReconciler {
            cluster,
            api,
            reporter,
            cluster_id,
        }
    }

    pub async fn reconcile(&self, shutdown: &Shutdown) -> Result<()> {
        // Only informer-backed pods: a transient pod has no status worth
        // reconciling yet. Pods already marked reported-done have nothing
        // left to say either.
        let pods: Vec<Pod> = self
            .cluster
            .active_batch_pods()
            .into_iter()
            .filter(|pod| pod.annotation(REPORTED_DONE_ANNOTATION).is_none())
            .collect();
        for ((queue, job_set_id), pods) in group_by_job_set(pods) {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let seen = self.server_view(&queue, &job_set_id, shutdown).await?;
            for (job_id, pod) in least_advanced_pod_per_job(&pods) {
                let local = stage_of_pod(pod);
                let server = seen.get(&job_id).copied();
                if server.map(|stage| stage >= local).unwrap_or(false) {
                    if local == Stage::Finished {
                        self.mark_reported_done(pod).await;
                    }
                    continue;
                }
                if let Some(event) = event_for_pod(pod, &self.cluster_id) {
                    info!(
                        "Reconciling job {}: the server last heard {:?}, the pod is {:?}",
                        cyan(&job_id),
                        server,
                        local
                    );
                    self.reporter.report(event);
                }
            }
        }
        Ok(())
    }

    /// Stamps a terminal pod once the server demonstrably has its final event,
    /// taking it out of every future reconciliation pass.
    async fn mark_reported_done(&self, pod: &Pod) {
        let mut annotations = BTreeMap::new();
        annotations.insert(REPORTED_DONE_ANNOTATION.to_string(), "true".to_string());
        if let Err(err) = self.cluster.add_annotations(pod, annotations).await {
            // The next pass simply re-reads the job set. Costly, not wrong.
            debug!(
                "Could not mark job {} as reported-done: {}",
                cyan(pod.job_id().unwrap_or("<unlabeled>")),
                err
            );
        }
    }

    /// Reads the server's stream for one job set (bounded mode) and reduces it
    /// to the highest lifecycle stage heard per job.
    async fn server_view(
        &self,
        queue: &str,
        job_set_id: &str,
        shutdown: &Shutdown,
    ) -> Result<HashMap<String, Stage>> {
        let mut seen: HashMap<String, Stage> = HashMap::new();
        let mut reader = EventStreamReader::new(
            self.api.clone(),
            queue,
            job_set_id,
            None,
            false,
            RECONCILE_STREAM_TOLERANCE,
        );
        reader
            .run(shutdown, |_id, event| {
                if let Some(stage) = event.stage() {
                    let entry = seen.entry(event.job_id().to_string()).or_insert(stage);
                    if stage > *entry {
                        *entry = stage;
                    }
                }
            })
            .await?;
        Ok(seen)
    }
}

#[async_trait]
impl PeriodicTask for EventReconciler {
    async fn tick(&self, shutdown: &Shutdown) -> Result<()> {
        self.reconcile(shutdown).await
    }
}

fn group_by_job_set(pods: Vec<Pod>) -> BTreeMap<(String, String), Vec<Pod>> {
    let mut groups: BTreeMap<(String, String), Vec<Pod>> = BTreeMap::new();
    for pod in pods {
        let key = (
            pod.queue().unwrap_or("").to_string(),
            pod.job_set().unwrap_or("").to_string(),
        );
        groups.entry(key).or_insert_with(Vec::new).push(pod);
    }
    groups
}

/// For multi-pod jobs the job is only as far along as its slowest pod; pick
/// that pod as the job's representative.
fn least_advanced_pod_per_job(pods: &[Pod]) -> Vec<(String, &Pod)> {
    let mut representative: BTreeMap<String, &Pod> = BTreeMap::new();
    for pod in pods {
        let job_id = match pod.job_id() {
            Some(job_id) => job_id.to_string(),
            None => continue,
        };
        match representative.get(&job_id) {
            Some(current) if stage_of_pod(current) <= stage_of_pod(pod) => {}
            _ => {
                representative.insert(job_id, pod);
            }
        }
    }
    representative.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEvent;
    use crate::testing::batch_pod;

    fn event(job_id: &str) -> Event {
        Event::Running(JobEvent::now(job_id, "set-1", "gpu", "cluster-1"))
    }

    #[test]
    fn coalescing_keeps_first_occurrence_and_order() {
        let mut pending = VecDeque::new();
        pending.push_back(event("j1"));
        pending.push_back(event("j2"));
        pending.push_back(event("j1")); // duplicate (job, variant)
        pending.push_back(Event::Succeeded(JobEvent::now("j1", "set-1", "gpu", "c")));
        let batch = coalesce(&pending);
        assert_eq!(3, batch.len());
        assert_eq!("j1", batch[0].job_id());
        assert_eq!("j2", batch[1].job_id());
        assert_eq!("Event::Succeeded", batch[2].kind());
    }

    #[test]
    fn events_carry_complete_routing() {
        let event = event("j1");
        assert!(!event.job_id().is_empty());
        assert!(!event.job_set_id().is_empty());
        assert!(!event.queue().is_empty());
    }

    #[test]
    fn representatives_are_the_least_advanced_pod() {
        let mut lagging = batch_pod("j1", "q-j1-1", "Pending");
        lagging
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("pod_number".to_string(), "1".to_string());
        let pods = vec![batch_pod("j1", "q-j1-0", "Running"), lagging];
        let representatives = least_advanced_pod_per_job(&pods);
        assert_eq!(1, representatives.len());
        assert_eq!(Stage::Pending, stage_of_pod(representatives[0].1));
    }

    #[test]
    fn job_sets_group_by_queue_and_set() {
        let groups = group_by_job_set(vec![
            batch_pod("j1", "q-j1-0", "Running"),
            batch_pod("j2", "q-j2-0", "Running"),
        ]);
        assert_eq!(1, groups.len());
        assert!(groups.contains_key(&("test-queue".to_string(), "test-set".to_string())));
    }
}
