use crate::cluster::ClusterContext;
use crate::events::{Event, JobEvent, ReasonedEvent};
use crate::metrics::STUCK_PODS;
use crate::reporter::EventReporter;
use crate::service::lease::LeaseService;
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use chrono::Utc;
use k8s::PodExt;
use k8s_openapi::api::core::v1::{Event as ClusterEvent, Pod};
use result::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::sync::Mutex;

/// What the monitor concluded about a stuck pod.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnosis {
    /// The pod would run if the world improved: the scheduler will place it
    /// once resources free up, the image will pull once the registry answers.
    /// The job goes back to the queue for another try somewhere else.
    Recoverable(String),
    /// No amount of waiting helps: the spec is invalid or the container has
    /// crash looped past the threshold. The job is failed.
    Unrecoverable(String),
}

/// The Pod Progress Monitor hunts for pods that stopped making progress:
/// non-terminal, not running, and sitting in that state beyond the stuck pod
/// expiry. Recoverable causes surface as `unable_to_schedule` with the lease
/// returned; unrecoverable causes surface as `failed` with diagnostics. Either
/// way the pod is staged for deletion so the cluster stops burning quota on it.
pub struct ProgressMonitor {
    cluster: Arc<ClusterContext>,
    leases: Arc<LeaseService>,
    reporter: EventReporter,
    cluster_id: String,
    stuck_pod_expiry: Duration,
    restart_threshold: i32,
    /// Pods already resolved this incarnation, so a slow informer does not
    /// cause double reporting. Entries leave when the pod leaves the store.
    handled: Mutex<HashSet<String>>,
}

impl ProgressMonitor {
    pub fn new(
        cluster: Arc<ClusterContext>,
        leases: Arc<LeaseService>,
        reporter: EventReporter,
        cluster_id: String,
        stuck_pod_expiry: Duration,
        restart_threshold: i32,
    ) -> ProgressMonitor {
        ProgressMonitor {
            cluster,
            leases,
            reporter,
            cluster_id,
            stuck_pod_expiry,
            restart_threshold,
            handled: Mutex::new(HashSet::new()),
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let expiry = chrono::Duration::from_std(self.stuck_pod_expiry)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let pods = self.cluster.active_batch_pods();

        {
            // Forget pods the informer no longer shows; their uids can never
            // come back.
            let current: HashSet<String> = pods
                .iter()
                .filter_map(|pod| pod.uid().map(str::to_string))
                .collect();
            self.handled.lock().await.retain(|uid| current.contains(uid));
        }

        for pod in pods {
            if pod.is_terminal() || pod.is_running() {
                continue;
            }
            let stuck_since = match pod.last_transition() {
                Some(transition) => transition,
                None => continue,
            };
            if now - stuck_since <= expiry {
                continue;
            }
            let uid = match pod.uid() {
                Some(uid) => uid.to_string(),
                None => continue,
            };
            if self.handled.lock().await.contains(&uid) {
                continue;
            }
            let diagnosis = diagnose(
                &pod,
                &self.cluster.pod_cluster_events(&pod),
                self.restart_threshold,
            );
            if self.resolve(&pod, diagnosis).await {
                self.handled.lock().await.insert(uid);
            }
        }
        Ok(())
    }

    /// Applies one diagnosis. Returns whether the pod is fully resolved; a
    /// failed lease return leaves it unresolved so the next sweep retries.
    async fn resolve(&self, pod: &Pod, diagnosis: Diagnosis) -> bool {
        let body = match JobEvent::for_pod(pod, &self.cluster_id) {
            Some(body) => body,
            None => return true,
        };
        let job_id = body.job_id.clone();
        match diagnosis {
            Diagnosis::Unrecoverable(reason) => {
                warn!(
                    "Pod {} of job {} is stuck beyond repair: {}",
                    cyan(pod.metadata.name.as_deref().unwrap_or("")),
                    cyan(&job_id),
                    reason
                );
                STUCK_PODS.with_label_values(&["failed"]).inc();
                self.reporter
                    .report(Event::Failed(ReasonedEvent { job: body, reason }));
            }
            Diagnosis::Recoverable(reason) => {
                info!(
                    "Pod {} of job {} cannot start here, returning the job: {}",
                    cyan(pod.metadata.name.as_deref().unwrap_or("")),
                    cyan(&job_id),
                    reason
                );
                STUCK_PODS.with_label_values(&["returned"]).inc();
                self.reporter.report(Event::UnableToSchedule(ReasonedEvent {
                    job: body,
                    reason: reason.clone(),
                }));
                if let Err(err) = self.leases.release(&job_id, &reason).await {
                    warn!(
                        "Could not return the lease of stuck job {} yet: {}",
                        cyan(&job_id),
                        err
                    );
                    return false;
                }
            }
        }
        self.cluster.delete_pods(vec![pod.clone()]).await;
        true
    }
}

/// Decides what a stuck pod's problem is, in order of certainty: a spec the
/// kubelet refuses outright, a crash loop past the threshold, the scheduler's
/// own explanation, a sulky registry, and finally whatever the newest cluster
/// event has to say.
pub fn diagnose(pod: &Pod, cluster_events: &[ClusterEvent], restart_threshold: i32) -> Diagnosis {
    if let Some(reason) = pod.invalid_config_reason() {
        return Diagnosis::Unrecoverable(reason);
    }
    if pod.crash_looping() && pod.restarts() >= restart_threshold {
        return Diagnosis::Unrecoverable(format!(
            "The container has crash looped {} times; refusing to wait for more",
            pod.restarts()
        ));
    }
    if let Some(message) = pod.unschedulable_message() {
        return Diagnosis::Recoverable(message);
    }
    if pod.image_pull_backoff() {
        let (reason, message) = pod.waiting_reason().unwrap_or_default();
        return Diagnosis::Recoverable(format!("{}: {}", reason, message));
    }
    let hint = cluster_events
        .iter()
        .max_by_key(|event| event.last_timestamp.as_ref().map(|time| time.0))
        .and_then(|event| event.message.clone())
        .unwrap_or_else(|| format!("The pod is stuck in the {} phase", pod.phase()));
    Diagnosis::Recoverable(hint)
}

#[async_trait]
impl PeriodicTask for ProgressMonitor {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuck_pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "q-j1-0",
                "uid": "uid-1",
                "labels": { "job_id": "j1", "pod_number": "0" },
                "annotations": { "queue": "gpu", "job_set_id": "set-1" }
            },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn invalid_specs_are_unrecoverable() {
        let pod = stuck_pod(serde_json::json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "main", "image": ":::", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": { "reason": "InvalidImageName", "message": "bad reference" } }
            }]
        }));
        assert!(matches!(
            diagnose(&pod, &[], 3),
            Diagnosis::Unrecoverable(_)
        ));
    }

    #[test]
    fn crash_loops_fail_only_past_the_threshold() {
        let looping = |restarts| {
            stuck_pod(serde_json::json!({
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "main", "image": "app:1", "imageID": "", "ready": false,
                    "restartCount": restarts,
                    "state": { "waiting": { "reason": "CrashLoopBackOff", "message": "back-off restarting" } }
                }]
            }))
        };
        assert!(matches!(
            diagnose(&looping(5), &[], 3),
            Diagnosis::Unrecoverable(_)
        ));
        // Below the threshold we keep waiting politely.
        assert!(matches!(
            diagnose(&looping(1), &[], 3),
            Diagnosis::Recoverable(_)
        ));
    }

    #[test]
    fn scheduler_complaints_are_recoverable() {
        let pod = stuck_pod(serde_json::json!({
            "phase": "Pending",
            "conditions": [{
                "type": "PodScheduled", "status": "False", "reason": "Unschedulable",
                "message": "0/3 nodes are available"
            }]
        }));
        assert_eq!(
            Diagnosis::Recoverable("0/3 nodes are available".to_string()),
            diagnose(&pod, &[], 3)
        );
    }

    #[test]
    fn image_pull_backoff_is_recoverable() {
        let pod = stuck_pod(serde_json::json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "main", "image": "app:missing", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": { "reason": "ImagePullBackOff", "message": "pull access denied" } }
            }]
        }));
        match diagnose(&pod, &[], 3) {
            Diagnosis::Recoverable(reason) => assert!(reason.contains("ImagePullBackOff")),
            other => panic!("unexpected diagnosis {:?}", other),
        }
    }

    #[test]
    fn unexplained_pods_borrow_the_newest_cluster_event() {
        let pod = stuck_pod(serde_json::json!({ "phase": "Unknown" }));
        let event: ClusterEvent = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "ev-1" },
            "involvedObject": { "uid": "uid-1" },
            "message": "node went away",
            "lastTimestamp": "2021-08-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            Diagnosis::Recoverable("node went away".to_string()),
            diagnose(&pod, &[event], 3)
        );
    }
}
