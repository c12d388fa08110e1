use crate::quantity::ComputeResources;
use crate::{JOB_ID_LABEL, JOB_SET_ANNOTATION, OWNER_ANNOTATION, POD_NUMBER_LABEL, QUEUE_ANNOTATION};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};

/// Container waiting reasons that mean the image cannot currently be fetched.
/// These resolve themselves once the registry recovers or the image is pushed,
/// which is why they count as recoverable when a pod is diagnosed as stuck.
const IMAGE_PULL_REASONS: [&str; 2] = ["ErrImagePull", "ImagePullBackOff"];

/// Container waiting reasons that no amount of waiting will fix. A pod stuck
/// with one of these is failed, full stop.
const INVALID_CONFIG_REASONS: [&str; 4] = [
    "InvalidImageName",
    "ErrImageNeverPull",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// PodExt is an extension trait used to answer common questions about pods.
///
/// The questions split into two families: identity (which job does this pod
/// belong to, which queue, which job set) and health (is it running, is it
/// stuck, why). Identity comes from the mandatory batch labels and the
/// annotations stamped on at submission; health comes from the status block
/// that the kubelet maintains.
pub trait PodExt {
    fn label(&self, key: &str) -> Option<&str>;
    fn annotation(&self, key: &str) -> Option<&str>;

    /// A pod is batch work if and only if it carries BOTH mandatory labels.
    fn is_batch(&self) -> bool;
    fn job_id(&self) -> Option<&str>;
    fn pod_number(&self) -> u32;
    fn queue(&self) -> Option<&str>;
    fn job_set(&self) -> Option<&str>;
    fn owner(&self) -> Option<&str>;
    fn uid(&self) -> Option<&str>;

    fn phase(&self) -> &str;
    fn is_pending(&self) -> bool;
    fn is_running(&self) -> bool;
    fn succeeded(&self) -> bool;
    fn failed(&self) -> bool;
    fn is_terminal(&self) -> bool;

    /// Wall clock time since the API server accepted this pod.
    fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration>;

    /// The instant of the most recent pod condition transition, falling back to
    /// the creation timestamp. "How long has this pod sat in its current state"
    /// is measured from here.
    fn last_transition(&self) -> Option<DateTime<Utc>>;

    /// The (reason, message) of the first container found waiting, if any.
    fn waiting_reason(&self) -> Option<(String, String)>;
    fn crash_looping(&self) -> bool;
    fn image_pull_backoff(&self) -> bool;
    fn invalid_config_reason(&self) -> Option<String>;

    /// The scheduler's explanation for why this pod cannot be placed, taken
    /// from the PodScheduled=False condition.
    fn unschedulable_message(&self) -> Option<String>;

    fn restarts(&self) -> i32;
    fn terminated_reason(&self) -> Option<String>;
    fn terminated_message(&self) -> Option<String>;

    /// The sum of resource requests across all containers of the pod.
    fn requests(&self) -> ComputeResources;
}

fn statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.as_slice())
        .unwrap_or(&[])
}

fn waiting_with_reason(pod: &Pod, reasons: &[&str]) -> Option<String> {
    statuses(pod)
        .iter()
        .filter_map(|status| status.state.as_ref())
        .filter_map(|state| state.waiting.as_ref())
        .find(|waiting| {
            waiting
                .reason
                .as_deref()
                .map(|reason| reasons.contains(&reason))
                .unwrap_or(false)
        })
        .map(|waiting| {
            format!(
                "{}: {}",
                waiting.reason.as_deref().unwrap_or(""),
                waiting.message.as_deref().unwrap_or("<no message given>")
            )
        })
}

impl PodExt for Pod {
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    fn is_batch(&self) -> bool {
        self.label(JOB_ID_LABEL).is_some() && self.label(POD_NUMBER_LABEL).is_some()
    }

    fn job_id(&self) -> Option<&str> {
        self.label(JOB_ID_LABEL)
    }

    fn pod_number(&self) -> u32 {
        self.label(POD_NUMBER_LABEL)
            .and_then(|number| number.parse().ok())
            .unwrap_or(0)
    }

    fn queue(&self) -> Option<&str> {
        self.annotation(QUEUE_ANNOTATION)
    }

    fn job_set(&self) -> Option<&str> {
        self.annotation(JOB_SET_ANNOTATION)
    }

    fn owner(&self) -> Option<&str> {
        self.annotation(OWNER_ANNOTATION)
    }

    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("")
    }

    fn is_pending(&self) -> bool {
        self.phase() == "Pending" || self.phase().is_empty() || self.phase() == "Unknown"
    }

    fn is_running(&self) -> bool {
        self.phase() == "Running"
    }

    fn succeeded(&self) -> bool {
        self.phase() == "Succeeded"
    }

    fn failed(&self) -> bool {
        self.phase() == "Failed"
    }

    fn is_terminal(&self) -> bool {
        self.succeeded() || self.failed()
    }

    fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let created = self.metadata.creation_timestamp.as_ref()?;
        Some(now - created.0)
    }

    fn last_transition(&self) -> Option<DateTime<Utc>> {
        let conditions = self
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref());
        let latest = conditions
            .into_iter()
            .flatten()
            .filter_map(|condition| condition.last_transition_time.as_ref())
            .map(|time| time.0)
            .max();
        latest.or_else(|| {
            self.metadata
                .creation_timestamp
                .as_ref()
                .map(|time| time.0)
        })
    }

    fn waiting_reason(&self) -> Option<(String, String)> {
        statuses(self)
            .iter()
            .filter_map(|status| status.state.as_ref())
            .filter_map(|state| state.waiting.as_ref())
            .find(|waiting| waiting.reason.is_some())
            .map(|waiting| {
                (
                    waiting.reason.clone().unwrap_or_default(),
                    waiting.message.clone().unwrap_or_default(),
                )
            })
    }

    fn crash_looping(&self) -> bool {
        waiting_with_reason(self, &["CrashLoopBackOff"]).is_some()
    }

    fn image_pull_backoff(&self) -> bool {
        waiting_with_reason(self, &IMAGE_PULL_REASONS).is_some()
    }

    fn invalid_config_reason(&self) -> Option<String> {
        waiting_with_reason(self, &INVALID_CONFIG_REASONS)
    }

    fn unschedulable_message(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .into_iter()
            .flatten()
            .find(|condition| {
                condition.type_ == "PodScheduled"
                    && condition.status == "False"
                    && condition.reason.as_deref() == Some("Unschedulable")
            })
            .map(|condition| {
                condition
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unschedulable".to_string())
            })
    }

    fn restarts(&self) -> i32 {
        statuses(self)
            .iter()
            .map(|status| status.restart_count)
            .max()
            .unwrap_or(0)
    }

    fn terminated_reason(&self) -> Option<String> {
        terminated_field(self, |terminated| terminated.reason.clone())
    }

    fn terminated_message(&self) -> Option<String> {
        terminated_field(self, |terminated| terminated.message.clone())
    }

    fn requests(&self) -> ComputeResources {
        let mut total = ComputeResources::new();
        let containers = self
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or(&[]);
        for container in containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref())
            {
                total.add_quantities(requests);
            }
        }
        total
    }
}

fn terminated_field<F>(pod: &Pod, extract: F) -> Option<String>
where
    F: Fn(&k8s_openapi::api::core::v1::ContainerStateTerminated) -> Option<String>,
{
    statuses(pod)
        .iter()
        .filter_map(|status| status.state.as_ref())
        .filter_map(|state| match state {
            ContainerState {
                terminated: Some(terminated),
                ..
            } => extract(terminated),
            _ => None,
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn batch_pods_need_both_labels() {
        let full = pod(serde_json::json!({
            "metadata": {
                "name": "q-01-0",
                "labels": { "job_id": "01", "pod_number": "0" }
            }
        }));
        assert!(full.is_batch());
        assert_eq!(Some("01"), full.job_id());
        assert_eq!(0, full.pod_number());

        let missing_number = pod(serde_json::json!({
            "metadata": { "name": "q-01-0", "labels": { "job_id": "01" } }
        }));
        assert!(!missing_number.is_batch());

        let unlabeled = pod(serde_json::json!({ "metadata": { "name": "someone-elses" } }));
        assert!(!unlabeled.is_batch());
    }

    #[test]
    fn request_totals_span_containers() {
        let p = pod(serde_json::json!({
            "metadata": { "name": "p" },
            "spec": {
                "containers": [
                    { "name": "a", "resources": { "requests": { "cpu": "500m", "memory": "1Gi" } } },
                    { "name": "b", "resources": { "requests": { "cpu": "1", "memory": "512Mi" } } }
                ]
            }
        }));
        let requests = p.requests();
        assert!((requests.get("cpu") - 1.5).abs() < 1e-9);
        assert!((requests.get("memory") - (1024.0 * 1024.0 * 1024.0 * 1.5)).abs() < 1.0);
    }

    #[test]
    fn stuck_cause_probing() {
        let pulling = pod(serde_json::json!({
            "metadata": { "name": "p" },
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "main",
                    "image": "missing:latest",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "waiting": { "reason": "ImagePullBackOff", "message": "Back-off pulling image" } }
                }]
            }
        }));
        assert!(pulling.image_pull_backoff());
        assert!(!pulling.crash_looping());
        assert!(pulling.invalid_config_reason().is_none());

        let invalid = pod(serde_json::json!({
            "metadata": { "name": "p" },
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "main",
                    "image": ":::",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "waiting": { "reason": "InvalidImageName", "message": "couldn't parse image reference" } }
                }]
            }
        }));
        assert!(invalid.invalid_config_reason().is_some());
    }

    #[test]
    fn unschedulable_surfaces_the_scheduler_message() {
        let p = pod(serde_json::json!({
            "metadata": { "name": "p" },
            "status": {
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable",
                    "message": "0/3 nodes are available: insufficient cpu"
                }]
            }
        }));
        assert_eq!(
            Some("0/3 nodes are available: insufficient cpu".to_string()),
            p.unschedulable_message()
        );
    }
}
