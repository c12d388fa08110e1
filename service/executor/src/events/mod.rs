pub mod stream;

use chrono::{DateTime, Utc};
use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use k8s::quantity::ComputeResources;
use kind::Kind;
use serde::{Deserialize, Serialize};

/// The fields that EVERY lifecycle event carries. Invariantly, all four are
/// non-empty: an event that cannot name its job, job set, and queue cannot be
/// routed to any subscriber and the central service would only drop it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub job_set_id: String,
    pub queue: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl JobEvent {
    pub fn now<J, S, Q>(job_id: J, job_set_id: S, queue: Q, cluster_id: &str) -> JobEvent
    where
        J: AsRef<str>,
        S: AsRef<str>,
        Q: AsRef<str>,
    {
        JobEvent {
            job_id: job_id.as_ref().to_string(),
            job_set_id: job_set_id.as_ref().to_string(),
            queue: queue.as_ref().to_string(),
            created_at: Utc::now(),
            cluster_id: Some(cluster_id.to_string()),
        }
    }

    /// Derives the common event body from a batch pod's labels and
    /// annotations. Returns None for anything that is not a batch pod; the
    /// executor never speaks about pods it does not own.
    pub fn for_pod(pod: &Pod, cluster_id: &str) -> Option<JobEvent> {
        let job_id = pod.job_id()?;
        Some(JobEvent::now(
            job_id,
            pod.job_set().unwrap_or(""),
            pod.queue().unwrap_or(""),
            cluster_id,
        ))
    }
}

/// An event body that additionally carries prose: the scheduler's complaint,
/// the container's crash message, the API server's rejection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReasonedEvent {
    #[serde(flatten)]
    pub job: JobEvent,
    pub reason: String,
}

/// An event body carrying a priority change.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReprioritizedEvent {
    #[serde(flatten)]
    pub job: JobEvent,
    pub new_priority: f64,
}

/// An event body carrying sampled resource usage for one job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UtilisationEvent {
    #[serde(flatten)]
    pub job: JobEvent,
    pub max_usage: ComputeResources,
    pub last_usage: ComputeResources,
}

/// The discriminated union of every lifecycle event the platform knows.
///
/// On the wire this serializes externally tagged, which is exactly the
/// `{ "<variant>": { ... } }` framing of the event stream: a `running` event
/// is `{"running": {"job_id": ..., ...}}`. Deserialization of an unknown
/// variant fails, which the stream reader treats as "silently drop" so that
/// old executors tolerate new event kinds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Kind)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    Submitted(JobEvent),
    Queued(JobEvent),
    Leased(JobEvent),
    LeaseReturned(ReasonedEvent),
    LeaseExpired(JobEvent),
    Pending(JobEvent),
    Running(JobEvent),
    UnableToSchedule(ReasonedEvent),
    Failed(ReasonedEvent),
    Succeeded(JobEvent),
    Reprioritized(ReprioritizedEvent),
    Cancelling(JobEvent),
    Cancelled(JobEvent),
    Terminated(ReasonedEvent),
    Utilisation(UtilisationEvent),
}

impl Event {
    /// The common body, regardless of variant.
    pub fn job(&self) -> &JobEvent {
        match self {
            Event::Submitted(job)
            | Event::Queued(job)
            | Event::Leased(job)
            | Event::LeaseExpired(job)
            | Event::Pending(job)
            | Event::Running(job)
            | Event::Succeeded(job)
            | Event::Cancelling(job)
            | Event::Cancelled(job) => job,
            Event::LeaseReturned(reasoned)
            | Event::UnableToSchedule(reasoned)
            | Event::Failed(reasoned)
            | Event::Terminated(reasoned) => &reasoned.job,
            Event::Reprioritized(event) => &event.job,
            Event::Utilisation(event) => &event.job,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job().job_id
    }

    pub fn queue(&self) -> &str {
        &self.job().queue
    }

    pub fn job_set_id(&self) -> &str {
        &self.job().job_set_id
    }

    /// Where this event sits in the main lifecycle progression, or None for
    /// the orthogonal variants (cancellation, leases bouncing, utilisation).
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Event::Submitted(_) => Some(Stage::Submitted),
            Event::Queued(_) => Some(Stage::Queued),
            Event::Leased(_) => Some(Stage::Leased),
            Event::Pending(_) => Some(Stage::Pending),
            Event::Running(_) => Some(Stage::Running),
            Event::Succeeded(_) | Event::Failed(_) => Some(Stage::Finished),
            _ => None,
        }
    }
}

/// The main-line lifecycle progression:
///
/// ```text
/// submitted -> queued -> leased -> pending -> running -> (succeeded | failed)
/// ```
///
/// `cancelling -> cancelled` is an orthogonal branch, and the lease may be
/// returned or expire at any point before `running`; neither participates in
/// this order. What the order buys us is the non-regression guarantee: once
/// `running` has been reported for a pod, a reconciliation pass must never
/// re-report `pending` no matter how stale its view of the pod is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Submitted,
    Queued,
    Leased,
    Pending,
    Running,
    Finished,
}

/// Deduces the lifecycle stage a pod is currently in from its status block.
pub fn stage_of_pod(pod: &Pod) -> Stage {
    if pod.is_terminal() {
        Stage::Finished
    } else if pod.is_running() {
        Stage::Running
    } else {
        Stage::Pending
    }
}

/// Builds the event that describes a pod's CURRENT state, used by the
/// reconciler when the server's view has fallen behind ours.
pub fn event_for_pod(pod: &Pod, cluster_id: &str) -> Option<Event> {
    let job = JobEvent::for_pod(pod, cluster_id)?;
    let event = match stage_of_pod(pod) {
        Stage::Running => Event::Running(job),
        Stage::Finished => {
            if pod.succeeded() {
                Event::Succeeded(job)
            } else {
                Event::Failed(ReasonedEvent {
                    job,
                    reason: pod
                        .terminated_message()
                        .or_else(|| pod.terminated_reason())
                        .unwrap_or_else(|| "The pod failed".to_string()),
                })
            }
        }
        _ => Event::Pending(job),
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobEvent {
        JobEvent::now("01arz", "set-1", "gpu", "cluster-1")
    }

    #[test]
    fn wire_framing_is_externally_tagged() {
        let event = Event::Running(job());
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("running").is_some());
        assert_eq!("01arz", value["running"]["job_id"]);
        assert_eq!("set-1", value["running"]["job_set_id"]);
        assert_eq!("gpu", value["running"]["queue"]);
        assert!(value["running"]["created_at"].is_string());
    }

    #[test]
    fn reasoned_events_flatten_the_common_body() {
        let event = Event::UnableToSchedule(ReasonedEvent {
            job: job(),
            reason: "insufficient cpu".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!("insufficient cpu", value["unableToSchedule"]["reason"]);
        assert_eq!("01arz", value["unableToSchedule"]["job_id"]);
    }

    #[test]
    fn unknown_variants_fail_to_decode() {
        let raw = serde_json::json!({ "somethingNew": { "job_id": "01arz" } });
        assert!(serde_json::from_value::<Event>(raw).is_err());
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Submitted < Stage::Queued);
        assert!(Stage::Leased < Stage::Pending);
        assert!(Stage::Pending < Stage::Running);
        assert!(Stage::Running < Stage::Finished);
    }

    #[test]
    fn stage_roundtrip_through_events() {
        assert_eq!(Some(Stage::Running), Event::Running(job()).stage());
        assert_eq!(None, Event::Cancelled(job()).stage());
        assert_eq!(
            None,
            Event::LeaseReturned(ReasonedEvent {
                job: job(),
                reason: "".to_string()
            })
            .stage()
        );
    }

    #[test]
    fn kinds_name_the_variant() {
        assert_eq!("Event::Running", Event::Running(job()).kind());
    }
}
