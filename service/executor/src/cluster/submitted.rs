use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use term_colors::*;
use tokio::sync::Mutex;

struct Entry {
    pod: Pod,
    inserted: Instant,
}

/// The submitted-pods cache: pods the API server has ACCEPTED but the informer
/// has not yet OBSERVED.
///
/// Between those two moments a freshly submitted pod exists nowhere locally,
/// and a capacity computation or a lease renewal running in that window would
/// swear the job does not exist. This cache is the bridge. Writes come from
/// the submission path; evictions come from the informer callback the moment
/// the authoritative cache first sees the pod (or from the pruner, should the
/// informer never see it at all).
///
/// There is deliberately no atomicity between the API server accepting a pod
/// and this cache learning about it. The informer is authoritative; this cache
/// only ever shrinks toward it.
#[derive(Default)]
pub struct SubmittedPods {
    inner: Mutex<HashMap<String, Entry>>,
}

impl SubmittedPods {
    pub fn new() -> SubmittedPods {
        SubmittedPods::default()
    }

    /// Records a pod the API server just accepted, keyed by its job id.
    pub async fn insert(&self, pod: Pod) {
        let job_id = match pod.job_id() {
            Some(job_id) => job_id.to_string(),
            // A pod without a job id could never be evicted by the informer
            // callback, so refuse to remember it at all.
            None => return,
        };
        self.inner.lock().await.insert(
            job_id,
            Entry {
                pod,
                inserted: Instant::now(),
            },
        );
    }

    /// Drops the entry for a job the informer has now observed. Harmless when
    /// there is nothing to drop, which is the common case for every informer
    /// event after the first.
    pub async fn evict(&self, job_id: &str) {
        if self.inner.lock().await.remove(job_id).is_some() {
            trace!(
                "The informer caught up with job {}; transient entry dropped",
                cyan(job_id)
            );
        }
    }

    /// A point in time copy of every transient pod.
    pub async fn snapshot(&self) -> Vec<Pod> {
        self.inner
            .lock()
            .await
            .values()
            .map(|entry| entry.pod.clone())
            .collect()
    }

    /// Drops entries older than the deadline and returns them. An entry aging
    /// out means the informer NEVER observed a pod the API server accepted,
    /// which is worth shouting about upstream.
    pub async fn prune(&self, deadline: Duration) -> Vec<Pod> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() > deadline)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|job_id| inner.remove(job_id))
            .map(|entry| entry.pod)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    fn pod(job_id: &str, name: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name,
                "labels": { "job_id": job_id, "pod_number": "0" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn insert_snapshot_evict() {
        tokio_test::block_on(async {
            let cache = SubmittedPods::new();
            cache.insert(pod("01a", "q-01a-0")).await;
            cache.insert(pod("01b", "q-01b-0")).await;
            assert_eq!(2, cache.len().await);

            cache.evict("01a").await;
            let snapshot = cache.snapshot().await;
            assert_eq!(1, snapshot.len());
            assert_eq!("q-01b-0", snapshot[0].name());

            // Evicting a job the informer already collapsed is a no-op.
            cache.evict("01a").await;
            assert_eq!(1, cache.len().await);
        });
    }

    #[test]
    fn unlabeled_pods_are_refused() {
        tokio_test::block_on(async {
            let cache = SubmittedPods::new();
            let stray: Pod = serde_json::from_value(serde_json::json!({
                "metadata": { "name": "stray" }
            }))
            .unwrap();
            cache.insert(stray).await;
            assert_eq!(0, cache.len().await);
        });
    }

    #[test]
    fn pruning_is_age_based() {
        tokio_test::block_on(async {
            let cache = SubmittedPods::new();
            cache.insert(pod("01a", "q-01a-0")).await;
            assert!(cache.prune(Duration::from_secs(60)).await.is_empty());
            let expired = cache.prune(Duration::from_secs(0)).await;
            assert_eq!(1, expired.len());
            assert_eq!(0, cache.len().await);
        });
    }
}
