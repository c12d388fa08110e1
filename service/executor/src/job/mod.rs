use crate::cluster::ClusterContext;
use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A job-oriented view over raw pods: every batch pod sharing a job id,
/// gathered under that id with the routing metadata lifted off the first pod's
/// annotations.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job_id: String,
    pub queue: String,
    pub job_set_id: String,
    pub owner: Option<String>,
    pub pods: Vec<Pod>,
}

impl RunningJob {
    /// A job is live while ANY of its pods is non-terminal. Multi-pod jobs
    /// only finish when the last pod does.
    pub fn is_live(&self) -> bool {
        self.pods.iter().any(|pod| !pod.is_terminal())
    }
}

/// The Job Context adapts the Cluster Context's pod-shaped world into the
/// job-shaped world that leases and events live in. It also keeps the one
/// piece of job state that cannot be recovered from the cluster: submissions
/// the cluster REJECTED, for which no pod exists to ask.
pub struct JobContext {
    cluster: Arc<ClusterContext>,
    submit_failures: Mutex<HashMap<String, String>>,
}

impl JobContext {
    pub fn new(cluster: Arc<ClusterContext>) -> JobContext {
        JobContext {
            cluster,
            submit_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Groups every known batch pod (transient ones included) into jobs.
    pub async fn jobs(&self) -> Vec<RunningJob> {
        group_into_jobs(self.cluster.batch_pods().await)
    }

    /// Records that the cluster rejected a pod of this job at admission. The
    /// lease service consumes these: a rejected job's lease is returned, not
    /// renewed.
    pub async fn record_submit_failure(&self, job_id: &str, reason: String) {
        self.submit_failures
            .lock()
            .await
            .insert(job_id.to_string(), reason);
    }

    /// Takes (and clears) every recorded admission failure. Callers that fail
    /// to act on one are expected to put it back via
    /// [record_submit_failure](JobContext::record_submit_failure).
    pub async fn take_submit_failures(&self) -> HashMap<String, String> {
        std::mem::take(&mut *self.submit_failures.lock().await)
    }
}

fn group_into_jobs(pods: Vec<Pod>) -> Vec<RunningJob> {
    let mut jobs: BTreeMap<String, RunningJob> = BTreeMap::new();
    for pod in pods {
        let job_id = match pod.job_id() {
            Some(job_id) => job_id.to_string(),
            None => continue,
        };
        let entry = jobs.entry(job_id.clone()).or_insert_with(|| RunningJob {
            job_id,
            queue: pod.queue().unwrap_or("").to_string(),
            job_set_id: pod.job_set().unwrap_or("").to_string(),
            owner: pod.owner().map(str::to_string),
            pods: Vec::new(),
        });
        entry.pods.push(pod);
    }
    let mut jobs: Vec<RunningJob> = jobs.into_iter().map(|(_, job)| job).collect();
    for job in &mut jobs {
        job.pods.sort_by_key(|pod| pod.pod_number());
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::batch_pod;

    #[test]
    fn pods_group_by_job_id_in_pod_number_order() {
        let mut second = batch_pod("j1", "q-j1-1", "Running");
        second
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("pod_number".to_string(), "1".to_string());
        let pods = vec![
            second,
            batch_pod("j1", "q-j1-0", "Running"),
            batch_pod("j2", "q-j2-0", "Pending"),
        ];
        let jobs = group_into_jobs(pods);
        assert_eq!(2, jobs.len());
        let j1 = jobs.iter().find(|job| job.job_id == "j1").unwrap();
        assert_eq!(2, j1.pods.len());
        assert_eq!(0, j1.pods[0].pod_number());
        assert_eq!(1, j1.pods[1].pod_number());
        assert_eq!("test-queue", j1.queue);
        assert_eq!("test-set", j1.job_set_id);
    }

    #[test]
    fn liveness_follows_the_last_pod() {
        let jobs = group_into_jobs(vec![
            batch_pod("j1", "q-j1-0", "Succeeded"),
            batch_pod("j2", "q-j2-0", "Running"),
        ]);
        let j1 = jobs.iter().find(|job| job.job_id == "j1").unwrap();
        let j2 = jobs.iter().find(|job| job.job_id == "j2").unwrap();
        assert!(!j1.is_live());
        assert!(j2.is_live());
    }
}
