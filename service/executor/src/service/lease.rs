use crate::api::queue::QueueApi;
use crate::cluster::ClusterContext;
use crate::job::{JobContext, RunningJob};
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s::PodExt;
use result::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;

/// The Job Lease Service keeps the central server's picture of "what this
/// cluster is running" truthful.
///
/// Each tick it: returns the leases of jobs the cluster rejected at admission
/// (recorded in the Job Context, since no pod exists to ask); renews every
/// live job's lease in one batched call; treats any lease the server declines
/// to renew as lost and stages those pods for deletion; and finalizes jobs
/// whose pods have sat in a terminal state long enough, releasing the lease
/// of failures with the failure text attached.
pub struct LeaseService {
    cluster: Arc<ClusterContext>,
    jobs: Arc<JobContext>,
    queue_api: Arc<QueueApi>,
    minimum_pod_age: Duration,
    failed_pod_expiry: Duration,
    deadline: Duration,
}

impl LeaseService {
    pub fn new(
        cluster: Arc<ClusterContext>,
        jobs: Arc<JobContext>,
        queue_api: Arc<QueueApi>,
        minimum_pod_age: Duration,
        failed_pod_expiry: Duration,
        deadline: Duration,
    ) -> LeaseService {
        LeaseService {
            cluster,
            jobs,
            queue_api,
            minimum_pod_age,
            failed_pod_expiry,
            deadline,
        }
    }

    /// Releases one lease with a reason, on behalf of collaborators (the
    /// progress monitor gives up on stuck pods through here).
    pub async fn release(&self, job_id: &str, reason: &str) -> Result<()> {
        self.queue_api
            .return_lease(job_id, reason, self.deadline)
            .await
    }

    pub async fn manage(&self) -> Result<()> {
        self.return_rejected().await;

        let now = Utc::now();
        let mut renewable: Vec<RunningJob> = Vec::new();
        for job in self.jobs.jobs().await {
            if job.is_live() {
                renewable.push(job);
            } else if self.ripe_for_finalization(&job, now) {
                self.finalize(job).await;
            }
        }
        self.renew(renewable).await
    }

    /// Returns the leases of jobs whose pods the cluster rejected. A failed
    /// return goes back into the Job Context so the next tick tries again;
    /// until the server hears the return, not renewing the lease keeps us
    /// honest either way.
    async fn return_rejected(&self) {
        let failures = self.jobs.take_submit_failures().await;
        if failures.is_empty() {
            return;
        }
        let jobs = self.jobs.jobs().await;
        for (job_id, reason) in failures {
            match self
                .queue_api
                .return_lease(&job_id, &reason, self.deadline)
                .await
            {
                Ok(()) => {
                    info!(
                        "Returned the lease of rejected job {}: {}",
                        cyan(&job_id),
                        reason
                    );
                    // Partial admissions of multi-pod jobs leave orphans
                    // behind; those must go too.
                    if let Some(job) = jobs.iter().find(|job| job.job_id == job_id) {
                        self.cluster.delete_pods(job.pods.clone()).await;
                    }
                }
                Err(err) => {
                    warn!(
                        "Could not return the lease of rejected job {} yet: {}",
                        cyan(&job_id),
                        err
                    );
                    self.jobs.record_submit_failure(&job_id, reason).await;
                }
            }
        }
    }

    /// One batched renewal. Whatever the server does NOT renew has expired
    /// centrally; the pods are staged for deletion and the central server
    /// speaks the `lease_expired` event itself.
    async fn renew(&self, jobs: Vec<RunningJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let job_ids: Vec<String> = jobs.iter().map(|job| job.job_id.clone()).collect();
        let renewed: HashSet<String> = self
            .queue_api
            .renew_leases(&job_ids, self.deadline)
            .await?
            .into_iter()
            .collect();
        for job in jobs {
            if renewed.contains(&job.job_id) {
                continue;
            }
            warn!(
                "The server declined to renew the lease of job {}; releasing its pods",
                cyan(&job.job_id)
            );
            self.cluster.delete_pods(job.pods).await;
        }
        Ok(())
    }

    /// A dead job is ripe once every pod is old enough to rule out informer
    /// lag AND has sat in its terminal state beyond the failed pod expiry.
    /// The dwell requirement keeps failure evidence around long enough for a
    /// human (or the reconciler) to read it.
    fn ripe_for_finalization(&self, job: &RunningJob, now: DateTime<Utc>) -> bool {
        let minimum_age = match chrono::Duration::from_std(self.minimum_pod_age) {
            Ok(age) => age,
            Err(_) => return false,
        };
        let expiry = match chrono::Duration::from_std(self.failed_pod_expiry) {
            Ok(expiry) => expiry,
            Err(_) => return false,
        };
        job.pods.iter().all(|pod| {
            let old_enough = pod
                .age(now)
                .map(|age| age > minimum_age)
                .unwrap_or(false);
            let settled = pod
                .last_transition()
                .map(|transition| now - transition > expiry)
                .unwrap_or(true);
            old_enough && settled
        })
    }

    async fn finalize(&self, job: RunningJob) {
        let failed: Vec<String> = job
            .pods
            .iter()
            .filter(|pod| pod.failed())
            .filter_map(|pod| pod.terminated_message().or_else(|| pod.terminated_reason()))
            .collect();
        if job.pods.iter().any(|pod| pod.failed()) {
            let reason = if failed.is_empty() {
                "The pod failed".to_string()
            } else {
                failed.join("; ")
            };
            match self
                .queue_api
                .return_lease(&job.job_id, &reason, self.deadline)
                .await
            {
                Ok(()) => info!(
                    "Finalized failed job {} and released its lease",
                    cyan(&job.job_id)
                ),
                Err(err) => {
                    // The pods stay put; the next tick finds the job again.
                    warn!(
                        "Could not release the lease of failed job {} yet: {}",
                        cyan(&job.job_id),
                        err
                    );
                    return;
                }
            }
        } else {
            debug!("Cleaning up finished job {}", cyan(&job.job_id));
        }
        self.cluster.delete_pods(job.pods).await;
    }
}

#[async_trait]
impl PeriodicTask for LeaseService {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.manage().await
    }
}
