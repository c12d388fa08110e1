use super::ApiConnection;
use k8s::quantity::ComputeResources;
use k8s_openapi::api::core::v1::PodSpec;
use result::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A job the central queue service has committed to us. The pod specs are
/// native Kubernetes specs authored by the submitter; the executor only wraps
/// them in metadata, it never edits them.
#[derive(Deserialize, Clone, Debug)]
pub struct JobLease {
    pub job_id: String,
    pub queue: String,
    pub job_set_id: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub pod_specs: Vec<PodSpec>,
}

#[derive(Serialize)]
struct LeaseRequest<'a> {
    cluster_id: &'a str,
    pool: &'a str,
    resources: &'a ComputeResources,
    minimum_job_size: &'a ComputeResources,
    heartbeat_timeout_seconds: u64,
}

#[derive(Deserialize)]
struct LeaseResponse {
    #[serde(default)]
    jobs: Vec<JobLease>,
}

#[derive(Serialize)]
struct RenewRequest<'a> {
    cluster_id: &'a str,
    job_ids: &'a [String],
}

#[derive(Deserialize)]
struct RenewResponse {
    #[serde(default)]
    renewed: Vec<String>,
}

#[derive(Serialize)]
struct ReturnRequest<'a> {
    cluster_id: &'a str,
    job_id: &'a str,
    reason: &'a str,
}

/// The client of the aggregated queue service: request new leases, renew the
/// ones we hold, return the ones we cannot honor.
///
/// Lease requests are idempotent with respect to server side bookkeeping; the
/// server deduplicates on (cluster id, job id), so a response that is lost in
/// transit costs nothing but the tick it happened on.
pub struct QueueApi {
    connection: Arc<ApiConnection>,
    cluster_id: String,
    pool: String,
    heartbeat_timeout: Duration,
}

impl QueueApi {
    pub fn new(
        connection: Arc<ApiConnection>,
        cluster_id: String,
        pool: String,
        heartbeat_timeout: Duration,
    ) -> QueueApi {
        QueueApi {
            connection,
            cluster_id,
            pool,
            heartbeat_timeout,
        }
    }

    /// Requests leases sized to the given spare capacity. The heartbeat
    /// timeout tells the server how stale our renewals may become before it
    /// should consider this executor dead and expire everything we hold.
    pub async fn request_leases(
        &self,
        spare: &ComputeResources,
        minimum_job_size: &ComputeResources,
        deadline: Duration,
    ) -> Result<Vec<JobLease>> {
        let request = LeaseRequest {
            cluster_id: &self.cluster_id,
            pool: &self.pool,
            resources: spare,
            minimum_job_size,
            heartbeat_timeout_seconds: self.heartbeat_timeout.as_secs(),
        };
        let response: LeaseResponse = self
            .connection
            .post_json("/v1/queue/leases", &request, deadline)
            .await?;
        Ok(response.jobs)
    }

    /// Renews every given lease in one batched call and returns the ids the
    /// server actually renewed. A job id we sent that does NOT come back has
    /// lost its lease centrally.
    pub async fn renew_leases(&self, job_ids: &[String], deadline: Duration) -> Result<Vec<String>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = RenewRequest {
            cluster_id: &self.cluster_id,
            job_ids,
        };
        let response: RenewResponse = self
            .connection
            .post_json("/v1/queue/renew", &request, deadline)
            .await?;
        Ok(response.renewed)
    }

    /// Returns a single lease with the reason we could not honor it.
    pub async fn return_lease(&self, job_id: &str, reason: &str, deadline: Duration) -> Result<()> {
        let request = ReturnRequest {
            cluster_id: &self.cluster_id,
            job_id,
            reason,
        };
        self.connection
            .post("/v1/queue/return", &request, deadline)
            .await
    }
}
