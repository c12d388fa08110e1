pub mod allocation;
pub mod lease;
pub mod progress;
pub mod queue_usage;
pub mod utilisation;

use crate::cluster::ClusterContext;
use crate::shutdown::Shutdown;
use crate::taskmanager::PeriodicTask;
use async_trait::async_trait;
use result::Result;
use std::sync::Arc;
use std::time::Duration;

/// Drives the Cluster Context's staged deletions on a short leash. Staging and
/// issuing are split on purpose: every service can stage a deletion at any
/// time, but only this task talks to the API server, which is what keeps the
/// delete traffic serialized and rate limited.
pub struct DeletionTask {
    cluster: Arc<ClusterContext>,
}

impl DeletionTask {
    pub fn new(cluster: Arc<ClusterContext>) -> DeletionTask {
        DeletionTask { cluster }
    }
}

#[async_trait]
impl PeriodicTask for DeletionTask {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.cluster.process_pods_to_delete().await;
        Ok(())
    }
}

/// Periodic cache hygiene for the Cluster Context.
pub struct CachePruneTask {
    cluster: Arc<ClusterContext>,
    transient_deadline: Duration,
}

impl CachePruneTask {
    pub fn new(cluster: Arc<ClusterContext>, transient_deadline: Duration) -> CachePruneTask {
        CachePruneTask {
            cluster,
            transient_deadline,
        }
    }
}

#[async_trait]
impl PeriodicTask for CachePruneTask {
    async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
        self.cluster.prune_caches(self.transient_deadline).await;
        Ok(())
    }
}
