use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// The recently-deleted cache: pod UID to the instant of the last delete call
/// that the API server acknowledged.
///
/// Its one job is rate limiting. Several services stage deletions for the same
/// pod (the lease service finalizing it, the progress monitor giving up on it)
/// and the informer can take a while to actually observe the pod disappearing.
/// Without this cache every deletion tick in that window would hammer the API
/// server with another DELETE for an object that is already dying.
///
/// Only ACKNOWLEDGED deletes are recorded, where NotFound counts as the
/// warmest acknowledgment of all. A delete that failed outright is deliberately
/// NOT recorded so that the very next tick retries it.
pub struct RecentlyDeleted {
    period: Duration,
    inner: Mutex<HashMap<String, Instant>>,
}

impl RecentlyDeleted {
    pub fn new(period: Duration) -> RecentlyDeleted {
        RecentlyDeleted {
            period,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a delete for this UID was acknowledged within the repeat
    /// period, meaning another call now would be noise.
    pub async fn is_recent(&self, uid: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(uid)
            .map(|instant| instant.elapsed() < self.period)
            .unwrap_or(false)
    }

    /// Records an acknowledged delete at the current instant.
    pub async fn record(&self, uid: &str) {
        self.inner
            .lock()
            .await
            .insert(uid.to_string(), Instant::now());
    }

    /// Drops entries old enough that they no longer suppress anything.
    pub async fn prune(&self) {
        let period = self.period;
        self.inner
            .lock()
            .await
            .retain(|_, instant| instant.elapsed() < period);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_expires_with_the_period() {
        tokio_test::block_on(async {
            let cache = RecentlyDeleted::new(Duration::from_millis(50));
            assert!(!cache.is_recent("uid-1").await);
            cache.record("uid-1").await;
            assert!(cache.is_recent("uid-1").await);
            tokio::time::sleep(Duration::from_millis(80)).await;
            assert!(!cache.is_recent("uid-1").await);
        });
    }

    #[test]
    fn pruning_only_drops_stale_entries() {
        tokio_test::block_on(async {
            let cache = RecentlyDeleted::new(Duration::from_millis(50));
            cache.record("old").await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            cache.record("fresh").await;
            cache.prune().await;
            assert_eq!(1, cache.len().await);
            assert!(cache.is_recent("fresh").await);
        });
    }
}
