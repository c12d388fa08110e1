//! Re-exports and helpers around the kube-runtime watch machinery.
//!
//! The executor never consumes raw watch streams directly. It drives
//! [reflector]s, which maintain an eventually-consistent local [Store] of
//! cluster objects while passing each observed event through the stream. The
//! stream side is what collapses the transient submitted-pods cache; the store
//! side is what every read path queries.

use backoff::ExponentialBackoff;
use std::time::Duration;

pub use kube_runtime::reflector::{reflector, store::Writer, Store};
pub use kube_runtime::watcher::{watcher, Error, Event};

/// The backoff applied between failures of an informer stream. Informers are
/// expected to self-heal, so this never gives up; it just spaces the retries
/// out to a ceiling of five minutes.
pub fn informer_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_interval: Duration::from_secs(300),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
