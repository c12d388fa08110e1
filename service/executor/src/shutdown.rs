use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A Shutdown is the cancellation handle threaded through every daemon and
/// periodic task in the executor. Cancelling is sticky and broadcast; every
/// clone observes it.
///
/// Shutdown is LAYERED. The task manager, the event reporter, and the cluster
/// context each hold their own handle so that main can wind the process down
/// in dependency order: stop producing work, then flush the events that work
/// produced, then stop the informers that everything read from.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [cancel](Shutdown::cancel) has been called, immediately if
    /// it already has been. Safe to call from any number of tasks at once.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            // The flag may have flipped between the check and the registration
            // of the waiter. Re-check before parking.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
