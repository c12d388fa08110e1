use crate::metrics::{TASK_DURATION, TASK_ERRORS, TASK_RUNS};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use error::Retryable;
use kind::Kind;
use result::Result;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::task::JoinHandle;

/// One unit of periodic work. Implementations receive the shared shutdown
/// handle so that long ticks (stream reads, big sweeps) can bail out midway;
/// short ticks may ignore it, since the manager already checks it between
/// invocations.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    async fn tick(&self, shutdown: &Shutdown) -> Result<()>;
}

struct RunningTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// The TaskManager owns the executor's heartbeat: every periodic service is
/// registered here as `(name, task, interval)` and driven on its own
/// cooperative worker.
///
/// Two guarantees matter. Invocations of the SAME task are strictly
/// serialized, because each worker awaits the tick to completion before it
/// will consider the next one; a slow sweep simply eats its own slots. And
/// every invocation is accounted for in prometheus under the task's name, the
/// errors additionally under the error's kind.
pub struct TaskManager {
    shutdown: Shutdown,
    tasks: Vec<RunningTask>,
}

impl TaskManager {
    pub fn new(shutdown: Shutdown) -> TaskManager {
        TaskManager {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Registers and immediately starts a named task. The first invocation
    /// fires right away rather than one interval from now; a freshly booted
    /// executor should lease, report, and reconcile without sitting on its
    /// hands first.
    pub fn register(&mut self, name: &'static str, interval: Duration, task: Arc<dyn PeriodicTask>) {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                TASK_RUNS.with_label_values(&[name]).inc();
                let timer = TASK_DURATION.with_label_values(&[name]).start_timer();
                if let Err(err) = task.tick(&shutdown).await {
                    TASK_ERRORS
                        .with_label_values(&[name, err.kind().as_str()])
                        .inc();
                    if err.is_transient() {
                        warn!("Task {} failed this tick: {}", cyan(name), err);
                    } else {
                        error!("Task {} failed: {}", cyan(name), red(format!("{}", err)));
                    }
                }
                timer.observe_duration();
            }
            debug!("Task {} has stopped", cyan(name));
        });
        self.tasks.push(RunningTask { name, handle });
        info!(
            "Registered task {} every {}",
            cyan(name),
            orange(format!("{:?}", interval))
        );
    }

    /// Requests cancellation of every task and waits up to `timeout` for them
    /// to exit. Returns whether they ALL did; stragglers are abandoned to the
    /// runtime (they cannot outlive the process) and reported by name.
    pub async fn stop_all(self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_stopped = true;
        for task in self.tasks {
            match tokio::time::timeout_at(deadline, task.handle).await {
                Ok(_) => trace!("Task {} joined", cyan(task.name)),
                Err(_) => {
                    all_stopped = false;
                    warn!(
                        "Task {} did not stop within the shutdown timeout and was abandoned",
                        cyan(task.name)
                    );
                }
            }
        }
        all_stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for Arc<CountingTask> {
        async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubbornTask {}

    #[async_trait]
    impl PeriodicTask for StubbornTask {
        async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
            // Deliberately deaf to cancellation.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[test]
    fn tasks_tick_and_stop_cleanly() {
        tokio_test::block_on(async {
            let counter = Arc::new(CountingTask {
                ticks: AtomicUsize::new(0),
            });
            let mut manager = TaskManager::new(Shutdown::new());
            manager.register(
                "counting",
                Duration::from_millis(10),
                Arc::new(counter.clone()),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(manager.stop_all(Duration::from_secs(1)).await);
            // The first tick fires immediately, then roughly every 10ms.
            assert!(counter.ticks.load(Ordering::SeqCst) >= 2);
        });
    }

    #[test]
    fn stragglers_are_reported_not_awaited_forever() {
        tokio_test::block_on(async {
            let mut manager = TaskManager::new(Shutdown::new());
            manager.register("stubborn", Duration::from_millis(1), Arc::new(StubbornTask {}));
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!manager.stop_all(Duration::from_millis(50)).await);
        });
    }

    #[test]
    fn invocations_never_overlap() {
        tokio_test::block_on(async {
            struct SlowTask {
                running: Arc<AtomicUsize>,
                overlapped: Arc<AtomicUsize>,
            }

            #[async_trait]
            impl PeriodicTask for SlowTask {
                async fn tick(&self, _shutdown: &Shutdown) -> Result<()> {
                    if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                        self.overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }

            let overlapped = Arc::new(AtomicUsize::new(0));
            let mut manager = TaskManager::new(Shutdown::new());
            manager.register(
                "slow",
                // An interval far shorter than the tick takes.
                Duration::from_millis(1),
                Arc::new(SlowTask {
                    running: Arc::new(AtomicUsize::new(0)),
                    overlapped: overlapped.clone(),
                }),
            );
            tokio::time::sleep(Duration::from_millis(150)).await;
            manager.stop_all(Duration::from_secs(1)).await;
            assert_eq!(0, overlapped.load(Ordering::SeqCst));
        });
    }
}
