//! Background removal of idle registry entries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::registry::LimiterRegistry;

/// Periodically evicts registry entries that have been idle longer than a TTL.
///
/// The evictor does nothing until [`spawn`](Self::spawn) is called, and runs
/// until the returned handle is stopped or dropped.
pub struct Evictor {
    registry: Arc<LimiterRegistry>,
    interval: Duration,
    ttl: Duration,
}

impl Evictor {
    /// Create an evictor for `registry`.
    pub fn new(registry: Arc<LimiterRegistry>, interval: Duration, ttl: Duration) -> Self {
        Self {
            registry,
            interval,
            ttl,
        }
    }

    /// Get the sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Get the idle TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Run a single eviction pass.
    ///
    /// A panic inside the pass is logged and reported as zero evictions.
    pub fn sweep(&self) -> usize {
        self.sweep_with(LimiterRegistry::evict_idle)
    }

    fn sweep_with<F>(&self, pass: F) -> usize
    where
        F: FnOnce(&LimiterRegistry, Duration) -> usize,
    {
        match catch_unwind(AssertUnwindSafe(|| pass(self.registry.as_ref(), self.ttl))) {
            Ok(0) => {
                debug!(remaining = self.registry.len(), "No idle buckets to evict");
                0
            }
            Ok(evicted) => {
                info!(
                    evicted,
                    remaining = self.registry.len(),
                    ttl_secs = self.ttl.as_secs(),
                    "Evicted idle rate limit buckets"
                );
                evicted
            }
            Err(_) => {
                error!("Eviction pass panicked; will retry on next tick");
                0
            }
        }
    }

    /// Start the eviction loop on the current Tokio runtime.
    pub fn spawn(self) -> EvictorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(
            interval_secs = self.interval.as_secs_f64(),
            ttl_secs = self.ttl.as_secs_f64(),
            "Starting idle bucket evictor"
        );

        let task = tokio::spawn(async move {
            // tokio panics on a zero period.
            let period = self.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }

            info!("Idle bucket evictor stopped");
        });

        EvictorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`Evictor`].
///
/// Dropping the handle also signals the task to stop, without waiting for it.
pub struct EvictorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Signal the evictor to stop and wait for its task to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already be gone; nothing to signal then.
            let _ = shutdown.send(());
        }

        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "Evictor task ended abnormally");
        }
    }

    /// Check whether the evictor task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
