//! Cancellable scheduler for periodic buffer work (index snapshot, stats
//! refresh, background scoring).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs registered closures on fixed periods until cancelled.
///
/// Each run happens on the blocking pool; a run that overlaps the next tick
/// makes that tick skip rather than queue up.
pub struct Ticker {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Ticker {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` every `period`, first run one period from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn every<F>(&self, name: &'static str, period: Duration, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let token = self.token.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let task = task.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                            warn!(task = name, error = %e, "Periodic task panicked");
                        }
                    }
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        self.tasks.lock().push((name, handle));
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop scheduling new runs. Runs already in progress finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for every task loop to exit.
    pub async fn shutdown(&self) {
        self.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Periodic task ended abnormally");
            }
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_periodically_until_shutdown() {
        let ticker = Ticker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        ticker.every("count", Duration::from_millis(20), {
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(ticker.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        ticker.shutdown().await;
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "only {after_shutdown} runs");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
        assert_eq!(ticker.task_count(), 0);
    }

    #[tokio::test]
    async fn test_first_run_waits_one_period() {
        let ticker = Ticker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        ticker.every("slow", Duration::from_secs(60), {
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        ticker.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_ticking() {
        let ticker = Ticker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        ticker.every("flaky", Duration::from_millis(15), {
            let runs = runs.clone();
            move || {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        ticker.shutdown().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
