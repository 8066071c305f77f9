//! Background sweep of expired fallback entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::local::LocalStore;

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to a running sweep task.
///
/// The task stops when [`Sweeper::stop`] is awaited or, failing that, when the
/// handle is dropped.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl Sweeper {
    /// Spawn a task that sweeps `store` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(store: Arc<LocalStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        info!(interval_secs = interval.as_secs(), "Starting fallback sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; nothing to sweep yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        debug!(removed = removed, remaining = store.len(), "Fallback sweep finished");
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the task and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Fallback sweeper exited abnormally");
            }
        }
        info!("Fallback sweeper stopped");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let clock = MockClock::default();
        let store = Arc::new(LocalStore::new(Arc::new(clock.clone())));
        store.set("gone", vec![1], Duration::from_secs(1));
        store.set("kept", vec![2], Duration::from_secs(3600));
        clock.advance(Duration::from_secs(2));

        let sweeper = Sweeper::start(Arc::clone(&store), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.get("kept"), Some(vec![2]));
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_stop_ends_task() {
        let store = Arc::new(LocalStore::new(Arc::new(MockClock::default())));
        let sweeper = Sweeper::start(store, Duration::from_secs(60));
        assert!(sweeper.is_running());
        assert_eq!(sweeper.interval(), Duration::from_secs(60));

        tokio::time::timeout(Duration::from_secs(1), sweeper.stop())
            .await
            .expect("stop should not hang");
    }
}
