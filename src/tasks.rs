//! Periodic background tasks and their scheduler.
//!
//! Everything that runs off the request path — the write-back worker, LSM
//! maintenance, metrics emission, the Raft ticker and applier — is a
//! [`BackgroundTask`] registered on a [`Scheduler`]. Each task gets its own
//! tokio timer loop; a broadcast channel fans out shutdown.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A task executed periodically until shutdown.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one tick
    async fn execute(&self) -> Result<()>;

    /// Run once more after the shutdown signal, before the task exits.
    /// Defaults to a no-op; the write-back worker uses this for its final
    /// flush.
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs registered tasks on their intervals with graceful shutdown.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), error = %e, "Task execution failed");
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        if let Err(e) = task.on_shutdown().await {
                            tracing::error!(task = task.name(), error = %e, "Task shutdown hook failed");
                        }
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signal every task, run shutdown hooks, join.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<_> = self.tasks.write().unwrap().drain(..).collect();
        for task in handles {
            task.await?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        ticks: Arc<AtomicUsize>,
        final_runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_shutdown(&self) -> Result<()> {
            self.final_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_task_runs_periodically() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let final_runs = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            ticks: ticks.clone(),
            final_runs: final_runs.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ticks.load(Ordering::SeqCst) > 1);

        scheduler.shutdown().await?;
        assert_eq!(final_runs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticking() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            ticks: ticks.clone(),
            final_runs: Arc::new(AtomicUsize::new(0)),
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await?;

        let after_shutdown = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
        Ok(())
    }
}
