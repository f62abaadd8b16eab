//! Metrics observer surface.
//!
//! The server snapshots its counters on a fixed period and hands them to a
//! [`MetricsObserver`]. Embedders plug in their own exporter; the default
//! observer just logs the snapshot.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::lsm::{LsmEngine, LsmStatsSnapshot};
use crate::manager::{CacheManager, ManagerStatsSnapshot};
use crate::tasks::BackgroundTask;

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub keys: u64,
    pub manager: ManagerStatsSnapshot,
    pub storage: Option<LsmStatsSnapshot>,
}

pub trait MetricsObserver: Send + Sync {
    fn record(&self, snapshot: &MetricsSnapshot);
}

/// Default observer: one structured log line per snapshot.
pub struct LogObserver;

impl MetricsObserver for LogObserver {
    fn record(&self, snapshot: &MetricsSnapshot) {
        tracing::info!(
            keys = snapshot.keys,
            hits = snapshot.manager.cache_hits,
            misses = snapshot.manager.cache_misses,
            write_through = snapshot.manager.write_through_ops,
            write_back = snapshot.manager.write_back_ops,
            sstables = snapshot.storage.as_ref().map_or(0, |s| s.sstable_count),
            compactions = snapshot.storage.as_ref().map_or(0, |s| s.compactions_done),
            "metrics"
        );
    }
}

pub struct MetricsTask {
    manager: Arc<CacheManager>,
    engine: Option<Arc<LsmEngine>>,
    observer: Arc<dyn MetricsObserver>,
    interval: Duration,
}

impl MetricsTask {
    pub fn new(
        manager: Arc<CacheManager>,
        engine: Option<Arc<LsmEngine>>,
        observer: Arc<dyn MetricsObserver>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            engine,
            observer,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let snapshot = MetricsSnapshot {
            keys: self.manager.size() as u64,
            manager: self.manager.stats().snapshot(),
            storage: self.engine.as_ref().map(|engine| engine.stats().snapshot()),
        };
        self.observer.record(&snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::manager::WriteMode;
    use crate::tasks::Scheduler;
    use crate::tmpfs::NamedTempFile;
    use std::sync::Mutex;

    struct CapturingObserver {
        snapshots: Mutex<Vec<MetricsSnapshot>>,
    }

    impl MetricsObserver for CapturingObserver {
        fn record(&self, snapshot: &MetricsSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn test_observer_receives_snapshots() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let backend = Arc::new(FileBackend::open(file.path())?);
        let manager = CacheManager::new(64, 4, WriteMode::WriteBack, backend);
        manager.put(b"k", b"v")?;

        let observer = Arc::new(CapturingObserver {
            snapshots: Mutex::new(Vec::new()),
        });

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(MetricsTask::new(
            manager.clone(),
            None,
            observer.clone(),
            Duration::from_millis(10),
        )));
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown().await?;

        let snapshots = observer.snapshots.lock().unwrap();
        assert!(!snapshots.is_empty());
        let last = snapshots.last().unwrap();
        assert_eq!(last.keys, 1);
        assert_eq!(last.manager.write_back_ops, 1);
        assert!(last.storage.is_none());
        Ok(())
    }
}
