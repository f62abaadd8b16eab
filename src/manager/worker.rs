//! Write-back worker: periodic batched flush of dirty cache entries.

use std::sync::Arc;
use std::time::Duration;

use super::CacheManager;
use crate::error::Result;
use crate::tasks::BackgroundTask;

pub struct WriteBackTask {
    manager: Arc<CacheManager>,
    interval: Duration,
}

impl WriteBackTask {
    pub fn new(manager: Arc<CacheManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WriteBackTask {
    fn name(&self) -> &'static str {
        "write-back"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        // A failed batch aborts this tick; entries stay dirty and the next
        // tick retries them.
        let flushed = self.manager.flush_dirty()?;
        if flushed > 0 {
            tracing::info!(entries = flushed, "Write-back flush completed");
        }
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        let flushed = self.manager.flush_dirty()?;
        if flushed > 0 {
            tracing::info!(entries = flushed, "Final write-back flush completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, StorageBackend};
    use crate::manager::WriteMode;
    use crate::tasks::Scheduler;
    use crate::tmpfs::NamedTempFile;

    #[tokio::test]
    async fn test_worker_flushes_periodically() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let backend = Arc::new(FileBackend::open(file.path())?);
        let manager = CacheManager::new(64, 4, WriteMode::WriteBack, backend.clone());

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(WriteBackTask::new(
            manager.clone(),
            Duration::from_millis(20),
        )));

        manager.put(b"k", b"v")?;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(backend.load(b"k")?, Some(b"v".to_vec()));
        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_flush() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let backend = Arc::new(FileBackend::open(file.path())?);
        let manager = CacheManager::new(64, 4, WriteMode::WriteBack, backend.clone());

        let scheduler = Scheduler::new();
        // Long interval: only the shutdown hook can flush this entry.
        scheduler.register(Arc::new(WriteBackTask::new(
            manager.clone(),
            Duration::from_secs(3600),
        )));

        manager.put(b"pending", b"v")?;
        scheduler.shutdown().await?;

        assert_eq!(backend.load(b"pending")?, Some(b"v".to_vec()));
        Ok(())
    }
}
