//! Auto-backup timer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ArchiveEngine, CreateOptions};

/// Periodically creates `auto` backups until stopped or dropped.
///
/// Stopping never interrupts a backup in progress: the timer finishes it,
/// records it in the history and only then exits.
pub struct AutoBackup {
    interval: Duration,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AutoBackup {
    /// Start the timer. The first backup is taken one `interval` from now.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(engine: Arc<ArchiveEngine>, interval: Duration) -> Self {
        info!("Auto-backup every {:?}", interval);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.create(CreateOptions::auto()).await {
                            Ok(manifest) => info!("Auto-backup {} created", manifest.id),
                            Err(e) => warn!("Auto-backup failed: {}", e),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            debug!("Auto-backup timer stopped");
        });

        Self {
            interval,
            stop_tx,
            task: Some(task),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ask the timer to stop once any backup in progress has been recorded.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop the timer and wait until it has exited.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutoBackup {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BackupConfig;
    use crate::manifest::BackupKind;
    use keepsync_common::NoopNotifier;
    use keepsync_storage::MemoryStore;
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::TempDir;

    fn engine(dir: &Path) -> Arc<ArchiveEngine> {
        Arc::new(ArchiveEngine::new(
            Arc::new(MemoryStore::new()),
            None,
            Arc::new(NoopNotifier),
            BackupConfig::new(dir),
        ))
    }

    fn archives_on_disk(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tar.gz"))
            .collect()
    }

    #[tokio::test]
    async fn test_timer_creates_auto_backups_until_stopped() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        let timer = AutoBackup::start(engine.clone(), Duration::from_millis(40));
        assert!(engine.list().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.shutdown().await;

        let history = engine.list().unwrap();
        assert!(!history.is_empty());
        assert!(history.iter().all(|m| m.kind == BackupKind::Auto));

        let count = history.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.list().unwrap().len(), count);
    }

    #[tokio::test]
    async fn test_stopping_mid_backup_leaves_no_unrecorded_archive() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        for delay_ms in [5u64, 12, 20, 27] {
            let timer = AutoBackup::start(engine.clone(), Duration::from_millis(5));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            timer.shutdown().await;
        }

        let recorded: BTreeSet<String> = engine
            .list()
            .unwrap()
            .into_iter()
            .map(|m| m.file_name)
            .collect();
        assert_eq!(archives_on_disk(dir.path()), recorded);
    }

    #[tokio::test]
    async fn test_dropping_the_timer_stops_it() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        drop(AutoBackup::start(engine.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(engine.list().unwrap().is_empty());
    }
}
