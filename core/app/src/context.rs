//! Application-lifetime context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use keepsync_backup::{ArchiveBuilder, ArchiveEngine, AutoBackup, BackupManifest};
use keepsync_common::{BackupId, Notifier, Result};
use keepsync_pool::TaskPool;
use keepsync_storage::{FileStore, KeyValueStore};
use keepsync_sync::{ConnectivityProber, Probe, RetryQueue, SyncScheduler};

use crate::config::AppConfig;
use crate::webhook::WebhookAdapter;

/// Every long-lived component, built once per process.
pub struct AppContext {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub store: Arc<dyn KeyValueStore>,
    pub prober: Arc<ConnectivityProber>,
    pub queue: RetryQueue,
    pub pool: Arc<TaskPool<ArchiveBuilder>>,
    pub backups: Arc<ArchiveEngine>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    /// Build the context with an HTTP reachability probe.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: AppConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let prober = ConnectivityProber::http(config.prober_config())?;
        Self::assemble(config, Arc::new(prober), notifier)
    }

    /// Build the context around a custom probe.
    pub fn with_probe(
        config: AppConfig,
        probe: Arc<dyn Probe>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let prober = ConnectivityProber::new(probe, config.prober_config());
        Self::assemble(config, Arc::new(prober), notifier)
    }

    fn assemble(
        config: AppConfig,
        prober: Arc<ConnectivityProber>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        info!("Data directory: {:?}", data_dir);

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.store_path())?);

        let queue = RetryQueue::new(
            store.clone(),
            prober.clone(),
            notifier.clone(),
            config.queue_config(),
        )?;
        if let Some(url) = &config.sync.webhook_url {
            let timeout = Duration::from_secs(config.sync.webhook_timeout_secs);
            queue.set_adapter(Arc::new(WebhookAdapter::new(url.clone(), timeout)?));
            info!("Sync adapter: webhook {}", url);
        }

        let pool = Arc::new(TaskPool::new(config.pool.size, ArchiveBuilder)?);
        let backups = Arc::new(ArchiveEngine::new(
            store.clone(),
            Some(pool.clone()),
            notifier.clone(),
            config.backup_config(),
        ));

        Ok(Self {
            config,
            data_dir,
            store,
            prober,
            queue,
            pool,
            backups,
            notifier,
        })
    }

    /// Start the prober loop, the sync scheduler and, if configured, the
    /// auto-backup timer.
    pub fn start_background(&self) -> BackgroundTasks {
        self.prober.start();

        let (scheduler, handle) =
            SyncScheduler::new(self.config.sync_mode(), self.queue.clone(), &self.prober);
        let scheduler_task = tokio::spawn(handle.run());

        let auto_backup = self
            .config
            .auto_backup_interval()
            .map(|interval| AutoBackup::start(self.backups.clone(), interval));

        info!("Background tasks started (sync mode {:?})", scheduler.mode());
        BackgroundTasks {
            prober: self.prober.clone(),
            scheduler,
            scheduler_task,
            auto_backup,
        }
    }

    /// Restore a backup from the history and reload the sync queue from the
    /// restored store.
    ///
    /// # Errors
    /// - `InvalidInput` if a sync pass is in flight; nothing is restored
    /// - Any error from the restore itself; the queue keeps its operations
    pub async fn restore_backup(&self, id: &BackupId) -> Result<BackupManifest> {
        let pause = self.queue.pause()?;
        let manifest = self.backups.restore(id).await?;
        let loaded = pause.reload()?;
        info!("Restored backup {} ({} queued operations)", manifest.id, loaded);
        Ok(manifest)
    }

    /// Restore an archive at an arbitrary path and reload the sync queue
    /// from the restored store.
    ///
    /// # Errors
    /// Same as [`restore_backup`](Self::restore_backup).
    pub async fn restore_backup_from_path(&self, path: &Path) -> Result<BackupManifest> {
        let pause = self.queue.pause()?;
        let manifest = self.backups.restore_from_path(path).await?;
        let loaded = pause.reload()?;
        info!(
            "Restored {} from {:?} ({} queued operations)",
            manifest.id, path, loaded
        );
        Ok(manifest)
    }

    /// Stop the task pool. Queued archive builds are rejected.
    pub async fn shutdown(&self) {
        self.pool.terminate().await;
        info!("KeepSync context shut down");
    }
}

/// Background activity started by [`AppContext::start_background`].
pub struct BackgroundTasks {
    prober: Arc<ConnectivityProber>,
    scheduler: SyncScheduler,
    scheduler_task: JoinHandle<()>,
    auto_backup: Option<AutoBackup>,
}

impl BackgroundTasks {
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn auto_backup(&self) -> Option<&AutoBackup> {
        self.auto_backup.as_ref()
    }

    /// Stop everything and wait for the scheduler loop and any backup in
    /// progress to finish.
    pub async fn shutdown(self) {
        if let Some(timer) = self.auto_backup {
            timer.shutdown().await;
        }
        self.scheduler.shutdown().await;
        let _ = self.scheduler_task.await;
        self.prober.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keepsync_backup::CreateOptions;
    use keepsync_common::{Error, NoopNotifier};
    use keepsync_sync::{
        NewOperation, ProcessOutcome, SkipReason, SyncMode, SyncOperation, QUEUE_KEY,
    };
    use serde_json::json;
    use tempfile::TempDir;

    struct Reachable;

    #[async_trait]
    impl Probe for Reachable {
        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    fn config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..AppConfig::default()
        };
        config.queue.auto_sync = false;
        config
    }

    fn context(config: AppConfig) -> AppContext {
        AppContext::with_probe(config, Arc::new(Reachable), Arc::new(NoopNotifier)).unwrap()
    }

    #[tokio::test]
    async fn test_queue_persists_in_data_dir() {
        let dir = TempDir::new().unwrap();
        {
            let ctx = context(config(&dir));
            ctx.queue
                .enqueue(NewOperation::new("update", "profile", b"{}".to_vec()))
                .unwrap();
            ctx.shutdown().await;
        }
        assert!(dir.path().join("store.json").is_file());

        let ctx = context(config(&dir));
        assert_eq!(ctx.queue.status().pending, 1);

        // No webhook configured.
        let outcome = ctx.queue.process().await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::NoAdapter));
    }

    #[tokio::test]
    async fn test_backup_round_trip_through_context() {
        let dir = TempDir::new().unwrap();
        let ctx = context(config(&dir));
        ctx.store.set("settings", json!({"lang": "en"})).unwrap();

        let manifest = ctx.backups.create(CreateOptions::default()).await.unwrap();
        assert!(dir.path().join("backups").join(&manifest.file_name).is_file());

        ctx.store.set("settings", json!({"lang": "fr"})).unwrap();
        ctx.restore_backup(&manifest.id).await.unwrap();
        assert_eq!(ctx.store.get("settings").unwrap(), Some(json!({"lang": "en"})));
    }

    fn queued_entities(ctx: &AppContext) -> (Vec<String>, Vec<String>) {
        let persisted: Vec<SyncOperation> = ctx.store.get_or(QUEUE_KEY, Vec::new()).unwrap();
        (
            persisted.into_iter().map(|op| op.entity).collect(),
            ctx.queue.operations().into_iter().map(|op| op.entity).collect(),
        )
    }

    fn op(entity: &str) -> NewOperation {
        NewOperation::new("update", entity, b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_restore_rolls_back_the_live_queue() {
        let dir = TempDir::new().unwrap();
        let ctx = context(config(&dir));

        ctx.queue.enqueue(op("a")).unwrap();
        let manifest = ctx.backups.create(CreateOptions::default()).await.unwrap();
        ctx.queue.enqueue(op("b")).unwrap();

        ctx.restore_backup(&manifest.id).await.unwrap();
        assert!(!ctx.queue.is_paused());
        ctx.queue.enqueue(op("c")).unwrap();

        let expected = vec!["a".to_string(), "c".to_string()];
        assert_eq!(queued_entities(&ctx), (expected.clone(), expected));
    }

    #[tokio::test]
    async fn test_restore_from_path_rolls_back_the_live_queue() {
        let dir = TempDir::new().unwrap();
        let ctx = context(config(&dir));

        ctx.queue.enqueue(op("a")).unwrap();
        let manifest = ctx.backups.create(CreateOptions::default()).await.unwrap();
        ctx.queue.enqueue(op("b")).unwrap();

        let archive = dir.path().join("backups").join(&manifest.file_name);
        ctx.restore_backup_from_path(&archive).await.unwrap();

        let expected = vec!["a".to_string()];
        assert_eq!(queued_entities(&ctx), (expected.clone(), expected));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_queue_usable() {
        let dir = TempDir::new().unwrap();
        let ctx = context(config(&dir));
        ctx.queue.enqueue(op("a")).unwrap();

        let missing = BackupId::new("manual-missing").unwrap();
        assert!(matches!(
            ctx.restore_backup(&missing).await,
            Err(Error::NotFound(_))
        ));

        ctx.queue.enqueue(op("b")).unwrap();
        let expected = vec!["a".to_string(), "b".to_string()];
        assert_eq!(queued_entities(&ctx), (expected.clone(), expected));
    }

    #[tokio::test]
    async fn test_background_tasks_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.backup.auto_interval_secs = Some(3600);
        let ctx = context(config);

        let background = ctx.start_background();
        assert_eq!(background.scheduler().mode(), SyncMode::OnReconnect);
        assert!(background.auto_backup().is_some());

        let outcome = background.scheduler().request_sync().await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::NoAdapter));

        background.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.pool.size = 0;

        let result = AppContext::with_probe(config, Arc::new(Reachable), Arc::new(NoopNotifier));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
