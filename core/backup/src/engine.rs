//! Archive engine: create, restore, list, delete and validate backups.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use keepsync_common::{
    notify_best_effort, BackupId, Error, Notification, Notifier, Result, Urgency,
};
use keepsync_pool::TaskPool;
use keepsync_storage::{Entries, KeyValueStore};

use crate::archive::{
    build_archive, extract_archive, read_embedded_manifest, read_manifest, read_store_dump,
    ArchiveBuilder, ArchiveJob, DATABASE_DIR, FILES_DIR,
};
use crate::checksum::file_sha256;
use crate::manifest::{BackupKind, BackupManifest, Component};

/// Store key holding the backup history, most recent first.
pub const HISTORY_KEY: &str = "backup:history";

/// Key prefix owned by the archive engine. Never dumped or restored.
pub const BACKUP_NAMESPACE: &str = "backup:";

/// Default payload size above which builds are offloaded (5 MB).
pub const DEFAULT_OFFLOAD_THRESHOLD: u64 = 5 * 1024 * 1024;

const STAGING_DIR: &str = ".staging";

/// Configuration for the archive engine.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory holding archive files.
    pub backup_dir: PathBuf,
    /// Number of backups kept in the history.
    pub max_backups: usize,
    /// Estimated payload size above which the build runs on the task pool.
    pub offload_threshold: u64,
    /// Whether builds may be offloaded at all.
    pub allow_offload: bool,
    /// Database file embedded as the `database` component.
    pub database_path: Option<PathBuf>,
    /// Directory embedded as the `files` component.
    pub user_files_dir: Option<PathBuf>,
    /// Platform recorded in manifests.
    pub platform: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("backups"),
            max_backups: 10,
            offload_threshold: DEFAULT_OFFLOAD_THRESHOLD,
            allow_offload: true,
            database_path: None,
            user_files_dir: None,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl BackupConfig {
    /// Default configuration storing archives in `backup_dir`.
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_backups(mut self, max: usize) -> Self {
        self.max_backups = max;
        self
    }

    pub fn with_offload_threshold(mut self, bytes: u64) -> Self {
        self.offload_threshold = bytes;
        self
    }

    pub fn with_allow_offload(mut self, allow: bool) -> Self {
        self.allow_offload = allow;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_user_files_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_files_dir = Some(path.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Directory under which restores are unpacked.
    pub fn staging_dir(&self) -> PathBuf {
        self.backup_dir.join(STAGING_DIR)
    }
}

/// Options for a single `create` call.
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub kind: BackupKind,
    /// Embed the database file when one is configured and present.
    pub include_database: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            kind: BackupKind::Manual,
            include_database: true,
        }
    }
}

impl CreateOptions {
    /// Options for a backup started by the auto-backup timer.
    pub fn auto() -> Self {
        Self {
            kind: BackupKind::Auto,
            ..Self::default()
        }
    }

    pub fn with_include_database(mut self, include: bool) -> Self {
        self.include_database = include;
        self
    }
}

/// Result of checking a backup without restoring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub id: BackupId,
    pub file_exists: bool,
    /// `None` when the history carries no checksum or the file is missing.
    pub checksum_matches: Option<bool>,
    pub manifest_readable: bool,
}

impl ValidationReport {
    /// Whether the backup can be restored.
    pub fn is_valid(&self) -> bool {
        self.file_exists && self.checksum_matches != Some(false) && self.manifest_readable
    }
}

/// Produces and restores point-in-time snapshots of application state.
pub struct ArchiveEngine {
    store: Arc<dyn KeyValueStore>,
    pool: Option<Arc<TaskPool<ArchiveBuilder>>>,
    notifier: Arc<dyn Notifier>,
    config: BackupConfig,
    /// Serializes read-modify-write cycles on the history.
    history: Mutex<()>,
}

impl ArchiveEngine {
    /// Create an engine. Without a pool every build runs inline.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        pool: Option<Arc<TaskPool<ArchiveBuilder>>>,
        notifier: Arc<dyn Notifier>,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            pool,
            notifier,
            config,
            history: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Build a new backup and record it in the history.
    ///
    /// # Postconditions
    /// - The archive file exists and its checksum is recorded
    /// - The history holds at most `max_backups` entries
    ///
    /// # Errors
    /// - `Storage` if any step of the build fails. The partial archive is
    ///   removed and the history is untouched.
    pub async fn create(&self, options: CreateOptions) -> Result<BackupManifest> {
        let result = self.create_inner(options).await;
        match &result {
            Ok(manifest) => notify_best_effort(
                self.notifier.as_ref(),
                Notification::new(
                    "Backup complete",
                    format!(
                        "Backup {} created ({} bytes)",
                        manifest.id,
                        manifest.size_bytes.unwrap_or(0)
                    ),
                ),
            ),
            Err(e) => notify_best_effort(
                self.notifier.as_ref(),
                Notification::new("Backup failed", e.to_string()).with_urgency(Urgency::Critical),
            ),
        }
        result
    }

    async fn create_inner(&self, options: CreateOptions) -> Result<BackupManifest> {
        fs::create_dir_all(&self.config.backup_dir).map_err(|e| {
            Error::Storage(format!(
                "Failed to create backup directory {}: {}",
                self.config.backup_dir.display(),
                e
            ))
        })?;

        let created_at = Utc::now();
        let id = BackupId::new(format!(
            "{}-{}-{}",
            options.kind,
            created_at.format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ))?;
        let mut manifest =
            BackupManifest::new(id, options.kind, created_at, &self.config.platform);

        manifest.include(Component::Store);
        let store = self.store_dump()?;

        let database = self
            .config
            .database_path
            .clone()
            .filter(|path| options.include_database && path.is_file());
        if database.is_some() {
            manifest.include(Component::Database);
        }

        let files = self.config.user_files_dir.clone().filter(|dir| dir.is_dir());
        if files.is_some() {
            manifest.include(Component::Files);
        }

        let dest = self.config.backup_dir.join(&manifest.file_name);
        let job = ArchiveJob {
            manifest: manifest.clone(),
            store,
            database,
            files,
            dest: dest.clone(),
        };

        let estimate = job
            .estimated_size()
            .map_err(|e| Error::Storage(format!("Failed to size backup sources: {}", e)))?;

        info!(
            "Creating {} backup {} with {:?} (~{} bytes)",
            manifest.kind, manifest.id, manifest.includes, estimate
        );

        let built = match self.offload_pool(estimate) {
            Some(pool) => {
                debug!("Offloading backup {} to the task pool", manifest.id);
                pool.execute(job).await
            }
            None => tokio::task::spawn_blocking(move || build_archive(&job, &|_| {}))
                .await
                .unwrap_or_else(|e| Err(Error::Storage(format!("Archive build aborted: {}", e)))),
        };

        let size = match built {
            Ok(size) => size,
            Err(e) => {
                remove_file_if_exists(&dest);
                return Err(as_storage_error(&manifest, e));
            }
        };

        let checksum_path = dest.clone();
        let checksum = match tokio::task::spawn_blocking(move || file_sha256(&checksum_path)).await
        {
            Ok(Ok(checksum)) => checksum,
            Ok(Err(e)) => {
                remove_file_if_exists(&dest);
                return Err(as_storage_error(&manifest, e));
            }
            Err(e) => {
                remove_file_if_exists(&dest);
                return Err(Error::Storage(format!("Checksum aborted: {}", e)));
            }
        };

        manifest.checksum = Some(checksum);
        manifest.size_bytes = Some(size);

        let evicted = {
            let _guard = self.lock_history();
            let mut history = self.load_history()?;
            history.insert(0, manifest.clone());
            let evicted = if history.len() > self.config.max_backups {
                history.split_off(self.config.max_backups)
            } else {
                Vec::new()
            };
            if let Err(e) = self.save_history(&history) {
                remove_file_if_exists(&dest);
                return Err(as_storage_error(&manifest, e));
            }
            evicted
        };

        for old in &evicted {
            info!("Pruning backup {} beyond retention limit", old.id);
            remove_file_if_exists(&self.config.backup_dir.join(&old.file_name));
        }

        info!("Backup {} created ({} bytes)", manifest.id, size);
        Ok(manifest)
    }

    fn offload_pool(&self, estimate: u64) -> Option<&Arc<TaskPool<ArchiveBuilder>>> {
        if self.config.allow_offload && estimate > self.config.offload_threshold {
            self.pool.as_ref()
        } else {
            None
        }
    }

    /// Restore the backup recorded under `id`.
    ///
    /// # Errors
    /// - `NotFound` if `id` is not in the history or its file is missing
    /// - `Corruption` if the checksum differs, the archive does not unpack
    ///   or its manifest is absent or invalid
    pub async fn restore(&self, id: &BackupId) -> Result<BackupManifest> {
        let result = self.restore_known(id).await;
        self.notify_restore(&result);
        result
    }

    async fn restore_known(&self, id: &BackupId) -> Result<BackupManifest> {
        let recorded = self.find(id)?;
        let path = self.config.backup_dir.join(&recorded.file_name);
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "Archive for backup {} is missing: {}",
                id,
                path.display()
            )));
        }

        if let Some(expected) = recorded.checksum.clone() {
            let checked = path.clone();
            let actual = tokio::task::spawn_blocking(move || file_sha256(&checked))
                .await
                .map_err(|e| Error::Storage(format!("Checksum aborted: {}", e)))??;
            if actual != expected {
                return Err(Error::Corruption(format!(
                    "Checksum mismatch for backup {}: expected {}, found {}",
                    id, expected, actual
                )));
            }
        }

        self.restore_archive(path).await
    }

    /// Restore an archive picked from outside the history.
    ///
    /// No checksum is available for such archives, so only the container and
    /// manifest are checked.
    pub async fn restore_from_path(&self, path: &Path) -> Result<BackupManifest> {
        let result = if path.is_file() {
            self.restore_archive(path.to_path_buf()).await
        } else {
            Err(Error::NotFound(format!("Archive not found: {}", path.display())))
        };
        self.notify_restore(&result);
        result
    }

    async fn restore_archive(&self, archive: PathBuf) -> Result<BackupManifest> {
        let staging_root = self.config.staging_dir();
        let store = self.store.clone();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || -> Result<BackupManifest> {
            fs::create_dir_all(&staging_root)?;
            // Removed when dropped, on success and on every error path.
            let staging = tempfile::Builder::new()
                .prefix("restore-")
                .tempdir_in(&staging_root)?;

            extract_archive(&archive, staging.path())?;
            let manifest = read_manifest(staging.path())?;
            info!("Restoring backup {} from {}", manifest.id, archive.display());

            for name in &manifest.includes {
                match Component::from_name(name) {
                    Some(Component::Store) => restore_store(store.as_ref(), staging.path())?,
                    Some(Component::Database) => restore_database(&config, staging.path())?,
                    Some(Component::Files) => restore_files(&config, staging.path())?,
                    None => warn!("Skipping unknown backup component '{}'", name),
                }
            }

            Ok(manifest)
        })
        .await
        .map_err(|e| Error::Storage(format!("Restore aborted: {}", e)))?
    }

    fn notify_restore(&self, result: &Result<BackupManifest>) {
        let notification = match result {
            Ok(manifest) => Notification::new(
                "Restore complete",
                format!("Backup {} restored", manifest.id),
            ),
            Err(e) => Notification::new("Restore failed", e.to_string())
                .with_urgency(Urgency::Critical),
        };
        notify_best_effort(self.notifier.as_ref(), notification);
    }

    /// Backup history, most recent first.
    pub fn list(&self) -> Result<Vec<BackupManifest>> {
        self.load_history()
    }

    /// Remove a backup's archive file and history entry.
    ///
    /// # Errors
    /// - `NotFound` if `id` is not in the history
    pub fn delete(&self, id: &BackupId) -> Result<()> {
        let removed = {
            let _guard = self.lock_history();
            let mut history = self.load_history()?;
            let index = history
                .iter()
                .position(|m| &m.id == id)
                .ok_or_else(|| Error::NotFound(format!("Backup not found: {}", id)))?;
            let removed = history.remove(index);
            self.save_history(&history)?;
            removed
        };

        let path = self.config.backup_dir.join(&removed.file_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Archive for backup {} was already gone", id);
            }
            Err(e) => return Err(e.into()),
        }

        info!("Deleted backup {}", id);
        Ok(())
    }

    /// Check a recorded backup without modifying anything.
    ///
    /// # Errors
    /// - `NotFound` if `id` is not in the history
    pub async fn validate(&self, id: &BackupId) -> Result<ValidationReport> {
        let recorded = self.find(id)?;
        let path = self.config.backup_dir.join(&recorded.file_name);
        let id = id.clone();

        tokio::task::spawn_blocking(move || {
            if !path.is_file() {
                return ValidationReport {
                    id,
                    file_exists: false,
                    checksum_matches: None,
                    manifest_readable: false,
                };
            }

            let checksum_matches = recorded.checksum.as_ref().map(|expected| {
                file_sha256(&path).is_ok_and(|actual| &actual == expected)
            });
            let manifest_readable = read_embedded_manifest(&path).is_ok_and(|m| m.id == id);

            ValidationReport {
                id,
                file_exists: true,
                checksum_matches,
                manifest_readable,
            }
        })
        .await
        .map_err(|e| Error::Storage(format!("Validation aborted: {}", e)))
    }

    fn find(&self, id: &BackupId) -> Result<BackupManifest> {
        self.load_history()?
            .into_iter()
            .find(|m| &m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Backup not found: {}", id)))
    }

    fn store_dump(&self) -> Result<Entries> {
        let mut entries = self.store.snapshot()?;
        entries.retain(|key, _| !key.starts_with(BACKUP_NAMESPACE));
        Ok(entries)
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, ()> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_history(&self) -> Result<Vec<BackupManifest>> {
        self.store.get_or(HISTORY_KEY, Vec::new())
    }

    fn save_history(&self, history: &[BackupManifest]) -> Result<()> {
        self.store.set_typed(HISTORY_KEY, history)
    }
}

fn as_storage_error(manifest: &BackupManifest, err: Error) -> Error {
    match err {
        Error::Storage(_) => err,
        other => Error::Storage(format!("Failed to create backup {}: {}", manifest.id, other)),
    }
}

fn remove_file_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Replace the store's non-backup keys with the archived dump.
fn restore_store(store: &dyn KeyValueStore, staging: &Path) -> Result<()> {
    let dump = read_store_dump(staging)?;

    let mut entries: Entries = store
        .snapshot()?
        .into_iter()
        .filter(|(key, _)| key.starts_with(BACKUP_NAMESPACE))
        .collect();
    entries.extend(
        dump.into_iter()
            .filter(|(key, _)| !key.starts_with(BACKUP_NAMESPACE)),
    );

    let count = entries.len();
    store.replace(entries)?;
    debug!("Restored store ({} keys)", count);
    Ok(())
}

fn restore_database(config: &BackupConfig, staging: &Path) -> Result<()> {
    let Some(target) = &config.database_path else {
        warn!("Archive contains a database but none is configured; skipping");
        return Ok(());
    };

    let source_dir = staging.join(DATABASE_DIR);
    let source = fs::read_dir(&source_dir)
        .map_err(|e| Error::Corruption(format!("{} is unreadable: {}", DATABASE_DIR, e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| path.is_file())
        .ok_or_else(|| Error::Corruption(format!("{} holds no database file", DATABASE_DIR)))?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source, target)?;
    debug!("Restored database to {}", target.display());
    Ok(())
}

fn restore_files(config: &BackupConfig, staging: &Path) -> Result<()> {
    let Some(target) = &config.user_files_dir else {
        warn!("Archive contains user files but no directory is configured; skipping");
        return Ok(());
    };

    let source = staging.join(FILES_DIR);
    if !source.is_dir() {
        return Err(Error::Corruption(format!("{} directory is missing", FILES_DIR)));
    }

    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    copy_dir(&source, target)?;
    debug!("Restored user files to {}", target.display());
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
