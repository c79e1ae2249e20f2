//! Application configuration file.
//!
//! A single JSON document with one section per component. Every field has a
//! default, so a missing file, a missing section and a missing field all
//! fall back to the built-in values. Durations are given in seconds.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use keepsync_backup::BackupConfig;
use keepsync_common::{Error, Result};
use keepsync_sync::connectivity::DEFAULT_PROBE_ENDPOINT;
use keepsync_sync::{BackoffPolicy, ProberConfig, QueueConfig, SyncMode};

const APP_DIR: &str = "keepsync";
const CONFIG_FILE: &str = "config.json";
const STORE_FILE: &str = "store.json";

const SECS_PER_DAY: u64 = 24 * 60 * 60;
/// Upper bound on `queue.retentionDays`.
pub const MAX_RETENTION_DAYS: u64 = 36_500;
/// Upper bound on every timer period, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 365 * SECS_PER_DAY;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Directory for the store and, unless overridden, backups.
    pub data_dir: Option<PathBuf>,
    pub queue: QueueSection,
    pub prober: ProberSection,
    pub backup: BackupSection,
    pub pool: PoolSection,
    pub sync: SyncSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSection {
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub retention_days: u64,
    pub auto_sync: bool,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retries: 5,
            base_delay_secs: 1,
            max_delay_secs: 32,
            batch_size: 10,
            concurrency_limit: 3,
            retention_days: 7,
            auto_sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProberSection {
    pub endpoint: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ProberSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_PROBE_ENDPOINT.to_string(),
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupSection {
    /// Defaults to `<dataDir>/backups`.
    pub dir: Option<PathBuf>,
    pub max_backups: usize,
    pub offload_threshold_bytes: u64,
    pub allow_offload: bool,
    pub database_path: Option<PathBuf>,
    pub user_files_dir: Option<PathBuf>,
    /// Auto-backup is off unless an interval is set.
    pub auto_interval_secs: Option<u64>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_backups: 10,
            offload_threshold_bytes: keepsync_backup::engine::DEFAULT_OFFLOAD_THRESHOLD,
            allow_offload: true,
            database_path: None,
            user_files_dir: None,
            auto_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSection {
    pub size: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self { size: 2 }
    }
}

/// Scheduler mode names accepted in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncModeSetting {
    Manual,
    OnReconnect,
    Periodic,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSection {
    pub mode: SyncModeSetting,
    /// Period for `periodic` and `hybrid` modes.
    pub interval_secs: u64,
    /// Endpoint receiving queued operations. No adapter is installed without it.
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            mode: SyncModeSetting::OnReconnect,
            interval_secs: 300,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// `<platform data dir>/keepsync/config.json`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load the configuration at `path`. A missing file yields the defaults.
    ///
    /// # Errors
    /// - `Io` if the file exists but cannot be read
    /// - `Serialization` if it is not valid configuration JSON
    /// - `InvalidInput` if a value is out of range
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| Error::InvalidInput(format!("{} must be greater than zero", name));
        let too_large = |name: &str, max: u64| {
            Error::InvalidInput(format!("{} must be at most {}", name, max))
        };
        if self.queue.batch_size == 0 {
            return Err(zero("queue.batchSize"));
        }
        if self.queue.concurrency_limit == 0 {
            return Err(zero("queue.concurrencyLimit"));
        }
        if self.pool.size == 0 {
            return Err(zero("pool.size"));
        }
        if self.prober.interval_secs == 0 {
            return Err(zero("prober.intervalSecs"));
        }
        if self.backup.max_backups == 0 {
            return Err(zero("backup.maxBackups"));
        }
        if self.backup.auto_interval_secs == Some(0) {
            return Err(zero("backup.autoIntervalSecs"));
        }
        if matches!(self.sync.mode, SyncModeSetting::Periodic | SyncModeSetting::Hybrid)
            && self.sync.interval_secs == 0
        {
            return Err(zero("sync.intervalSecs"));
        }
        if self.prober.timeout_secs == 0 {
            return Err(zero("prober.timeoutSecs"));
        }
        if self.sync.webhook_timeout_secs == 0 {
            return Err(zero("sync.webhookTimeoutSecs"));
        }
        if self.queue.retention_days > MAX_RETENTION_DAYS {
            return Err(too_large("queue.retentionDays", MAX_RETENTION_DAYS));
        }
        let periods = [
            ("prober.intervalSecs", Some(self.prober.interval_secs)),
            ("sync.intervalSecs", Some(self.sync.interval_secs)),
            ("backup.autoIntervalSecs", self.backup.auto_interval_secs),
        ];
        for (name, secs) in periods {
            if secs.is_some_and(|secs| secs > MAX_INTERVAL_SECS) {
                return Err(too_large(name, MAX_INTERVAL_SECS));
            }
        }
        Ok(())
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR)))
            .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
    }

    /// Path of the persisted key-value store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join(STORE_FILE)
    }

    /// How long finished operations are kept. `None` when `retentionDays`
    /// does not fit in a `Duration` of seconds.
    pub fn retention(&self) -> Option<Duration> {
        self.queue
            .retention_days
            .checked_mul(SECS_PER_DAY)
            .map(Duration::from_secs)
    }

    /// Queue settings. Call [`validate`](Self::validate) first: an
    /// unrepresentable retention falls back to the default.
    pub fn queue_config(&self) -> QueueConfig {
        let q = &self.queue;
        let defaults = QueueConfig::default();
        let retention = self.retention().unwrap_or(defaults.retention);
        defaults
            .with_max_queue_size(q.max_queue_size)
            .with_max_retries(q.max_retries)
            .with_backoff(
                BackoffPolicy::default()
                    .with_base_delay(Duration::from_secs(q.base_delay_secs))
                    .with_max_delay(Duration::from_secs(q.max_delay_secs)),
            )
            .with_batch_size(q.batch_size)
            .with_concurrency_limit(q.concurrency_limit)
            .with_retention(retention)
            .with_auto_sync(q.auto_sync)
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig::default()
            .with_endpoint(self.prober.endpoint.clone())
            .with_interval(Duration::from_secs(self.prober.interval_secs))
            .with_timeout(Duration::from_secs(self.prober.timeout_secs))
    }

    pub fn backup_config(&self) -> BackupConfig {
        let b = &self.backup;
        let dir = b.dir.clone().unwrap_or_else(|| self.data_dir().join("backups"));
        let mut config = BackupConfig::new(dir)
            .with_max_backups(b.max_backups)
            .with_offload_threshold(b.offload_threshold_bytes)
            .with_allow_offload(b.allow_offload);
        if let Some(path) = &b.database_path {
            config = config.with_database_path(path);
        }
        if let Some(dir) = &b.user_files_dir {
            config = config.with_user_files_dir(dir);
        }
        config
    }

    pub fn sync_mode(&self) -> SyncMode {
        let interval = Duration::from_secs(self.sync.interval_secs);
        match self.sync.mode {
            SyncModeSetting::Manual => SyncMode::Manual,
            SyncModeSetting::OnReconnect => SyncMode::OnReconnect,
            SyncModeSetting::Periodic => SyncMode::Periodic { interval },
            SyncModeSetting::Hybrid => SyncMode::Hybrid { interval },
        }
    }

    /// Auto-backup period, if enabled.
    pub fn auto_backup_interval(&self) -> Option<Duration> {
        self.backup.auto_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());

        let queue = config.queue_config();
        assert_eq!(queue.max_queue_size, 10_000);
        assert_eq!(queue.max_retries, 5);
        assert_eq!(queue.backoff.base_delay, Duration::from_secs(1));
        assert_eq!(queue.backoff.max_delay, Duration::from_secs(32));
        assert_eq!(queue.retention, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.prober_config().timeout, Duration::from_secs(5));
        assert_eq!(config.sync_mode(), SyncMode::OnReconnect);
        assert!(config.auto_backup_interval().is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "dataDir": "/tmp/keepsync-test",
                "queue": { "maxRetries": 2 },
                "sync": { "mode": "hybrid", "intervalSecs": 60 },
                "backup": { "maxBackups": 3, "autoIntervalSecs": 3600 }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(
            config.sync_mode(),
            SyncMode::Hybrid {
                interval: Duration::from_secs(60)
            }
        );
        assert_eq!(config.auto_backup_interval(), Some(Duration::from_secs(3600)));

        let backup = config.backup_config();
        assert_eq!(backup.max_backups, 3);
        assert_eq!(backup.backup_dir, PathBuf::from("/tmp/keepsync-test/backups"));
        assert_eq!(config.store_path(), PathBuf::from("/tmp/keepsync-test/store.json"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        fs::write(&path, r#"{ "pool": { "size": 0 } }"#).unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::InvalidInput(_))));

        fs::write(&path, r#"{ "sync": { "mode": "sometimes" } }"#).unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let mut config = AppConfig::default();
        config.prober.timeout_secs = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.sync.webhook_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_oversized_retention_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        fs::write(
            &path,
            format!(r#"{{ "queue": {{ "retentionDays": {} }} }}"#, u64::MAX),
        )
        .unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.queue.retention_days = MAX_RETENTION_DAYS + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        config.queue.retention_days = MAX_RETENTION_DAYS;
        config.validate().unwrap();
        assert_eq!(
            config.queue_config().retention,
            Duration::from_secs(MAX_RETENTION_DAYS * SECS_PER_DAY)
        );
    }

    #[test]
    fn test_unrepresentable_retention_falls_back_to_default() {
        let mut config = AppConfig::default();
        config.queue.retention_days = u64::MAX;

        assert!(config.retention().is_none());
        assert_eq!(config.queue_config().retention, QueueConfig::default().retention);
    }

    #[test]
    fn test_oversized_intervals_are_rejected() {
        let mut config = AppConfig::default();
        config.backup.auto_interval_secs = Some(u64::MAX);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.sync.mode = SyncModeSetting::Periodic;
        config.sync.interval_secs = MAX_INTERVAL_SECS + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.sync.webhook_url = Some("http://localhost:9000/ops".to_string());
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }
}
