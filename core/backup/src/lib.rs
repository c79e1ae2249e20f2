//! Point-in-time backups of KeepSync application state.
//!
//! A backup is a gzip-compressed tar archive holding a manifest, a dump of
//! the key-value store and, when configured, the database file and the
//! user-files tree. Large builds are offloaded to a [`keepsync_pool::TaskPool`];
//! every finished archive is checksummed and recorded in the backup history.

pub mod archive;
pub mod checksum;
pub mod engine;
pub mod manifest;
pub mod schedule;

pub use archive::{ArchiveBuilder, ArchiveJob};
pub use checksum::file_sha256;
pub use engine::{
    ArchiveEngine, BackupConfig, CreateOptions, ValidationReport, BACKUP_NAMESPACE, HISTORY_KEY,
};
pub use manifest::{BackupKind, BackupManifest, Component, MANIFEST_FILE, MANIFEST_VERSION};
pub use schedule::AutoBackup;
