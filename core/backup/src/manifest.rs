//! Backup manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use keepsync_common::BackupId;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Name of the manifest entry at the root of every archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// What triggered a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Manual,
    Auto,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Manual => write!(f, "manual"),
            BackupKind::Auto => write!(f, "auto"),
        }
    }
}

/// A piece of application state that can be embedded in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Dump of the key-value store.
    Store,
    /// The application database file.
    Database,
    /// The user-files directory tree.
    Files,
}

impl Component {
    /// Name recorded in the manifest's `includes` list.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Store => "store",
            Component::Database => "database",
            Component::Files => "files",
        }
    }

    /// Parse a manifest include name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "store" => Some(Component::Store),
            "database" => Some(Component::Database),
            "files" => Some(Component::Files),
            _ => None,
        }
    }
}

/// Description of one backup.
///
/// The copy embedded in the archive has `checksum` and `size_bytes` unset;
/// the copy kept in the backup history carries both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub format_version: u32,
    pub id: BackupId,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub platform: String,
    /// Component names actually embedded. Kept as strings so archives from
    /// newer versions still parse.
    pub includes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub file_name: String,
}

impl BackupManifest {
    /// Manifest shell for a backup that is about to be built.
    pub fn new(id: BackupId, kind: BackupKind, created_at: DateTime<Utc>, platform: &str) -> Self {
        let file_name = format!("{}.tar.gz", id);
        Self {
            format_version: MANIFEST_VERSION,
            id,
            kind,
            created_at,
            platform: platform.to_string(),
            includes: Vec::new(),
            checksum: None,
            size_bytes: None,
            file_name,
        }
    }

    /// Record that `component` is embedded.
    pub fn include(&mut self, component: Component) {
        let name = component.as_str();
        if !self.includes.iter().any(|c| c == name) {
            self.includes.push(name.to_string());
        }
    }

    /// Whether `component` is listed in `includes`.
    pub fn includes(&self, component: Component) -> bool {
        self.includes.iter().any(|c| c == component.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> BackupManifest {
        BackupManifest::new(
            BackupId::new("manual-1").unwrap(),
            BackupKind::Manual,
            Utc::now(),
            "linux",
        )
    }

    #[test]
    fn test_new_manifest() {
        let manifest = shell();
        assert_eq!(manifest.format_version, MANIFEST_VERSION);
        assert_eq!(manifest.file_name, "manual-1.tar.gz");
        assert!(manifest.includes.is_empty());
        assert!(manifest.checksum.is_none());
    }

    #[test]
    fn test_include_is_idempotent() {
        let mut manifest = shell();
        manifest.include(Component::Store);
        manifest.include(Component::Store);
        manifest.include(Component::Files);

        assert_eq!(manifest.includes, vec!["store", "files"]);
        assert!(manifest.includes(Component::Files));
        assert!(!manifest.includes(Component::Database));
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let json = serde_json::to_value(shell()).unwrap();
        assert!(json.get("checksum").is_none());
        assert!(json.get("sizeBytes").is_none());
        assert_eq!(json["kind"], "manual");
        assert_eq!(json["fileName"], "manual-1.tar.gz");
    }

    #[test]
    fn test_unknown_include_names_parse() {
        let mut json = serde_json::to_value(shell()).unwrap();
        json["includes"] = serde_json::json!(["store", "thumbnails"]);
        let manifest: BackupManifest = serde_json::from_value(json).unwrap();

        assert_eq!(Component::from_name(&manifest.includes[0]), Some(Component::Store));
        assert_eq!(Component::from_name(&manifest.includes[1]), None);
    }
}
