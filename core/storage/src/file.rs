//! JSON file backed store.

use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::store::{Entries, KeyValueStore};
use keepsync_common::{Error, Result};

/// Store persisted as a single JSON document on disk.
///
/// The whole document is rewritten on every change. Writes go to a sibling
/// temporary file which is then renamed over the original, so a crash
/// leaves either the old or the new document, never a torn one.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories if needed.
    ///
    /// # Postconditions
    /// - Existing contents are loaded into memory
    /// - An unparseable document is moved aside to `<path>.corrupt` and the
    ///   store starts empty
    ///
    /// # Errors
    /// - Permission denied or other I/O errors
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<Entries>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    let mut aside = path.clone().into_os_string();
                    aside.push(".corrupt");
                    let aside = PathBuf::from(aside);
                    warn!(
                        "Store file {} is unreadable ({}), moving it to {}",
                        path.display(),
                        e,
                        aside.display()
                    );
                    fs::rename(&path, &aside)?;
                    Entries::new()
                }
            }
        } else {
            Entries::new()
        };

        debug!("Opened store {} with {} keys", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Storage("File store lock poisoned".to_string())
}

impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let previous = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn snapshot(&self) -> Result<Entries> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.clone())
    }

    fn replace(&self, new_entries: Entries) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        self.persist(&new_entries)?;
        *entries = new_entries;
        Ok(())
    }
}
