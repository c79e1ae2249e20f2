//! Archive container codec.
//!
//! Layout of a `.tar.gz` backup:
//!
//! ```text
//! manifest.json        embedded manifest (no checksum)
//! store.json           key-value store dump
//! database/<file>      database file, when included
//! files/...            user-files tree, when included
//! ```

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use keepsync_common::{Error, Result};
use keepsync_pool::{ProgressReporter, TaskHandler};
use keepsync_storage::Entries;

use crate::manifest::{BackupManifest, Component, MANIFEST_FILE};

/// Archive entry holding the store dump.
pub const STORE_FILE: &str = "store.json";
/// Archive directory holding the database file.
pub const DATABASE_DIR: &str = "database";
/// Archive directory holding the user-files tree.
pub const FILES_DIR: &str = "files";

/// Everything needed to build one archive.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    /// Manifest embedded as `manifest.json`.
    pub manifest: BackupManifest,
    /// Store entries written to `store.json`.
    pub store: Entries,
    /// Database file to embed.
    pub database: Option<PathBuf>,
    /// User-files directory to embed.
    pub files: Option<PathBuf>,
    /// Archive file to create.
    pub dest: PathBuf,
}

impl ArchiveJob {
    /// Estimated uncompressed payload size in bytes.
    pub fn estimated_size(&self) -> Result<u64> {
        let mut total = serde_json::to_vec(&self.store)?.len() as u64;
        if let Some(database) = &self.database {
            total += fs::metadata(database)?.len();
        }
        if let Some(files) = &self.files {
            total += dir_size(files)?;
        }
        Ok(total)
    }
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mtime: u64,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    builder.append_data(&mut header, name, data)
}

/// Write the archive described by `job`, streaming through gzip.
///
/// `on_component` is called as each component starts.
///
/// # Postconditions
/// - `job.dest` is fully written and synced when this returns `Ok`
/// - Returns the archive size in bytes
///
/// # Errors
/// - I/O errors while reading sources or writing the archive. The partial
///   file is left for the caller to remove.
pub fn build_archive(job: &ArchiveJob, on_component: &dyn Fn(Component)) -> Result<u64> {
    let file = File::create(&job.dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mtime = job.manifest.created_at.timestamp().max(0) as u64;

    let manifest = serde_json::to_vec_pretty(&job.manifest)?;
    append_bytes(&mut builder, MANIFEST_FILE, &manifest, mtime)?;

    on_component(Component::Store);
    let store = serde_json::to_vec(&job.store)?;
    append_bytes(&mut builder, STORE_FILE, &store, mtime)?;

    if let Some(database) = &job.database {
        on_component(Component::Database);
        let name = database.file_name().ok_or_else(|| {
            Error::InvalidInput(format!("Database path has no file name: {}", database.display()))
        })?;
        builder.append_path_with_name(database, Path::new(DATABASE_DIR).join(name))?;
    }

    if let Some(files) = &job.files {
        on_component(Component::Files);
        builder.append_dir_all(FILES_DIR, files)?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    let size = file.metadata()?.len();
    debug!("Wrote archive {} ({} bytes)", job.dest.display(), size);
    Ok(size)
}

/// Unpack `archive` into `dest`.
///
/// # Errors
/// - `Corruption` if the file is not a readable gzip-compressed tar
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.unpack(dest).map_err(|e| {
        Error::Corruption(format!("Failed to extract {}: {}", archive.display(), e))
    })
}

/// Parse `manifest.json` from an extracted archive directory.
///
/// # Errors
/// - `Corruption` if the manifest is absent or does not parse
pub fn read_manifest(dir: &Path) -> Result<BackupManifest> {
    let bytes = match fs::read(dir.join(MANIFEST_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::Corruption(format!("{} is missing", MANIFEST_FILE)));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Corruption(format!("{} does not parse: {}", MANIFEST_FILE, e)))
}

/// Parse `store.json` from an extracted archive directory.
///
/// # Errors
/// - `Corruption` if the dump is absent or does not parse
pub fn read_store_dump(dir: &Path) -> Result<Entries> {
    let bytes = fs::read(dir.join(STORE_FILE))
        .map_err(|e| Error::Corruption(format!("{} is unreadable: {}", STORE_FILE, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Corruption(format!("{} does not parse: {}", STORE_FILE, e)))
}

/// Read the embedded manifest straight from an archive without unpacking it.
///
/// # Errors
/// - `Corruption` if the archive is unreadable or has no valid manifest
pub fn read_embedded_manifest(archive: &Path) -> Result<BackupManifest> {
    let corrupt = |e: io::Error| {
        Error::Corruption(format!("Failed to read {}: {}", archive.display(), e))
    };

    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    for entry in tar.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if entry.path().map_err(corrupt)?.as_ref() != Path::new(MANIFEST_FILE) {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(corrupt)?;
        return serde_json::from_slice(&bytes).map_err(|e| {
            Error::Corruption(format!("{} does not parse: {}", MANIFEST_FILE, e))
        });
    }

    Err(Error::Corruption(format!("{} is missing", MANIFEST_FILE)))
}

/// Task pool handler that builds archives off the async runtime.
///
/// Reports each component as it starts and returns the archive size.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveBuilder;

impl TaskHandler for ArchiveBuilder {
    type Input = ArchiveJob;
    type Output = u64;
    type Progress = Component;

    fn run(&self, job: ArchiveJob, progress: &ProgressReporter<Component>) -> Result<u64> {
        build_archive(&job, &|component| progress.report(component))
    }
}
