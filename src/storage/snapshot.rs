//! On-disk snapshot layout.
//!
//! ```text
//! <location>/CURRENT                     name of the live snapshot directory
//! <location>/snapshot-<gen>/manifest.json
//! <location>/snapshot-<gen>/fragments.redb
//! <location>/.staging-<gen>-<pid>-<n>/   write in progress, never read
//! ```
//!
//! A snapshot is written into a staging directory, renamed into place, and
//! only then published by atomically replacing `CURRENT`. Readers follow
//! `CURRENT`, so they see either the previous snapshot or the new one.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const CURRENT_FILE: &str = "CURRENT";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const FRAGMENTS_FILE: &str = "fragments.redb";
pub const FORMAT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const STAGING_PREFIX: &str = ".staging-";

/// Age after which an unpublished staging directory is considered abandoned
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(600);

/// Self-describing header stored next to the fragment table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    /// Embedding model that produced the vectors
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub fragment_count: usize,
    /// Unix timestamp of the write
    pub created_at: u64,
}

impl Manifest {
    pub fn new(
        generation: u64,
        model: Option<String>,
        dimensions: Option<usize>,
        fragment_count: usize,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            generation,
            model,
            dimensions,
            fragment_count,
            created_at: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| Error::Database(format!("Failed to parse manifest: {}", e)))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::Database(format!(
                "Unsupported index format version {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::PersistenceFailure(format!("Failed to serialize manifest: {}", e)))?;
        write_synced(path, &json)
    }
}

pub fn snapshot_name(generation: u64) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, generation)
}

/// Generation encoded in a `snapshot-<gen>` directory name
pub fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok()
}

/// The snapshot directory `CURRENT` points at, if any.
///
/// A writer may publish and collect the old snapshot between reading
/// `CURRENT` and checking its target, so a missing target is only an
/// error once `CURRENT` stops moving.
pub fn current_snapshot(location: &Path) -> Result<Option<PathBuf>> {
    let mut previous: Option<String> = None;
    loop {
        let Some(name) = read_current(location)? else {
            return Ok(None);
        };
        let dir = location.join(&name);
        if dir.is_dir() {
            return Ok(Some(dir));
        }
        if previous.as_deref() == Some(name.as_str()) {
            return Err(Error::Database(format!(
                "CURRENT points at missing snapshot {}",
                dir.display()
            )));
        }
        previous = Some(name);
    }
}

fn read_current(location: &Path) -> Result<Option<String>> {
    let current = location.join(CURRENT_FILE);
    let name = match fs::read_to_string(&current) {
        Ok(name) => name,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let name = name.trim();
    if parse_generation(name).is_none() {
        return Err(Error::Database(format!(
            "CURRENT in {} names an invalid snapshot '{}'",
            location.display(),
            name
        )));
    }
    Ok(Some(name.to_string()))
}

/// Generation of the live snapshot, if one has been published
pub fn current_generation(location: &Path) -> Result<Option<u64>> {
    Ok(current_snapshot(location)?
        .and_then(|dir| dir.file_name().and_then(|n| n.to_str()).and_then(parse_generation)))
}

/// First generation not used by any snapshot on disk.
///
/// Published, orphaned and garbage snapshots all count, so a new snapshot
/// never lands on an existing directory.
pub fn next_generation(location: &Path) -> Result<u64> {
    let entries = match fs::read_dir(location) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e.into()),
    };
    let newest = entries
        .flatten()
        .filter_map(|entry| parse_generation(&entry.file_name().to_string_lossy()))
        .max()
        .unwrap_or(0);
    Ok(newest + 1)
}

/// Scoped write area for one snapshot.
///
/// Dropping it without [`StagingDir::commit`] removes everything written.
pub struct StagingDir {
    location: PathBuf,
    path: PathBuf,
    generation: u64,
    committed: bool,
}

impl StagingDir {
    pub fn create(location: &Path, generation: u64) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let path = location.join(format!(
            "{}{}-{}-{}",
            STAGING_PREFIX,
            generation,
            std::process::id(),
            nanos
        ));
        let prepare = || -> std::io::Result<()> {
            fs::create_dir_all(location)?;
            fs::create_dir(&path)
        };
        prepare().map_err(|e| persist_err("create staging directory", &path, e))?;

        Ok(Self {
            location: location.to_path_buf(),
            path,
            generation,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged files into place and publish them through `CURRENT`.
    ///
    /// Fails without touching anything if the target snapshot already exists.
    pub fn commit(mut self) -> Result<PathBuf> {
        let name = snapshot_name(self.generation);
        let target = self.location.join(&name);

        if target.exists() {
            return Err(Error::PersistenceFailure(format!(
                "Snapshot {} already exists; another writer published concurrently",
                target.display()
            )));
        }
        fs::rename(&self.path, &target).map_err(|e| persist_err("rename staging directory", &target, e))?;
        // From here on a failure must clean up the renamed directory instead.
        self.path = target.clone();
        sync_dir(&self.location);

        let tmp = self.location.join(format!("{}.{}.tmp", CURRENT_FILE, self.generation));
        write_synced(&tmp, name.as_bytes())?;
        let current = self.location.join(CURRENT_FILE);
        if let Err(e) = fs::rename(&tmp, &current) {
            let _ = fs::remove_file(&tmp);
            return Err(persist_err("publish", &current, e));
        }
        sync_dir(&self.location);

        self.committed = true;
        debug!("Published snapshot {}", target.display());
        Ok(target)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.committed || !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Failed to clean up {}: {}", self.path.display(), e);
        }
    }
}

/// Remove snapshots older than the live one and staging directories
/// untouched for `stale_after`.
///
/// Newer snapshots and recent staging directories may belong to another
/// writer that has not published yet, so they are left alone.
pub fn collect_garbage(location: &Path, live_generation: u64, stale_after: Duration) {
    let entries = match fs::read_dir(location) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list {}: {}", location.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let stale = match parse_generation(&name) {
            Some(generation) => generation < live_generation,
            None if name.starts_with(STAGING_PREFIX) => entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= stale_after),
            None => false,
        };
        if stale {
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("Failed to remove old snapshot {}: {}", entry.path().display(), e);
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    write().map_err(|e| persist_err("write", path, e))
}

/// Flush directory entries; not every platform allows opening a directory
fn sync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

fn persist_err(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::PersistenceFailure(format!("Failed to {} {}: {}", action, path.display(), e))
}
