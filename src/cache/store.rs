//! Content-addressed artifact store with atomic publish.
//!
//! Artifacts are opaque byte blobs stored one file per key. Writers go through
//! a temporary file in the same directory that is renamed into place, so
//! readers see either the previous artifact or the complete new one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GeoError, Result};

const TEMP_SUFFIX: &str = ".tmp";

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| GeoError::CacheDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read an artifact; `Ok(None)` if it was never published.
    pub fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the artifact stored under `name`.
    pub fn publish(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.path_for(name);
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.root)?;

        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| GeoError::Io(e.error))?;

        debug!("Published {} ({} bytes)", target.display(), bytes.len());
        Ok(target)
    }

    /// Names of all published artifacts (temporary files excluded).
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io) => GeoError::Io(io),
                None => GeoError::Io(std::io::Error::other("cache directory loop")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !is_temp_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove leftover temporary files from interrupted writes.
    pub fn remove_stale_temps(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let Ok(entry) = entry else { continue };
            let is_temp = entry.file_name().to_str().is_some_and(is_temp_name);
            if entry.file_type().is_file() && is_temp {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Could not remove {}: {}", entry.path().display(), e),
                }
            }
        }
        Ok(removed)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}
