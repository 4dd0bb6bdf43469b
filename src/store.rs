//! Bookkeeping for the capture output directory.
//!
//! The capture program drops one artifact per round into this directory. We only ever
//! need the latest two, so older ones are evicted before loading. Ordering is by creation
//! time (falling back to modification time on filesystems without birth times), with the
//! path as a secondary key so ties resolve the same way on every listing.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::{matrix::SampleMatrix, Error, Result, ARTIFACT_EXTENSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub created: SystemTime,
}

impl ArtifactFile {
    fn from_entry(entry: &fs::DirEntry) -> Result<Self> {
        let meta = entry.metadata()?;
        let created = meta.created().or_else(|_| meta.modified())?;
        Ok(Self {
            path: entry.path(),
            created,
        })
    }

    pub fn created_utc(&self) -> DateTime<Utc> {
        self.created.into()
    }

    fn has_extension(&self, ext: &str) -> bool {
        self.path.extension().map_or(false, |e| e == ext)
    }
}

/// Sort oldest first, breaking timestamp ties by path
pub fn order_by_age(files: &mut [ArtifactFile]) {
    files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
}

/// The two newest artifacts, decoded
#[derive(Debug)]
pub struct LatestPair {
    pub new: SampleMatrix,
    pub old: SampleMatrix,
    pub new_file: ArtifactFile,
    pub old_file: ArtifactFile,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete the directory (if present) and recreate it empty. Safe to call repeatedly.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir)?;
        debug!(dir = %self.dir.display(), "Capture directory reset");
        Ok(())
    }

    /// Every entry in the directory, oldest first
    pub fn list(&self) -> Result<Vec<ArtifactFile>> {
        let mut files = fs::read_dir(&self.dir)?
            .map(|entry| ArtifactFile::from_entry(&entry?))
            .collect::<Result<Vec<_>>>()?;
        order_by_age(&mut files);
        Ok(files)
    }

    /// Evict the oldest entries until at most `max_kept` remain, returning what was removed
    pub fn enforce_retention(&self, max_kept: usize) -> Result<Vec<PathBuf>> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(max_kept);
        let mut removed = Vec::with_capacity(excess);
        for file in files.into_iter().take(excess) {
            if file.path.is_dir() {
                fs::remove_dir_all(&file.path)?;
            } else {
                fs::remove_file(&file.path)?;
            }
            debug!(path = %file.path.display(), "Evicted artifact");
            removed.push(file.path);
        }
        Ok(removed)
    }

    /// Decode the newest and second newest `.bin` artifacts
    pub fn load_latest_pair(&self) -> Result<LatestPair> {
        let mut candidates: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|f| f.has_extension(ARTIFACT_EXTENSION))
            .collect();
        if candidates.len() < 2 {
            return Err(Error::InsufficientArtifacts {
                found: candidates.len(),
            });
        }
        // Already sorted, so the tail holds the newest two
        let new_file = candidates.pop().ok_or(Error::InsufficientArtifacts { found: 0 })?;
        let old_file = candidates.pop().ok_or(Error::InsufficientArtifacts { found: 1 })?;
        let new = SampleMatrix::load(&new_file.path)?;
        let old = SampleMatrix::load(&old_file.path)?;
        info!(
            new = %new_file.path.display(),
            old = %old_file.path.display(),
            "Loaded artifacts"
        );
        Ok(LatestPair {
            new,
            old,
            new_file,
            old_file,
        })
    }

    /// Reset the directory when the returned guard goes out of scope
    pub fn guard(&self) -> ArtifactDirGuard {
        ArtifactDirGuard {
            store: self.clone(),
        }
    }
}

/// Cleans the capture directory on every exit path of whoever holds it
pub struct ArtifactDirGuard {
    store: ArtifactStore,
}

impl Drop for ArtifactDirGuard {
    fn drop(&mut self) {
        match self.store.reset() {
            Ok(()) => info!(dir = %self.store.dir.display(), "Cleaned capture directory"),
            Err(e) => error!("Failed to clean capture directory: {e}"),
        }
    }
}
