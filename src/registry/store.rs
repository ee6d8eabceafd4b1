// SPDX-License-Identifier: Apache-2.0

//! JSON file registry with atomic replacement.
//!
//! The whole document is rewritten on every commit: serialize to a temp file
//! in the same directory, fsync it, rename it over the live file, then fsync
//! the directory. A crash at any point leaves either the previous or the new
//! document on disk.

use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::schema::{FileState, REGISTRY_VERSION, RegistryDocument};
use crate::error::{Error, Result};
use crate::event::{Checkpoint, CommitSet};
use crate::input::FileId;

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Move an unreadable registry aside and start empty instead of failing.
    pub start_fresh_on_corruption: bool,
    /// Drop finished entries not seen for this long, at load and then
    /// periodically as batches are committed.
    pub clean_finished_after: Option<Duration>,
}

/// Longest gap between runtime sweeps of finished entries.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Registry {
    /// `None` keeps everything in memory
    path: Option<PathBuf>,
    files: HashMap<FileId, FileState>,
    dirty: bool,
    clean_finished_after: Option<Duration>,
    last_prune: Instant,
}

impl Registry {
    /// Load the registry at `path`, creating it if missing, and write it back
    /// once so an unwritable location fails here rather than after the first
    /// delivery.
    pub fn open(path: impl AsRef<Path>, options: &RegistryOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = parent_dir(&path) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Registry(format!(
                    "failed to create registry directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
            remove_stale_temp_files(&path);
        }

        let doc = match load_document(&path) {
            Ok(doc) => doc,
            Err(e @ Error::RegistryCorrupt { .. }) if options.start_fresh_on_corruption => {
                let aside = sibling(&path, "corrupt");
                warn!(error = %e, moved_to = ?aside, "Registry unreadable, starting fresh");
                fs::rename(&path, &aside)?;
                RegistryDocument::default()
            }
            Err(e) => return Err(e),
        };

        let files = doc
            .files
            .into_values()
            .map(|state| (state.id(), state))
            .collect();

        let mut registry = Self {
            path: Some(path),
            files,
            dirty: true,
            clean_finished_after: options.clean_finished_after,
            last_prune: Instant::now(),
        };

        if let Some(age) = options.clean_finished_after {
            let pruned = registry.prune_finished(age);
            if pruned > 0 {
                info!(pruned, "Removed finished registry entries");
            }
        }

        registry.persist()?;
        Ok(registry)
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            files: HashMap::new(),
            dirty: false,
            clean_finished_after: None,
            last_prune: Instant::now(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, id: &FileId) -> Option<&FileState> {
        self.files.get(id)
    }

    pub fn snapshot(&self) -> HashMap<FileId, FileState> {
        self.files.clone()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether there are in-memory changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record `checkpoint` in memory. Positions only move forward; a stale
    /// checkpoint is ignored. Returns whether anything changed.
    pub fn apply(&mut self, id: FileId, checkpoint: &Checkpoint) -> bool {
        let now = Utc::now();
        match self.files.get_mut(&id) {
            Some(state) => {
                if !checkpoint.is_at_or_after(state.generation, state.offset) {
                    debug!(
                        file_id = %id,
                        stored = state.offset,
                        stored_generation = state.generation,
                        offered = checkpoint.offset,
                        offered_generation = checkpoint.generation,
                        "Ignoring checkpoint behind the registry"
                    );
                    return false;
                }
                state.path = checkpoint.path.clone();
                state.offset = checkpoint.offset;
                state.generation = checkpoint.generation;
                if checkpoint.fingerprint.is_some() {
                    state.fingerprint = checkpoint.fingerprint.clone();
                }
                state.last_seen = now;
                state.finished = false;
            }
            None => {
                self.files.insert(
                    id,
                    FileState {
                        dev: id.dev(),
                        ino: id.ino(),
                        path: checkpoint.path.clone(),
                        offset: checkpoint.offset,
                        generation: checkpoint.generation,
                        fingerprint: checkpoint.fingerprint.clone(),
                        last_seen: now,
                        finished: false,
                    },
                );
            }
        }
        self.dirty = true;
        true
    }

    pub fn mark_finished(&mut self, id: &FileId) -> bool {
        match self.files.get_mut(id) {
            Some(state) if !state.finished => {
                state.finished = true;
                state.last_seen = Utc::now();
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Apply and persist a single checkpoint.
    pub fn commit(&mut self, id: FileId, checkpoint: &Checkpoint) -> Result<bool> {
        let changed = self.apply(id, checkpoint);
        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Apply an acknowledged batch's positions and finished marks, then
    /// persist once. Returns how many identities advanced.
    pub fn commit_batch(&mut self, commits: &CommitSet, finished: &[FileId]) -> Result<usize> {
        let mut advanced = 0;
        for (id, checkpoint) in commits.iter() {
            if self.apply(*id, checkpoint) {
                advanced += 1;
            }
        }
        for id in finished {
            self.mark_finished(id);
        }
        self.prune_if_due();
        self.persist()?;
        Ok(advanced)
    }

    /// Sweep finished entries on the commit path so a long-running process
    /// does not rewrite every file it has ever seen on each commit.
    fn prune_if_due(&mut self) {
        let Some(age) = self.clean_finished_after else {
            return;
        };
        if self.last_prune.elapsed() < age.min(PRUNE_INTERVAL) {
            return;
        }
        self.last_prune = Instant::now();
        let pruned = self.prune_finished(age);
        if pruned > 0 {
            debug!(pruned, remaining = self.files.len(), "Removed finished registry entries");
        }
    }

    /// Write pending changes to disk. A failed write leaves the registry dirty
    /// so the next call tries again.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.path.as_ref() else {
            self.dirty = false;
            return Ok(());
        };

        let doc = RegistryDocument {
            version: REGISTRY_VERSION,
            files: self
                .files
                .values()
                .map(|state| (state.key(), state.clone()))
                .collect(),
        };
        atomic_write(path, &doc)?;
        self.dirty = false;
        Ok(())
    }

    pub fn prune_finished(&mut self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let before = self.files.len();
        self.files
            .retain(|_, state| !(state.finished && state.last_seen <= cutoff));
        let pruned = before - self.files.len();
        if pruned > 0 {
            self.dirty = true;
        }
        pruned
    }
}

fn load_document(path: &Path) -> Result<RegistryDocument> {
    let corrupt = |reason: String| Error::RegistryCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = ?path, "No registry found, starting empty");
            return Ok(RegistryDocument::default());
        }
        Err(e) => return Err(corrupt(e.to_string())),
    };

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;

    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| corrupt("missing version".to_string()))?;
    if version > REGISTRY_VERSION as u64 {
        return Err(Error::RegistryVersion {
            found: u8::try_from(version).unwrap_or(u8::MAX),
            supported: REGISTRY_VERSION,
        });
    }

    let doc: RegistryDocument =
        serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
    info!(path = ?path, files = doc.files.len(), "Loaded registry");
    Ok(doc)
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn temp_prefix(path: &Path) -> String {
    format!(
        "{}.tmp.",
        path.file_name().unwrap_or_default().to_string_lossy()
    )
}

/// Temp files left by a crash mid-write are never the live registry.
fn remove_stale_temp_files(path: &Path) {
    let Some(dir) = parent_dir(path) else {
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let prefix = temp_prefix(path);
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!(path = ?entry.path(), "Removed stale registry temp file"),
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to remove stale registry temp file"),
            }
        }
    }
}

fn atomic_write(path: &Path, doc: &RegistryDocument) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let persist_err = |what: &str, e: std::io::Error| Error::Registry(format!("{}: {}", what, e));

    let temp_name = format!(
        "{}{}.{}",
        temp_prefix(path),
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = path.with_file_name(temp_name);

    let result = (|| {
        let file = File::create(&temp_path).map_err(|e| persist_err("failed to create temp file", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, doc)?;
        writer
            .flush()
            .map_err(|e| persist_err("failed to flush registry", e))?;
        let file = writer
            .into_inner()
            .map_err(|e| persist_err("failed to flush registry", e.into_error()))?;
        file.sync_all()
            .map_err(|e| persist_err("failed to sync registry", e))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| persist_err("failed to replace registry", e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    #[cfg(unix)]
    if let Some(dir) = parent_dir(path) {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(error = %e, "Registry directory fsync failed");
        }
    }

    Ok(())
}
