//! Persisted delta sync progress
//!
//! `current_block` is the highest block such that every block in
//! `1..=current_block` has been applied. Blocks applied past a gap are kept in
//! `applied_ahead` so a retry pass skips them instead of XORing them in twice.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fixed identifier the progress is persisted under
pub const PROGRESS_KEY: &str = "plinko_current_block";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Contiguous watermark
    #[serde(rename = "plinko_current_block")]
    pub current_block: u64,
    /// Applied blocks above `current_block + 1`
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub applied_ahead: BTreeSet<u64>,
}

impl SyncProgress {
    pub fn at(current_block: u64) -> Self {
        Self {
            current_block,
            applied_ahead: BTreeSet::new(),
        }
    }

    /// Whether `block`'s deltas are already in the hint
    pub fn is_applied(&self, block: u64) -> bool {
        block <= self.current_block || self.applied_ahead.contains(&block)
    }

    /// Record `block` as applied and advance the watermark over any
    /// now-contiguous run. Returns true if the watermark moved.
    pub fn mark_applied(&mut self, block: u64) -> bool {
        if self.is_applied(block) {
            return false;
        }
        if block != self.current_block + 1 {
            self.applied_ahead.insert(block);
            return false;
        }

        self.current_block = block;
        while self.applied_ahead.remove(&(self.current_block + 1)) {
            self.current_block += 1;
        }
        true
    }

    /// Highest block applied, gap or not
    pub fn highest_applied(&self) -> u64 {
        self.applied_ahead
            .last()
            .copied()
            .unwrap_or(self.current_block)
            .max(self.current_block)
    }

    pub fn has_gap(&self) -> bool {
        !self.applied_ahead.is_empty()
    }

    /// Advance the watermark up to `through` over blocks that have no delta
    /// file in `published`. A listed block that is not yet applied stops the
    /// advance. Returns true if the watermark moved.
    pub fn retire_unpublished(&mut self, published: &BTreeSet<u64>, through: u64) -> bool {
        let start = self.current_block;

        while self.current_block < through {
            let next = self.current_block + 1;
            if self.applied_ahead.remove(&next) {
                self.current_block = next;
                continue;
            }
            if published.contains(&next) {
                break;
            }

            // Jump the whole unlisted run in one step
            let next_listed = published.range(next..).next().copied();
            let next_ahead = self.applied_ahead.range(next..).next().copied();
            let stop = [next_listed, next_ahead]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(u64::MAX)
                .min(through.saturating_add(1));
            self.current_block = stop - 1;
        }

        self.current_block != start
    }
}

/// Durable home for [`SyncProgress`]
pub trait ProgressStore: Send + Sync {
    /// Saved progress, or the default when nothing was saved yet
    fn load(&self) -> Result<SyncProgress>;

    fn save(&self, progress: &SyncProgress) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// JSON file, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/plinko_current_block.json`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{}.json", PROGRESS_KEY)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<SyncProgress> {
        if !self.path.exists() {
            return Ok(SyncProgress::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, progress: &SyncProgress) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(progress)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    inner: Mutex<Option<SyncProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(progress: SyncProgress) -> Self {
        Self {
            inner: Mutex::new(Some(progress)),
        }
    }

    /// Last saved value, if any
    pub fn saved(&self) -> Option<SyncProgress> {
        self.inner.lock().ok().and_then(|guard| guard.clone())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self) -> Result<SyncProgress> {
        Ok(self.saved().unwrap_or_default())
    }

    fn save(&self, progress: &SyncProgress) -> Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(progress.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
        Ok(())
    }
}

impl<T: ProgressStore + ?Sized> ProgressStore for std::sync::Arc<T> {
    fn load(&self) -> Result<SyncProgress> {
        (**self).load()
    }

    fn save(&self, progress: &SyncProgress) -> Result<()> {
        (**self).save(progress)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}
