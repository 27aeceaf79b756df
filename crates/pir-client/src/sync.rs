//! Hint synchronization from per-block XOR delta files
//!
//! Each pass lists the published delta files and applies every listed block
//! above the watermark in ascending order. Block numbers without a file have
//! no changes and are retired. A block is applied whole (under the hint write
//! lock) or not at all. A failed block holds the watermark back; later blocks
//! are still applied and remembered so the retry of the failed block never
//! causes them to be XORed in twice.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pir_core::DeltaFile;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::hint_store::SharedHintStore;
use crate::progress::{ProgressStore, SyncProgress};
use crate::transport::DeltaSource;

/// Default interval between periodic passes
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest interval accepted by [`SyncTask::spawn`]
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub from: u64,
    pub to: u64,
    /// Blocks applied during this pass
    pub applied: Vec<u64>,
    /// Blocks that failed to download, decode or apply
    pub failed: Vec<u64>,
    /// Blocks skipped because an earlier pass already applied them
    pub skipped_already_applied: Vec<u64>,
    pub records_applied: u64,
    /// Contiguous watermark after the pass
    pub watermark: u64,
    /// Pass stopped early at a block boundary
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Resets the in-flight flag when a pass ends, even if its future is dropped
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Applies delta files to the shared hint and tracks progress
pub struct DeltaSynchronizer<D, P> {
    hints: SharedHintStore,
    source: Arc<D>,
    store: P,
    checkpoint: Option<PathBuf>,
    progress: Mutex<SyncProgress>,
    in_progress: AtomicBool,
    cancel_requested: AtomicBool,
}

impl<D, P> DeltaSynchronizer<D, P>
where
    D: DeltaSource,
    P: ProgressStore,
{
    /// Create a synchronizer starting from block 0; call
    /// [`load_progress`](Self::load_progress) to resume a saved watermark.
    pub fn new(hints: SharedHintStore, source: Arc<D>, store: P) -> Self {
        Self {
            hints,
            source,
            store,
            checkpoint: None,
            progress: Mutex::new(SyncProgress::default()),
            in_progress: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Save the hint together with its progress to `path` after every pass
    /// that changed the watermark
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_deref()
    }

    /// Replace in-memory progress with the persisted one
    pub fn load_progress(&self) -> Result<SyncProgress> {
        let loaded = self.store.load()?;
        tracing::info!(
            block = loaded.current_block,
            applied_ahead = loaded.applied_ahead.len(),
            "Loaded sync progress"
        );
        *self.lock_progress() = loaded.clone();
        Ok(loaded)
    }

    /// Adopt `progress` (e.g. from a restored checkpoint) and persist it
    pub fn restore_progress(&self, progress: SyncProgress) -> Result<()> {
        *self.lock_progress() = progress.clone();
        self.store.save(&progress)
    }

    /// Reset to block 0 and drop the persisted value and checkpoint
    pub fn clear_progress(&self) -> Result<()> {
        *self.lock_progress() = SyncProgress::default();
        if let Some(path) = &self.checkpoint {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.clear()
    }

    pub fn progress(&self) -> SyncProgress {
        self.lock_progress().clone()
    }

    /// Contiguous watermark
    pub fn current_block(&self) -> u64 {
        self.lock_progress().current_block
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Ask the running pass to stop at the next block boundary. No effect
    /// when no pass is running.
    pub fn cancel(&self) {
        if self.is_syncing() {
            self.cancel_requested.store(true, Ordering::Release);
        }
    }

    /// Newest published block, or the watermark if none are listed or the
    /// listing fails
    pub async fn discover_latest_block(&self) -> u64 {
        let current = self.current_block();
        match self.source.list_delta_blocks().await {
            Ok(blocks) => match blocks.last() {
                Some(&latest) => latest,
                None => {
                    tracing::debug!("No delta files published");
                    current
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list delta files");
                current
            }
        }
    }

    /// Apply every listed block above the watermark.
    ///
    /// Block numbers up to the newest listed one that have no delta file are
    /// retired as empty; only listed blocks that fail hold the watermark.
    /// Returns `None` if another pass is already running.
    pub async fn sync_once(&self) -> Option<SyncReport> {
        let _guard = self.begin_pass()?;
        let from = self.current_block() + 1;

        let published: BTreeSet<u64> = match self.source.list_delta_blocks().await {
            Ok(blocks) => blocks.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list delta files");
                return Some(self.idle_report(from));
            }
        };

        let latest = match published.last() {
            Some(&latest) if latest >= from => latest,
            _ => {
                tracing::debug!("Hint up to date");
                return Some(self.idle_report(from));
            }
        };

        tracing::info!(from, to = latest, "Syncing deltas");
        let blocks: Vec<u64> = published.range(from..).copied().collect();
        let listing = Listing { published: &published, latest };
        Some(self.run_pass(from, latest, blocks, Some(listing)).await)
    }

    /// Apply blocks `from..=to` in ascending order. Every block in the
    /// range is expected to have a delta file.
    ///
    /// Returns `None` if another pass is already running.
    pub async fn sync_range(&self, from: u64, to: u64) -> Option<SyncReport> {
        let _guard = self.begin_pass()?;
        Some(self.run_pass(from, to, (from..=to).collect(), None).await)
    }

    fn begin_pass(&self) -> Option<PassGuard<'_>> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            tracing::debug!("Sync pass already in flight");
            return None;
        }
        self.cancel_requested.store(false, Ordering::Release);
        Some(PassGuard(&self.in_progress))
    }

    fn idle_report(&self, from: u64) -> SyncReport {
        let watermark = self.current_block();
        SyncReport {
            from,
            to: watermark,
            watermark,
            ..SyncReport::default()
        }
    }

    async fn run_pass(&self, from: u64, to: u64, blocks: Vec<u64>, listing: Option<Listing<'_>>) -> SyncReport {
        let start = Instant::now();
        let start_block = self.current_block();
        let mut report = SyncReport {
            from,
            to,
            ..SyncReport::default()
        };

        if let Some(listing) = &listing {
            self.record_progress(None, Some(listing));
        }

        for block in blocks {
            if self.cancel_requested.swap(false, Ordering::AcqRel) {
                tracing::info!(block, "Sync pass cancelled");
                report.cancelled = true;
                break;
            }

            if self.lock_progress().is_applied(block) {
                report.skipped_already_applied.push(block);
                continue;
            }

            match self.apply_block(block).await {
                Ok(records) => {
                    if records > 0 {
                        tracing::info!(block, records, "Applied delta");
                    } else {
                        tracing::debug!(block, "Empty delta");
                    }
                    report.applied.push(block);
                    report.records_applied += records as u64;
                    self.record_progress(Some(block), listing.as_ref());
                }
                Err(e) => {
                    tracing::warn!(block, error = %e, "Failed to sync delta, will retry next pass");
                    report.failed.push(block);
                }
            }
        }

        report.watermark = self.current_block();
        if report.watermark != start_block || !report.applied.is_empty() {
            self.save_checkpoint().await;
        }

        tracing::info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            records = report.records_applied,
            watermark = report.watermark,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Sync pass finished"
        );

        report
    }

    /// Download, decode and apply one block under the write lock
    async fn apply_block(&self, block: u64) -> Result<usize> {
        let bytes = self.source.fetch_delta(block).await?;
        let delta = DeltaFile::from_bytes(&bytes)?;

        let mut hints = self.hints.write().await;
        hints.apply_delta_file(&delta)
    }

    /// Mark `applied` (if any), retire unlisted blocks, persist on change
    fn record_progress(&self, applied: Option<u64>, listing: Option<&Listing<'_>>) {
        let snapshot = {
            let mut progress = self.lock_progress();
            let before = progress.clone();
            if let Some(block) = applied {
                progress.mark_applied(block);
            }
            if let Some(listing) = listing {
                let from = progress.current_block;
                if progress.retire_unpublished(listing.published, listing.latest) {
                    tracing::debug!(
                        from,
                        to = progress.current_block,
                        "Retired blocks without delta files"
                    );
                }
            }
            if *progress == before {
                return;
            }
            progress.clone()
        };

        if let Err(e) = self.store.save(&snapshot) {
            tracing::error!(block = snapshot.current_block, error = %e, "Failed to persist sync progress");
        }
    }

    async fn save_checkpoint(&self) {
        let Some(path) = &self.checkpoint else {
            return;
        };
        // The pass guard is held, so no delta lands between the read and the
        // progress snapshot.
        let hints = self.hints.read().await;
        let progress = self.progress();
        match hints.save(path, &progress) {
            Ok(()) => tracing::debug!(block = progress.current_block, "Saved hint checkpoint"),
            Err(e) => tracing::error!(error = %e, "Failed to save hint checkpoint"),
        }
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, SyncProgress> {
        // Progress updates cannot leave the value half-written, so a
        // poisoned lock is still usable.
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Published blocks seen by the current pass
struct Listing<'a> {
    published: &'a BTreeSet<u64>,
    latest: u64,
}

/// Handle to a running [`SyncTask`]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SyncHandle {
    /// Run a pass now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the task; a running pass stops at the next block boundary
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Sync task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Periodic, re-triggerable sync loop with at most one pass in flight
pub struct SyncTask;

impl SyncTask {
    /// Spawn the loop on the current tokio runtime.
    ///
    /// Runs a pass immediately, then every `interval` (clamped to
    /// [`MIN_SYNC_INTERVAL`]) or whenever [`SyncHandle::trigger`] is called.
    pub fn spawn<D, P>(synchronizer: Arc<DeltaSynchronizer<D, P>>, interval: Duration) -> SyncHandle
    where
        D: DeltaSource + 'static,
        P: ProgressStore + 'static,
    {
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let trigger = Arc::new(Notify::new());
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let notified = Arc::clone(&trigger);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_secs = interval.as_secs(), "Sync task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let pass = synchronizer.sync_once();
                tokio::pin!(pass);

                let stopping = tokio::select! {
                    biased;
                    _ = &mut pass => false,
                    _ = shutdown_rx.changed() => {
                        synchronizer.cancel();
                        pass.await;
                        true
                    }
                };
                if stopping {
                    break;
                }
            }

            tracing::info!("Sync task stopped");
        });

        SyncHandle {
            trigger,
            shutdown,
            join,
        }
    }
}
