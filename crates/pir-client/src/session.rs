//! Explicitly owned client session
//!
//! Owns the one hint for the process and hands it to the query engine and the
//! synchronizer. Nothing here is global; construct one and pass it around.
//!
//! The CDN's `hint.bin` is the snapshot the deltas build on, so a freshly
//! downloaded hint always starts from block 0. Progress survives a restart
//! only through a checkpoint that stores the patched hint with its watermark.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pir_core::HintMetadata;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::hint_store::{HintStore, SharedHintStore};
use crate::progress::{FileProgressStore, ProgressStore, SyncProgress};
use crate::query::{DecodedQuery, PlaintextAnswer, QueryEngine};
use crate::resolver::IndexResolver;
use crate::sync::{DeltaSynchronizer, SyncHandle, SyncReport, SyncTask};
use crate::transport::{DeltaSource, HttpCdn, HttpPirServer, PirServer};

/// Session wired to the HTTP server and CDN
pub type HttpSession = PlinkoSession<HttpPirServer, HttpCdn, Box<dyn IndexResolver>, FileProgressStore>;

pub struct PlinkoSession<S, D, R, P> {
    hints: SharedHintStore,
    engine: QueryEngine<S, R>,
    source: Arc<D>,
    synchronizer: Arc<DeltaSynchronizer<D, P>>,
}

impl HttpSession {
    /// Build a session from configuration; nothing is downloaded yet
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self::build(
            HttpPirServer::new(&config.pir_server_url, timeout)?,
            HttpCdn::new(&config.cdn_url, timeout)?,
            config.resolver()?,
            config.progress_store(),
            config.hint_checkpoint.clone(),
        ))
    }
}

impl<S, D, R, P> PlinkoSession<S, D, R, P>
where
    S: PirServer,
    D: DeltaSource,
    R: IndexResolver,
    P: ProgressStore,
{
    pub fn new(server: S, source: D, resolver: R, store: P) -> Self {
        Self::build(server, source, resolver, store, None)
    }

    /// Like [`new`](Self::new), restoring from and saving to a hint
    /// checkpoint at `checkpoint`
    pub fn with_checkpoint(server: S, source: D, resolver: R, store: P, checkpoint: impl Into<PathBuf>) -> Self {
        Self::build(server, source, resolver, store, Some(checkpoint.into()))
    }

    fn build(server: S, source: D, resolver: R, store: P, checkpoint: Option<PathBuf>) -> Self {
        let hints = HintStore::new().into_shared();
        let source = Arc::new(source);

        let mut synchronizer = DeltaSynchronizer::new(hints.clone(), source.clone(), store);
        if let Some(path) = checkpoint {
            synchronizer = synchronizer.with_checkpoint(path);
        }

        Self {
            engine: QueryEngine::new(hints.clone(), Arc::new(server), Arc::new(resolver)),
            synchronizer: Arc::new(synchronizer),
            hints,
            source,
        }
    }

    /// Load the hint: from the checkpoint when one is readable, otherwise a
    /// fresh download with progress reset to block 0.
    ///
    /// A failed download leaves the session in non-private mode and is
    /// returned to the caller.
    pub async fn enable_private_mode(&self) -> Result<HintMetadata> {
        if let Some(metadata) = self.restore_checkpoint().await {
            return Ok(metadata);
        }

        tracing::info!("Downloading hint");
        let bytes = match self.source.fetch_hint().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Hint download failed, private mode unavailable");
                return Err(e);
            }
        };

        let metadata = {
            let mut hints = self.hints.write().await;
            hints.load_full(bytes)?;
            *hints.metadata()?
        };

        // Deltas are relative to the snapshot; replay all of them
        self.synchronizer.clear_progress()?;
        tracing::info!(
            database_size = metadata.database_size,
            "Private mode enabled from a fresh hint, syncing from block 1"
        );

        Ok(metadata)
    }

    async fn restore_checkpoint(&self) -> Option<HintMetadata> {
        let path = self.synchronizer.checkpoint_path()?;
        if !path.exists() {
            return None;
        }

        let (store, progress) = match HintStore::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable hint checkpoint");
                return None;
            }
        };
        let metadata = match store.metadata() {
            Ok(metadata) => *metadata,
            Err(_) => return None,
        };

        *self.hints.write().await = store;
        let block = progress.current_block;
        if let Err(e) = self.synchronizer.restore_progress(progress) {
            tracing::error!(error = %e, "Failed to persist restored sync progress");
        }

        tracing::info!(
            database_size = metadata.database_size,
            block,
            "Private mode enabled from checkpoint"
        );
        Some(metadata)
    }

    pub async fn is_private_mode_enabled(&self) -> bool {
        self.hints.read().await.is_loaded()
    }

    /// Private balance lookup; errors are the caller's cue to fall back
    pub async fn query_balance(&self, address: &str) -> Result<DecodedQuery> {
        self.engine.query_private(address).await
    }

    /// Non-private lookup: the server learns which index is requested
    pub async fn query_balance_plaintext(&self, address: &str) -> Result<PlaintextAnswer> {
        self.engine.query_plaintext(address).await
    }

    pub async fn verify_server_params(&self) -> Result<HintMetadata> {
        self.engine.verify_server_params().await
    }

    /// Run one sync pass now; `None` if a pass is already running
    pub async fn sync_once(&self) -> Option<SyncReport> {
        self.synchronizer.sync_once().await
    }

    pub fn progress(&self) -> SyncProgress {
        self.synchronizer.progress()
    }

    pub fn reset_progress(&self) -> Result<()> {
        self.synchronizer.clear_progress()
    }

    pub fn hints(&self) -> &SharedHintStore {
        &self.hints
    }

    pub fn engine(&self) -> &QueryEngine<S, R> {
        &self.engine
    }

    pub fn synchronizer(&self) -> &Arc<DeltaSynchronizer<D, P>> {
        &self.synchronizer
    }
}

impl<S, D, R, P> PlinkoSession<S, D, R, P>
where
    S: PirServer,
    D: DeltaSource + 'static,
    R: IndexResolver,
    P: ProgressStore + 'static,
{
    /// Start periodic sync on the current runtime
    pub fn start_sync(&self, interval: Duration) -> SyncHandle {
        SyncTask::spawn(self.synchronizer.clone(), interval)
    }
}
