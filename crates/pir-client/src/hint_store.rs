//! Local hint storage
//!
//! The hint is a byte-for-byte mirror of the server database:
//! `[32-byte header][database_size x u64 LE]`. It is loaded once from the CDN
//! and then patched in place by XOR deltas.

use std::path::Path;
use std::sync::Arc;

use pir_core::{hint, DeltaFile, HintMetadata, IndexSet, ENTRY_SIZE, HINT_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ClientError, Result};
use crate::progress::SyncProgress;

/// Hint store shared between the query engine and the synchronizer.
///
/// Writers hold the lock for a whole delta file, readers for a whole decode,
/// so a decode never observes a half-applied batch.
pub type SharedHintStore = Arc<RwLock<HintStore>>;

/// Hint image saved together with the progress it reflects
#[derive(Debug, Serialize, Deserialize)]
struct StoredHint<H> {
    current_block: u64,
    applied_ahead: Vec<u64>,
    hint: H,
}

/// Local hint store
#[derive(Debug, Default)]
pub struct HintStore {
    /// Raw hint image, header included
    buffer: Vec<u8>,
    /// Present once a hint has been loaded
    metadata: Option<HintMetadata>,
}

impl HintStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already loaded with `bytes`
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut store = Self::new();
        store.load_full(bytes)?;
        Ok(store)
    }

    /// Wrap in the lock used by the session
    pub fn into_shared(self) -> SharedHintStore {
        Arc::new(RwLock::new(self))
    }

    /// Replace the buffer wholesale with a freshly downloaded image
    ///
    /// On error the previous hint (if any) is kept.
    pub fn load_full(&mut self, bytes: Vec<u8>) -> Result<()> {
        let metadata = HintMetadata::parse_hint(&bytes)?;

        if !metadata.covers_database() {
            tracing::warn!(
                database_size = metadata.database_size,
                chunk_size = metadata.chunk_size,
                set_size = metadata.set_size,
                "Chunks do not span the whole database; trailing entries are never queried"
            );
        }

        tracing::info!(
            database_size = metadata.database_size,
            chunk_size = metadata.chunk_size,
            set_size = metadata.set_size,
            bytes = bytes.len(),
            "Hint loaded"
        );

        self.buffer = bytes;
        self.metadata = Some(metadata);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.metadata.is_some()
    }

    /// Metadata, or `NotLoaded` before the first download
    pub fn metadata(&self) -> Result<&HintMetadata> {
        self.metadata.as_ref().ok_or(ClientError::NotLoaded)
    }

    /// Read entry `index`; 0 when out of bounds or not loaded
    pub fn read_entry(&self, index: u64) -> u64 {
        let Some((start, end)) = entry_span(index) else {
            return 0;
        };
        match self.buffer.get(start..end) {
            Some(slot) => {
                let mut bytes = [0u8; ENTRY_SIZE];
                bytes.copy_from_slice(slot);
                u64::from_le_bytes(bytes)
            }
            None => 0,
        }
    }

    /// XOR the LE encoding of `value` into the buffer at `offset_bytes`
    pub fn apply_xor(&mut self, offset_bytes: usize, value: u64) -> Result<()> {
        if !self.is_loaded() {
            return Err(ClientError::NotLoaded);
        }
        self.check_range(offset_bytes)?;

        let end = offset_bytes + ENTRY_SIZE;
        let mut slot = [0u8; ENTRY_SIZE];
        slot.copy_from_slice(&self.buffer[offset_bytes..end]);
        hint::xor_into(&mut slot, value);
        self.buffer[offset_bytes..end].copy_from_slice(&slot);
        Ok(())
    }

    /// Apply every record of a delta file, or none of them.
    ///
    /// All offsets are checked before the first write. Returns the number of
    /// records applied.
    pub fn apply_delta_file(&mut self, delta: &DeltaFile) -> Result<usize> {
        let chunk_size = self.metadata()?.chunk_size;

        let mut offsets = Vec::with_capacity(delta.records.len());
        for record in &delta.records {
            let offset = record
                .entry_offset(chunk_size)
                .ok_or(ClientError::OutOfRange {
                    offset: usize::MAX,
                    len: ENTRY_SIZE,
                    buffer_len: self.buffer.len(),
                })?;
            self.check_range(offset)?;
            offsets.push(offset);
        }

        for (record, offset) in delta.records.iter().zip(offsets) {
            self.apply_xor(offset, record.value)?;
        }

        Ok(delta.records.len())
    }

    /// XOR parity of the hint entries in `set`
    pub fn parity(&self, set: &IndexSet) -> u64 {
        hint::compute_parity(set.iter(), |idx| self.read_entry(idx))
    }

    /// Entries physically present in the buffer
    pub fn entry_count(&self) -> u64 {
        (self.buffer.len().saturating_sub(HINT_HEADER_SIZE) / ENTRY_SIZE) as u64
    }

    /// Total storage size
    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Raw hint image
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Load a checkpoint written by [`save`](Self::save)
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, SyncProgress)> {
        let data = std::fs::read(path)?;
        let stored: StoredHint<Vec<u8>> = bincode::deserialize(&data)?;

        let store = Self::from_bytes(stored.hint)?;
        let progress = SyncProgress {
            current_block: stored.current_block,
            applied_ahead: stored.applied_ahead.into_iter().collect(),
        };
        Ok((store, progress))
    }

    /// Save the hint image and the progress it reflects as one file,
    /// replaced atomically
    pub fn save(&self, path: impl AsRef<Path>, progress: &SyncProgress) -> Result<()> {
        if !self.is_loaded() {
            return Err(ClientError::NotLoaded);
        }
        let path = path.as_ref();
        let stored = StoredHint {
            current_block: progress.current_block,
            applied_ahead: progress.applied_ahead.iter().copied().collect(),
            hint: self.buffer.as_slice(),
        };
        let data = bincode::serialize(&stored)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn check_range(&self, offset: usize) -> Result<()> {
        match offset.checked_add(ENTRY_SIZE) {
            Some(end) if end <= self.buffer.len() => Ok(()),
            _ => Err(ClientError::OutOfRange {
                offset,
                len: ENTRY_SIZE,
                buffer_len: self.buffer.len(),
            }),
        }
    }
}

/// Byte span of entry `index`: `32 + 8 * index .. + 8`
fn entry_span(index: u64) -> Option<(usize, usize)> {
    let start = usize::try_from(index)
        .ok()?
        .checked_mul(ENTRY_SIZE)?
        .checked_add(HINT_HEADER_SIZE)?;
    Some((start, start.checked_add(ENTRY_SIZE)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pir_core::codec::encode_hint;
    use pir_core::{DeltaRecord, PrfKey};
    use tempfile::tempdir;

    fn test_store() -> HintStore {
        let metadata = HintMetadata { database_size: 16, chunk_size: 4, set_size: 4 };
        let entries: Vec<u64> = (0..16).collect();
        HintStore::from_bytes(encode_hint(&metadata, &entries)).unwrap()
    }

    #[test]
    fn test_read_entry() {
        let store = test_store();
        assert_eq!(store.read_entry(0), 0);
        assert_eq!(store.read_entry(13), 13);
        assert_eq!(store.entry_count(), 16);
    }

    #[test]
    fn test_read_out_of_bounds_is_zero() {
        let store = test_store();
        assert_eq!(store.read_entry(16), 0);
        assert_eq!(store.read_entry(u64::MAX), 0);
        assert_eq!(HintStore::new().read_entry(0), 0);
    }

    #[test]
    fn test_metadata_requires_load() {
        let store = HintStore::new();
        assert!(!store.is_loaded());
        assert!(matches!(store.metadata(), Err(ClientError::NotLoaded)));
    }

    #[test]
    fn test_apply_xor_not_loaded() {
        let mut store = HintStore::new();
        assert!(matches!(store.apply_xor(32, 1), Err(ClientError::NotLoaded)));
    }

    #[test]
    fn test_apply_xor_out_of_range() {
        let mut store = test_store();
        let len = store.size_bytes();

        assert!(matches!(
            store.apply_xor(len - 4, 1),
            Err(ClientError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.apply_xor(usize::MAX, 1),
            Err(ClientError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_apply_same_record_twice_reverts() {
        let mut store = test_store();
        let record = DeltaRecord { hint_set_id: 2, is_backup_set: false, value: 0xff00 };
        let offset = record.entry_offset(4).unwrap();
        let before = store.read_entry(8);

        store.apply_xor(offset, record.value).unwrap();
        assert_eq!(store.read_entry(8), before ^ 0xff00);

        store.apply_xor(offset, record.value).unwrap();
        assert_eq!(store.read_entry(8), before);
    }

    #[test]
    fn test_header_reserved_bytes_preserved() {
        let metadata = HintMetadata { database_size: 4, chunk_size: 2, set_size: 2 };
        let mut bytes = encode_hint(&metadata, &[1, 2, 3, 4]);
        bytes[24..32].copy_from_slice(b"RESERVED");

        let mut store = HintStore::from_bytes(bytes).unwrap();
        store.apply_xor(32, 7).unwrap();

        assert_eq!(&store.as_bytes()[24..32], b"RESERVED");
        assert_eq!(store.read_entry(0), 1 ^ 7);
    }

    #[test]
    fn test_load_short_buffer_keeps_previous() {
        let mut store = test_store();
        let result = store.load_full(vec![0u8; 10]);

        assert!(matches!(result, Err(ClientError::MalformedInput(_))));
        assert_eq!(store.read_entry(5), 5);
    }

    #[test]
    fn test_apply_delta_file() {
        let mut store = test_store();
        let delta = DeltaFile::new(vec![
            DeltaRecord { hint_set_id: 0, is_backup_set: false, value: 0b1 },
            DeltaRecord { hint_set_id: 3, is_backup_set: true, value: 0b10 },
        ]);

        assert_eq!(store.apply_delta_file(&delta).unwrap(), 2);
        assert_eq!(store.read_entry(0), 1);
        assert_eq!(store.read_entry(12), 12 ^ 0b10);
    }

    #[test]
    fn test_apply_delta_file_is_all_or_nothing() {
        let mut store = test_store();
        let delta = DeltaFile::new(vec![
            DeltaRecord { hint_set_id: 1, is_backup_set: false, value: 0xaa },
            DeltaRecord { hint_set_id: 4, is_backup_set: false, value: 0xbb }, // offset 160, past the end
        ]);

        assert!(matches!(
            store.apply_delta_file(&delta),
            Err(ClientError::OutOfRange { offset: 160, .. })
        ));
        assert_eq!(store.read_entry(4), 4);
    }

    #[test]
    fn test_parity_matches_manual_xor() {
        let store = test_store();
        let set = IndexSet::expand(&PrfKey::new([0u8; 16]), 4, 4);

        assert_eq!(set.indices, vec![1, 4, 11, 14]);
        assert_eq!(store.parity(&set), 1 ^ 4 ^ 11 ^ 14);
    }

    #[test]
    fn test_checkpoint_keeps_hint_and_progress_together() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("hint-checkpoint.bin");

        let mut store = test_store();
        store.apply_xor(32 + 4 * 8, 0xff).unwrap();
        let mut progress = SyncProgress::at(2);
        progress.mark_applied(4);
        store.save(&path, &progress).unwrap();

        let (loaded, loaded_progress) = HintStore::load(&path).unwrap();
        assert_eq!(loaded.as_bytes(), store.as_bytes());
        assert_eq!(loaded.read_entry(4), 4 ^ 0xff);
        assert_eq!(loaded_progress, progress);
    }

    #[test]
    fn test_checkpoint_requires_hint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hint-checkpoint.bin");

        assert!(matches!(
            HintStore::new().save(&path, &SyncProgress::default()),
            Err(ClientError::NotLoaded)
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_checkpoint_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hint-checkpoint.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        assert!(HintStore::load(&path).is_err());
    }
}
