//! Binary codec for hint and delta files
//!
//! All integers are little-endian u64.
//!
//! ```text
//! hint.bin:            [db_size][chunk_size][set_size][reserved:8] [entry:8]*db_size
//! delta-NNNNNN.bin:    [count][reserved] ([hint_set_id][is_backup_set][value])*count
//! ```
//!
//! The codec trusts declared counts and only checks them against the buffer
//! length. It never validates the chunking parameters themselves.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};
use crate::{DELTA_HEADER_SIZE, DELTA_RECORD_SIZE, ENTRY_SIZE, HINT_HEADER_SIZE};

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Database shape, decoded from the first 24 bytes of `hint.bin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintMetadata {
    /// Number of 8-byte entries in the database
    pub database_size: u64,
    /// Entries per chunk
    pub chunk_size: u64,
    /// Number of chunks (one index per chunk in a FullSet query)
    pub set_size: u64,
}

impl HintMetadata {
    /// Decode the header only. Needs the full 32-byte header.
    pub fn from_header(data: &[u8]) -> Result<Self> {
        if data.len() < HINT_HEADER_SIZE {
            return Err(CodecError::MalformedInput {
                what: "hint header",
                expected: HINT_HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            database_size: read_u64(data, 0),
            chunk_size: read_u64(data, 8),
            set_size: read_u64(data, 16),
        })
    }

    /// Decode the header and check the buffer holds every declared entry.
    pub fn parse_hint(data: &[u8]) -> Result<Self> {
        let metadata = Self::from_header(data)?;
        let expected = metadata.expected_hint_len()?;

        if data.len() < expected {
            return Err(CodecError::MalformedInput {
                what: "hint",
                expected,
                actual: data.len(),
            });
        }

        Ok(metadata)
    }

    /// Total length of a hint file with this shape
    pub fn expected_hint_len(&self) -> Result<usize> {
        usize::try_from(self.database_size)
            .ok()
            .and_then(|n| n.checked_mul(ENTRY_SIZE))
            .and_then(|n| n.checked_add(HINT_HEADER_SIZE))
            .ok_or(CodecError::SizeOverflow {
                what: "hint",
                count: self.database_size,
            })
    }

    /// Whether `chunk_size * set_size` spans the whole database
    pub fn covers_database(&self) -> bool {
        self.chunk_size
            .checked_mul(self.set_size)
            .map_or(true, |span| span >= self.database_size)
    }

    /// Chunk that owns a database index (0 when `chunk_size` is 0)
    pub fn chunk_of(&self, index: u64) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        index / self.chunk_size
    }

    /// Encode as a 32-byte header with zeroed reserved bytes
    pub fn to_header_bytes(&self) -> [u8; HINT_HEADER_SIZE] {
        let mut header = [0u8; HINT_HEADER_SIZE];
        header[0..8].copy_from_slice(&self.database_size.to_le_bytes());
        header[8..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        header[16..24].copy_from_slice(&self.set_size.to_le_bytes());
        header
    }
}

/// Build a complete hint image from metadata and entries
pub fn encode_hint(metadata: &HintMetadata, entries: &[u64]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HINT_HEADER_SIZE + entries.len() * ENTRY_SIZE);
    data.extend_from_slice(&metadata.to_header_bytes());
    for entry in entries {
        data.extend_from_slice(&entry.to_le_bytes());
    }
    data
}

/// One database-entry update, XORed into the hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Chunk that owns the changed entry
    pub hint_set_id: u64,
    /// Secondary representative flag, carried through untouched
    pub is_backup_set: bool,
    /// XOR delta (old value ^ new value)
    pub value: u64,
}

impl DeltaRecord {
    /// Byte offset in the hint buffer: `32 + hint_set_id * chunk_size * 8`
    ///
    /// Returns `None` if the offset does not fit in `usize`.
    pub fn entry_offset(&self, chunk_size: u64) -> Option<usize> {
        let offset = self
            .hint_set_id
            .checked_mul(chunk_size)?
            .checked_mul(ENTRY_SIZE as u64)?
            .checked_add(HINT_HEADER_SIZE as u64)?;
        usize::try_from(offset).ok()
    }

    fn from_bytes(data: &[u8]) -> Self {
        Self {
            hint_set_id: read_u64(data, 0),
            is_backup_set: read_u64(data, 8) != 0,
            value: read_u64(data, 16),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hint_set_id.to_le_bytes());
        out.extend_from_slice(&u64::from(self.is_backup_set).to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }
}

/// Batch of updates published for one block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaFile {
    /// Reserved header word, preserved verbatim
    pub reserved: u64,
    pub records: Vec<DeltaRecord>,
}

impl DeltaFile {
    pub fn new(records: Vec<DeltaRecord>) -> Self {
        Self { reserved: 0, records }
    }

    /// Decode a delta file. Trailing bytes past the declared records are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DELTA_HEADER_SIZE {
            return Err(CodecError::MalformedInput {
                what: "delta header",
                expected: DELTA_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let count = read_u64(data, 0);
        let reserved = read_u64(data, 8);

        let expected = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(DELTA_RECORD_SIZE))
            .and_then(|n| n.checked_add(DELTA_HEADER_SIZE))
            .ok_or(CodecError::SizeOverflow {
                what: "delta",
                count,
            })?;

        if data.len() < expected {
            return Err(CodecError::MalformedInput {
                what: "delta",
                expected,
                actual: data.len(),
            });
        }

        let records = data[DELTA_HEADER_SIZE..expected]
            .chunks_exact(DELTA_RECORD_SIZE)
            .map(DeltaRecord::from_bytes)
            .collect();

        Ok(Self { reserved, records })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(DELTA_HEADER_SIZE + self.records.len() * DELTA_RECORD_SIZE);
        data.extend_from_slice(&(self.records.len() as u64).to_le_bytes());
        data.extend_from_slice(&self.reserved.to_le_bytes());
        for record in &self.records {
            record.write_to(&mut data);
        }
        data
    }

    pub fn count(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// File name for a block's delta: `delta-000042.bin`
pub fn delta_file_name(block: u64) -> String {
    format!("delta-{:06}.bin", block)
}

/// Extract block numbers from a directory listing.
///
/// Matches `delta-` followed by exactly six digits and `.bin`, anywhere in the
/// text (HTML index pages, plain listings, JSON manifests). Result is sorted
/// and deduplicated.
pub fn parse_delta_listing(listing: &str) -> Vec<u64> {
    const PREFIX: &str = "delta-";
    const SUFFIX: &str = ".bin";
    const DIGITS: usize = 6;

    let mut blocks: Vec<u64> = listing
        .match_indices(PREFIX)
        .filter_map(|(pos, _)| {
            let rest = &listing[pos + PREFIX.len()..];
            let digits = rest.get(..DIGITS)?;
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            if !rest[DIGITS..].starts_with(SUFFIX) {
                return None;
            }
            digits.parse().ok()
        })
        .collect();

    blocks.sort_unstable();
    blocks.dedup();
    blocks
}
