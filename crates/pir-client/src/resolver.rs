//! Address to database index resolution
//!
//! The core never hard-codes the mapping; the session is handed an
//! [`IndexResolver`]. Two implementations ship:
//! - [`PlaceholderResolver`]: the proof-of-concept hash (sum of address bytes
//!   mod database size). Collides freely; only for demos and tests.
//! - [`MappingTableResolver`]: an `address-mapping.bin` lookup table.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{ClientError, Result};

/// Database size assumed by the placeholder mapping when no hint is loaded
pub const DEFAULT_DATABASE_SIZE: u64 = 8_388_608;

/// Maps an address to its database index
pub trait IndexResolver: Send + Sync {
    /// `database_size` is the loaded hint's size, if any
    fn resolve(&self, address: &str, database_size: Option<u64>) -> Result<u64>;
}

/// Decode a 20-byte hex address with optional `0x` prefix
pub fn parse_address(address: &str) -> Result<[u8; 20]> {
    let hex_part = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    let bytes = hex::decode(hex_part)
        .map_err(|e| ClientError::IndexResolution(format!("invalid address hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ClientError::IndexResolution("address must be 20 bytes".to_string()))
}

/// Proof-of-concept mapping: sum of address bytes mod database size
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderResolver;

impl IndexResolver for PlaceholderResolver {
    fn resolve(&self, address: &str, database_size: Option<u64>) -> Result<u64> {
        let address = parse_address(address)?;
        let modulus = database_size
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_DATABASE_SIZE);
        let sum: u64 = address.iter().map(|&b| u64::from(b)).sum();
        Ok(sum % modulus)
    }
}

/// Size of one mapping record: 20-byte address + u32 LE index
const MAPPING_ENTRY_SIZE: usize = 24;

/// Sorted `address-mapping.bin` table, memory mapped
pub struct MappingTableResolver {
    mmap: Mmap,
    count: usize,
}

impl MappingTableResolver {
    /// Map the file at `path`; its length must be a multiple of 24
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        if len % MAPPING_ENTRY_SIZE as u64 != 0 {
            return Err(ClientError::IndexResolution(format!(
                "mapping size {} is not a multiple of {}",
                len, MAPPING_ENTRY_SIZE
            )));
        }

        // SAFETY: the mapping file is read-only input and is not modified
        // while the resolver is alive.
        let mmap = unsafe { Mmap::map(&file)? };
        let count = mmap.len() / MAPPING_ENTRY_SIZE;

        tracing::info!(path = %path.display(), entries = count, "Loaded address mapping");

        Ok(Self { mmap, count })
    }

    /// Look up an address by binary search
    pub fn get(&self, address: &[u8; 20]) -> Option<u64> {
        let mut low = 0;
        let mut high = self.count;

        while low < high {
            let mid = low + (high - low) / 2;
            let offset = mid * MAPPING_ENTRY_SIZE;
            let entry_addr = &self.mmap[offset..offset + 20];

            match entry_addr.cmp(address.as_slice()) {
                std::cmp::Ordering::Equal => {
                    let mut idx = [0u8; 4];
                    idx.copy_from_slice(&self.mmap[offset + 20..offset + 24]);
                    return Some(u64::from(u32::from_le_bytes(idx)));
                }
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl IndexResolver for MappingTableResolver {
    fn resolve(&self, address: &str, _database_size: Option<u64>) -> Result<u64> {
        let address = parse_address(address)?;
        self.get(&address)
            .ok_or_else(|| ClientError::IndexResolution("address not in mapping".to_string()))
    }
}

impl<T: IndexResolver + ?Sized> IndexResolver for Box<T> {
    fn resolve(&self, address: &str, database_size: Option<u64>) -> Result<u64> {
        (**self).resolve(address, database_size)
    }
}
