//! FullSet index-set expansion
//!
//! A key expands to exactly one index per chunk:
//! `index[i] = i * chunk_size + PRF(key, i) mod chunk_size`.
//! The server expands the same key to the same set and XORs those entries.

use serde::{Deserialize, Serialize};

use crate::prf::{Prf, PrfKey};

/// Ordered database indices touched by a FullSet query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSet {
    /// Entries per chunk used during expansion
    pub chunk_size: u64,
    /// `indices[i]` lies in chunk `i`
    pub indices: Vec<u64>,
}

impl IndexSet {
    /// Expand a key into `set_size` indices, one per chunk
    pub fn expand(key: &PrfKey, set_size: u64, chunk_size: u64) -> Self {
        let prf = Prf::new(key);
        let indices = (0..set_size)
            .map(|i| i.wrapping_mul(chunk_size).wrapping_add(prf.eval_mod(i, chunk_size)))
            .collect();

        Self { chunk_size, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.indices.iter().copied()
    }

    /// Index chosen inside chunk `chunk`, if the set reaches it
    pub fn index_in_chunk(&self, chunk: u64) -> Option<u64> {
        usize::try_from(chunk).ok().and_then(|c| self.indices.get(c).copied())
    }

    /// O(1) membership: only chunk `target / chunk_size` can hold `target`
    pub fn contains(&self, target: u64) -> bool {
        if self.chunk_size == 0 {
            return false;
        }
        self.index_in_chunk(target / self.chunk_size) == Some(target)
    }

    /// First `n` indices, for display
    pub fn sample(&self, n: usize) -> &[u64] {
        &self.indices[..n.min(self.indices.len())]
    }
}

/// Expand a key into a set (convenience function)
pub fn expand(key: &PrfKey, set_size: u64, chunk_size: u64) -> IndexSet {
    IndexSet::expand(key, set_size, chunk_size)
}
