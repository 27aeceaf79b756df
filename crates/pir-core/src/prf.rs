//! PRF (Pseudorandom Function) for FullSet index selection
//!
//! 32-bit FNV-1a over `key || x.to_le_bytes()`, reduced mod `m`. The server
//! expands the same key with the same function, so the output must be
//! bit-identical on every target: the state is a `u32` and the multiply is
//! done in `u64` and masked back to 32 bits.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::PRF_KEY_SIZE;

/// FNV-1a 32-bit offset basis
pub const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;

/// FNV-1a 32-bit prime
pub const FNV_PRIME: u32 = 0x0100_0193;

/// 16-byte PRF key. Generated fresh for every query and never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrfKey([u8; PRF_KEY_SIZE]);

impl PrfKey {
    pub fn new(bytes: [u8; PRF_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Draw a key from the operating system CSPRNG
    pub fn random() -> Self {
        let mut bytes = [0u8; PRF_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PRF_KEY_SIZE] {
        &self.0
    }

    /// Hex of the first 8 bytes, for logs
    pub fn short_hex(&self) -> String {
        self.0[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<[u8; PRF_KEY_SIZE]> for PrfKey {
    fn from(bytes: [u8; PRF_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

// Keys are query secrets; keep them out of Debug output.
impl std::fmt::Debug for PrfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrfKey({}..)", self.short_hex())
    }
}

#[inline]
fn fnv1a_step(hash: u32, byte: u8) -> u32 {
    let mixed = hash ^ u32::from(byte);
    ((u64::from(mixed) * u64::from(FNV_PRIME)) & 0xFFFF_FFFF) as u32
}

/// PRF keyed by a [`PrfKey`]
#[derive(Clone, Debug)]
pub struct Prf {
    /// FNV state after absorbing the key
    keyed_state: u32,
}

impl Prf {
    pub fn new(key: &PrfKey) -> Self {
        let keyed_state = key.0.iter().fold(FNV_OFFSET_BASIS, |h, &b| fnv1a_step(h, b));
        Self { keyed_state }
    }

    /// Raw 32-bit hash of `key || x` (little-endian)
    pub fn hash(&self, x: u64) -> u32 {
        x.to_le_bytes()
            .iter()
            .fold(self.keyed_state, |h, &b| fnv1a_step(h, b))
    }

    /// `PRF(key, x) mod m`; returns 0 when `m == 0`
    pub fn eval_mod(&self, x: u64, m: u64) -> u64 {
        if m == 0 {
            return 0;
        }
        u64::from(self.hash(x)) % m
    }
}

/// One-shot evaluation (convenience function)
pub fn eval(key: &PrfKey, x: u64, m: u64) -> u64 {
    Prf::new(key).eval_mod(x, m)
}
