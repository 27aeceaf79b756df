//! PIR Core - Shared primitives for Plinko FullSet PIR
//!
//! This crate provides:
//! - Binary codec for the hint file header and per-block delta files
//! - FNV-1a based PRF that matches the server bit for bit
//! - PRF-driven index-set expansion (one index per chunk)
//! - XOR parity helpers over 8-byte entries
//!
//! Everything here is synchronous and I/O free; the async client lives in
//! `pir-client`.

pub mod codec;
pub mod error;
pub mod hint;
pub mod prf;
pub mod subset;

pub use codec::{DeltaFile, DeltaRecord, HintMetadata};
pub use error::CodecError;
pub use prf::{Prf, PrfKey};
pub use subset::IndexSet;

/// Database entry size in bytes (one u64 balance)
pub const ENTRY_SIZE: usize = 8;

/// Hint file header size in bytes
pub const HINT_HEADER_SIZE: usize = 32;

/// Delta file header size in bytes (count + reserved)
pub const DELTA_HEADER_SIZE: usize = 16;

/// Size of one encoded delta record in bytes
pub const DELTA_RECORD_SIZE: usize = 24;

/// PRF key length in bytes
pub const PRF_KEY_SIZE: usize = 16;
