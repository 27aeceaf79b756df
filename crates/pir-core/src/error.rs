//! Codec error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer is shorter than its header (or declared count) implies
    #[error("Malformed {what}: expected at least {expected} bytes, got {actual}")]
    MalformedInput {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Declared sizes do not fit in the address space
    #[error("Malformed {what}: declared size overflows ({count} items)")]
    SizeOverflow { what: &'static str, count: u64 },
}

pub type Result<T> = std::result::Result<T, CodecError>;
