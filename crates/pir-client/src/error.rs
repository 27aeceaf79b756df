//! Client error types

use pir_core::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Malformed input: {0}")]
    MalformedInput(#[from] CodecError),

    #[error("Hint not loaded - download the hint before querying or syncing")]
    NotLoaded,

    #[error("Write of {len} bytes at offset {offset} exceeds hint buffer ({buffer_len} bytes)")]
    OutOfRange {
        offset: usize,
        len: usize,
        buffer_len: usize,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Query failed: {status} - {message}")]
    QueryFailed { status: u16, message: String },

    #[error("Index resolution failed: {0}")]
    IndexResolution(String),

    #[error("Server parameter mismatch: {field} - hint has {hint}, server has {server}")]
    ParamsMismatch {
        field: &'static str,
        hint: u64,
        server: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hint checkpoint error: {0}")]
    Checkpoint(#[from] bincode::Error),
}

impl ClientError {
    /// Whether the failure came from the transport rather than local state
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ClientError::Http(_) | ClientError::Network(_) | ClientError::QueryFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
