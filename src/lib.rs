//! plinko-pir: Plinko PIR client
//!
//! - `pir_core`: wire codec, PRF, index-set expansion, parity helpers
//! - `pir_client`: hint store, query engine, delta sync, HTTP transports

pub use pir_client;
pub use pir_core;

pub use pir_client::{ClientConfig, ClientError, HttpSession, PlinkoSession};
pub use pir_core::{DeltaFile, DeltaRecord, HintMetadata, IndexSet, PrfKey};
