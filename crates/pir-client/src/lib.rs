//! pir-client: Plinko PIR client
//!
//! Keeps a local hint of the balance database current through per-block XOR
//! deltas and answers balance lookups with FullSet queries that reveal only a
//! random PRF key to the server.

pub mod config;
pub mod error;
pub mod hint_store;
pub mod progress;
pub mod query;
pub mod resolver;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use hint_store::{HintStore, SharedHintStore};
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressStore, SyncProgress};
pub use query::{DecodedQuery, PlaintextAnswer, PreparedQuery, QueryEngine, QueryPhase};
pub use resolver::{IndexResolver, MappingTableResolver, PlaceholderResolver};
pub use session::{HttpSession, PlinkoSession};
pub use sync::{DeltaSynchronizer, SyncHandle, SyncReport, SyncTask};
pub use transport::{DeltaSource, HttpCdn, HttpPirServer, PirServer, ServerAnswer, ServerHealth};
