//! Query construction and decoding
//!
//! A private query goes `Idle -> AwaitingServerResponse -> Decoded` (or
//! `Failed`):
//! 1. resolve the address to a target index
//! 2. draw a fresh PRF key and expand it to one index per chunk
//! 3. send only the key; the server answers with the parity of the set
//! 4. recompute the parity from the hint; `delta = server ^ hint`
//! 5. read the target entry from the hint
//!
//! A non-zero delta means the hint is stale somewhere in the set. It does not
//! say whether the target itself is stale, so the decoded value is still the
//! hint's and the parities are surfaced for the caller to judge.

use std::sync::Arc;
use std::time::Instant;

use pir_core::{HintMetadata, IndexSet, PrfKey};
use serde::Serialize;

use crate::error::{ClientError, Result};
use crate::hint_store::{HintStore, SharedHintStore};
use crate::resolver::IndexResolver;
use crate::transport::{PirServer, ServerAnswer};

/// Indices kept in [`DecodedQuery::index_set_sample`]
const SAMPLE_SIZE: usize = 5;

/// Lifecycle of a single private query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryPhase {
    Idle,
    AwaitingServerResponse,
    Decoded,
    Failed,
}

impl std::fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryPhase::Idle => "idle",
            QueryPhase::AwaitingServerResponse => "awaiting_server_response",
            QueryPhase::Decoded => "decoded",
            QueryPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Key and index set ready to be sent
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    key: PrfKey,
    target_index: u64,
    metadata: HintMetadata,
    index_set: IndexSet,
}

impl PreparedQuery {
    pub fn new(key: PrfKey, target_index: u64, metadata: HintMetadata) -> Self {
        let index_set = IndexSet::expand(&key, metadata.set_size, metadata.chunk_size);
        Self {
            key,
            target_index,
            metadata,
            index_set,
        }
    }

    /// Fresh random key
    pub fn random(target_index: u64, metadata: HintMetadata) -> Self {
        Self::new(PrfKey::random(), target_index, metadata)
    }

    pub fn key(&self) -> &PrfKey {
        &self.key
    }

    pub fn index_set(&self) -> &IndexSet {
        &self.index_set
    }

    pub fn target_index(&self) -> u64 {
        self.target_index
    }

    /// Decode the server's parity against the hint
    pub fn decode(self, answer: ServerAnswer, hints: &HintStore) -> DecodedQuery {
        let hint_parity = hints.parity(&self.index_set);
        let value = hints.read_entry(self.target_index);

        DecodedQuery {
            value,
            target_index: self.target_index,
            target_chunk: self.metadata.chunk_of(self.target_index),
            target_in_set: self.index_set.contains(self.target_index),
            prf_key: self.key,
            index_set_size: self.index_set.len(),
            index_set_sample: self.index_set.sample(SAMPLE_SIZE).to_vec(),
            server_parity: answer.value,
            hint_parity,
            delta: answer.value ^ hint_parity,
            chunk_size: self.metadata.chunk_size,
            set_size: self.metadata.set_size,
            server_time_nanos: answer.server_time_nanos,
            elapsed_ms: 0.0,
        }
    }
}

/// Result of a private query, with the data needed to judge staleness
#[derive(Debug, Clone, Serialize)]
pub struct DecodedQuery {
    /// Target entry as read from the hint
    pub value: u64,
    pub target_index: u64,
    pub target_chunk: u64,
    /// Whether the random set happened to include the target
    pub target_in_set: bool,
    #[serde(skip)]
    pub prf_key: PrfKey,
    pub index_set_size: usize,
    pub index_set_sample: Vec<u64>,
    pub server_parity: u64,
    pub hint_parity: u64,
    /// `server_parity ^ hint_parity`; non-zero means the hint is stale
    pub delta: u64,
    pub chunk_size: u64,
    pub set_size: u64,
    pub server_time_nanos: u64,
    pub elapsed_ms: f64,
}

impl DecodedQuery {
    /// Server and hint agree on the queried set
    pub fn is_consistent(&self) -> bool {
        self.delta == 0
    }
}

/// Result of a non-private query
#[derive(Debug, Clone, Serialize)]
pub struct PlaintextAnswer {
    pub value: u64,
    pub target_index: u64,
    pub server_time_nanos: u64,
}

/// Drives queries against the shared hint
pub struct QueryEngine<S, R> {
    hints: SharedHintStore,
    server: Arc<S>,
    resolver: Arc<R>,
}

impl<S, R> QueryEngine<S, R>
where
    S: PirServer,
    R: IndexResolver,
{
    pub fn new(hints: SharedHintStore, server: Arc<S>, resolver: Arc<R>) -> Self {
        Self {
            hints,
            server,
            resolver,
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    /// Resolve an address against the loaded hint's database size
    pub async fn resolve(&self, address: &str) -> Result<u64> {
        let database_size = self
            .hints
            .read()
            .await
            .metadata()
            .ok()
            .map(|m| m.database_size);
        self.resolver.resolve(address, database_size)
    }

    /// Private balance query for `address`
    pub async fn query_private(&self, address: &str) -> Result<DecodedQuery> {
        let target_index = self.resolve(address).await?;
        self.query_index_private(target_index).await
    }

    /// Private query for a known database index
    pub async fn query_index_private(&self, target_index: u64) -> Result<DecodedQuery> {
        let start = Instant::now();
        let metadata = *self.hints.read().await.metadata()?;

        let prepared = PreparedQuery::random(target_index, metadata);
        tracing::debug!(
            phase = %QueryPhase::Idle,
            key = %prepared.key().short_hex(),
            set_size = metadata.set_size,
            "Prepared FullSet query"
        );

        tracing::debug!(phase = %QueryPhase::AwaitingServerResponse, "Sending FullSet query");
        let answer = match self.server.query_fullset(prepared.key()).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(phase = %QueryPhase::Failed, error = %e, "FullSet query failed");
                return Err(e);
            }
        };

        let mut decoded = {
            let hints = self.hints.read().await;
            prepared.decode(answer, &hints)
        };
        decoded.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        if decoded.is_consistent() {
            tracing::debug!(
                phase = %QueryPhase::Decoded,
                elapsed_ms = decoded.elapsed_ms,
                "FullSet query decoded"
            );
        } else {
            tracing::warn!(
                phase = %QueryPhase::Decoded,
                server_parity = decoded.server_parity,
                hint_parity = decoded.hint_parity,
                delta = decoded.delta,
                "Parity mismatch, hint may be stale"
            );
        }

        Ok(decoded)
    }

    /// Non-private query: the server learns the index
    pub async fn query_plaintext(&self, address: &str) -> Result<PlaintextAnswer> {
        let target_index = self.resolve(address).await?;
        tracing::warn!("Plaintext query: the server sees which index is requested");

        let answer = self.server.query_plaintext(target_index).await?;
        Ok(PlaintextAnswer {
            value: answer.value,
            target_index,
            server_time_nanos: answer.server_time_nanos,
        })
    }

    /// Server-side parity of an explicit set (non-private, debugging only)
    pub async fn query_set_parity(&self, indices: &[u64]) -> Result<u64> {
        self.server.query_set_parity(indices).await
    }

    /// Check the server serves the same database shape as the hint
    pub async fn verify_server_params(&self) -> Result<HintMetadata> {
        let metadata = *self.hints.read().await.metadata()?;
        let health = self.server.health().await?;

        let checks = [
            ("db_size", metadata.database_size, health.db_size),
            ("chunk_size", metadata.chunk_size, health.chunk_size),
            ("set_size", metadata.set_size, health.set_size),
        ];
        for (field, hint, server) in checks {
            if hint != server {
                return Err(ClientError::ParamsMismatch {
                    field,
                    hint,
                    server,
                });
            }
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PlaceholderResolver;
    use crate::transport::ServerHealth;
    use pir_core::codec::encode_hint;
    use std::sync::Mutex;

    /// Server holding its own copy of the database
    struct FakeServer {
        metadata: HintMetadata,
        db: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl FakeServer {
        fn new(metadata: HintMetadata, db: Vec<u64>) -> Self {
            Self {
                metadata,
                db: Mutex::new(db),
                fail: false,
            }
        }

        fn entry(&self, idx: u64) -> u64 {
            self.db.lock().unwrap().get(idx as usize).copied().unwrap_or(0)
        }
    }

    impl PirServer for FakeServer {
        async fn query_fullset(&self, key: &PrfKey) -> Result<ServerAnswer> {
            if self.fail {
                return Err(ClientError::QueryFailed {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            let set = IndexSet::expand(key, self.metadata.set_size, self.metadata.chunk_size);
            let value = set.iter().fold(0, |acc, idx| acc ^ self.entry(idx));
            Ok(ServerAnswer {
                value,
                server_time_nanos: 10,
            })
        }

        async fn query_plaintext(&self, index: u64) -> Result<ServerAnswer> {
            Ok(ServerAnswer {
                value: self.entry(index),
                server_time_nanos: 1,
            })
        }

        async fn query_set_parity(&self, indices: &[u64]) -> Result<u64> {
            Ok(indices.iter().fold(0, |acc, &idx| acc ^ self.entry(idx)))
        }

        async fn health(&self) -> Result<ServerHealth> {
            Ok(ServerHealth {
                status: "healthy".into(),
                service: None,
                db_size: self.metadata.database_size,
                chunk_size: self.metadata.chunk_size,
                set_size: 99,
            })
        }
    }

    fn metadata() -> HintMetadata {
        HintMetadata { database_size: 64, chunk_size: 8, set_size: 8 }
    }

    fn database() -> Vec<u64> {
        (0..64).map(|i| i * 1_000_003 + 17).collect()
    }

    fn engine(server: FakeServer) -> QueryEngine<FakeServer, PlaceholderResolver> {
        let hints = HintStore::from_bytes(encode_hint(&metadata(), &database()))
            .unwrap()
            .into_shared();
        QueryEngine::new(hints, Arc::new(server), Arc::new(PlaceholderResolver))
    }

    #[tokio::test]
    async fn test_decode_synchronized_hint() {
        let engine = engine(FakeServer::new(metadata(), database()));

        for target in [0u64, 13, 63] {
            let decoded = engine.query_index_private(target).await.unwrap();
            assert!(decoded.is_consistent());
            assert_eq!(decoded.server_parity, decoded.hint_parity);
            assert_eq!(decoded.value, database()[target as usize]);
            assert_eq!(decoded.index_set_size, 8);
            assert_eq!(decoded.target_chunk, target / 8);
        }
    }

    #[tokio::test]
    async fn test_desync_outside_target_detected() {
        let mut server_db = database();
        let key = PrfKey::new([3u8; 16]);
        let set = IndexSet::expand(&key, 8, 8);

        // Change one entry in the set, in chunk 5; target sits in chunk 0
        let changed = set.index_in_chunk(5).unwrap();
        server_db[changed as usize] ^= 0xabc;
        let server = FakeServer::new(metadata(), server_db);

        let prepared = PreparedQuery::new(key, 2, metadata());
        let answer = server.query_fullset(prepared.key()).await.unwrap();
        let hints = HintStore::from_bytes(encode_hint(&metadata(), &database())).unwrap();
        let decoded = prepared.decode(answer, &hints);

        assert_eq!(decoded.delta, 0xabc);
        assert!(!decoded.is_consistent());
        assert_eq!(decoded.value, database()[2]);
    }

    #[tokio::test]
    async fn test_server_failure_propagates() {
        let mut server = FakeServer::new(metadata(), database());
        server.fail = true;
        let engine = engine(server);

        let result = engine.query_index_private(1).await;
        assert!(matches!(result, Err(ClientError::QueryFailed { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_query_requires_hint() {
        let engine = QueryEngine::new(
            HintStore::new().into_shared(),
            Arc::new(FakeServer::new(metadata(), database())),
            Arc::new(PlaceholderResolver),
        );

        assert!(matches!(
            engine.query_index_private(1).await,
            Err(ClientError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_fresh_key_per_query() {
        let engine = engine(FakeServer::new(metadata(), database()));
        let a = engine.query_index_private(5).await.unwrap();
        let b = engine.query_index_private(5).await.unwrap();
        assert_ne!(a.prf_key, b.prf_key);
    }

    #[tokio::test]
    async fn test_plaintext_query() {
        let engine = engine(FakeServer::new(metadata(), database()));
        let address = "0x0101010101010101010101010101010101010101";

        let answer = engine.query_plaintext(address).await.unwrap();
        assert_eq!(answer.target_index, 20);
        assert_eq!(answer.value, database()[20]);
    }

    #[tokio::test]
    async fn test_set_parity_matches_hint() {
        let engine = engine(FakeServer::new(metadata(), database()));
        let set = IndexSet::expand(&PrfKey::new([9u8; 16]), 8, 8);

        let server_parity = engine.query_set_parity(&set.indices).await.unwrap();
        let hint_parity = engine.hints.read().await.parity(&set);
        assert_eq!(server_parity, hint_parity);
    }

    #[tokio::test]
    async fn test_verify_server_params_mismatch() {
        let engine = engine(FakeServer::new(metadata(), database()));
        let result = engine.verify_server_params().await;

        assert!(matches!(
            result,
            Err(ClientError::ParamsMismatch { field: "set_size", hint: 8, server: 99 })
        ));
    }
}
