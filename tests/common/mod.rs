//! In-process mock of the PIR server and CDN
//!
//! One axum router serves both sides:
//! - `GET /hint.bin`, `GET /deltas/`, `GET /deltas/:name` (CDN)
//! - `POST /query/fullset`, `POST /query/plaintext`, `POST /query/setparity`,
//!   `GET /health` (PIR server)
//!
//! The hint is the snapshot taken at construction; updates go to the live
//! database and are published as delta files.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pir_client::transport::{
    FullSetRequest, ParityResponse, PlaintextRequest, ServerAnswer, ServerHealth, SetParityRequest,
};
use pir_client::ClientConfig;
use pir_core::codec::{delta_file_name, encode_hint, parse_delta_listing};
use pir_core::hint::delta_value;
use pir_core::{DeltaFile, DeltaRecord, HintMetadata, IndexSet};
use tokio::net::TcpListener;

pub struct MockState {
    pub metadata: HintMetadata,
    db: RwLock<Vec<u64>>,
    hint: RwLock<Option<Vec<u8>>>,
    deltas: RwLock<BTreeMap<u64, Vec<u8>>>,
    failing_blocks: RwLock<HashSet<u64>>,
    fail_queries: AtomicBool,
}

impl MockState {
    fn entry(&self, index: u64) -> u64 {
        self.db
            .read()
            .unwrap()
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }
}

pub struct MockPlinko {
    pub url: String,
    pub state: Arc<MockState>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl MockPlinko {
    /// Serve `entries` with the given chunking on an ephemeral port
    pub async fn start(entries: Vec<u64>, chunk_size: u64, set_size: u64) -> Self {
        let metadata = HintMetadata {
            database_size: entries.len() as u64,
            chunk_size,
            set_size,
        };
        let state = Arc::new(MockState {
            metadata,
            hint: RwLock::new(Some(encode_hint(&metadata, &entries))),
            db: RwLock::new(entries),
            deltas: RwLock::new(BTreeMap::new()),
            failing_blocks: RwLock::new(HashSet::new()),
            fail_queries: AtomicBool::new(false),
        });

        let router = Router::new()
            .route("/hint.bin", get(hint))
            .route("/deltas/", get(listing))
            .route("/deltas/:name", get(delta))
            .route("/query/fullset", post(fullset))
            .route("/query/plaintext", post(plaintext))
            .route("/query/setparity", post(setparity))
            .route("/health", get(health))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            url,
            state,
            _shutdown: shutdown_tx,
        }
    }

    /// Config pointing both server and CDN at the mock
    pub fn config(&self, data_dir: &Path) -> ClientConfig {
        ClientConfig {
            pir_server_url: self.url.clone(),
            cdn_url: self.url.clone(),
            progress_path: data_dir.join("plinko_current_block.json"),
            request_timeout_secs: 5,
            ..ClientConfig::default()
        }
    }

    /// Set the first entry of `chunk` to `new_value` and publish the delta
    /// as `block`
    pub fn publish_update(&self, block: u64, chunk: u64, new_value: u64) {
        let index = (chunk * self.state.metadata.chunk_size) as usize;
        let old_value = {
            let mut db = self.state.db.write().unwrap();
            std::mem::replace(&mut db[index], new_value)
        };

        let file = DeltaFile::new(vec![DeltaRecord {
            hint_set_id: chunk,
            is_backup_set: false,
            value: delta_value(old_value, new_value),
        }]);
        self.state
            .deltas
            .write()
            .unwrap()
            .insert(block, file.to_bytes());
    }

    pub fn fail_block(&self, block: u64, failing: bool) {
        let mut blocks = self.state.failing_blocks.write().unwrap();
        if failing {
            blocks.insert(block);
        } else {
            blocks.remove(&block);
        }
    }

    pub fn fail_queries(&self, failing: bool) {
        self.state.fail_queries.store(failing, Ordering::SeqCst);
    }

    pub fn remove_hint(&self) {
        *self.state.hint.write().unwrap() = None;
    }

    pub fn db(&self) -> Vec<u64> {
        self.state.db.read().unwrap().clone()
    }
}

async fn hint(State(state): State<Arc<MockState>>) -> Response {
    match state.hint.read().unwrap().clone() {
        Some(bytes) => bytes.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// nginx-style autoindex page
async fn listing(State(state): State<Arc<MockState>>) -> String {
    let mut html = String::from("<html><body><a href=\"../\">../</a>\n");
    for block in state.deltas.read().unwrap().keys() {
        let name = delta_file_name(*block);
        html.push_str(&format!("<a href=\"{0}\">{0}</a>\n", name));
    }
    html.push_str("<a href=\"README.txt\">README.txt</a></body></html>");
    html
}

async fn delta(State(state): State<Arc<MockState>>, UrlPath(name): UrlPath<String>) -> Response {
    let Some(&block) = parse_delta_listing(&name).first() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if state.failing_blocks.read().unwrap().contains(&block) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match state.deltas.read().unwrap().get(&block) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn fullset(
    State(state): State<Arc<MockState>>,
    Json(req): Json<FullSetRequest>,
) -> Result<Json<ServerAnswer>, (StatusCode, String)> {
    if state.fail_queries.load(Ordering::SeqCst) {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "overloaded".to_string()));
    }
    let set = IndexSet::expand(&req.prf_key, state.metadata.set_size, state.metadata.chunk_size);
    let value = set.iter().fold(0, |acc, idx| acc ^ state.entry(idx));
    Ok(Json(ServerAnswer {
        value,
        server_time_nanos: 1_000,
    }))
}

async fn plaintext(
    State(state): State<Arc<MockState>>,
    Json(req): Json<PlaintextRequest>,
) -> Result<Json<ServerAnswer>, (StatusCode, String)> {
    if req.index >= state.metadata.database_size {
        return Err((StatusCode::BAD_REQUEST, "index out of range".to_string()));
    }
    Ok(Json(ServerAnswer {
        value: state.entry(req.index),
        server_time_nanos: 500,
    }))
}

async fn setparity(
    State(state): State<Arc<MockState>>,
    Json(req): Json<SetParityRequest>,
) -> Json<ParityResponse> {
    let parity = req.indices.iter().fold(0, |acc, &idx| acc ^ state.entry(idx));
    Json(ParityResponse {
        parity,
        server_time_nanos: 800,
    })
}

async fn health(State(state): State<Arc<MockState>>) -> Json<ServerHealth> {
    Json(ServerHealth {
        status: "healthy".to_string(),
        service: Some("plinko-pir-server".to_string()),
        db_size: state.metadata.database_size,
        chunk_size: state.metadata.chunk_size,
        set_size: state.metadata.set_size,
    })
}
