//! Remote collaborators: the PIR server and the hint/delta CDN
//!
//! Both are traits so the engine and synchronizer can run against in-memory
//! fakes; the HTTP implementations sit on `reqwest`.

use std::future::Future;
use std::time::Duration;

use pir_core::codec::{delta_file_name, parse_delta_listing};
use pir_core::PrfKey;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Request body for `POST /query/fullset`
#[derive(Debug, Serialize, Deserialize)]
pub struct FullSetRequest {
    pub prf_key: PrfKey,
}

/// Request body for `POST /query/plaintext`
#[derive(Debug, Serialize, Deserialize)]
pub struct PlaintextRequest {
    pub index: u64,
}

/// Request body for `POST /query/setparity`
#[derive(Debug, Serialize, Deserialize)]
pub struct SetParityRequest {
    pub indices: Vec<u64>,
}

/// Response of the fullset and plaintext endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAnswer {
    pub value: u64,
    #[serde(default)]
    pub server_time_nanos: u64,
}

/// Response of the setparity endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParityResponse {
    pub parity: u64,
    #[serde(default)]
    pub server_time_nanos: u64,
}

/// Response of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHealth {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    pub db_size: u64,
    pub chunk_size: u64,
    pub set_size: u64,
}

/// PIR query server
pub trait PirServer: Send + Sync {
    /// Private query: the key is the only payload; returns the set parity
    fn query_fullset(&self, key: &PrfKey) -> impl Future<Output = Result<ServerAnswer>> + Send;

    /// Non-private query: the server sees `index`
    fn query_plaintext(&self, index: u64) -> impl Future<Output = Result<ServerAnswer>> + Send;

    /// Non-private parity of an explicit index list (debug path)
    fn query_set_parity(&self, indices: &[u64]) -> impl Future<Output = Result<u64>> + Send;

    fn health(&self) -> impl Future<Output = Result<ServerHealth>> + Send;
}

/// Source of the full hint and per-block delta files
pub trait DeltaSource: Send + Sync {
    /// Full `hint.bin` image
    fn fetch_hint(&self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Block numbers for which a delta file is published
    fn list_delta_blocks(&self) -> impl Future<Output = Result<Vec<u64>>> + Send;

    /// Raw delta file for `block`
    fn fetch_delta(&self, block: u64) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

fn build_http(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

async fn ensure_success(resp: Response) -> Result<Response> {
    if !resp.status().is_success() {
        return Err(ClientError::QueryFailed {
            status: resp.status().as_u16(),
            message: resp.text().await.unwrap_or_default(),
        });
    }
    Ok(resp)
}

/// HTTP client for the PIR server
pub struct HttpPirServer {
    http: Client,
    base_url: String,
}

impl HttpPirServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(&self, path: &str, body: &T) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json().await?)
    }
}

impl PirServer for HttpPirServer {
    async fn query_fullset(&self, key: &PrfKey) -> Result<ServerAnswer> {
        self.post_json("/query/fullset", &FullSetRequest { prf_key: *key })
            .await
    }

    async fn query_plaintext(&self, index: u64) -> Result<ServerAnswer> {
        self.post_json("/query/plaintext", &PlaintextRequest { index })
            .await
    }

    async fn query_set_parity(&self, indices: &[u64]) -> Result<u64> {
        let body = SetParityRequest {
            indices: indices.to_vec(),
        };
        let resp: ParityResponse = self.post_json("/query/setparity", &body).await?;
        Ok(resp.parity)
    }

    async fn health(&self) -> Result<ServerHealth> {
        let url = format!("{}/health", self.base_url);
        let resp = ensure_success(self.http.get(&url).send().await?).await?;
        Ok(resp.json().await?)
    }
}

/// HTTP client for the CDN serving `hint.bin` and `deltas/`
pub struct HttpCdn {
    http: Client,
    base_url: String,
}

impl HttpCdn {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(ClientError::Network(format!(
                "HTTP {} from {}",
                resp.status(),
                url
            )));
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

impl DeltaSource for HttpCdn {
    async fn fetch_hint(&self) -> Result<Vec<u8>> {
        self.get_bytes("/hint.bin").await
    }

    async fn list_delta_blocks(&self) -> Result<Vec<u64>> {
        let listing = self.get_bytes("/deltas/").await?;
        Ok(parse_delta_listing(&String::from_utf8_lossy(&listing)))
    }

    async fn fetch_delta(&self, block: u64) -> Result<Vec<u8>> {
        self.get_bytes(&format!("/deltas/{}", delta_file_name(block)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fullset_request_wire_format() {
        let body = FullSetRequest {
            prf_key: PrfKey::new([0u8; 16]),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"prf_key":[0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0]}"#);
    }

    #[test]
    fn test_answer_accepts_large_values() {
        let answer: ServerAnswer =
            serde_json::from_str(r#"{"value":18446744073709551615,"server_time_nanos":1200}"#)
                .unwrap();
        assert_eq!(answer.value, u64::MAX);
        assert_eq!(answer.server_time_nanos, 1200);
    }

    #[test]
    fn test_health_parse() {
        let health: ServerHealth = serde_json::from_str(
            r#"{"status":"healthy","service":"plinko-pir-server","db_size":16,"chunk_size":4,"set_size":4}"#,
        )
        .unwrap();
        assert_eq!(health.db_size, 16);
        assert_eq!(health.service.as_deref(), Some("plinko-pir-server"));
    }

    #[test]
    fn test_base_url_trimmed() {
        let server = HttpPirServer::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(server.base_url(), "http://localhost:3000");
    }
}
