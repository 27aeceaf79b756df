//! Client configuration
//!
//! Every field can come from a flag, an environment variable or a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::progress::FileProgressStore;
use crate::resolver::{IndexResolver, MappingTableResolver, PlaceholderResolver};
use crate::sync::MIN_SYNC_INTERVAL;

pub const DEFAULT_PIR_SERVER_URL: &str = "http://localhost:3000";
pub const DEFAULT_CDN_URL: &str = "http://localhost:8080";
pub const DEFAULT_PROGRESS_PATH: &str = "./plinko-data/plinko_current_block.json";

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// PIR query server
    #[arg(long, env = "PLINKO_PIR_SERVER_URL", default_value = DEFAULT_PIR_SERVER_URL)]
    #[serde(default = "default_pir_server_url")]
    pub pir_server_url: String,

    /// CDN serving hint.bin and deltas/
    #[arg(long, env = "PLINKO_CDN_URL", default_value = DEFAULT_CDN_URL)]
    #[serde(default = "default_cdn_url")]
    pub cdn_url: String,

    /// Where the sync watermark is persisted
    #[arg(long, env = "PLINKO_PROGRESS_PATH", default_value = DEFAULT_PROGRESS_PATH)]
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,

    /// Patched hint saved with its watermark after each sync pass; without
    /// one every start downloads the hint and replays deltas from block 1
    #[arg(long, env = "PLINKO_HINT_CHECKPOINT")]
    #[serde(default)]
    pub hint_checkpoint: Option<PathBuf>,

    /// address-mapping.bin lookup table; placeholder hash when absent
    #[arg(long, env = "PLINKO_ADDRESS_MAPPING")]
    #[serde(default)]
    pub address_mapping: Option<PathBuf>,

    /// Seconds between periodic sync passes
    #[arg(long, env = "PLINKO_SYNC_INTERVAL_SECS", default_value = "30")]
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Per-request HTTP timeout
    #[arg(long, env = "PLINKO_REQUEST_TIMEOUT_SECS", default_value = "30")]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_pir_server_url() -> String {
    DEFAULT_PIR_SERVER_URL.to_string()
}

fn default_cdn_url() -> String {
    DEFAULT_CDN_URL.to_string()
}

fn default_progress_path() -> PathBuf {
    PathBuf::from(DEFAULT_PROGRESS_PATH)
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pir_server_url: default_pir_server_url(),
            cdn_url: default_cdn_url(),
            progress_path: default_progress_path(),
            hint_checkpoint: None,
            address_mapping: None,
            sync_interval_secs: default_sync_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Sync interval, never below one second
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs).max(MIN_SYNC_INTERVAL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn progress_store(&self) -> FileProgressStore {
        FileProgressStore::new(&self.progress_path)
    }

    /// Mapping table if configured, otherwise the placeholder hash
    pub fn resolver(&self) -> Result<Box<dyn IndexResolver>> {
        match &self.address_mapping {
            Some(path) => Ok(Box::new(MappingTableResolver::load(path)?)),
            None => {
                tracing::warn!("No address mapping configured, using placeholder index hash");
                Ok(Box::new(PlaceholderResolver))
            }
        }
    }
}
