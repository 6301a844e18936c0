//! Configuration for ledger-reconciler

use crate::kubo::KuboConfig;
use crate::pipeline::ReconcileOptions;
use crate::retry_ledger::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ledger-reconciler")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the state database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Kubo RPC API URL
    #[serde(default = "default_ipfs_url")]
    pub ipfs_url: String,

    /// Timeout of a single content fetch
    #[serde(default = "default_ipfs_timeout_ms")]
    pub ipfs_timeout_ms: u64,

    /// Maximum fetches in flight during a pass
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Extra attempts for connection failures within one pass
    #[serde(default = "default_max_in_pass_retries")]
    pub max_in_pass_retries: u32,

    /// Backoff unit for entries waiting in the retry ledger
    #[serde(default = "default_retry_base_interval")]
    pub retry_base_interval_secs: u64,

    /// Longest wait between two retries of the same entry
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval_secs: u64,

    /// Period of the sync loop
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// JSON export of ledger entries to reconcile
    #[serde(default)]
    pub ledger_file: Option<PathBuf>,
}

fn default_ipfs_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_ipfs_timeout_ms() -> u64 {
    10_000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_max_in_pass_retries() -> u32 {
    1
}

fn default_retry_base_interval() -> u64 {
    60
}

fn default_retry_max_interval() -> u64 {
    24 * 60 * 60
}

fn default_sync_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            ipfs_url: default_ipfs_url(),
            ipfs_timeout_ms: default_ipfs_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            max_in_pass_retries: default_max_in_pass_retries(),
            retry_base_interval_secs: default_retry_base_interval(),
            retry_max_interval_secs: default_retry_max_interval(),
            sync_interval_secs: default_sync_interval(),
            ledger_file: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// sled database holding the retry ledger and the metadata cache
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("state.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.ipfs_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_interval: Duration::from_secs(self.retry_base_interval_secs),
            max_interval: Duration::from_secs(self.retry_max_interval_secs),
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            concurrency: self.max_concurrency,
            max_in_pass_retries: self.max_in_pass_retries,
        }
    }

    pub fn kubo_config(&self) -> KuboConfig {
        KuboConfig {
            api_url: self.ipfs_url.clone(),
            timeout: self.fetch_timeout(),
        }
    }
}
