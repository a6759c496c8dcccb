//! Service configuration, loaded from a TOML file
use super::workflow::WorkflowConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Holds the sled database.
    pub data_dir: PathBuf,
    pub blobs: BlobConfig,
    pub ledger: LedgerConfig,
    pub notifier: NotifierConfig,
    pub reconcile: ReconcileConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub root: PathBuf,
    pub public_base_url: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub explorer_tx_url: Option<String>,
    /// Bound on waiting for a confirmation.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            blobs: BlobConfig::default(),
            ledger: LedgerConfig::default(),
            notifier: NotifierConfig::default(),
            reconcile: ReconcileConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/blobs"),
            public_base_url: "http://localhost:8080/files".into(),
            timeout_secs: Some(30),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            explorer_tx_url: None,
            timeout_secs: Some(120),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Some(30),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60 * 60,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".into(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.blobs.public_base_url.trim().is_empty() {
            anyhow::bail!("blobs.public_base_url must not be empty");
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("konek.db")
    }

    pub fn stale_after(&self) -> anyhow::Result<chrono::Duration> {
        seconds(self.reconcile.stale_after_secs).context("reconcile.stale_after_secs")
    }

    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig {
            blob_timeout: self.blobs.timeout_secs.map(Duration::from_secs),
            ledger_timeout: self.ledger.timeout_secs.map(Duration::from_secs),
            notify_timeout: self.notifier.timeout_secs.map(Duration::from_secs),
            explorer_tx_url: self.ledger.explorer_tx_url.clone(),
        }
    }
}

/// Converts a second count from config or the command line into a
/// `chrono::Duration`, failing instead of wrapping on huge values.
pub fn seconds(secs: u64) -> anyhow::Result<chrono::Duration> {
    let secs = i64::try_from(secs).with_context(|| format!("{secs} seconds is out of range"))?;
    chrono::TimeDelta::try_seconds(secs)
        .with_context(|| format!("{secs} seconds is out of range"))
}
