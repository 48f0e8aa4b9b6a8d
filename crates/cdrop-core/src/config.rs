use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::TransferError;
use crate::DEFAULT_CHUNK_SIZE;

/// Top-level configuration (loaded from cdrop.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdropConfig {
    pub transfer: TransferConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Read/write chunk size for cipher and digest streams (default: 2048)
    pub chunk_size: usize,
    /// Background worker count (0 = cpu_count)
    pub workers: usize,
    /// Directory for produced files when no explicit destination is given
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Record store backend: "fs", "memory", or "s3"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Key prefix for records inside the backend
    pub prefix: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket
    pub bucket: String,
    /// Refuse plaintext HTTP S3 endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            output_dir: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("~/.local/share/cdrop/store"),
            prefix: "cdrop".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "cdrop".into(),
            enforce_tls: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl TransferConfig {
    /// Effective worker count: configured value, or available parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl CdropConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(text: &str) -> Result<Self, TransferError> {
        let config: CdropConfig =
            toml::from_str(text).map_err(|e| TransferError::Config(format!("parsing: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransferError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.transfer.chunk_size == 0 {
            return Err(TransferError::Config(
                "transfer.chunk_size must be greater than zero".into(),
            ));
        }
        match self.store.backend.as_str() {
            "fs" | "memory" | "s3" => {}
            other => {
                return Err(TransferError::Config(format!(
                    "unknown store.backend '{other}' (expected fs, memory, or s3)"
                )))
            }
        }
        match self.log.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(TransferError::Config(format!(
                "unknown log.format '{other}' (expected json or text)"
            ))),
        }
    }
}
