//! Configuration loading
//!
//! Two layers:
//! - [`CacheConfig`] is what the engine needs to build a [`crate::Cache`].
//! - [`Config`] is the server's TOML file. Every section and key is optional;
//!   a missing file means "all defaults".
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8448
//!
//! [cache]
//! default_expiration_ms = 0      # 0 = keys only expire via SETEX
//! clean_interval_ms = 500
//! unlink_interval_ms = 1000
//! concurrency = "default"        # or a number
//!
//! [snapshot]
//! dir = "/var/lib/tidekv"
//! file_name = "dump"
//!
//! [logging]
//! level = "info"
//! ```

use crate::storage::DEFAULT_SWEEP_BUDGET;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Engine configuration for a [`crate::Cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL for every key. `Some` puts the cache in single-bucket mode;
    /// `None` keeps persistent and volatile keys apart.
    pub default_expiration: Option<Duration>,
    /// Tick of the active-expiry sweeper
    pub clean_interval: Duration,
    /// Tick of the unlink drain cycle
    pub unlink_interval: Duration,
    /// Reads allowed to run at once
    pub read_concurrency: usize,
    /// Jobs the executor queue holds before submitters wait
    pub queue_capacity: usize,
    /// Entries visited per sweep tick
    pub sweep_budget: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_expiration: None,
            clean_interval: Duration::from_millis(500),
            unlink_interval: Duration::from_secs(1),
            read_concurrency: default_read_concurrency(),
            queue_capacity: 1024,
            sweep_budget: DEFAULT_SWEEP_BUDGET,
        }
    }
}

/// Two read slots per available CPU.
pub fn default_read_concurrency() -> usize {
    2 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Server configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Longest request line accepted before the connection is dropped
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// `concurrency` accepts a number or the word `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    Fixed(usize),
    Named(String),
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Named("default".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    /// 0 disables the default expiration
    #[serde(default)]
    pub default_expiration_ms: u64,
    #[serde(default = "default_clean_interval_ms")]
    pub clean_interval_ms: u64,
    #[serde(default = "default_unlink_interval_ms")]
    pub unlink_interval_ms: u64,
    #[serde(default)]
    pub concurrency: Concurrency,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sweep_budget")]
    pub sweep_budget: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_expiration_ms: 0,
            clean_interval_ms: default_clean_interval_ms(),
            unlink_interval_ms: default_unlink_interval_ms(),
            concurrency: Concurrency::default(),
            queue_capacity: default_queue_capacity(),
            sweep_budget: default_sweep_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Directory for snapshot files; snapshots are disabled when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_true")]
    pub load_on_start: bool,
    #[serde(default = "default_true")]
    pub save_on_shutdown: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file_name: default_file_name(),
            load_on_start: true,
            save_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    crate::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_max_datagram_size() -> usize {
    crate::protocol::DEFAULT_MAX_DATAGRAM_SIZE
}

fn default_clean_interval_ms() -> u64 {
    500
}

fn default_unlink_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sweep_budget() -> usize {
    DEFAULT_SWEEP_BUDGET
}

fn default_file_name() -> String {
    "dump".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.clean_interval_ms == 0 {
            bail!("cache.clean_interval_ms must be greater than 0");
        }
        if cache.unlink_interval_ms == 0 {
            bail!("cache.unlink_interval_ms must be greater than 0");
        }
        if cache.queue_capacity == 0 {
            bail!("cache.queue_capacity must be greater than 0");
        }
        if cache.sweep_budget == 0 {
            bail!("cache.sweep_budget must be greater than 0");
        }
        self.read_concurrency()?;

        if self.server.max_datagram_size == 0 {
            bail!("server.max_datagram_size must be greater than 0");
        }
        if self.snapshot.file_name.trim().is_empty() {
            bail!("snapshot.file_name must not be empty");
        }
        Ok(())
    }

    fn read_concurrency(&self) -> Result<usize> {
        match &self.cache.concurrency {
            Concurrency::Fixed(0) => bail!("cache.concurrency must be greater than 0"),
            Concurrency::Fixed(n) => Ok(*n),
            Concurrency::Named(word) if word.eq_ignore_ascii_case("default") => {
                Ok(default_read_concurrency())
            }
            Concurrency::Named(word) => {
                bail!("cache.concurrency must be a number or \"default\", got \"{}\"", word)
            }
        }
    }

    /// The engine configuration described by the `[cache]` section.
    pub fn cache_config(&self) -> Result<CacheConfig> {
        let cache = &self.cache;
        Ok(CacheConfig {
            default_expiration: (cache.default_expiration_ms > 0)
                .then(|| Duration::from_millis(cache.default_expiration_ms)),
            clean_interval: Duration::from_millis(cache.clean_interval_ms),
            unlink_interval: Duration::from_millis(cache.unlink_interval_ms),
            read_concurrency: self.read_concurrency()?,
            queue_capacity: cache.queue_capacity,
            sweep_budget: cache.sweep_budget,
        })
    }

    /// Base path for snapshot files, if snapshots are enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot
            .dir
            .as_ref()
            .map(|dir| dir.join(&self.snapshot.file_name))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
