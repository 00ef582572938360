//! Process configuration for the admission chain, the ledger and the counter store.
//!
//! Loaded once at startup by the surrounding service and handed to the
//! constructors; nothing in this crate reads configuration lazily or keeps it
//! in a global.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Errors produced when loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration document is malformed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// Partition count must be > 0.
    #[error("partitions must be > 0 (got {provided})")]
    InvalidPartitions {
        /// Value provided by caller.
        provided: usize,
    },
    /// Limiter refill rate must be finite and > 0.
    #[error("limiter '{namespace}': rate must be > 0 (got {provided})")]
    InvalidRate {
        /// Offending namespace.
        namespace: String,
        /// Value provided by caller.
        provided: f64,
    },
    /// Limiter capacity must be finite and > 0.
    #[error("limiter '{namespace}': capacity must be > 0 (got {provided})")]
    InvalidCapacity {
        /// Offending namespace.
        namespace: String,
        /// Value provided by caller.
        provided: f64,
    },
    /// Namespaces must be non-empty.
    #[error("limiter namespace cannot be empty")]
    EmptyNamespace,
    /// Two levels would share one bucket.
    #[error("limiter namespace '{0}' is configured twice")]
    DuplicateNamespace(String),
}

/// One level of the admission chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LimiterConfig {
    /// Bucket namespace, e.g. `"per-ip"` or `"global"`.
    pub namespace: String,
    /// Tokens added per second.
    pub rate: f64,
    /// Bucket size (maximum burst).
    #[serde(alias = "cap")]
    pub capacity: f64,
}

impl LimiterConfig {
    /// Create a validated limiter config.
    pub fn new(namespace: impl Into<String>, rate: f64, capacity: f64) -> Result<Self, ConfigError> {
        let cfg = Self { namespace: namespace.into(), rate, capacity };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check rate, capacity and namespace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(ConfigError::InvalidRate {
                namespace: self.namespace.clone(),
                provided: self.rate,
            });
        }
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ConfigError::InvalidCapacity {
                namespace: self.namespace.clone(),
                provided: self.capacity,
            });
        }
        Ok(())
    }
}

/// Connection parameters for the shared counter store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 6379, db: 0, password: None }
    }
}

impl StoreConfig {
    /// Render a `redis://` connection URL for the store adapter.
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_partitions() -> usize {
    4
}

fn default_cache_ttl_ms() -> u64 {
    100
}

fn default_prefetch() -> u32 {
    crate::rate_limit::token_bucket::DEFAULT_PREFETCH
}

/// Top-level configuration consumed by this crate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlashSaleConfig {
    /// Admission levels, checked in this order.
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
    /// Number of order partitions. Fixed for the lifetime of the deployment.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// How long a limiter may spend its local reserve. Capped per level at
    /// half the level's refill interval.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Extra tokens each remote acquisition reserves for the local tier.
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for FlashSaleConfig {
    fn default() -> Self {
        Self {
            limiters: Vec::new(),
            partitions: default_partitions(),
            cache_ttl_ms: default_cache_ttl_ms(),
            prefetch: default_prefetch(),
            store: StoreConfig::default(),
        }
    }
}

impl FlashSaleConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check every limiter level and the partition count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::InvalidPartitions { provided: 0 });
        }
        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            limiter.validate()?;
            if !seen.insert(limiter.namespace.as_str()) {
                return Err(ConfigError::DuplicateNamespace(limiter.namespace.clone()));
            }
        }
        Ok(())
    }

    /// Local cache TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}
