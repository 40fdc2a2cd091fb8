//! Configuration types for blockmesh
//!
//! All sections carry defaults so a partial TOML file (or none at all) is
//! enough to run. Command-line flags are layered on top by the binaries.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on the number of cached volume handles
pub const LRU_COUNT_MAX: usize = 512;

/// Default number of cached volume handles
pub const LRU_COUNT_DEFAULT: usize = 5;

/// Root configuration for blockmesh
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared storage configuration
    pub store: StoreConfig,
    /// Remote execution configuration
    pub executor: ExecutorConfig,
    /// Volume handle cache configuration
    pub cache: CacheConfig,
    /// Target host agent configuration
    pub target: TargetConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.cache.lru_count == 0 || self.cache.lru_count > LRU_COUNT_MAX {
            return Err(Error::configuration(format!(
                "cache.lru_count must be between 1 and {LRU_COUNT_MAX}, got {}",
                self.cache.lru_count
            )));
        }
        if self.executor.remote_timeout_secs == 0 {
            return Err(Error::configuration(
                "executor.remote_timeout_secs must be greater than zero",
            ));
        }
        if self.executor.capability_timeout_secs == 0 {
            return Err(Error::configuration(
                "executor.capability_timeout_secs must be greater than zero",
            ));
        }
        if self.target.iqn_prefix.is_empty() {
            return Err(Error::configuration("target.iqn_prefix must not be empty"));
        }
        Ok(())
    }
}

/// Shared storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one sub-directory per volume
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/blockmesh/volumes"),
        }
    }
}

/// Remote execution configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for a single remote block operation
    pub remote_timeout_secs: u64,
    /// Deadline for a capability query
    pub capability_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_timeout_secs: 300,
            capability_timeout_secs: 30,
        }
    }
}

/// Volume handle cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of open volume handles
    pub lru_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_count: LRU_COUNT_DEFAULT,
        }
    }
}

/// Target host agent configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// URL scheme used to reach the agents (http or https)
    pub scheme: String,
    /// Port the agents listen on
    pub port: u16,
    /// iSCSI portal port advertised to initiators
    pub portal_port: u16,
    /// IQN prefix, the block GBID is appended to it
    pub iqn_prefix: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 24010,
            portal_port: 3260,
            iqn_prefix: "iqn.2016-12.org.blockmesh".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON formatted log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
