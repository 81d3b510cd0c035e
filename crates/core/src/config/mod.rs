//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (RESCACHE_*)
//! 2. TOML config file (if RESCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::backing::StoreParams;
use crate::llcache::CacheParams;

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (RESCACHE_*)
/// 2. TOML config file (if RESCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// RAM budget for cached object data, in bytes.
    ///
    /// Set via RESCACHE_MEMORY_LIMIT environment variable.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,

    /// Path to the SQLite backing store.
    ///
    /// Set via RESCACHE_DISC_PATH environment variable.
    #[serde(default = "default_disc_path")]
    pub disc_path: PathBuf,

    /// Whether objects are persisted to the backing store at all.
    ///
    /// Set via RESCACHE_DISC_ENABLED environment variable.
    #[serde(default = "default_true")]
    pub disc_enabled: bool,

    /// Upper bound on backing store size in bytes; 0 is unbounded.
    ///
    /// Set via RESCACHE_DISC_LIMIT environment variable.
    #[serde(default = "default_disc_limit")]
    pub disc_limit: u64,

    /// Objects must stay fresh for longer than this to be persisted.
    ///
    /// Set via RESCACHE_MINIMUM_LIFETIME_SECS environment variable.
    #[serde(default = "default_minimum_lifetime_secs")]
    pub minimum_lifetime_secs: i64,

    /// Write bandwidth floor in bytes per second; below it the backing store
    /// is disabled.
    ///
    /// Set via RESCACHE_MINIMUM_BANDWIDTH environment variable.
    #[serde(default = "default_minimum_bandwidth")]
    pub minimum_bandwidth: u64,

    /// Write bandwidth ceiling in bytes per second.
    ///
    /// Set via RESCACHE_MAXIMUM_BANDWIDTH environment variable.
    #[serde(default = "default_maximum_bandwidth")]
    pub maximum_bandwidth: u64,

    /// Length of a persistence time slot in milliseconds.
    ///
    /// Set via RESCACHE_TIME_QUANTUM_MS environment variable.
    #[serde(default = "default_time_quantum_ms")]
    pub time_quantum_ms: u64,

    /// Attempts made for a fetch that times out.
    ///
    /// Set via RESCACHE_FETCH_ATTEMPTS environment variable.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    /// Whether a Referer header is sent on fetches.
    ///
    /// Set via RESCACHE_SEND_REFERER environment variable.
    #[serde(default = "default_true")]
    pub send_referer: bool,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via RESCACHE_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via RESCACHE_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_memory_limit() -> usize {
    12 * 1024 * 1024
}

fn default_disc_path() -> PathBuf {
    PathBuf::from("./rescache.sqlite")
}

fn default_disc_limit() -> u64 {
    1024 * 1024 * 1024
}

fn default_minimum_lifetime_secs() -> i64 {
    1800
}

fn default_minimum_bandwidth() -> u64 {
    128 * 1024
}

fn default_maximum_bandwidth() -> u64 {
    512 * 1024
}

fn default_time_quantum_ms() -> u64 {
    100
}

fn default_fetch_attempts() -> u32 {
    1
}

fn default_user_agent() -> String {
    "rescache/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            disc_path: default_disc_path(),
            disc_enabled: true,
            disc_limit: default_disc_limit(),
            minimum_lifetime_secs: default_minimum_lifetime_secs(),
            minimum_bandwidth: default_minimum_bandwidth(),
            maximum_bandwidth: default_maximum_bandwidth(),
            time_quantum_ms: default_time_quantum_ms(),
            fetch_attempts: default_fetch_attempts(),
            send_referer: true,
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `RESCACHE_`
    /// 2. TOML file from `RESCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("RESCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("RESCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parameters the cache is initialised with.
    pub fn cache_params(&self) -> CacheParams {
        CacheParams {
            limit: self.memory_limit,
            minimum_lifetime: self.minimum_lifetime_secs,
            minimum_bandwidth: self.minimum_bandwidth,
            maximum_bandwidth: self.maximum_bandwidth,
            time_quantum: self.time_quantum_ms,
            fetch_attempts: self.fetch_attempts,
            send_referer: self.send_referer,
            store: StoreParams { path: Some(self.disc_path.clone()), size_limit: self.disc_limit },
        }
    }
}
