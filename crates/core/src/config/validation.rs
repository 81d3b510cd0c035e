//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `memory_limit` or `time_quantum_ms` is 0
    /// - `maximum_bandwidth` is below `minimum_bandwidth`
    /// - `fetch_attempts` is 0
    /// - `user_agent` is empty
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    ///
    /// Returns `ConfigError::Missing` if the backing store is enabled but
    /// `disc_path` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit == 0 {
            return Err(ConfigError::Invalid { field: "memory_limit".into(), reason: "must be greater than 0".into() });
        }

        if self.time_quantum_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "time_quantum_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.maximum_bandwidth < self.minimum_bandwidth {
            return Err(ConfigError::Invalid {
                field: "maximum_bandwidth".into(),
                reason: format!("must not be below minimum_bandwidth ({})", self.minimum_bandwidth),
            });
        }

        if self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid { field: "fetch_attempts".into(), reason: "must be at least 1".into() });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.disc_enabled && self.disc_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "disc_path".into(),
                hint: "Set RESCACHE_DISC_PATH or RESCACHE_DISC_ENABLED=false".into(),
            });
        }

        if self.minimum_lifetime_secs < 0 {
            tracing::warn!(
                minimum_lifetime_secs = self.minimum_lifetime_secs,
                "negative minimum_lifetime_secs; every fresh object is a persistence candidate"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_memory_limit_zero() {
        let config = AppConfig { memory_limit: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "memory_limit"));
    }

    #[test]
    fn test_validate_time_quantum_zero() {
        let config = AppConfig { time_quantum_ms: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "time_quantum_ms"));
    }

    #[test]
    fn test_validate_bandwidth_order() {
        let config = AppConfig { minimum_bandwidth: 1000, maximum_bandwidth: 999, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "maximum_bandwidth"));
    }

    #[test]
    fn test_validate_equal_bandwidths() {
        let config = AppConfig { minimum_bandwidth: 1000, maximum_bandwidth: 1000, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_fetch_attempts_zero() {
        let config = AppConfig { fetch_attempts: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "fetch_attempts"));
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "user_agent"));
    }

    #[test]
    fn test_validate_timeout_bounds() {
        let small = AppConfig { timeout_ms: 50, ..Default::default() };
        assert!(matches!(small.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));

        let large = AppConfig { timeout_ms: 301_000, ..Default::default() };
        assert!(matches!(large.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));

        let edge = AppConfig { timeout_ms: 300_000, ..Default::default() };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_disc_path() {
        let config = AppConfig { disc_path: PathBuf::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Missing { field, .. }) if field == "disc_path"));

        let disabled = AppConfig { disc_path: PathBuf::new(), disc_enabled: false, ..Default::default() };
        assert!(disabled.validate().is_ok());
    }
}
