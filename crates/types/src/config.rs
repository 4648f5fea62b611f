//! Engine configuration.
//!
//! The engine consults exactly two groups of runtime knobs: backend cache
//! sizing and the write-admission quota. Everything else about a tree is
//! persisted per tree at creation time.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Minimum backend cache size: 1 MB.
const MIN_CACHE_SIZE_BYTES: usize = 1024 * 1024;

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A field failed validation.
    #[snafu(display("invalid configuration: {message}"))]
    Validation {
        /// What failed.
        message: String,
    },
}

/// Storage backend configuration.
///
/// # Validation Rules
///
/// - `cache_size_bytes` must be >= 1 MB (1,048,576 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Maximum size of the backend page cache in bytes.
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: usize,
}

#[bon::bon]
impl StorageConfig {
    /// Creates a storage configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `cache_size_bytes` < 1 MB.
    #[builder]
    pub fn new(
        #[builder(default = default_cache_size())] cache_size_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { cache_size_bytes };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(ConfigError::Validation {
                message: format!(
                    "cache_size_bytes {} below minimum {MIN_CACHE_SIZE_BYTES}",
                    self.cache_size_bytes
                ),
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { cache_size_bytes: default_cache_size() }
    }
}

fn default_cache_size() -> usize {
    64 * 1024 * 1024
}

/// Write-admission quota configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QuotaConfig {
    /// Ceiling on the unsequenced backlog before global write tokens are
    /// denied.
    #[serde(default = "default_max_unsequenced_rows")]
    pub max_unsequenced_rows: u64,
    /// When true, count the backlog with a full scan (accurate but
    /// expensive); otherwise read the constant-time table statistics,
    /// which may lag reality.
    #[serde(default)]
    pub use_select_count: bool,
}

#[bon::bon]
impl QuotaConfig {
    /// Creates a quota configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `max_unsequenced_rows` is 0.
    #[builder]
    pub fn new(
        #[builder(default = default_max_unsequenced_rows())] max_unsequenced_rows: u64,
        #[builder(default)] use_select_count: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_unsequenced_rows, use_select_count };
        config.validate()?;
        Ok(config)
    }
}

impl QuotaConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_unsequenced_rows == 0 {
            return Err(ConfigError::Validation {
                message: "max_unsequenced_rows must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_unsequenced_rows: default_max_unsequenced_rows(),
            use_select_count: false,
        }
    }
}

fn default_max_unsequenced_rows() -> u64 {
    500_000
}
