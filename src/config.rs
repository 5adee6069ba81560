//! Engine-level configuration.
//!
//! Configuration *loading* (files, env vars, CLI flags) is an external
//! collaborator's job; this module only defines the shape and defaults
//! of the knobs the engine itself consults.

use serde::Deserialize;

fn default_max_value_size() -> u64 {
    5 * 1024 * 1024 * 1024 - 5 * 1024 * 1024
}

fn default_max_custom_metadata_size() -> usize {
    2048
}

fn default_min_multipart_part_size() -> u64 {
    5 * 1024 * 1024
}

fn default_max_key_length() -> usize {
    1024
}

fn default_max_list_limit() -> u32 {
    1000
}

fn default_max_list_limit_with_include() -> u32 {
    100
}

/// Limits enforced by the Validator and Bucket Coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_value_size")]
    pub max_value_size: u64,

    #[serde(default = "default_max_custom_metadata_size")]
    pub max_custom_metadata_size: usize,

    #[serde(default = "default_min_multipart_part_size")]
    pub min_multipart_part_size: u64,

    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: u32,

    #[serde(default = "default_max_list_limit_with_include")]
    pub max_list_limit_with_include: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_value_size: default_max_value_size(),
            max_custom_metadata_size: default_max_custom_metadata_size(),
            min_multipart_part_size: default_min_multipart_part_size(),
            max_key_length: default_max_key_length(),
            max_list_limit: default_max_list_limit(),
            max_list_limit_with_include: default_max_list_limit_with_include(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging knobs, mirrored after the shape a wrapping binary would load
/// and hand to `tracing_subscriber`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// A config with a tiny `min_multipart_part_size`, for exercising the
    /// multipart-completion boundary rules without uploading gigabytes.
    pub fn test_mode(min_part_size: u64) -> Self {
        EngineConfig {
            limits: LimitsConfig {
                min_multipart_part_size: min_part_size,
                ..LimitsConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}
