//! Configuration management for the sync service.
//!
//! Configuration is read once at startup from a single required file and may be
//! overridden with environment variables (prefixed with `SYNC`, `__` separated).

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "SYNC_CONFIG";

/// Smallest part size S3 accepts for all but the last part of a multipart upload.
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the sync service
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// AWS region of the bucket
    pub region: String,
    /// Destination bucket
    pub bucket: String,
    /// Directory to watch (non-recursive), passed verbatim to the watch
    #[serde(alias = "local_directory", alias = "inboundDir", alias = "inbounddir")]
    pub local_directory: String,
    /// Static access key id
    #[serde(alias = "access_key", alias = "accessKey", alias = "accesskey")]
    pub access_key: String,
    /// Static secret access key
    pub secret: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub failure: FailureConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Port for the Prometheus exporter; disabled when absent
    #[serde(default, alias = "metrics_port")]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Transfer tuning for the S3 session.
///
/// Keys are kebab-case; the snake_case aliases are what `SYNC__UPLOAD__*`
/// environment overrides arrive as.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UploadConfig {
    /// Files above this size go through a multipart upload
    #[serde(default = "default_multipart_threshold", alias = "multipart_threshold_bytes")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads
    #[serde(default = "default_part_size", alias = "part_size_bytes")]
    pub part_size_bytes: usize,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    #[serde(default, alias = "endpoint_url")]
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default, alias = "force_path_style")]
    pub force_path_style: bool,
    /// Issue a HeadBucket while establishing the session
    #[serde(default, alias = "verify_bucket")]
    pub verify_bucket: bool,
}

/// What the supervisor does when a single upload task fails.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    #[serde(alias = "fail_fast")]
    FailFast,
    Skip,
    Retry,
}

/// Failure policy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Total attempts per task under the retry policy
    #[serde(default = "default_max_attempts", alias = "max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms", alias = "initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms", alias = "max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Watch bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchConfig {
    /// Capacity of the channel between the notify thread and the watcher
    #[serde(default = "default_event_buffer", alias = "event_buffer")]
    pub event_buffer: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024 // 8MB
}
fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_event_buffer() -> usize {
    64
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            endpoint_url: None,
            force_path_style: false,
            verify_bucket: false,
        }
    }
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the default location.
    ///
    /// The file is `$SYNC_CONFIG` when set, otherwise `$HOME/config` with any
    /// extension the `config` crate recognizes (json, yaml, toml, ...).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    /// Load configuration from an explicit file, then apply `SYNC__*` overrides.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            // SYNC__BUCKET -> bucket, SYNC__UPLOAD__PART_SIZE_BYTES -> upload.part_size_bytes (alias)
            .add_source(
                config::Environment::with_prefix("SYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("region", &self.region),
            ("bucket", &self.bucket),
            ("local-directory", &self.local_directory),
            ("access-key", &self.access_key),
            ("secret", &self.secret),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(field.to_string()));
            }
        }

        if self.upload.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "upload.part-size-bytes".to_string(),
                message: format!("must be at least {} bytes", MIN_PART_SIZE_BYTES),
            });
        }

        if self.watch.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watch.event-buffer".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.failure.policy == PolicyKind::Retry && self.failure.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "failure.max-attempts".to_string(),
                message: "must be greater than 0 for the retry policy".to_string(),
            });
        }

        Ok(())
    }
}

impl FailureConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return path;
    }
    match std::env::var("HOME") {
        Ok(home) => format!("{}/config", home.trim_end_matches('/')),
        Err(_) => "config".to_string(),
    }
}
