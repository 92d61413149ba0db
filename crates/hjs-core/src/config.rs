//! Configuration system for humio-jaeger-storage
//!
//! Provides:
//! - Config file discovery (CLI flag, env var)
//! - TOML or JSON parsing with serde, chosen by file extension
//! - Environment variable overrides
//! - Validation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "HJS_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete storage plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Backend connection settings
    pub humio: HumioSettings,

    /// Write path settings
    pub ingest: IngestSettings,

    /// Read path settings
    pub reader: ReaderSettings,

    /// Dependency graph settings
    pub dependencies: DependencySettings,

    /// Asynchronous query job settings
    pub jobs: JobSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            humio: HumioSettings::default(),
            ingest: IngestSettings::default(),
            reader: ReaderSettings::default(),
            dependencies: DependencySettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumioSettings {
    /// Base URL of the Humio cluster
    pub url: String,

    /// Repository holding the spans
    pub repository: String,

    /// API token used for queries
    pub read_token: Option<String>,

    /// Ingest token used for writes
    pub write_token: Option<String>,

    /// Per-request HTTP timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for HumioSettings {
    fn default() -> Self {
        Self {
            url: "https://cloud.humio.com".to_string(),
            repository: "sandbox".to_string(),
            read_token: None,
            write_token: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl HumioSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Write path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Interval between buffer flushes in milliseconds
    pub flush_interval_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
        }
    }
}

impl IngestSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Where traces are grouped during search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Group by trace id in the backend (two-phase search)
    #[default]
    Server,
    /// Fetch spans in bulk and group them locally
    Client,
}

/// Read path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    pub aggregation: AggregationMode,

    /// Trace limit used when a search does not set one
    pub default_num_traces: usize,

    /// Maximum age of the service/operation catalog in seconds
    pub catalog_refresh_secs: u64,

    /// Searches over a wider window than this get their session query
    /// narrowed to the discovered time range. 0 disables narrowing.
    pub narrow_window_threshold_secs: u64,

    /// Relative lookback for trace lookups by id, in backend syntax
    pub trace_lookback: String,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            aggregation: AggregationMode::Server,
            default_num_traces: 20,
            catalog_refresh_secs: 30,
            narrow_window_threshold_secs: 3600,
            trace_lookback: "14 days".to_string(),
        }
    }
}

impl ReaderSettings {
    pub fn catalog_max_age(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_secs)
    }

    pub fn narrow_window_threshold(&self) -> Option<Duration> {
        (self.narrow_window_threshold_secs > 0)
            .then(|| Duration::from_secs(self.narrow_window_threshold_secs))
    }
}

/// Dependency graph settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    /// Run the background refresh task
    pub enabled: bool,

    /// Interval between refreshes in seconds
    pub refresh_interval_secs: u64,

    /// Rolling window covered by one refresh, in hours
    pub window_hours: u64,

    /// Width of each sub-query bucket, in minutes
    pub bucket_minutes: u64,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 90 * 60,
            window_hours: 24,
            bucket_minutes: 15,
        }
    }
}

impl DependencySettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 3600)
    }

    pub fn bucket(&self) -> Duration {
        Duration::from_secs(self.bucket_minutes * 60)
    }
}

/// Asynchronous query job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Lower bound on the server's poll-after hint, in milliseconds
    pub min_poll_interval_ms: u64,

    /// Poll interval used when the server sends no hint, in milliseconds
    pub default_poll_interval_ms: u64,

    /// Polling deadline when the caller has none, in seconds
    pub default_timeout_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: 10,
            default_poll_interval_ms: 1000,
            default_timeout_secs: 15,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. HJS_CONFIG environment variable
    /// 3. Default values
    ///
    /// Environment overrides are applied on top, then the result is validated.
    pub fn load(&self) -> ConfigResult<StorageConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file given, using defaults");
                StorageConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());

        Self::validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        // An explicitly requested file must exist
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("{} path does not exist: {}", CONFIG_ENV_VAR, env_path);
        }

        Ok(None)
    }

    /// Load configuration from a TOML or JSON file
    pub fn load_from_file(path: &Path) -> ConfigResult<StorageConfig> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    /// Validate configuration
    pub fn validate(config: &StorageConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.log_level, valid_levels
            )));
        }

        if !config.humio.url.starts_with("http://") && !config.humio.url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid Humio URL: {}. Must start with http:// or https://",
                config.humio.url
            )));
        }

        if config.humio.repository.is_empty() {
            return Err(ConfigError::ValidationError(
                "Humio repository cannot be empty".to_string(),
            ));
        }

        if config.ingest.flush_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Flush interval cannot be 0".to_string(),
            ));
        }

        if config.dependencies.enabled {
            let deps = &config.dependencies;
            if deps.bucket_minutes == 0 || deps.window_hours == 0 {
                return Err(ConfigError::ValidationError(
                    "Dependency window and bucket must be non-zero".to_string(),
                ));
            }
            if deps.bucket() > deps.window() {
                return Err(ConfigError::ValidationError(format!(
                    "Dependency bucket ({}m) is wider than the window ({}h)",
                    deps.bucket_minutes, deps.window_hours
                )));
            }
            if deps.refresh_interval_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "Dependency refresh interval cannot be 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply environment style overrides through `lookup`
pub fn apply_overrides(config: &mut StorageConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("HJS_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = lookup("HUMIO_URL") {
        config.humio.url = val;
    }
    if let Some(val) = lookup("HUMIO_REPOSITORY") {
        config.humio.repository = val;
    }
    if let Some(val) = lookup("HUMIO_READ_TOKEN") {
        config.humio.read_token = Some(val);
    }
    if let Some(val) = lookup("HUMIO_WRITE_TOKEN") {
        config.humio.write_token = Some(val);
    }
}
