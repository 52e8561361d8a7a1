//! Configuration management for the history subsystem

pub mod directory;

use crate::dispatch::DispatcherConfig;
use crate::error::{HistoryError, Result};
use crate::extract::ExtractorConfig;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, time::Duration};
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Upstream telemetry service configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Per-site dispatch pacing
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Streaming payload extraction
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Partitioned store layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Query paging limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Site directory file location
    #[serde(default = "default_sites_file")]
    pub sites_file: PathBuf,
}

fn default_sites_file() -> PathBuf {
    directory::SiteDirectory::default_path()
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            dispatcher: DispatcherConfig::default(),
            extractor: ExtractorConfig::default(),
            storage: StorageConfig::default(),
            query: QueryConfig::default(),
            sites_file: default_sites_file(),
        }
    }
}

/// Upstream telemetry service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Service base URL (e.g., "https://telemetry.example.com")
    pub base_url: Url,

    /// Root-relative history endpoint path on the upstream host
    pub history_path: String,

    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum days covered by a single history request
    pub max_span_days: u32,

    /// Enable SSL/TLS verification
    pub verify_ssl: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://telemetry.example.com".parse().unwrap(),
            history_path: "/api/v1/thermostat/history".to_string(),
            request_timeout: Duration::from_secs(30),
            max_span_days: 30,
            verify_ssl: true,
        }
    }
}

/// Query paging limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Page size applied when a request passes zero
    pub default_page_size: usize,

    /// Upper bound on requested page sizes
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 500,
            max_page_size: 5000,
        }
    }
}

impl HistoryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HistoryError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            HistoryError::config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `THERMO_*` environment overrides in place
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("THERMO_UPSTREAM_URL") {
            self.upstream.base_url = url
                .parse()
                .map_err(|e| HistoryError::config(format!("Invalid THERMO_UPSTREAM_URL: {e}")))?;
        }

        if let Ok(path) = env::var("THERMO_HISTORY_PATH") {
            self.upstream.history_path = path;
        }

        if let Ok(timeout) = env::var("THERMO_TIMEOUT") {
            self.upstream.request_timeout = Duration::from_secs(
                timeout
                    .parse()
                    .map_err(|e| HistoryError::config(format!("Invalid THERMO_TIMEOUT: {e}")))?,
            );
        }

        if let Ok(days) = env::var("THERMO_MAX_SPAN_DAYS") {
            self.upstream.max_span_days = days
                .parse()
                .map_err(|e| HistoryError::config(format!("Invalid THERMO_MAX_SPAN_DAYS: {e}")))?;
        }

        if let Ok(qps) = env::var("THERMO_REQUESTS_PER_SECOND") {
            self.dispatcher.requests_per_second = qps.parse().map_err(|e| {
                HistoryError::config(format!("Invalid THERMO_REQUESTS_PER_SECOND: {e}"))
            })?;
        }

        if let Ok(timeout) = env::var("THERMO_TASK_TIMEOUT") {
            self.dispatcher.task_timeout = Duration::from_secs(timeout.parse().map_err(|e| {
                HistoryError::config(format!("Invalid THERMO_TASK_TIMEOUT: {e}"))
            })?);
        }

        if let Ok(root) = env::var("THERMO_STORE_ROOT") {
            self.storage.root_dir = PathBuf::from(root);
        }

        if let Ok(sites) = env::var("THERMO_SITES_FILE") {
            self.sites_file = PathBuf::from(sites);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let scheme = self.upstream.base_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(HistoryError::config("base URL must use http or https"));
        }

        if !self.upstream.history_path.starts_with('/') {
            return Err(HistoryError::config("history path must start with '/'"));
        }

        if self.upstream.request_timeout.is_zero() {
            return Err(HistoryError::config(
                "request timeout must be greater than zero",
            ));
        }

        if self.upstream.max_span_days == 0 {
            return Err(HistoryError::config("max span days must be at least 1"));
        }

        // `NaN <= 0.0` is false, so a plain comparison alone would let NaN through
        if !self.dispatcher.requests_per_second.is_finite()
            || self.dispatcher.requests_per_second <= 0.0
        {
            return Err(HistoryError::config(
                "requests per second must be a finite rate greater than zero",
            ));
        }

        if self.dispatcher.max_pending_per_key == 0 {
            return Err(HistoryError::config(
                "pending queue capacity must be at least 1",
            ));
        }

        if self.extractor.target_key.is_empty() {
            return Err(HistoryError::config("extractor target key cannot be empty"));
        }

        if self.query.default_page_size == 0
            || self.query.default_page_size > self.query.max_page_size
        {
            return Err(HistoryError::config(
                "default page size must be between 1 and the maximum page size",
            ));
        }

        Ok(())
    }
}
