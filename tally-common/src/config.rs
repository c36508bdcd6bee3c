//! Configuration loading and config-file resolution
//!
//! Process configuration is resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled defaults (fallback)
//!
//! A missing config file is not fatal: the caller gets compiled defaults and a
//! warning. A config file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "TALLY_CONFIG";
/// Environment variable carrying the store API key
pub const API_KEY_ENV: &str = "TALLY_STORE_API_KEY";

/// Root of the TOML config file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// External store connection settings (`[store]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    /// Integration token; prefer the environment variable over the file
    pub api_key: Option<String>,
    pub base_url: String,
    /// Page under which bootstrap collections are created
    pub parent_page_id: Option<String>,
    /// Configuration collection; created and seeded when absent
    pub configuration_collection_id: Option<String>,
    pub requests_per_second: u32,
    /// Budget for retrying one transient failure
    pub max_retry_wait_ms: u64,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.notion.com/v1".to_string(),
            parent_page_id: None,
            configuration_collection_id: None,
            requests_per_second: 3,
            max_retry_wait_ms: 30_000,
            page_size: 100,
            request_timeout_secs: 30,
        }
    }
}

/// How a raw point value of exactly zero is treated during extraction
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ZeroPointsPolicy {
    /// Zero counts as a missing value and the stage is skipped
    #[default]
    TreatAsMissing,
    /// Zero is a legitimate value and produces a zero-point record
    Accept,
}

/// What happens when a freshly minted task id cannot be written back
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteBackPolicy {
    /// Retry with backoff; if the write still fails, skip the item this run
    #[default]
    Required,
    /// Use the minted id for this run even if it was not persisted
    BestEffort,
}

/// Engine behaviour settings (`[engine]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Max in-flight store operations per fan-out
    pub concurrency: usize,
    pub zero_points: ZeroPointsPolicy,
    pub identity_write_back: WriteBackPolicy,
    pub write_back_max_wait_ms: u64,
    /// Timer mode period; `None` runs a single pass
    pub interval_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            zero_points: ZeroPointsPolicy::default(),
            identity_write_back: WriteBackPolicy::default(),
            write_back_max_wait_ms: 5_000,
            interval_secs: None,
        }
    }
}

/// Logging settings (`[logging]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Resolves which config file to read
pub struct ConfigPathResolver {
    module_name: String,
}

impl ConfigPathResolver {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
        }
    }

    /// Resolve config file path. Returns `None` when no candidate exists.
    pub fn resolve(&self, cli_arg: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_arg {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        self.default_candidates().into_iter().find(|p| p.exists())
    }

    /// Platform config locations, user first
    pub fn default_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("tally").join(format!("{}.toml", self.module_name)));
            candidates.push(dir.join("tally").join("config.toml"));
        }
        if cfg!(unix) {
            candidates.push(PathBuf::from("/etc/tally/config.toml"));
        }
        candidates
    }
}

/// Load config from `path`, falling back to defaults when the file is missing
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        warn!("No config file found, using compiled defaults");
        return Ok(TomlConfig::default());
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using compiled defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    info!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Write config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolve the store API key
///
/// **Priority:** ENV → TOML
pub fn resolve_api_key(config: &TomlConfig) -> Result<String> {
    let env_key = std::env::var(API_KEY_ENV).ok().filter(|k| is_valid_key(k));
    let toml_key = config.store.api_key.as_ref().filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!("Store API key found in both environment and TOML. Using environment.");
    }

    if let Some(key) = env_key {
        info!("Store API key loaded from environment variable");
        return Ok(key);
    }

    if let Some(key) = toml_key {
        info!("Store API key loaded from TOML config");
        return Ok(key.clone());
    }

    Err(Error::Config(format!(
        "Store API key not configured. Set {} or [store] api_key in the config file",
        API_KEY_ENV
    )))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
