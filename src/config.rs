use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::network::{AdaptiveOverrides, ConnectionThresholds};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Link thresholds for classifying the connection as slow
  #[serde(default)]
  pub connection: ConnectionThresholds,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend (e.g. "https://clinic.example.com/")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub request_timeout_secs: u64,
  pub retry_base_delay_ms: u64,
  pub max_retry_delay_secs: u64,
  /// How often the binary sweeps expired entries
  pub gc_interval_secs: u64,
  /// Per-quality overrides of freshness, retention and retry budget
  pub adaptive: AdaptiveOverrides,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: 30,
      retry_base_delay_ms: 1000,
      max_retry_delay_secs: 30,
      gc_interval_secs: 60,
      adaptive: AdaptiveOverrides::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Log directory (defaults to the platform data dir)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration, either from `explicit_path` or from the first
  /// existing file in [`search_paths`](Self::search_paths).
  ///
  /// An explicit path that does not exist is an error rather than a
  /// fallback to the search.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let candidates = Self::search_paths();
    match candidates.iter().find(|path| path.exists()) {
      Some(path) => Self::load_from_path(path),
      None => {
        let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(eyre!(
          "No configuration file found (searched: {}).\nSee config.example.yaml for the format.",
          searched.join(", ")
        ))
      }
    }
  }

  /// Candidate config files, highest priority first: `./clinic-cache.yaml`,
  /// then `clinic-cache/config.yaml` under the platform config dir
  /// (`$XDG_CONFIG_HOME`, falling back to `~/.config`, on Linux).
  pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("clinic-cache.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("clinic-cache").join("config.yaml")));
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.backend.url.trim().is_empty() {
      return Err(eyre!("backend.url must not be empty"));
    }
    Ok(config)
  }

  /// Store-wide settings derived from the `cache` section.
  pub fn cache_settings(&self) -> CacheSettings {
    CacheSettings {
      request_timeout: Duration::from_secs(self.cache.request_timeout_secs),
      retry_base_delay: Duration::from_millis(self.cache.retry_base_delay_ms),
      max_retry_delay: Duration::from_secs(self.cache.max_retry_delay_secs),
    }
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks CLINIC_CACHE_API_KEY first, then CLINIC_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("CLINIC_CACHE_API_KEY")
      .or_else(|_| std::env::var("CLINIC_API_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set CLINIC_CACHE_API_KEY or CLINIC_API_KEY environment variable.")
      })
  }
}
