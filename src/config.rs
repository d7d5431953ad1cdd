use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::fetch::FetchOptions;

/// Tuning defaults for the data layer. Every field is optional in the
/// file; loading no file at all is equally fine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub defaults: QueryDefaults,
  pub offline: OfflineConfig,
}

/// Default fetch policy applied to controllers minted from this config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
  /// Freshness window in milliseconds; 0 means every read revalidates.
  pub stale_time_ms: u64,
  pub cache_ttl_ms: u64,
  pub retry_count: u32,
  pub retry_delay_ms: u64,
  /// Per-attempt network bound; absent means unbounded.
  pub timeout_ms: Option<u64>,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      stale_time_ms: 0,
      cache_ttl_ms: 300_000,
      retry_count: 3,
      retry_delay_ms: 1_000,
      timeout_ms: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  pub enabled: bool,
  /// Database location; the platform data directory when unset.
  pub db_path: Option<PathBuf>,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      db_path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./docquery.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/docquery/config.yaml
  /// 4. ~/.config/docquery/config.yaml
  ///
  /// With no explicit path and no file found, the built-in defaults
  /// apply; only an explicit path that does not exist is an error.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("docquery.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("docquery").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Mint fetch options for `cache_key`, pre-seeded from the defaults.
  pub fn fetch_options<T>(&self, cache_key: impl Into<String>) -> FetchOptions<T> {
    let defaults = &self.defaults;
    let mut options = FetchOptions::new(cache_key)
      .with_stale_time(Duration::from_millis(defaults.stale_time_ms))
      .with_cache_ttl(Duration::from_millis(defaults.cache_ttl_ms))
      .with_retry_count(defaults.retry_count)
      .with_retry_delay(Duration::from_millis(defaults.retry_delay_ms));
    if let Some(timeout_ms) = defaults.timeout_ms {
      options = options.with_timeout(Duration::from_millis(timeout_ms));
    }
    options
  }
}
