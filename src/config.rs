use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{AnalyticsConfig, MemoryLimits, PreloadConfig};
use crate::db::Database;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub preload: PreloadSettings,
  pub analytics: AnalyticsSettings,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  pub memory_max_bytes: usize,
  pub memory_max_entries: usize,
  /// SQLite file (defaults to the platform data dir)
  pub database: Option<PathBuf>,
  /// Keep a persistent tier at all
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let limits = MemoryLimits::default();
    Self {
      memory_max_bytes: limits.max_bytes,
      memory_max_entries: limits.max_entries,
      database: None,
      persist: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreloadSettings {
  pub recent_window_days: u32,
  pub locality_refresh_minutes: Option<u64>,
}

impl Default for PreloadSettings {
  fn default() -> Self {
    Self {
      recent_window_days: 30,
      locality_refresh_minutes: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyticsSettings {
  pub interval_minutes: u64,
  pub error_threshold: u64,
  pub eviction_ratio_warning: f64,
  pub memory_pressure_warning: f64,
}

impl Default for AnalyticsSettings {
  fn default() -> Self {
    let defaults = AnalyticsConfig::default();
    Self {
      interval_minutes: 15,
      error_threshold: defaults.error_threshold,
      eviction_ratio_warning: defaults.eviction_ratio_warning,
      memory_pressure_warning: defaults.memory_pressure_warning,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
  /// `EnvFilter` directive, overridden by RUST_LOG
  pub filter: String,
  /// Also write a daily rolling log file to the data dir
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      file: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./receipt-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/receipt-cache/config.yaml
  ///
  /// Falls back to defaults when nothing is found.
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
    let local = PathBuf::from("receipt-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("receipt-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.memory_max_entries == 0 {
      return Err(eyre!("cache.memory_max_entries must be at least 1"));
    }
    if self.analytics.interval_minutes == 0 {
      return Err(eyre!("analytics.interval_minutes must be at least 1"));
    }
    if self.preload.locality_refresh_minutes == Some(0) {
      return Err(eyre!("preload.locality_refresh_minutes must be at least 1"));
    }
    Ok(())
  }

  pub fn memory_limits(&self) -> MemoryLimits {
    MemoryLimits {
      max_bytes: self.cache.memory_max_bytes,
      max_entries: self.cache.memory_max_entries,
    }
  }

  pub fn preload_config(&self) -> PreloadConfig {
    PreloadConfig {
      recent_window_days: self.preload.recent_window_days,
      locality_refresh: self
        .preload
        .locality_refresh_minutes
        .map(|m| std::time::Duration::from_secs(m * 60)),
    }
  }

  pub fn analytics_config(&self) -> AnalyticsConfig {
    AnalyticsConfig {
      error_threshold: self.analytics.error_threshold,
      eviction_ratio_warning: self.analytics.eviction_ratio_warning,
      memory_pressure_warning: self.analytics.memory_pressure_warning,
      ..AnalyticsConfig::default()
    }
  }

  /// Minutes between health checks, for `CacheAnalytics::start_monitoring`.
  pub fn monitoring_interval(&self) -> u64 {
    self.analytics.interval_minutes
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.memory_limits(), MemoryLimits::default());
    assert!(config.cache.persist);
    assert_eq!(config.preload.recent_window_days, 30);
    assert_eq!(config.preload_config().locality_refresh, None);
    assert_eq!(config.monitoring_interval(), 15);
    assert_eq!(config.analytics_config(), AnalyticsConfig::default());
    assert_eq!(config.logging.filter, "info");
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let config = Config::parse(
      "cache:\n  memory_max_entries: 50\npreload:\n  locality_refresh_minutes: 60\n",
    )
    .unwrap();

    assert_eq!(config.cache.memory_max_entries, 50);
    assert_eq!(config.cache.memory_max_bytes, 5 * 1024 * 1024);
    assert_eq!(
      config.preload_config().locality_refresh,
      Some(std::time::Duration::from_secs(3600))
    );
    assert_eq!(config.analytics, AnalyticsSettings::default());
  }

  #[test]
  fn test_monitoring_interval_from_file() {
    let config = Config::parse("analytics:\n  interval_minutes: 5\n").unwrap();
    assert_eq!(config.monitoring_interval(), 5);
  }

  #[test]
  fn test_empty_file_is_default() {
    assert_eq!(Config::parse("").unwrap(), Config::default());
  }

  #[test]
  fn test_rejects_invalid_values() {
    assert!(Config::parse("cache:\n  memory_max_entries: 0\n").is_err());
    assert!(Config::parse("analytics:\n  interval_minutes: 0\n").is_err());
    assert!(Config::parse("cache: [1, 2]\n").is_err());
  }

  #[test]
  fn test_load_from_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache:\n  database: /tmp/receipts.db\n  persist: false").unwrap();
    writeln!(file, "logging:\n  filter: debug\n  file: true").unwrap();

    let config = Config::load(Some(file.path())).unwrap();

    assert!(!config.cache.persist);
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/receipts.db")
    );
    assert_eq!(config.logging.filter, "debug");
    assert!(config.logging.file);
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
