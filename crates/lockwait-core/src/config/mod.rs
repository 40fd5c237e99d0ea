//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Lockwait configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub locking: LockingConfig,
}

/// Tunables of the lock-wait core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Delay before a waiter runs the deadlock check
    pub deadlock_timeout_ms: u64,
    /// Give up waiting after this long; 0 waits forever
    pub lock_timeout_ms: u64,
    /// Number of lock table partitions
    pub num_partitions: usize,
    /// Number of process slots in the registry
    pub max_workers: usize,
    /// Report waits that outlive the deadlock check
    pub log_lock_waits: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            deadlock_timeout_ms: 1000,
            lock_timeout_ms: 0,
            num_partitions: 16,
            max_workers: 64,
            log_lock_waits: false,
        }
    }
}

impl LockingConfig {
    pub fn with_deadlock_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_partitions(mut self, n: usize) -> Self {
        self.num_partitions = n;
        self
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn with_log_lock_waits(mut self, enabled: bool) -> Self {
        self.log_lock_waits = enabled;
        self
    }

    pub fn deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.deadlock_timeout_ms)
    }

    /// `None` when lock timeouts are disabled
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadlock_timeout_ms == 0 {
            return Err(Error::ConfigError(
                "deadlock_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.num_partitions == 0 || !self.num_partitions.is_power_of_two() {
            return Err(Error::ConfigError(format!(
                "num_partitions must be a power of two, got {}",
                self.num_partitions
            )));
        }
        if self.max_workers == 0 || self.max_workers >= u32::MAX as usize {
            return Err(Error::ConfigError(format!(
                "max_workers must be between 1 and {}, got {}",
                u32::MAX - 1,
                self.max_workers
            )));
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "locking.deadlock_timeout_ms",
    "locking.lock_timeout_ms",
    "locking.num_partitions",
    "locking.max_workers",
    "locking.log_lock_waits",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("LOCKWAIT_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("lockwait")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.locking.validate().map_err(|e| anyhow!(e))
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let l = &self.locking;
        match key {
            "locking.deadlock_timeout_ms" => Ok(l.deadlock_timeout_ms.to_string()),
            "locking.lock_timeout_ms" => Ok(l.lock_timeout_ms.to_string()),
            "locking.num_partitions" => Ok(l.num_partitions.to_string()),
            "locking.max_workers" => Ok(l.max_workers.to_string()),
            "locking.log_lock_waits" => Ok(l.log_lock_waits.to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `lockwait config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The whole configuration is validated afterwards; on failure it is
    /// left unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut locking = self.locking.clone();
        match key {
            "locking.deadlock_timeout_ms" => {
                locking.deadlock_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid deadlock_timeout_ms value: {}", value))?;
            }
            "locking.lock_timeout_ms" => {
                locking.lock_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid lock_timeout_ms value: {}", value))?;
            }
            "locking.num_partitions" => {
                locking.num_partitions = value
                    .parse()
                    .with_context(|| format!("Invalid num_partitions value: {}", value))?;
            }
            "locking.max_workers" => {
                locking.max_workers = value
                    .parse()
                    .with_context(|| format!("Invalid max_workers value: {}", value))?;
            }
            "locking.log_lock_waits" => {
                locking.log_lock_waits = match value {
                    "true" | "on" | "1" => true,
                    "false" | "off" | "0" => false,
                    _ => return Err(anyhow!("Invalid log_lock_waits value: {}", value)),
                };
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `lockwait config list` to see available keys.",
                    key
                ));
            }
        }
        locking.validate().map_err(|e| anyhow!(e))?;
        self.locking = locking;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.locking.deadlock_timeout(), Duration::from_secs(1));
        assert_eq!(config.locking.lock_timeout(), None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("locking.lock_timeout_ms", "250").unwrap();
        config.set("locking.log_lock_waits", "on").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.locking.lock_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[locking]\nmax_workers = 8\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.locking.max_workers, 8);
        assert_eq!(loaded.locking.num_partitions, 16);
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("locking.num_partitions", "12").is_err());
        assert!(config.set("locking.deadlock_timeout_ms", "0").is_err());
        assert!(config.set("locking.max_workers", "many").is_err());
        assert!(config.set("locking.log_lock_waits", "maybe").is_err());
        assert!(config.set("locking.nope", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_list_covers_every_key() {
        let list = Config::default().list().unwrap();
        assert_eq!(list.len(), KEYS.len());
        assert!(list.contains(&("locking.max_workers".to_string(), "64".to_string())));
    }

    #[test]
    fn test_invalid_file_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[locking]\nnum_partitions = 3\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
