//! Configuration management for the connector service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter selection, auto-connect target and the timing
//! parameters of the read loop.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Adapter name (e.g. `hci0`); the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Address of a bonded device to connect to at startup.
   #[serde(default)]
   pub auto_connect: Option<String>,

   #[serde(default = "default_discover_on_start")]
   pub discover_on_start: bool,

   #[serde(default = "default_read_chunk_size")]
   pub read_chunk_size: usize,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_shutdown_timeout")]
   pub shutdown_timeout_ms: u64,

   #[serde(default = "default_adapter_poll_interval")]
   pub adapter_poll_interval_sec: u64,
}

const fn default_discover_on_start() -> bool {
   true
}

const fn default_read_chunk_size() -> usize {
   16
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_shutdown_timeout() -> u64 {
   1000
}

const fn default_adapter_poll_interval() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         auto_connect: None,
         discover_on_start: default_discover_on_start(),
         read_chunk_size: default_read_chunk_size(),
         connect_timeout_sec: default_connect_timeout(),
         shutdown_timeout_ms: default_shutdown_timeout(),
         adapter_poll_interval_sec: default_adapter_poll_interval(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("SPP_CONNECTOR_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ConnectorError::ConfigDirNotFound);
      };

      Ok(config_dir.join("spp-connector").join("config.toml"))
   }

   /// Read buffer size, never zero.
   pub fn chunk_size(&self) -> usize {
      self.read_chunk_size.max(1)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   /// Upper bound on waiting for a background task to wind down.
   pub const fn shutdown_timeout(&self) -> Duration {
      Duration::from_millis(self.shutdown_timeout_ms)
   }

   pub fn adapter_poll_interval(&self) -> Duration {
      Duration::from_secs(self.adapter_poll_interval_sec.max(1))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_defaults_from_empty_file() {
      let config: Config = toml::from_str("").unwrap();
      assert!(config.adapter.is_none());
      assert!(config.auto_connect.is_none());
      assert!(config.discover_on_start);
      assert_eq!(config.read_chunk_size, 16);
      assert_eq!(config.connect_timeout(), Duration::from_secs(10));
      assert_eq!(config.shutdown_timeout(), Duration::from_millis(1000));
   }

   #[test]
   fn test_partial_file_keeps_other_defaults() {
      let config: Config = toml::from_str(
         r#"
         adapter = "hci1"
         auto_connect = "11:22:33:44:55:66"
         read_chunk_size = 0
         "#,
      )
      .unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.auto_connect.as_deref(), Some("11:22:33:44:55:66"));
      assert_eq!(config.chunk_size(), 1);
      assert_eq!(config.adapter_poll_interval(), Duration::from_secs(10));
   }

   #[test]
   fn test_load_creates_default_then_reads_back() -> Result<()> {
      let dir = TempDir::new().unwrap();
      unsafe {
         env::set_var("SPP_CONNECTOR_HOME", dir.path());
      }

      let created = Config::load()?;
      assert!(dir.path().join("spp-connector/config.toml").exists());

      let mut changed = created.clone();
      changed.auto_connect = Some("AA:BB:CC:DD:EE:FF".into());
      changed.save()?;

      let loaded = Config::load()?;
      assert_eq!(loaded.auto_connect.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
      assert_eq!(loaded.read_chunk_size, created.read_chunk_size);
      Ok(())
   }
}
