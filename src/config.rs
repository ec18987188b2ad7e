//! Configuration management for the link service.
//!
//! This module handles loading and saving configuration from disk, including
//! the adapter to use and the socket parameters of the serial link.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::transport::LinkConfig,
   error::{LinkError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   /// Frame terminator for inbound data. Empty selects raw byte mode.
   #[serde(default = "default_delimiter")]
   pub delimiter: String,

   #[serde(default = "default_discovery_window")]
   pub discovery_window_sec: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,
}

const fn default_rfcomm_channel() -> u8 {
   1
}

fn default_delimiter() -> String {
   "\n".to_string()
}

const fn default_discovery_window() -> u64 {
   12
}

const fn default_connect_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         rfcomm_channel: default_rfcomm_channel(),
         delimiter: default_delimiter(),
         discovery_window_sec: default_discovery_window(),
         connect_timeout_sec: default_connect_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         let config: Self = toml::from_str(&contents)?;
         config.link_config()?;
         Ok(config)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   fn save_to(&self, config_path: PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(LinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btlinkd").join("config.toml"))
   }

   /// Socket parameters derived from this configuration.
   pub fn link_config(&self) -> Result<LinkConfig> {
      LinkConfig::new(self.rfcomm_channel, self.delimiter.as_bytes())
   }

   pub const fn discovery_window(&self) -> Duration {
      Duration::from_secs(self.discovery_window_sec)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("btlinkd").join("config.toml");

      let config = Config::load_from(path.clone()).expect("load");
      assert_eq!(config, Config::default());
      assert!(path.exists());

      let reloaded = Config::load_from(path).expect("reload");
      assert_eq!(reloaded, config);
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");
      fs::write(&path, "adapter = \"hci1\"\ndelimiter = \"\"\n").expect("write");

      let config = Config::load_from(path).expect("load");
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.rfcomm_channel, 1);
      assert!(config.link_config().expect("link config").is_raw());
      assert_eq!(config.discovery_window(), Duration::from_secs(12));
   }

   #[test]
   fn test_oversized_delimiter_rejected() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");
      fs::write(&path, "delimiter = \"<<END-OF-FRAME>>\"\n").expect("write");

      assert!(matches!(
         Config::load_from(path),
         Err(LinkError::InvalidConfig(_))
      ));
   }
}
