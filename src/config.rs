//! Configuration management for the SCO bridge.
//!
//! This module handles loading and saving configuration from disk,
//! including the attached devices and link timing parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   str::FromStr,
   time::Duration,
};

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, ScoError},
   sco::{
      device::{
         DEFAULT_CONNECT_TIMEOUT, DEFAULT_RELEASE_INTERVAL, DEFAULT_RELEASE_RETRIES, DeviceConfig,
      },
      link::Mode,
   },
};

/// Main configuration structure for the bridge.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default = "default_devices")]
   pub devices: Vec<DeviceEntry>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_release_retries")]
   pub release_retries: u32,

   #[serde(default = "default_release_interval")]
   pub release_interval_ms: u64,

   #[serde(default = "default_loopback_mtu")]
   pub loopback_mtu: u16,

   #[serde(default = "default_loopback_blocks")]
   pub loopback_blocks: u32,
}

/// Represents one attached SCO device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceEntry {
   pub name: String,
   pub local: String,
   pub remote: String,
   #[serde(default = "default_channel")]
   pub channel: u8,
   #[serde(default)]
   pub listen: bool,
   #[serde(default)]
   pub speaker_gain: Option<u8>,
   #[serde(default)]
   pub mic_gain: Option<u8>,
}

fn default_devices() -> Vec<DeviceEntry> {
   vec![
      DeviceEntry {
         name: "gateway".to_string(),
         local: "00:00:00:00:00:01".to_string(),
         remote: "00:00:00:00:00:02".to_string(),
         channel: default_channel(),
         listen: true,
         speaker_gain: None,
         mic_gain: None,
      },
      DeviceEntry {
         name: "headset".to_string(),
         local: "00:00:00:00:00:02".to_string(),
         remote: "00:00:00:00:00:01".to_string(),
         channel: default_channel(),
         listen: false,
         speaker_gain: None,
         mic_gain: None,
      },
   ]
}

const fn default_channel() -> u8 {
   1
}

const fn default_connect_timeout() -> u64 {
   DEFAULT_CONNECT_TIMEOUT.as_secs()
}

const fn default_release_retries() -> u32 {
   DEFAULT_RELEASE_RETRIES
}

const fn default_release_interval() -> u64 {
   DEFAULT_RELEASE_INTERVAL.as_millis() as u64
}

const fn default_loopback_mtu() -> u16 {
   crate::bluetooth::loopback::DEFAULT_MTU
}

const fn default_loopback_blocks() -> u32 {
   16
}

impl Default for Config {
   fn default() -> Self {
      Self {
         devices: default_devices(),
         connect_timeout_sec: default_connect_timeout(),
         release_retries: default_release_retries(),
         release_interval_ms: default_release_interval(),
         loopback_mtu: default_loopback_mtu(),
         loopback_blocks: default_loopback_blocks(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(btsco_home) = env::var("BTSCO_HOME") {
         PathBuf::from(btsco_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(ScoError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btsco").join("config.toml"))
   }

   /// Finds a device entry by name.
   pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
      self.devices.iter().find(|d| d.name == name)
   }
}

fn parse_address(s: &str) -> Result<Address> {
   Address::from_str(s).map_err(|_| ScoError::InvalidAddress(s.to_string()))
}

impl DeviceEntry {
   /// Builds and validates the device parameters, taking link timing from
   /// `config`.
   pub fn to_device_config(&self, config: &Config) -> Result<DeviceConfig> {
      let mode = if self.listen { Mode::Listen } else { Mode::Dial };
      let mut device = DeviceConfig::new(
         self.name.as_str(),
         parse_address(&self.local)?,
         parse_address(&self.remote)?,
         self.channel,
         mode,
      );
      device.connect_timeout = Duration::from_secs(config.connect_timeout_sec);
      device.release_retries = config.release_retries;
      device.release_interval = Duration::from_millis(config.release_interval_ms);
      if let Some(gain) = self.speaker_gain {
         device.speaker_gain = gain;
      }
      if let Some(gain) = self.mic_gain {
         device.mic_gain = gain;
      }
      device.validate()?;
      Ok(device)
   }
}
