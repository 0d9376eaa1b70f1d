//! Configuration management for the iAP2 link service.
//!
//! This module handles loading and saving configuration from disk,
//! including known peers, their connection priorities and link parameters.

use std::{
   env, fs, io,
   path::{Path, PathBuf},
   time::Duration,
};

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{LinkError, Result},
   link::Priority,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_secs: u64,

   /// Reject unsolicited inbound connections unless an outgoing connect is
   /// in flight.
   #[serde(default)]
   pub quiet_mode: bool,

   /// L2CAP PSM of the accessory service channel.
   #[serde(default = "default_psm")]
   pub psm: u16,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_link_poll_interval")]
   pub link_poll_interval_secs: u64,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// Represents a known accessory peer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
   #[serde(default)]
   pub priority: Priority,
}

const fn default_connect_timeout() -> u64 {
   30
}

const fn default_psm() -> u16 {
   0x1001
}

const fn default_link_poll_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_timeout_secs: default_connect_timeout(),
         quiet_mode: false,
         psm: default_psm(),
         adapter: None,
         link_poll_interval_secs: default_link_poll_interval(),
         known_devices: vec![],
      }
   }
}

/// Environment overrides for the config directory, most specific first.
const DIR_OVERRIDES: [(&str, Option<&str>); 3] = [
   ("IAP2_HOME", None),
   ("XDG_CONFIG_HOME", None),
   ("HOME", Some(".config")),
];

impl Config {
   /// Reads the config at `path`, writing the defaults there on first run.
   pub fn load_from(path: &Path) -> Result<Self> {
      match fs::read_to_string(path) {
         Ok(contents) => Ok(toml::from_str(&contents)?),
         Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
         },
         Err(e) => Err(e.into()),
      }
   }

   /// Writes the config next to `path` and renames it into place, so readers
   /// never see a partial file.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let staged = path.with_extension("toml.tmp");
      fs::write(&staged, toml::to_string_pretty(self)?)?;
      fs::rename(&staged, path)?;
      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let dir = config_dir(|name| env::var(name).ok())
         .or_else(dirs::config_dir)
         .ok_or(LinkError::ConfigDirNotFound)?;
      Ok(dir.join("iap2d").join("config.toml"))
   }

   pub fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub fn link_poll_interval(&self) -> Duration {
      Duration::from_secs(self.link_poll_interval_secs.max(1))
   }

   /// Returns the known device entry for `address`, if any.
   pub fn known_device(&self, address: Address) -> Option<&KnownDevice> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.parse::<Address>().ok() == Some(address))
   }

   pub fn priority_of(&self, address: Address) -> Priority {
      self
         .known_device(address)
         .map(|d| d.priority)
         .unwrap_or_default()
   }

   /// Records the priority of `address`, adding it as a known device if new.
   pub fn set_priority(&mut self, address: Address, priority: Priority) {
      let entry = self
         .known_devices
         .iter_mut()
         .find(|d| d.address.parse::<Address>().ok() == Some(address));
      match entry {
         Some(device) => device.priority = priority,
         None => self.known_devices.push(KnownDevice {
            address: address.to_string(),
            name: String::new(),
            priority,
         }),
      }
   }
}

fn config_dir(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
   DIR_OVERRIDES.iter().find_map(|(var, subdir)| {
      let base = PathBuf::from(lookup(var)?);
      Some(match subdir {
         Some(subdir) => base.join(subdir),
         None => base,
      })
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   const PEER: Address = Address([0x28, 0x6a, 0xba, 0x01, 0x02, 0x03]);

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("iap2d").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config.connect_timeout(), Duration::from_secs(30));
      assert_eq!(config.psm, 0x1001);
      assert!(!config.quiet_mode);
      assert!(config.known_devices.is_empty());
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
quiet_mode = true

[[known_devices]]
address = "28:6A:BA:01:02:03"
name = "Head unit"
priority = "off"
"#,
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert!(config.quiet_mode);
      assert_eq!(config.link_poll_interval_secs, 5);
      assert_eq!(config.priority_of(PEER), Priority::Off);
      assert_eq!(config.known_device(PEER).unwrap().name, "Head unit");
   }

   #[test]
   fn test_priority_persists() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::load_from(&path).unwrap();
      assert_eq!(config.priority_of(PEER), Priority::Undefined);
      config.set_priority(PEER, Priority::AutoConnect);
      config.set_priority(PEER, Priority::On);
      config.save_to(&path).unwrap();

      let reloaded = Config::load_from(&path).unwrap();
      assert_eq!(reloaded.known_devices.len(), 1);
      assert_eq!(reloaded.priority_of(PEER), Priority::On);
   }

   #[test]
   fn test_config_dir_search_order() {
      let env = |vars: &'static [(&'static str, &'static str)]| {
         move |name: &str| {
            vars
               .iter()
               .find(|(var, _)| *var == name)
               .map(|(_, value)| value.to_string())
         }
      };

      assert_eq!(
         config_dir(env(&[("HOME", "/home/u"), ("IAP2_HOME", "/etc/iap2")])),
         Some(PathBuf::from("/etc/iap2"))
      );
      assert_eq!(
         config_dir(env(&[("HOME", "/home/u"), ("XDG_CONFIG_HOME", "/xdg")])),
         Some(PathBuf::from("/xdg"))
      );
      assert_eq!(
         config_dir(env(&[("HOME", "/home/u")])),
         Some(PathBuf::from("/home/u/.config"))
      );
      assert_eq!(config_dir(env(&[])), None);
   }

   #[test]
   fn test_save_leaves_no_staging_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      Config::default().save_to(&path).unwrap();
      Config::default().save_to(&path).unwrap();
      assert!(path.exists());
      assert!(!path.with_extension("toml.tmp").exists());
   }

   #[test]
   fn test_malformed_file_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "psm = \"not a number\"").unwrap();
      assert!(matches!(Config::load_from(&path), Err(LinkError::TomlParse(_))));
   }
}
