//! Peer directory backed by the config file and the adapter's bond list.

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures::{
   StreamExt,
   stream::{BoxStream, SelectAll},
};
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::{
   select,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   config::Config,
   error::Result,
   link::{Priority, admission::PeerDirectory},
};

/// Service UUID advertised by iAP2-capable accessories.
pub const IAP2_UUID: Uuid = Uuid::from_u128(0x00000000_deca_fade_deca_deafdecacaff);

type DeviceChanges = SelectAll<BoxStream<'static, (Address, DeviceEvent)>>;

pub struct ConfigDirectory {
   config: RwLock<Config>,
   path: PathBuf,
   /// Every paired device, consulted for admission.
   paired: RwLock<HashSet<Address>>,
   /// Paired devices advertising the accessory service.
   accessories: RwLock<HashSet<Address>>,
}

impl ConfigDirectory {
   pub fn new(config: Config, path: PathBuf) -> Self {
      Self {
         config: RwLock::new(config),
         path,
         paired: RwLock::default(),
         accessories: RwLock::default(),
      }
   }

   /// Rebuilds the paired and accessory sets from the adapter.
   pub async fn refresh(&self, adapter: &Adapter) -> Result<()> {
      let mut paired = HashSet::new();
      let mut accessories = HashSet::new();
      for address in adapter.device_addresses().await? {
         let device = adapter.device(address)?;
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         paired.insert(address);
         let uuids = device.uuids().await?.unwrap_or_default();
         if uuids.contains(&IAP2_UUID) {
            accessories.insert(address);
         }
      }
      self.store(paired, accessories);
      Ok(())
   }

   fn store(&self, paired: HashSet<Address>, accessories: HashSet<Address>) {
      let mut current = self.accessories.write();
      if *current != accessories {
         info!("{} bonded accessory device(s)", accessories.len());
      }
      *current = accessories;
      *self.paired.write() = paired;
   }

   /// Keeps the bonded sets in sync with the adapter.
   ///
   /// Refreshes when a device is added or removed, when a device's pairing
   /// or service list changes, and periodically as a fallback.
   pub async fn watch(self: Arc<Self>, adapter: Adapter, interval: Duration) {
      let mut events = match adapter.events().await {
         Ok(events) => Some(events),
         Err(e) => {
            warn!("Adapter events unavailable, polling only: {e}");
            None
         },
      };
      let mut changes = DeviceChanges::new();
      match adapter.device_addresses().await {
         Ok(addresses) => {
            for address in addresses {
               subscribe(&adapter, address, &mut changes).await;
            }
         },
         Err(e) => warn!("Failed to list devices: {e}"),
      }
      let mut ticker = time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = ticker.tick() => {},
            event = async { events.as_mut()?.next().await }, if events.is_some() => match event {
               Some(AdapterEvent::DeviceAdded(addr)) => {
                  debug!("Device added: {addr}");
                  subscribe(&adapter, addr, &mut changes).await;
               },
               Some(AdapterEvent::DeviceRemoved(addr)) => debug!("Device removed: {addr}"),
               Some(_) => continue,
               None => {
                  warn!("Adapter event stream ended");
                  events = None;
               },
            },
            Some((addr, DeviceEvent::PropertyChanged(property))) = changes.next(), if !changes.is_empty() => {
               match property {
                  DeviceProperty::Paired(paired) => debug!("{addr} paired: {paired}"),
                  DeviceProperty::Uuids(_) => debug!("{addr} services changed"),
                  _ => continue,
               }
            },
         }
         if let Err(e) = self.refresh(&adapter).await {
            warn!("Failed to refresh bonded devices: {e}");
         }
      }
   }
}

/// Follows property changes of `address` until the device is removed.
async fn subscribe(adapter: &Adapter, address: Address, changes: &mut DeviceChanges) {
   let events = match adapter.device(address) {
      Ok(device) => device.events().await,
      Err(e) => Err(e),
   };
   match events {
      Ok(events) => changes.push(events.map(move |event| (address, event)).boxed()),
      Err(e) => warn!("Cannot follow {address}: {e}"),
   }
}

impl PeerDirectory for ConfigDirectory {
   fn priority(&self, device: Address) -> Priority {
      self.config.read().priority_of(device)
   }

   fn set_priority(&self, device: Address, priority: Priority) -> Result<()> {
      let snapshot = {
         let mut config = self.config.write();
         config.set_priority(device, priority);
         config.clone()
      };
      debug!("Persisting priority {priority} for {device}");
      snapshot.save_to(&self.path)
   }

   fn is_bonded(&self, device: Address) -> bool {
      self.paired.read().contains(&device)
   }

   fn bonded_devices(&self) -> Vec<Address> {
      self.accessories.read().iter().copied().collect()
   }

   fn quiet_mode(&self) -> bool {
      self.config.read().quiet_mode
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const PEER: Address = Address([0x28, 0x6a, 0xba, 0x0a, 0x0b, 0x0c]);

   #[test]
   fn test_uuid_literal() {
      assert_eq!(IAP2_UUID.to_string(), "00000000-deca-fade-deca-deafdecacaff");
   }

   #[test]
   fn test_set_priority_is_persisted() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let directory = ConfigDirectory::new(Config::default(), path.clone());

      assert_eq!(directory.priority(PEER), Priority::Undefined);
      directory.set_priority(PEER, Priority::Off).unwrap();
      assert_eq!(directory.priority(PEER), Priority::Off);

      let reloaded = Config::load_from(&path).unwrap();
      assert_eq!(reloaded.priority_of(PEER), Priority::Off);
   }

   #[test]
   fn test_bonded_and_quiet_mode() {
      let dir = tempfile::tempdir().unwrap();
      let config = Config {
         quiet_mode: true,
         ..Config::default()
      };
      let directory = ConfigDirectory::new(config, dir.path().join("config.toml"));

      assert!(directory.quiet_mode());
      assert!(!directory.is_bonded(PEER));
      directory.store(HashSet::from([PEER]), HashSet::from([PEER]));
      assert!(directory.is_bonded(PEER));
      assert_eq!(directory.bonded_devices(), vec![PEER]);
   }

   #[test]
   fn test_paired_peer_without_service_uuid_is_bonded() {
      let dir = tempfile::tempdir().unwrap();
      let directory = ConfigDirectory::new(Config::default(), dir.path().join("config.toml"));
      let other = Address([0x28, 0x6a, 0xba, 0x0a, 0x0b, 0x0d]);

      directory.store(HashSet::from([PEER, other]), HashSet::from([other]));
      assert!(directory.is_bonded(PEER));
      assert!(directory.is_bonded(other));
      assert_eq!(directory.bonded_devices(), vec![other]);

      directory.store(HashSet::new(), HashSet::new());
      assert!(!directory.is_bonded(PEER));
      assert!(directory.bonded_devices().is_empty());
   }

   #[test]
   fn test_set_priority_updates_memory_and_disk() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let directory = ConfigDirectory::new(Config::default(), path.clone());

      directory.set_priority(PEER, Priority::AutoConnect).unwrap();
      assert_eq!(directory.priority(PEER), Priority::AutoConnect);
      assert_eq!(Config::load_from(&path).unwrap().priority_of(PEER), Priority::AutoConnect);
   }
}
