//! Admission policy for unsolicited inbound connections.

use std::sync::Arc;

use bluer::Address;
use log::debug;

use crate::{error::Result, link::Priority};

/// Source of per-peer settings consulted by the link core.
pub trait PeerDirectory: Send + Sync {
   fn priority(&self, device: Address) -> Priority;

   fn set_priority(&self, device: Address, priority: Priority) -> Result<()>;

   fn is_bonded(&self, device: Address) -> bool;

   /// Bonded peers that advertise the accessory service.
   fn bonded_devices(&self) -> Vec<Address>;

   /// Whether the adapter suppresses unsolicited inbound connections.
   fn quiet_mode(&self) -> bool;
}

pub type DirectoryHandle = Arc<dyn PeerDirectory>;

pub struct AdmissionPolicy {
   directory: DirectoryHandle,
}

impl AdmissionPolicy {
   pub const fn new(directory: DirectoryHandle) -> Self {
      Self { directory }
   }

   /// Decides whether an inbound attempt from `device` is admitted.
   ///
   /// An undefined priority usually means service discovery has not run yet
   /// while the peer is already initiating, so a bonded peer is let in.
   pub fn should_accept(&self, device: Address, outgoing_in_flight: bool) -> bool {
      if self.directory.quiet_mode() && !outgoing_in_flight {
         debug!("Rejecting {device}: quiet mode");
         return false;
      }
      let priority = self.directory.priority(device);
      let bonded = self.directory.is_bonded(device);
      let accept = priority.is_enabled() || (priority == Priority::Undefined && bonded);
      debug!("Admission for {device}: priority={priority} bonded={bonded} -> {accept}");
      accept
   }
}

#[cfg(test)]
pub(crate) mod tests {
   use std::collections::{HashMap, HashSet};

   use parking_lot::Mutex;

   use super::*;

   /// In-memory directory for tests.
   #[derive(Default)]
   pub struct StaticDirectory {
      pub priorities: Mutex<HashMap<Address, Priority>>,
      pub bonded: Mutex<HashSet<Address>>,
      pub quiet: Mutex<bool>,
   }

   impl StaticDirectory {
      pub fn with(device: Address, priority: Priority, bonded: bool) -> Arc<Self> {
         let dir = Self::default();
         dir.priorities.lock().insert(device, priority);
         if bonded {
            dir.bonded.lock().insert(device);
         }
         Arc::new(dir)
      }
   }

   impl PeerDirectory for StaticDirectory {
      fn priority(&self, device: Address) -> Priority {
         self
            .priorities
            .lock()
            .get(&device)
            .copied()
            .unwrap_or_default()
      }

      fn set_priority(&self, device: Address, priority: Priority) -> Result<()> {
         self.priorities.lock().insert(device, priority);
         Ok(())
      }

      fn is_bonded(&self, device: Address) -> bool {
         self.bonded.lock().contains(&device)
      }

      fn bonded_devices(&self) -> Vec<Address> {
         self.bonded.lock().iter().copied().collect()
      }

      fn quiet_mode(&self) -> bool {
         *self.quiet.lock()
      }
   }

   fn device() -> Address {
      Address::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60])
   }

   #[test]
   fn test_enabled_priority_is_accepted() {
      let policy = AdmissionPolicy::new(StaticDirectory::with(device(), Priority::On, false));
      assert!(policy.should_accept(device(), false));

      let policy =
         AdmissionPolicy::new(StaticDirectory::with(device(), Priority::AutoConnect, false));
      assert!(policy.should_accept(device(), false));
   }

   #[test]
   fn test_off_priority_is_rejected_even_when_bonded() {
      let policy = AdmissionPolicy::new(StaticDirectory::with(device(), Priority::Off, true));
      assert!(!policy.should_accept(device(), false));
   }

   #[test]
   fn test_undefined_priority_requires_bond() {
      let policy =
         AdmissionPolicy::new(StaticDirectory::with(device(), Priority::Undefined, false));
      assert!(!policy.should_accept(device(), false));

      let policy =
         AdmissionPolicy::new(StaticDirectory::with(device(), Priority::Undefined, true));
      assert!(policy.should_accept(device(), false));
   }

   #[test]
   fn test_quiet_mode_blocks_unless_outgoing() {
      let dir = StaticDirectory::with(device(), Priority::On, true);
      *dir.quiet.lock() = true;
      let policy = AdmissionPolicy::new(dir);
      assert!(!policy.should_accept(device(), false));
      assert!(policy.should_accept(device(), true));
   }
}
