//! Device role tracking for the link state machine.
//!
//! At most one peer is "current" at a time. The role slots are modelled as a
//! single tagged value so that only legal slot combinations can exist.

use bluer::Address;
use strum::Display;

use crate::{
   error::{LinkError, Result},
   link::{ChannelHandle, ConnectionState, ServiceState},
};

/// Top-level state of the arbitration machine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum MachineState {
   #[default]
   Disconnected,
   Pending,
   Connected,
}

/// Role a device currently plays for the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
   None,
   Current,
   Target,
   Incoming,
}

/// Occupancy of the `current`/`target`/`incoming` slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Roles {
   #[default]
   Idle,
   /// Locally initiated connect in flight.
   Outgoing(Address),
   /// Unsolicited inbound attempt, not yet admitted.
   Incoming(Address),
   /// Tearing down `current` while connecting to `target`.
   Handover { current: Address, target: Address },
   /// Connected peer, or the peer being torn down while Pending.
   Current(Address),
}

impl Roles {
   pub const fn is_empty(&self) -> bool {
      matches!(self, Self::Idle)
   }

   pub const fn current(&self) -> Option<Address> {
      match *self {
         Self::Current(current) | Self::Handover { current, .. } => Some(current),
         _ => None,
      }
   }

   pub const fn target(&self) -> Option<Address> {
      match *self {
         Self::Outgoing(target) | Self::Handover { target, .. } => Some(target),
         _ => None,
      }
   }

   pub const fn incoming(&self) -> Option<Address> {
      match *self {
         Self::Incoming(incoming) => Some(incoming),
         _ => None,
      }
   }

   pub fn role_of(&self, device: Address) -> Role {
      if self.current() == Some(device) {
         Role::Current
      } else if self.target() == Some(device) {
         Role::Target
      } else if self.incoming() == Some(device) {
         Role::Incoming
      } else {
         Role::None
      }
   }

   /// Every tracked device, current first.
   pub fn devices(&self) -> impl Iterator<Item = Address> {
      [self.current(), self.target(), self.incoming()]
         .into_iter()
         .flatten()
   }

   pub fn set_target(&mut self, device: Address) -> Result<()> {
      *self = match *self {
         Self::Idle => Self::Outgoing(device),
         Self::Current(current) if current != device => Self::Handover {
            current,
            target: device,
         },
         _ => return Err(self.conflict("set target")),
      };
      Ok(())
   }

   pub fn set_incoming(&mut self, device: Address) -> Result<()> {
      match self {
         Self::Idle => {
            *self = Self::Incoming(device);
            Ok(())
         },
         _ => Err(self.conflict("set incoming")),
      }
   }

   pub fn set_current(&mut self, device: Address) -> Result<()> {
      match self {
         Self::Idle => {
            *self = Self::Current(device);
            Ok(())
         },
         _ => Err(self.conflict("set current")),
      }
   }

   /// Promotes the target or incoming device to current.
   ///
   /// Returns the previous current device when a handover target takes its
   /// place.
   pub fn promote(&mut self, device: Address) -> Result<Option<Address>> {
      let displaced = match *self {
         Self::Outgoing(target) if target == device => None,
         Self::Incoming(incoming) if incoming == device => None,
         Self::Handover { current, target } if target == device => Some(current),
         _ => return Err(self.conflict("promote")),
      };
      *self = Self::Current(device);
      Ok(displaced)
   }

   /// Empties one slot, returning the device it held.
   pub fn clear(&mut self, role: Role) -> Option<Address> {
      let (cleared, rest) = match (role, *self) {
         (Role::Current, Self::Current(current)) => (current, Self::Idle),
         (Role::Current, Self::Handover { current, target }) => (current, Self::Outgoing(target)),
         (Role::Target, Self::Outgoing(target)) => (target, Self::Idle),
         (Role::Target, Self::Handover { current, target }) => (target, Self::Current(current)),
         (Role::Incoming, Self::Incoming(incoming)) => (incoming, Self::Idle),
         _ => return None,
      };
      *self = rest;
      Some(cleared)
   }

   fn conflict(&self, op: &'static str) -> LinkError {
      LinkError::RoleConflict { op, roles: *self }
   }
}

/// Consistent view of the machine, shared with concurrent readers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot {
   pub state: MachineState,
   pub roles: Roles,
   /// Open service channel of the current device.
   pub service: Option<ChannelHandle>,
}

impl LinkSnapshot {
   pub fn connection_state_of(&self, device: Address) -> ConnectionState {
      match (self.state, self.roles.role_of(device)) {
         (MachineState::Pending, Role::Target | Role::Incoming) => ConnectionState::Connecting,
         (MachineState::Pending, Role::Current) => ConnectionState::Disconnecting,
         (MachineState::Connected, Role::Current) => ConnectionState::Connected,
         _ => ConnectionState::Disconnected,
      }
   }

   pub fn service_state_of(&self, device: Address) -> ServiceState {
      if self.channel_of(device).is_some() {
         ServiceState::Connected
      } else {
         ServiceState::Disconnected
      }
   }

   pub fn channel_of(&self, device: Address) -> Option<ChannelHandle> {
      if self.state == MachineState::Connected && self.roles.current() == Some(device) {
         self.service
      } else {
         None
      }
   }

   pub fn connected_device(&self) -> Option<Address> {
      match self.state {
         MachineState::Connected => self.roles.current(),
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn device(last: u8) -> Address {
      Address::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
   }

   #[test]
   fn test_outgoing_then_promote() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut roles = Roles::default();
      roles.set_target(a).unwrap();
      assert_eq!(roles, Roles::Outgoing(a));
      assert_eq!(roles.role_of(a), Role::Target);
      assert_eq!(roles.role_of(b), Role::None);

      assert_eq!(roles.promote(a).unwrap(), None);
      assert_eq!(roles, Roles::Current(a));
      assert_eq!(roles.role_of(a), Role::Current);
   }

   #[test]
   fn test_handover_slots() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut roles = Roles::Current(a);
      roles.set_target(b).unwrap();
      assert_eq!(roles, Roles::Handover {
         current: a,
         target: b
      });
      assert_eq!(roles.devices().collect::<Vec<_>>(), vec![a, b]);

      // Cancelling the target keeps the current device.
      assert_eq!(roles.clear(Role::Target), Some(b));
      assert_eq!(roles, Roles::Current(a));

      roles.set_target(b).unwrap();
      assert_eq!(roles.clear(Role::Current), Some(a));
      assert_eq!(roles, Roles::Outgoing(b));
   }

   #[test]
   fn test_handover_promote_displaces_current() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut roles = Roles::Handover {
         current: a,
         target: b,
      };
      assert_eq!(roles.promote(b).unwrap(), Some(a));
      assert_eq!(roles, Roles::Current(b));
   }

   #[test]
   fn test_illegal_combinations_rejected() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut roles = Roles::Incoming(a);
      assert!(matches!(
         roles.set_target(b),
         Err(LinkError::RoleConflict { op: "set target", .. })
      ));
      assert!(roles.set_incoming(b).is_err());
      assert!(roles.set_current(b).is_err());
      assert!(roles.promote(b).is_err());
      assert_eq!(roles, Roles::Incoming(a));

      let mut roles = Roles::Current(a);
      assert!(roles.set_target(a).is_err());
      assert!(roles.set_incoming(b).is_err());
   }

   #[test]
   fn test_clear_missing_role_is_noop() {
      let a = device(0xaa);
      let mut roles = Roles::Outgoing(a);
      assert_eq!(roles.clear(Role::Incoming), None);
      assert_eq!(roles.clear(Role::Current), None);
      assert_eq!(roles, Roles::Outgoing(a));
      assert_eq!(roles.clear(Role::Target), Some(a));
      assert!(roles.is_empty());
   }

   #[test]
   fn test_snapshot_connection_states() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut snap = LinkSnapshot::default();
      assert_eq!(snap.connection_state_of(a), ConnectionState::Disconnected);

      snap.state = MachineState::Pending;
      snap.roles = Roles::Handover {
         current: a,
         target: b,
      };
      assert_eq!(snap.connection_state_of(a), ConnectionState::Disconnecting);
      assert_eq!(snap.connection_state_of(b), ConnectionState::Connecting);

      snap.roles = Roles::Incoming(b);
      assert_eq!(snap.connection_state_of(b), ConnectionState::Connecting);
      assert_eq!(snap.connection_state_of(a), ConnectionState::Disconnected);

      snap.state = MachineState::Connected;
      snap.roles = Roles::Current(a);
      assert_eq!(snap.connection_state_of(a), ConnectionState::Connected);
      assert_eq!(snap.connection_state_of(b), ConnectionState::Disconnected);
      assert_eq!(snap.connected_device(), Some(a));
   }

   #[test]
   fn test_snapshot_service_state() {
      let (a, b) = (device(0xaa), device(0xbb));
      let mut snap = LinkSnapshot {
         state: MachineState::Connected,
         roles: Roles::Current(a),
         service: Some(ChannelHandle(7)),
      };
      assert_eq!(snap.service_state_of(a), ServiceState::Connected);
      assert_eq!(snap.channel_of(a), Some(ChannelHandle(7)));
      assert_eq!(snap.service_state_of(b), ServiceState::Disconnected);

      snap.state = MachineState::Pending;
      assert_eq!(snap.service_state_of(a), ServiceState::Disconnected);
      assert_eq!(snap.channel_of(a), None);
   }
}
