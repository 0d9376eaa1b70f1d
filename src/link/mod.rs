//! iAP2 link arbitration core.
//!
//! This module holds the state machine that owns the single accessory link:
//! role tracking, translation of stack callbacks, admission of inbound
//! connections, and the actor that serializes commands and stack events.

use core::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

pub mod admission;
pub mod control;
pub mod machine;
pub mod manager;
pub mod roles;
pub mod translator;

/// Per-device connection state as reported to observers.
///
/// Discriminants match the stack's raw connection state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 4,
}

impl ConnectionState {
   pub fn from_raw(raw: u32) -> Option<Self> {
      u8::try_from(raw).ok().and_then(Self::from_repr)
   }

   pub const fn to_raw(self) -> u32 {
      self as u32
   }
}

/// State of the accessory service sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ServiceState {
   Disconnected = 0,
   Connected = 1,
}

impl ServiceState {
   pub fn from_raw(raw: u32) -> Option<Self> {
      u8::try_from(raw).ok().and_then(Self::from_repr)
   }

   pub const fn to_raw(self) -> u32 {
      self as u32
   }
}

/// Opaque handle for an open service channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u32);

impl fmt::Display for ChannelHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "ch#{}", self.0)
   }
}

/// Connection priority configured for a peer.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   Display,
   EnumString,
   IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
   #[default]
   Undefined,
   Off,
   On,
   AutoConnect,
}

impl Priority {
   /// Whether the priority is above the "off" threshold.
   pub const fn is_enabled(self) -> bool {
      matches!(self, Self::On | Self::AutoConnect)
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_raw_state_codes() {
      assert_eq!(ConnectionState::from_raw(0), Some(ConnectionState::Disconnected));
      assert_eq!(ConnectionState::from_raw(1), Some(ConnectionState::Connecting));
      assert_eq!(ConnectionState::from_raw(2), Some(ConnectionState::Connected));
      assert_eq!(ConnectionState::from_raw(4), Some(ConnectionState::Disconnecting));
      assert_eq!(ConnectionState::from_raw(3), None);
      assert_eq!(ConnectionState::from_raw(0x1_0002), None);
      assert_eq!(ConnectionState::Disconnecting.to_raw(), 4);

      assert_eq!(ServiceState::from_raw(1), Some(ServiceState::Connected));
      assert_eq!(ServiceState::from_raw(2), None);
   }

   #[test]
   fn test_priority_threshold() {
      assert!(!Priority::Undefined.is_enabled());
      assert!(!Priority::Off.is_enabled());
      assert!(Priority::On.is_enabled());
      assert!(Priority::AutoConnect.is_enabled());
      assert_eq!(Priority::from_str("auto_connect").ok(), Some(Priority::AutoConnect));
      assert_eq!(Priority::Off.to_string(), "off");
   }
}
