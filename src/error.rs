//! Error types for the iAP2 link service.
//!
//! This module defines all error types that can occur while arbitrating the
//! accessory link, including Bluetooth, D-Bus, I/O, configuration and
//! state-machine errors.

use bluer::Address;
use thiserror::Error;
use tokio::task::JoinError;

use crate::link::roles::Roles;

/// Main error type for the iAP2 link service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid peer address ({0} bytes)")]
   InvalidAddress(usize),

   #[error("Unknown connection state code: {0}")]
   UnknownConnectionState(u32),

   #[error("Unknown service state code: {0}")]
   UnknownServiceState(u32),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Already connected to device")]
   AlreadyConnected,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Connections to {0} are disabled by priority")]
   PriorityOff(Address),

   #[error("Cannot {op} while roles are {roles:?}")]
   RoleConflict { op: &'static str, roles: Roles },

   #[error("Control interface refused {0}")]
   ControlRefused(&'static str),

   #[error("Service channel not open")]
   ChannelClosed,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Actor panicked: {0}")]
   ActorPanicked(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Link manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
