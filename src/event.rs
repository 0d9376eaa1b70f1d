//! Event handling system for link state notifications.
//!
//! The state machine reports every accepted transition as a `(new, prev)`
//! pair so observers can tell real changes from rebroadcasts.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::link::{ConnectionState, ServiceState};

/// Events that can be emitted by the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   ConnectionStateChanged {
      device: Address,
      new: ConnectionState,
      prev: ConnectionState,
   },
   ServiceStateChanged {
      device: Address,
      new: ServiceState,
      prev: ServiceState,
   },
   DataReceived(Vec<u8>),
   StackError {
      code: i32,
      message: SmolStr,
   },
   /// An inbound connection was refused; another profile may take the peer.
   IncomingRejected(Address),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
