//! Downstream control interface to the radio stack.

use std::sync::Arc;

use bluer::Address;

use crate::error::Result;

/// Commands the state machine issues to the transport.
///
/// Results are immediate local outcomes ("accepted for dispatch"). The actual
/// link outcome arrives later as a stack event through the
/// [`EventTranslator`](crate::link::translator::EventTranslator).
pub trait ControlInterface: Send + Sync {
   fn connect(&self, address: Address) -> Result<()>;

   fn disconnect(&self, address: Address) -> Result<()>;

   /// Queues `data` on the service channel of `address`.
   fn send_data(&self, address: Address, data: &[u8]) -> Result<()>;

   /// Releases every transport resource. Called once on shutdown.
   fn cleanup(&self);
}

pub type ControlHandle = Arc<dyn ControlInterface>;
