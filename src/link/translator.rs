//! Translation of raw stack callbacks into typed events.
//!
//! The transport calls into [`EventTranslator`] from its own delivery
//! context. Nothing here touches link state; events are only resolved and
//! queued for the state machine.

use bluer::Address;
use log::{debug, warn};
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::mpsc;

use crate::{
   error::{LinkError, Result},
   link::{ChannelHandle, ConnectionState, ServiceState, machine::Message},
};

/// Error code reported for callbacks that could not be translated.
pub const TRANSLATION_ERROR: i32 = -1;

/// Typed notification from the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
   ConnectionStateChanged {
      state: ConnectionState,
      device: Address,
   },
   ServiceStateChanged {
      state: ServiceState,
      device: Address,
      channel: Option<ChannelHandle>,
   },
   DataReceived(Vec<u8>),
   Error {
      code: i32,
      message: SmolStr,
   },
}

impl StackEvent {
   fn translation_error(err: &LinkError) -> Self {
      Self::Error {
         code: TRANSLATION_ERROR,
         message: err.to_smolstr(),
      }
   }
}

/// Callback sink handed to the transport.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct EventTranslator {
   inbox: mpsc::UnboundedSender<Message>,
}

impl EventTranslator {
   pub(crate) const fn new(inbox: mpsc::UnboundedSender<Message>) -> Self {
      Self { inbox }
   }

   pub fn connection_state_changed(&self, state: u32, address: &[u8]) {
      let event = match (ConnectionState::from_raw(state), resolve(address)) {
         (Some(state), Ok(device)) => StackEvent::ConnectionStateChanged { state, device },
         (None, _) => StackEvent::translation_error(&LinkError::UnknownConnectionState(state)),
         (_, Err(e)) => StackEvent::translation_error(&e),
      };
      self.deliver(event);
   }

   pub fn service_state_changed(&self, state: u32, address: &[u8], channel: Option<ChannelHandle>) {
      let event = match (ServiceState::from_raw(state), resolve(address)) {
         (Some(ServiceState::Connected), Ok(_)) if channel.is_none() => StackEvent::Error {
            code: TRANSLATION_ERROR,
            message: SmolStr::new_static("service connected without a channel"),
         },
         (Some(state), Ok(device)) => StackEvent::ServiceStateChanged {
            state,
            device,
            channel,
         },
         (None, _) => StackEvent::translation_error(&LinkError::UnknownServiceState(state)),
         (_, Err(e)) => StackEvent::translation_error(&e),
      };
      self.deliver(event);
   }

   pub fn data_received(&self, data: &[u8]) {
      debug!("← {}", hex::encode(data));
      self.deliver(StackEvent::DataReceived(data.to_vec()));
   }

   pub fn error(&self, code: i32, message: &str) {
      self.deliver(StackEvent::Error {
         code,
         message: message.into(),
      });
   }

   fn deliver(&self, event: StackEvent) {
      if let Err(e) = self.inbox.send(Message::Stack(event)) {
         warn!("Link manager is gone, dropping {:?}", e.0);
      }
   }
}

fn resolve(address: &[u8]) -> Result<Address> {
   let bytes: [u8; 6] = address
      .try_into()
      .map_err(|_| LinkError::InvalidAddress(address.len()))?;
   Ok(Address::new(bytes))
}

#[cfg(test)]
mod tests {
   use super::*;

   const RAW: [u8; 6] = [0xa4, 0xc1, 0x38, 0x00, 0x12, 0x34];

   fn translator() -> (EventTranslator, mpsc::UnboundedReceiver<Message>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (EventTranslator::new(tx), rx)
   }

   fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> StackEvent {
      match rx.try_recv() {
         Ok(Message::Stack(event)) => event,
         other => panic!("expected stack event, got {other:?}"),
      }
   }

   #[test]
   fn test_connection_state_is_resolved() {
      let (translator, mut rx) = translator();
      translator.connection_state_changed(2, &RAW);
      assert_eq!(next_event(&mut rx), StackEvent::ConnectionStateChanged {
         state: ConnectionState::Connected,
         device: Address::new(RAW),
      });
   }

   #[test]
   fn test_bad_address_becomes_error_event() {
      let (translator, mut rx) = translator();
      translator.connection_state_changed(1, &RAW[..4]);
      match next_event(&mut rx) {
         StackEvent::Error { code, message } => {
            assert_eq!(code, TRANSLATION_ERROR);
            assert!(message.contains("4 bytes"), "{message}");
         },
         other => panic!("unexpected {other:?}"),
      }
   }

   #[test]
   fn test_unknown_state_code_becomes_error_event() {
      let (translator, mut rx) = translator();
      translator.connection_state_changed(3, &RAW);
      assert!(matches!(next_event(&mut rx), StackEvent::Error {
         code: TRANSLATION_ERROR,
         ..
      }));

      translator.service_state_changed(9, &RAW, None);
      assert!(matches!(next_event(&mut rx), StackEvent::Error { .. }));
   }

   #[test]
   fn test_service_connected_requires_channel() {
      let (translator, mut rx) = translator();
      translator.service_state_changed(1, &RAW, None);
      assert!(matches!(next_event(&mut rx), StackEvent::Error { .. }));

      translator.service_state_changed(1, &RAW, Some(ChannelHandle(3)));
      assert_eq!(next_event(&mut rx), StackEvent::ServiceStateChanged {
         state: ServiceState::Connected,
         device: Address::new(RAW),
         channel: Some(ChannelHandle(3)),
      });

      translator.service_state_changed(0, &RAW, None);
      assert!(matches!(next_event(&mut rx), StackEvent::ServiceStateChanged {
         state: ServiceState::Disconnected,
         ..
      }));
   }

   #[test]
   fn test_data_and_errors_pass_through() {
      let (translator, mut rx) = translator();
      translator.data_received(&[0xff, 0x5a, 0x00]);
      assert_eq!(next_event(&mut rx), StackEvent::DataReceived(vec![0xff, 0x5a, 0x00]));

      translator.error(12, "link key missing");
      assert_eq!(next_event(&mut rx), StackEvent::Error {
         code: 12,
         message: "link key missing".into(),
      });
   }

   #[test]
   fn test_closed_inbox_drops_silently() {
      let (translator, rx) = translator();
      drop(rx);
      translator.error(1, "ignored");
   }
}
