use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   error::LinkError,
   link::{ConnectionState, Priority, manager::LinkManager},
};

/// Object path the link interface is served at.
pub const OBJECT_PATH: &str = "/org/iap2d/link";

pub struct LinkService {
   manager: Arc<LinkManager>,
}

impl LinkService {
   pub const fn new(manager: Arc<LinkManager>) -> Self {
      Self { manager }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.iap2d.Link1")]
impl LinkService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.connect(addr).map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.disconnect(addr).map_err(failed)?;
      Ok(true)
   }

   async fn send_data(&self, address: String, data: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let data = hex::decode(data).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self.manager.send_data(addr, data).await.map_err(failed)?;
      Ok(true)
   }

   async fn get_connection_state(&self, address: String) -> zbus::fdo::Result<u32> {
      let addr = parse_address(&address)?;
      Ok(self.manager.connection_state(addr).to_raw())
   }

   async fn get_service_state(&self, address: String) -> zbus::fdo::Result<u32> {
      let addr = parse_address(&address)?;
      Ok(self.manager.service_state(addr).to_raw())
   }

   /// Handle of the open service channel, for peers that need the raw socket.
   async fn get_service_channel(&self, address: String) -> zbus::fdo::Result<u32> {
      let addr = parse_address(&address)?;
      self
         .manager
         .service_channel(addr)
         .map(|channel| channel.0)
         .ok_or_else(|| failed(LinkError::ChannelClosed))
   }

   async fn get_connected_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .manager
         .connected_devices()
         .into_iter()
         .map(|addr| {
            serde_json::json!({
               "address": addr.to_string(),
               "service": self.manager.service_state(addr).to_raw(),
            })
         })
         .collect();
      serde_json::to_string(&devices).map_err(failed)
   }

   async fn get_devices_matching_states(&self, states: Vec<u32>) -> zbus::fdo::Result<Vec<String>> {
      let states = states
         .into_iter()
         .map(|raw| {
            ConnectionState::from_raw(raw).ok_or_else(|| {
               zbus::fdo::Error::InvalidArgs(format!("Unknown connection state: {raw}"))
            })
         })
         .collect::<zbus::fdo::Result<Vec<_>>>()?;
      Ok(self
         .manager
         .devices_matching_states(&states)
         .into_iter()
         .map(|addr| addr.to_string())
         .collect())
   }

   async fn get_priority(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      Ok(self.manager.priority(addr).to_string())
   }

   async fn set_priority(&self, address: String, priority: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let priority = Priority::from_str(&priority).map_err(|_| {
         zbus::fdo::Error::InvalidArgs(format!("Invalid priority: {priority}"))
      })?;
      self.manager.set_priority(addr, priority).map_err(failed)?;
      info!("Set priority of {address} to {priority}");
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      new_state: u32,
      prev_state: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn service_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      new_state: u32,
      prev_state: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(emitter: &SignalEmitter<'_>, data: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stack_error(emitter: &SignalEmitter<'_>, code: i32, message: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn incoming_rejected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.manager.connected_devices().len() as u32
   }
}
