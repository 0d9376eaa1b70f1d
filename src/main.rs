//! iAP2 link arbitration daemon.
//!
//! This service owns the single accessory link of a Bluetooth adapter,
//! arbitrates outgoing and inbound connection attempts, and exposes the
//! link over D-Bus.

use std::{sync::Arc, time::Duration};

use bluer::Session;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{control::BluerControl, peers::ConfigDirectory};
use dbus::LinkService;
use event::{EventBus, LinkEvent};
use link::manager::{Inbox, LinkManager};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod link;

use crate::{dbus::LinkServiceSignals, error::Result};

/// Interval between refreshes of the bonded device list
const BOND_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting iap2d...");

   // Load configuration
   let config_path = config::Config::config_path()?;
   let config = config::Config::load_from(&config_path)?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   // Bring up the adapter
   let session = Session::new().await?;
   let adapter = match &config.adapter {
      Some(name) => session.adapter(name)?,
      None => session.default_adapter().await?,
   };
   if !adapter.is_powered().await? {
      adapter.set_powered(true).await?;
      info!("Powered on adapter: {}", adapter.name());
   }

   let event_bus = EventProcessor::new();
   let inbox = Inbox::new();

   let control = Arc::new(BluerControl::new(
      adapter.clone(),
      inbox.translator(),
      config.psm,
      config.link_poll_interval(),
   ));
   if let Err(e) = control.listen().await {
      warn!("Inbound service channels unavailable: {e}");
   }

   let connect_timeout = config.connect_timeout();
   let directory = Arc::new(ConfigDirectory::new(config, config_path));
   if let Err(e) = directory.refresh(&adapter).await {
      warn!("Failed to read bonded devices: {e}");
   }
   tokio::spawn(directory.clone().watch(adapter, BOND_REFRESH_INTERVAL));

   let manager = Arc::new(LinkManager::spawn(
      inbox,
      control,
      directory,
      event_bus.clone(),
      connect_timeout,
   ));

   // Build D-Bus connection
   let connection = connection::Builder::system()?
      .name("org.iap2d")?
      .serve_at(dbus::OBJECT_PATH, LinkService::new(manager.clone()))?
      .build()
      .await?;

   info!("iap2d D-Bus service started at org.iap2d");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down iap2d...");
   manager.shutdown().await
}

/// Lock-free queue of link events, drained into D-Bus signals.
#[derive(Default)]
struct EventProcessor {
   pending: SegQueue<LinkEvent>,
   wakeup: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::default()
   }

   /// Waits for the next event. A wakeup that races the drain is kept as a
   /// permit, so nothing is missed.
   async fn next(&self) -> LinkEvent {
      loop {
         if let Some(event) = self.pending.pop() {
            return event;
         }
         self.wakeup.notified().await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<LinkService>, event: LinkEvent) -> Result<()> {
      match event {
         LinkEvent::ConnectionStateChanged { device, new, prev } => {
            iface
               .connection_state_changed(&device.to_string(), new.to_raw(), prev.to_raw())
               .await?;
         },
         LinkEvent::ServiceStateChanged { device, new, prev } => {
            iface
               .service_state_changed(&device.to_string(), new.to_raw(), prev.to_raw())
               .await?;
         },
         LinkEvent::DataReceived(data) => {
            iface.data_received(&hex::encode(data)).await?;
         },
         LinkEvent::StackError { code, message } => {
            iface.stack_error(code, &message).await?;
         },
         LinkEvent::IncomingRejected(device) => {
            iface.incoming_rejected(&device.to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, LinkService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         loop {
            let event = self.next().await;
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: LinkEvent) {
      self.pending.push(event);
      self.wakeup.notify_one();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::link::machine::tests::device;

   #[tokio::test]
   async fn test_events_delivered_in_order() {
      let processor = EventProcessor::new();
      processor.emit(LinkEvent::IncomingRejected(device(1)));
      processor.emit(LinkEvent::DataReceived(vec![0x40]));

      assert_eq!(processor.next().await, LinkEvent::IncomingRejected(device(1)));
      assert_eq!(processor.next().await, LinkEvent::DataReceived(vec![0x40]));
   }

   #[tokio::test]
   async fn test_waiter_wakes_on_emit() {
      let processor = EventProcessor::new();
      let waiter = tokio::spawn({
         let processor = processor.clone();
         async move { processor.next().await }
      });
      tokio::task::yield_now().await;

      processor.emit(LinkEvent::DataReceived(vec![1, 2]));
      assert_eq!(waiter.await.unwrap(), LinkEvent::DataReceived(vec![1, 2]));
   }
}
