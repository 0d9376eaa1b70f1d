//! BlueZ-backed control interface.
//!
//! Each peer gets one link task that brings up the ACL link, opens the
//! accessory service channel and relays packets until the link drops. All
//! outcomes are reported back through the [`EventTranslator`] using the raw
//! stack codes.

use std::{
   collections::{HashMap, HashSet},
   future,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::{Adapter, Address, Device, l2cap::SeqPacket};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   runtime::Handle,
   select,
   task::{JoinHandle, JoinSet},
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet},
   error::{LinkError, Result},
   link::{
      ChannelHandle, ConnectionState, ServiceState, control::ControlInterface,
      translator::EventTranslator,
   },
};

/// Maximum time to wait for the ACL link to come up
const ACL_CONNECT_TIMEOUT: Duration = Duration::from_secs(25);
/// Delay before accepting again after a listener failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

struct ActiveChannel {
   device: Address,
   handle: ChannelHandle,
   sender: L2CapSender,
}

/// State shared between the control handle and its link tasks.
#[derive(Clone)]
struct LinkContext {
   translator: EventTranslator,
   psm: u16,
   poll_interval: Duration,
   channel: Arc<Mutex<Option<ActiveChannel>>>,
   next_channel: Arc<AtomicU32>,
   /// Peers with a native disconnect already issued.
   closing: Arc<Mutex<HashSet<Address>>>,
}

impl LinkContext {
   fn report_connection(&self, state: ConnectionState, address: Address) {
      self
         .translator
         .connection_state_changed(state.to_raw(), &address.0);
   }

   fn report_service(&self, state: ServiceState, address: Address, channel: Option<ChannelHandle>) {
      self
         .translator
         .service_state_changed(state.to_raw(), &address.0, channel);
   }

   /// Installs the service channel of `device`, unless another peer holds it.
   fn open_channel(&self, device: Address, sender: L2CapSender) -> Option<ChannelHandle> {
      let mut channel = self.channel.lock();
      if let Some(active) = channel.as_ref()
         && active.device != device
      {
         warn!("Service channel held by {}, refusing {device}", active.device);
         return None;
      }
      let handle = ChannelHandle(self.next_channel.fetch_add(1, Ordering::Relaxed));
      *channel = Some(ActiveChannel {
         device,
         handle,
         sender,
      });
      Some(handle)
   }

   /// Drops the active channel if it belongs to `device`.
   fn close_channel(&self, device: Address) -> Option<ChannelHandle> {
      let mut channel = self.channel.lock();
      match channel.as_ref() {
         Some(active) if active.device == device => channel.take().map(|c| c.handle),
         _ => None,
      }
   }

   fn send_to(&self, device: Address, data: &[u8]) -> Result<()> {
      match self.channel.lock().as_ref() {
         Some(active) if active.device == device => active.sender.try_send(data),
         _ => Err(LinkError::ChannelClosed),
      }
   }

   /// Marks `device` as closing. Returns false if it already was.
   fn begin_close(&self, device: Address) -> bool {
      self.closing.lock().insert(device)
   }

   /// A new link to `device` is starting, so a later disconnect is real again.
   fn reopen(&self, device: Address) {
      self.closing.lock().remove(&device);
   }

   async fn outgoing(self, device: Device) {
      let address = device.address();
      match time::timeout(ACL_CONNECT_TIMEOUT, device.connect()).await {
         Ok(Ok(())) => {},
         Ok(Err(e)) => {
            warn!("ACL connect to {address} failed: {e}");
            self.report_connection(ConnectionState::Disconnected, address);
            return;
         },
         Err(_) => {
            warn!("ACL connect to {address} timed out");
            self.report_connection(ConnectionState::Disconnected, address);
            return;
         },
      }

      self.report_connection(ConnectionState::Connected, address);
      self.serve(&device, None).await;
   }

   async fn incoming(self, device: Device, seq_packet: SeqPacket) {
      let address = device.address();
      self.report_connection(ConnectionState::Connecting, address);
      self.report_connection(ConnectionState::Connected, address);
      self.serve(&device, Some(seq_packet)).await;
   }

   async fn serve(&self, device: &Device, accepted: Option<SeqPacket>) {
      let address = device.address();
      let mut jset = JoinSet::new();

      let channel = match accepted {
         Some(seq_packet) => Ok(l2cap::spawn_channel(&mut jset, address, seq_packet)),
         None => l2cap::connect(&mut jset, address, self.psm).await,
      };
      let mut rx = match channel {
         Ok((rx, tx)) => match self.open_channel(address, tx) {
            Some(handle) => {
               info!("Service channel {handle} open to {address}");
               self.report_service(ServiceState::Connected, address, Some(handle));
               Some(rx)
            },
            None => {
               jset.abort_all();
               self.report_connection(ConnectionState::Disconnected, address);
               return;
            },
         },
         Err(e) => {
            warn!("Service channel to {address} unavailable: {e}");
            None
         },
      };

      let mut poll = time::interval(self.poll_interval);
      poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            packet = next_packet(&mut rx) => match packet {
               Ok(packet) => self.translator.data_received(&packet),
               Err(e) => {
                  info!("Service channel to {address} closed: {e}");
                  rx = None;
                  if let Some(handle) = self.close_channel(address) {
                     debug!("Released {handle}");
                     self.report_service(ServiceState::Disconnected, address, None);
                  }
               },
            },
            _ = poll.tick() => {
               if !device.is_connected().await.unwrap_or(false) {
                  info!("Link to {address} lost");
                  break;
               }
            },
         }
      }

      if self.close_channel(address).is_some() {
         self.report_service(ServiceState::Disconnected, address, None);
      }
      jset.abort_all();
      self.report_connection(ConnectionState::Disconnected, address);
   }
}

async fn next_packet(rx: &mut Option<L2CapReceiver>) -> Result<Packet> {
   match rx {
      Some(rx) => rx.recv().await,
      None => future::pending().await,
   }
}

/// Control interface over a BlueZ adapter.
pub struct BluerControl {
   adapter: Adapter,
   context: LinkContext,
   runtime: Handle,
   links: Arc<Mutex<HashMap<Address, JoinHandle<()>>>>,
   listener: Mutex<Option<JoinHandle<()>>>,
}

impl BluerControl {
   /// Must be called from within the tokio runtime.
   pub fn new(
      adapter: Adapter,
      translator: EventTranslator,
      psm: u16,
      poll_interval: Duration,
   ) -> Self {
      Self {
         adapter,
         context: LinkContext {
            translator,
            psm,
            poll_interval,
            channel: Arc::default(),
            next_channel: Arc::new(AtomicU32::new(1)),
            closing: Arc::default(),
         },
         runtime: Handle::current(),
         links: Arc::default(),
         listener: Mutex::new(None),
      }
   }

   /// Starts accepting inbound service channels.
   pub async fn listen(&self) -> Result<()> {
      let listener = l2cap::listen(self.context.psm).await?;
      let adapter = self.adapter.clone();
      let context = self.context.clone();
      let links = self.links.clone();

      let task = self.runtime.spawn(async move {
         loop {
            let (seq_packet, peer) = match listener.accept().await {
               Ok(accepted) => accepted,
               Err(e) => {
                  warn!("Accepting service channel failed: {e}");
                  context
                     .translator
                     .error(e.raw_os_error().unwrap_or(-1), &e.to_string());
                  time::sleep(ACCEPT_RETRY_DELAY).await;
                  continue;
               },
            };
            let address = peer.addr;
            info!("Inbound service channel from {address}");
            let device = match adapter.device(address) {
               Ok(device) => device,
               Err(e) => {
                  warn!("Unknown inbound peer {address}: {e}");
                  continue;
               },
            };
            context.reopen(address);
            let task = tokio::spawn(context.clone().incoming(device, seq_packet));
            if let Some(old) = links.lock().insert(address, task) {
               old.abort();
            }
         }
      });

      if let Some(old) = self.listener.lock().replace(task) {
         old.abort();
      }
      Ok(())
   }
}

impl ControlInterface for BluerControl {
   fn connect(&self, address: Address) -> Result<()> {
      let mut links = self.links.lock();
      if links.get(&address).is_some_and(|task| !task.is_finished()) {
         return Err(LinkError::ControlRefused("connect"));
      }
      let device = self.adapter.device(address)?;
      self.context.reopen(address);
      debug!("Spawning link task for {address}");
      links.insert(address, self.runtime.spawn(self.context.clone().outgoing(device)));
      Ok(())
   }

   fn disconnect(&self, address: Address) -> Result<()> {
      let device = self.adapter.device(address)?;
      if !self.context.begin_close(address) {
         debug!("Disconnect of {address} already in progress");
         return Ok(());
      }
      let aborted = match self.links.lock().remove(&address) {
         Some(task) => {
            task.abort();
            true
         },
         None => false,
      };
      self.context.close_channel(address);

      let context = self.context.clone();
      self.runtime.spawn(async move {
         context.report_connection(ConnectionState::Disconnecting, address);
         if let Err(e) = device.disconnect().await {
            warn!("Disconnect of {address} failed: {e}");
         }
         let still_connected = device.is_connected().await.unwrap_or(false);
         context.report_connection(settled_state(aborted, still_connected), address);
      });
      Ok(())
   }

   fn send_data(&self, address: Address, data: &[u8]) -> Result<()> {
      self.context.send_to(address, data)
   }

   fn cleanup(&self) {
      info!("Releasing Bluetooth resources");
      if let Some(listener) = self.listener.lock().take() {
         listener.abort();
      }
      for (address, task) in self.links.lock().drain() {
         debug!("Aborting link task for {address}");
         task.abort();
      }
      *self.context.channel.lock() = None;
      self.context.closing.lock().clear();
   }
}

/// Link state to report once a native disconnect has run.
///
/// A peer whose link task was torn down is gone as far as the service is
/// concerned, even if another profile keeps the ACL up.
const fn settled_state(aborted: bool, still_connected: bool) -> ConnectionState {
   if still_connected && !aborted {
      ConnectionState::Connected
   } else {
      ConnectionState::Disconnected
   }
}
