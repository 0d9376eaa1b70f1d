//! Link arbitration state machine.
//!
//! ```text
//!   (Disconnected)
//!       |    ^
//!  CONNECT   | DISCONNECTED
//!       v    |
//!     (Pending)
//!       |    ^
//! CONNECTED  | CONNECT / DISCONNECT
//!       v    |
//!    (Connected)
//! ```
//!
//! The machine is driven by a single consumer (see
//! [`manager`](crate::link::manager)). Every mutation of the shared snapshot
//! happens here under one write lock, so readers never observe a half-applied
//! transition.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::{sync::oneshot, time::Instant};

use crate::{
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
   link::{
      ChannelHandle, ConnectionState, ServiceState,
      admission::AdmissionPolicy,
      control::ControlHandle,
      roles::{LinkSnapshot, MachineState, Role, Roles},
      translator::StackEvent,
   },
};

/// Inbound message consumed by the state machine.
#[derive(Debug)]
pub enum Message {
   Connect(Address),
   Disconnect(Address),
   SendData(Vec<u8>, Option<oneshot::Sender<Result<()>>>),
   Stack(StackEvent),
   /// Connect timer expiry, tagged with the generation it was armed with.
   ConnectTimeout(u64),
   Shutdown,
}

/// The single outstanding connect timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTimer {
   pub generation: u64,
   pub deadline: Instant,
}

pub struct LinkMachine {
   control: ControlHandle,
   policy: AdmissionPolicy,
   events: EventSender,
   shared: Arc<RwLock<LinkSnapshot>>,
   connect_timeout: Duration,

   deferred: Vec<Message>,
   replay: VecDeque<Message>,
   timer: Option<ConnectTimer>,
   generation: u64,
}

impl LinkMachine {
   pub fn new(
      control: ControlHandle,
      policy: AdmissionPolicy,
      events: EventSender,
      shared: Arc<RwLock<LinkSnapshot>>,
      connect_timeout: Duration,
   ) -> Self {
      Self {
         control,
         policy,
         events,
         shared,
         connect_timeout,
         deferred: Vec::new(),
         replay: VecDeque::new(),
         timer: None,
         generation: 0,
      }
   }

   pub fn snapshot(&self) -> LinkSnapshot {
      *self.shared.read()
   }

   pub const fn connect_timer(&self) -> Option<ConnectTimer> {
      self.timer
   }

   /// Processes one message, then any messages it released for replay.
   pub fn handle(&mut self, msg: Message) {
      self.process(msg);
      while let Some(msg) = self.replay.pop_front() {
         self.process(msg);
      }
   }

   /// Cancels the timer, drops deferred work and releases the transport.
   pub fn shutdown(&mut self) {
      self.timer = None;
      if !self.deferred.is_empty() {
         warn!("Dropping {} deferred message(s) on shutdown", self.deferred.len());
      }
      for msg in self.deferred.drain(..).chain(self.replay.drain(..)) {
         refuse(msg, LinkError::ManagerShutdown);
      }
      self.control.cleanup();
   }

   fn process(&mut self, msg: Message) {
      let state = self.shared.read().state;
      debug!("{state} processing {msg:?}");
      let result = match (state, msg) {
         (_, Message::Stack(StackEvent::Error { code, message })) => {
            self.on_stack_error(code, message);
            Ok(())
         },
         (_, Message::Shutdown) => Ok(()),
         (MachineState::Disconnected, msg) => self.on_disconnected(msg),
         (MachineState::Pending, msg) => self.on_pending(msg),
         (MachineState::Connected, msg) => self.on_connected(msg),
      };
      if let Err(e) = result {
         error!("{state}: message rejected: {e}");
      }
   }

   // === Disconnected ===

   fn on_disconnected(&mut self, msg: Message) -> Result<()> {
      let snap = self.snapshot();
      if !snap.roles.is_empty() {
         refuse(msg, LinkError::DeviceNotConnected);
         return Err(LinkError::RoleConflict {
            op: "process while disconnected",
            roles: snap.roles,
         });
      }

      match msg {
         Message::Connect(device) => {
            self.broadcast_connection(
               device,
               ConnectionState::Connecting,
               ConnectionState::Disconnected,
            );
            if let Err(e) = self.control.connect(device) {
               warn!("Connect to {device} failed: {e}");
               self.broadcast_connection(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               return Ok(());
            }
            self.commit(MachineState::Pending, |roles| roles.set_target(device))?;
            self.arm_connect_timer();
         },
         Message::Disconnect(device) => debug!("Nothing to disconnect for {device}"),
         msg @ Message::SendData(..) => refuse(msg, LinkError::DeviceNotConnected),
         Message::ConnectTimeout(generation) => debug!("Stale connect timeout #{generation}"),
         Message::Stack(StackEvent::ConnectionStateChanged { state, device }) => {
            self.disconnected_connection_event(state, device, snap)?;
         },
         Message::Stack(StackEvent::ServiceStateChanged { state, device, .. }) => {
            warn!("Ignoring service {state} for {device}: not connected");
         },
         Message::Stack(StackEvent::DataReceived(data)) => {
            warn!("Ignoring {} received bytes: not connected", data.len());
         },
         Message::Stack(StackEvent::Error { .. }) | Message::Shutdown => {},
      }
      Ok(())
   }

   fn disconnected_connection_event(
      &mut self,
      state: ConnectionState,
      device: Address,
      snap: LinkSnapshot,
   ) -> Result<()> {
      let outgoing = snap.roles.target().is_some();
      match state {
         ConnectionState::Disconnected | ConnectionState::Disconnecting => {
            warn!("Ignoring {state} for {device}: already disconnected");
         },
         ConnectionState::Connecting => {
            if self.policy.should_accept(device, outgoing) {
               info!("Incoming connection from {device} accepted");
               self.broadcast_connection(
                  device,
                  ConnectionState::Connecting,
                  ConnectionState::Disconnected,
               );
               self.commit(MachineState::Pending, |roles| roles.set_incoming(device))?;
            } else {
               info!("Incoming connection from {device} rejected");
               self.reject_peer(device);
               self.events.emit(LinkEvent::IncomingRejected(device));
            }
         },
         ConnectionState::Connected => {
            warn!("{device} connected without a connecting notification");
            if self.policy.should_accept(device, outgoing) {
               info!("Incoming connection from {device} accepted");
               self.broadcast_connection(
                  device,
                  ConnectionState::Connected,
                  ConnectionState::Disconnected,
               );
               self.commit(MachineState::Connected, |roles| roles.set_current(device))?;
            } else {
               info!("Incoming connection from {device} rejected");
               self.reject_peer(device);
            }
         },
      }
      Ok(())
   }

   // === Pending ===

   fn on_pending(&mut self, msg: Message) -> Result<()> {
      let snap = self.snapshot();
      match msg {
         msg @ Message::Connect(_) => self.defer(msg),
         msg @ Message::Disconnect(device) => self.pending_disconnect(device, snap.roles, msg)?,
         msg @ Message::SendData(..) => refuse(msg, LinkError::DeviceNotConnected),
         Message::ConnectTimeout(generation) => self.on_connect_timeout(generation, snap.roles),
         Message::Stack(StackEvent::ConnectionStateChanged { state, device }) => match state {
            ConnectionState::Disconnected => self.pending_disconnected(device, snap)?,
            ConnectionState::Connected => self.pending_connected(device, snap)?,
            ConnectionState::Connecting => match snap.roles.role_of(device) {
               Role::Current => debug!("Current device {device} is connecting back"),
               Role::Target => debug!("Stack and target {device} are connecting"),
               Role::Incoming => warn!("Another connecting event for incoming {device}"),
               Role::None => info!("Ignoring incoming connection from {device} while pending"),
            },
            ConnectionState::Disconnecting => match snap.roles.role_of(device) {
               Role::Current => debug!("Stack is disconnecting current {device}"),
               Role::Target => warn!("Target {device} is getting disconnected"),
               Role::Incoming => warn!("Incoming {device} is getting disconnected"),
               Role::None => warn!("Disconnecting unknown device {device}"),
            },
         },
         Message::Stack(StackEvent::ServiceStateChanged { state, device, .. }) => {
            warn!("Ignoring service {state} for {device}: link is pending");
         },
         Message::Stack(StackEvent::DataReceived(data)) => {
            warn!("Ignoring {} received bytes: link is pending", data.len());
         },
         Message::Stack(StackEvent::Error { .. }) | Message::Shutdown => {},
      }
      Ok(())
   }

   fn pending_disconnect(&mut self, device: Address, roles: Roles, msg: Message) -> Result<()> {
      match roles {
         Roles::Handover { target, .. } if target == device => {
            info!("Cancelling handover to {device}");
            self.broadcast_connection(
               device,
               ConnectionState::Disconnected,
               ConnectionState::Connecting,
            );
            self.commit(MachineState::Pending, |roles| {
               roles.clear(Role::Target);
               Ok(())
            })?;
         },
         Roles::Outgoing(target) if target == device => match self.control.disconnect(device) {
            Ok(()) => {
               info!("Cancelled connection attempt to {device}");
               self.broadcast_connection(
                  device,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
               self.commit(MachineState::Disconnected, |roles| {
                  roles.clear(Role::Target);
                  Ok(())
               })?;
            },
            Err(e) => {
               warn!("Could not cancel connection to {device}: {e}");
               self.defer(msg);
            },
         },
         _ => self.defer(msg),
      }
      Ok(())
   }

   fn on_connect_timeout(&mut self, generation: u64, roles: Roles) {
      if self.timer.is_none_or(|t| t.generation != generation) {
         debug!("Stale connect timeout #{generation}");
         return;
      }
      self.timer = None;
      match roles.target() {
         Some(target) => {
            warn!("Connection to {target} timed out");
            self
               .replay
               .push_front(Message::Stack(StackEvent::ConnectionStateChanged {
                  state: ConnectionState::Disconnected,
                  device: target,
               }));
         },
         None => debug!("Connect timeout with no target"),
      }
   }

   fn pending_disconnected(&mut self, device: Address, snap: LinkSnapshot) -> Result<()> {
      match snap.roles.role_of(device) {
         Role::Current => {
            self.broadcast_connection(
               device,
               ConnectionState::Disconnected,
               ConnectionState::Disconnecting,
            );
            let Some(target) = snap.roles.target() else {
               return self.commit(MachineState::Disconnected, |roles| {
                  roles.clear(Role::Current);
                  roles.clear(Role::Incoming);
                  Ok(())
               });
            };
            self.commit(MachineState::Pending, |roles| {
               roles.clear(Role::Current);
               Ok(())
            })?;
            match self.control.connect(target) {
               Ok(()) => self.arm_connect_timer(),
               Err(e) => {
                  warn!("Connect to {target} failed: {e}");
                  self.broadcast_connection(
                     target,
                     ConnectionState::Disconnected,
                     ConnectionState::Connecting,
                  );
                  self.commit(MachineState::Disconnected, |roles| {
                     roles.clear(Role::Target);
                     Ok(())
                  })?;
               },
            }
         },
         Role::Target => {
            self.broadcast_connection(
               device,
               ConnectionState::Disconnected,
               ConnectionState::Connecting,
            );
            // The old current device may still be tearing down.
            let next = if snap.roles.current().is_some() {
               MachineState::Pending
            } else {
               MachineState::Disconnected
            };
            self.commit(next, |roles| {
               roles.clear(Role::Target);
               Ok(())
            })?;
         },
         Role::Incoming => {
            self.broadcast_connection(
               device,
               ConnectionState::Disconnected,
               ConnectionState::Connecting,
            );
            self.commit(MachineState::Disconnected, |roles| {
               roles.clear(Role::Incoming);
               Ok(())
            })?;
         },
         Role::None => error!("Unknown device disconnected: {device}"),
      }
      Ok(())
   }

   fn pending_connected(&mut self, device: Address, snap: LinkSnapshot) -> Result<()> {
      match snap.roles.role_of(device) {
         Role::Current => {
            info!("Disconnect of {device} failed, link is back");
            self.broadcast_connection(
               device,
               ConnectionState::Connected,
               ConnectionState::Disconnecting,
            );
            if let Some(target) = snap.roles.target() {
               self.broadcast_connection(
                  target,
                  ConnectionState::Disconnected,
                  ConnectionState::Connecting,
               );
            }
            self.commit(MachineState::Connected, |roles| {
               roles.clear(Role::Target);
               Ok(())
            })?;
         },
         Role::Target | Role::Incoming => {
            if let Some(displaced) = snap.roles.current() {
               self.broadcast_connection(
                  displaced,
                  ConnectionState::Disconnected,
                  ConnectionState::Disconnecting,
               );
            }
            self.broadcast_connection(
               device,
               ConnectionState::Connected,
               ConnectionState::Connecting,
            );
            self.commit(MachineState::Connected, |roles| {
               roles.promote(device).map(drop)
            })?;
         },
         Role::None => {
            error!("Unknown device connected: {device}, resynchronizing");
            for other in snap.roles.devices() {
               self.broadcast_connection(
                  other,
                  ConnectionState::Disconnected,
                  snap.connection_state_of(other),
               );
            }
            self.broadcast_connection(
               device,
               ConnectionState::Connected,
               ConnectionState::Disconnected,
            );
            self.commit(MachineState::Connected, |roles| {
               *roles = Roles::Current(device);
               Ok(())
            })?;
         },
      }
      Ok(())
   }

   // === Connected ===

   fn on_connected(&mut self, msg: Message) -> Result<()> {
      let snap = self.snapshot();
      let Some(current) = snap.roles.current() else {
         refuse(msg, LinkError::DeviceNotConnected);
         return Err(LinkError::RoleConflict {
            op: "process while connected",
            roles: snap.roles,
         });
      };

      match msg {
         Message::Connect(device) if device == current => {
            debug!("Already connected to {device}");
         },
         Message::Connect(device) => self.connected_handover(current, device, snap)?,
         Message::Disconnect(device) if device != current => {
            debug!("Ignoring disconnect of {device}: connected to {current}");
         },
         Message::Disconnect(device) => self.connected_disconnect(device, snap)?,
         Message::SendData(data, reply) => {
            debug!("→ {current}: {}", hex::encode(&data));
            let result = self.control.send_data(current, &data);
            if let Err(e) = &result {
               warn!("Sending {} bytes to {current} failed: {e}", data.len());
            }
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         Message::ConnectTimeout(generation) => debug!("Stale connect timeout #{generation}"),
         Message::Stack(StackEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected,
            device,
         }) if device == current => {
            self.synthesize_service_disconnect(current, snap);
            self.broadcast_connection(
               current,
               ConnectionState::Disconnected,
               ConnectionState::Connected,
            );
            self.commit(MachineState::Disconnected, |roles| {
               roles.clear(Role::Current);
               Ok(())
            })?;
         },
         Message::Stack(StackEvent::ConnectionStateChanged { state, device }) => {
            error!("Unexpected {state} for {device} while connected to {current}");
         },
         Message::Stack(StackEvent::ServiceStateChanged {
            state,
            device,
            channel,
         }) => {
            if device == current {
               self.connected_service_event(device, state, channel, snap);
            } else {
               warn!("Ignoring service {state} for {device}: connected to {current}");
            }
         },
         Message::Stack(StackEvent::DataReceived(data)) => {
            debug!("Relaying {} bytes from {current}", data.len());
            self.events.emit(LinkEvent::DataReceived(data));
         },
         Message::Stack(StackEvent::Error { .. }) | Message::Shutdown => {},
      }
      Ok(())
   }

   fn connected_handover(
      &mut self,
      current: Address,
      device: Address,
      snap: LinkSnapshot,
   ) -> Result<()> {
      self.broadcast_connection(
         device,
         ConnectionState::Connecting,
         ConnectionState::Disconnected,
      );
      if let Err(e) = self.control.disconnect(current) {
         warn!("Disconnect of {current} for handover failed: {e}");
         self.broadcast_connection(
            device,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
         );
         return Ok(());
      }
      self.synthesize_service_disconnect(current, snap);
      self.broadcast_connection(
         current,
         ConnectionState::Disconnecting,
         ConnectionState::Connected,
      );
      self.commit(MachineState::Pending, |roles| roles.set_target(device))
   }

   fn connected_disconnect(&mut self, device: Address, snap: LinkSnapshot) -> Result<()> {
      self.synthesize_service_disconnect(device, snap);
      self.broadcast_connection(
         device,
         ConnectionState::Disconnecting,
         ConnectionState::Connected,
      );
      if let Err(e) = self.control.disconnect(device) {
         warn!("Disconnect of {device} failed: {e}");
         self.broadcast_connection(
            device,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
         );
         if let Some(channel) = snap.service {
            self.set_service(Some(channel));
            self.broadcast_service(device, ServiceState::Connected, ServiceState::Disconnected);
         }
         return Ok(());
      }
      self.commit(MachineState::Pending, |_| Ok(()))
   }

   fn connected_service_event(
      &mut self,
      device: Address,
      state: ServiceState,
      channel: Option<ChannelHandle>,
      snap: LinkSnapshot,
   ) {
      match (state, snap.service, channel) {
         (ServiceState::Connected, _, None) => {
            warn!("Service connected for {device} without a channel");
         },
         (ServiceState::Connected, None, Some(channel)) => {
            info!("Service channel {channel} open for {device}");
            self.set_service(Some(channel));
            self.broadcast_service(device, ServiceState::Connected, ServiceState::Disconnected);
         },
         (ServiceState::Connected, Some(old), Some(channel)) => {
            debug!("Service channel for {device} replaced: {old} -> {channel}");
            self.set_service(Some(channel));
         },
         (ServiceState::Disconnected, Some(channel), _) => {
            info!("Service channel {channel} closed for {device}");
            self.set_service(None);
            self.broadcast_service(device, ServiceState::Disconnected, ServiceState::Connected);
         },
         (ServiceState::Disconnected, None, _) => {
            debug!("Service already disconnected for {device}");
         },
      }
   }

   /// The stack does not always report the service going down with the link.
   fn synthesize_service_disconnect(&mut self, device: Address, snap: LinkSnapshot) {
      if snap.service.is_some() {
         warn!("Synthesizing service disconnect for {device}");
         self.set_service(None);
         self.broadcast_service(device, ServiceState::Disconnected, ServiceState::Connected);
      }
   }

   // === Helpers ===

   /// Applies a role update and state change atomically.
   fn commit(
      &mut self,
      next: MachineState,
      update: impl FnOnce(&mut Roles) -> Result<()>,
   ) -> Result<()> {
      let prev = {
         let mut shared = self.shared.write();
         let mut roles = shared.roles;
         update(&mut roles)?;
         if next == MachineState::Disconnected && !roles.is_empty() {
            return Err(LinkError::RoleConflict {
               op: "enter disconnected",
               roles,
            });
         }
         let prev = shared.state;
         shared.state = next;
         shared.roles = roles;
         if next != MachineState::Connected {
            shared.service = None;
         }
         prev
      };

      if next != MachineState::Pending && self.timer.take().is_some() {
         debug!("Connect timeout cancelled");
      }
      if prev != next {
         info!("{prev} -> {next}");
         self.replay_deferred();
      }
      Ok(())
   }

   fn set_service(&self, channel: Option<ChannelHandle>) {
      self.shared.write().service = channel;
   }

   fn defer(&mut self, msg: Message) {
      debug!("Deferring {msg:?}");
      self.deferred.push(msg);
   }

   /// Moves deferred messages ahead of everything not yet processed.
   fn replay_deferred(&mut self) {
      for msg in self.deferred.drain(..).rev() {
         self.replay.push_front(msg);
      }
   }

   fn arm_connect_timer(&mut self) {
      self.generation += 1;
      self.timer = Some(ConnectTimer {
         generation: self.generation,
         deadline: Instant::now() + self.connect_timeout,
      });
      debug!(
         "Connect timeout #{} armed for {:?}",
         self.generation, self.connect_timeout
      );
   }

   fn reject_peer(&self, device: Address) {
      if let Err(e) = self.control.disconnect(device) {
         warn!("Failed to drop rejected peer {device}: {e}");
      }
   }

   fn on_stack_error(&self, code: i32, message: SmolStr) {
      warn!("Stack error {code}: {message}");
      self.events.emit(LinkEvent::StackError { code, message });
   }

   fn broadcast_connection(&self, device: Address, new: ConnectionState, prev: ConnectionState) {
      info!("Connection state {device}: {prev} -> {new}");
      self
         .events
         .emit(LinkEvent::ConnectionStateChanged { device, new, prev });
   }

   fn broadcast_service(&self, device: Address, new: ServiceState, prev: ServiceState) {
      info!("Service state {device}: {prev} -> {new}");
      self
         .events
         .emit(LinkEvent::ServiceStateChanged { device, new, prev });
   }
}

/// Fails the reply channel of a message that will not be processed.
fn refuse(msg: Message, err: LinkError) {
   if let Message::SendData(_, Some(reply)) = msg {
      let _ = reply.send(Err(err));
   }
}
