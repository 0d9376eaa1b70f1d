//! Link manager actor and its request façade.
//!
//! Commands from callers and events from the transport share one ordered
//! inbox. A single actor task drains it and drives the [`LinkMachine`];
//! queries read the shared snapshot directly.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   error::{LinkError, Result},
   event::EventSender,
   link::{
      ChannelHandle, ConnectionState, Priority, ServiceState,
      admission::{AdmissionPolicy, DirectoryHandle},
      control::ControlHandle,
      machine::{LinkMachine, Message},
      roles::LinkSnapshot,
      translator::EventTranslator,
   },
};

/// The ordered queue shared by commands and stack events.
///
/// Created before the manager so the transport can be handed a translator
/// up front.
pub struct Inbox {
   tx: mpsc::UnboundedSender<Message>,
   rx: mpsc::UnboundedReceiver<Message>,
}

impl Inbox {
   pub fn new() -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      Self { tx, rx }
   }

   pub fn translator(&self) -> EventTranslator {
      EventTranslator::new(self.tx.clone())
   }
}

impl Default for Inbox {
   fn default() -> Self {
      Self::new()
   }
}

/// Handle to the running link core.
pub struct LinkManager {
   inbox: mpsc::UnboundedSender<Message>,
   snapshot: Arc<RwLock<LinkSnapshot>>,
   directory: DirectoryHandle,
   actor: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
   pub fn spawn(
      inbox: Inbox,
      control: ControlHandle,
      directory: DirectoryHandle,
      events: EventSender,
      connect_timeout: Duration,
   ) -> Self {
      let snapshot = Arc::new(RwLock::new(LinkSnapshot::default()));
      let machine = LinkMachine::new(
         control,
         AdmissionPolicy::new(directory.clone()),
         events,
         snapshot.clone(),
         connect_timeout,
      );
      let actor = tokio::spawn(ManagerActor { machine, inbox: inbox.rx }.run());
      Self {
         inbox: inbox.tx,
         snapshot,
         directory,
         actor: Mutex::new(Some(actor)),
      }
   }

   pub fn connect(&self, device: Address) -> Result<()> {
      if self.directory.priority(device) == Priority::Off {
         return Err(LinkError::PriorityOff(device));
      }
      match self.connection_state(device) {
         ConnectionState::Connected => Err(LinkError::AlreadyConnected),
         ConnectionState::Connecting => Err(LinkError::AlreadyConnecting),
         _ => self.enqueue(Message::Connect(device)),
      }
   }

   pub fn disconnect(&self, device: Address) -> Result<()> {
      match self.connection_state(device) {
         ConnectionState::Connected | ConnectionState::Connecting => {
            self.enqueue(Message::Disconnect(device))
         },
         _ => Err(LinkError::DeviceNotConnected),
      }
   }

   /// Sends `data` over the link and waits for the transport's verdict.
   pub async fn send_data(&self, device: Address, data: Vec<u8>) -> Result<()> {
      if self.connection_state(device) != ConnectionState::Connected {
         return Err(LinkError::DeviceNotConnected);
      }
      let (tx, rx) = oneshot::channel();
      self.enqueue(Message::SendData(data, Some(tx)))?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)?
   }

   pub fn connection_state(&self, device: Address) -> ConnectionState {
      self.snapshot.read().connection_state_of(device)
   }

   pub fn service_state(&self, device: Address) -> ServiceState {
      self.snapshot.read().service_state_of(device)
   }

   pub fn service_channel(&self, device: Address) -> Option<ChannelHandle> {
      self.snapshot.read().channel_of(device)
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      self.snapshot.read().connected_device().into_iter().collect()
   }

   /// Bonded accessory devices, plus any tracked peer, whose connection
   /// state is one of `states`.
   pub fn devices_matching_states(&self, states: &[ConnectionState]) -> Vec<Address> {
      let snapshot = *self.snapshot.read();
      let mut devices = self.directory.bonded_devices();
      for device in snapshot.roles.devices() {
         if !devices.contains(&device) {
            devices.push(device);
         }
      }
      devices.retain(|&device| states.contains(&snapshot.connection_state_of(device)));
      devices
   }

   pub fn priority(&self, device: Address) -> Priority {
      self.directory.priority(device)
   }

   pub fn set_priority(&self, device: Address, priority: Priority) -> Result<()> {
      info!("Priority of {device} set to {priority}");
      self.directory.set_priority(device, priority)
   }

   /// Stops the actor after it drained what was queued before this call.
   pub async fn shutdown(&self) -> Result<()> {
      let Some(actor) = self.actor.lock().take() else {
         return Ok(());
      };
      let _ = self.inbox.send(Message::Shutdown);
      actor.await.map_err(LinkError::ActorPanicked)
   }

   fn enqueue(&self, msg: Message) -> Result<()> {
      self
         .inbox
         .send(msg)
         .map_err(|_| LinkError::ManagerShutdown)
   }
}

// === Manager Actor ===

struct ManagerActor {
   machine: LinkMachine,
   inbox: mpsc::UnboundedReceiver<Message>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Link manager starting up");

      loop {
         let timer = self.machine.connect_timer();
         let deadline = timer.map_or_else(Instant::now, |t| t.deadline);
         select! {
            biased;
            msg = self.inbox.recv() => match msg {
               Some(Message::Shutdown) => {
                  info!("Link manager shutting down");
                  break;
               },
               Some(msg) => self.machine.handle(msg),
               None => {
                  info!("All link handles dropped, shutting down");
                  break;
               },
            },
            () = time::sleep_until(deadline), if timer.is_some() => {
               if let Some(timer) = timer {
                  self.machine.handle(Message::ConnectTimeout(timer.generation));
               }
            },
         }
      }

      self.inbox.close();
      while let Ok(msg) = self.inbox.try_recv() {
         debug!("Dropping {msg:?} after shutdown");
      }
      self.machine.shutdown();
   }
}
