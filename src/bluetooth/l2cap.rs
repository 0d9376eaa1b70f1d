//! L2CAP socket implementation for the accessory service channel.
//!
//! This module provides async L2CAP socket handling with separate
//! sender and receiver channels, for both outgoing and accepted links.

use std::{io, sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::mpsc::{self, error::TrySendError},
   task::JoinSet,
   time,
};

use crate::error::{LinkError, Result};

pub type Packet = SmallVec<[u8; 64]>;

/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Packets buffered in each direction
const CHANNEL_DEPTH: usize = 128;

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(LinkError::ChannelClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Packet>,
}

impl L2CapSender {
   /// Queues a packet without waiting for the socket.
   pub fn try_send(&self, data: &[u8]) -> Result<()> {
      self
         .tx
         .try_send(Packet::from_slice(data))
         .map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Io(io::ErrorKind::WouldBlock.into()),
            TrySendError::Closed(_) => LinkError::ChannelClosed,
         })
   }

   /// Sender whose packets land in the returned queue instead of a socket.
   #[cfg(test)]
   pub(crate) fn detached(depth: usize) -> (Self, mpsc::Receiver<Packet>) {
      let (tx, rx) = mpsc::channel(depth);
      (Self { tx }, rx)
   }
}

pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
   psm: u16,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| LinkError::RequestTimeout)??;

   Ok(spawn_channel(jset, address, seq_packet))
}

/// Binds a listener for inbound service channels on `psm`.
pub async fn listen(psm: u16) -> Result<SeqPacketListener> {
   let addr = SocketAddr::new(Address::any(), AddressType::BrEdr, psm);
   debug!("Listening for service channels on PSM {psm:#06x}");
   Ok(SeqPacketListener::bind(addr).await?)
}

/// Splits a connected socket into sender and receiver halves.
pub fn spawn_channel(
   jset: &mut JoinSet<()>,
   address: Address,
   seq_packet: SeqPacket,
) -> (L2CapReceiver, L2CapSender) {
   let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_DEPTH);
   let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_thread(address, in_tx, seq_packet.clone()));
   jset.spawn(send_thread(address, cmd_rx, seq_packet));

   (L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx })
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Result<Packet>>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      let n = match sp.recv(&mut stack).await {
         Ok(n) => n,
         Err(e) => {
            warn!("Receive from {adr} failed: {e}");
            let _ = tx.send(Err(LinkError::Io(e))).await;
            return;
         },
      };
      if n == 0 {
         warn!("Connection lost");
         let _ = tx.send(Err(LinkError::ConnectionLost)).await;
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if let Err(e) = tx.send(Ok(Packet::from_slice(recvd))).await {
         warn!("Failed to relay data: {e:?}");
         return;
      }
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Packet>, sp: Arc<SeqPacket>) {
   while let Some(data) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&data));
      if let Err(e) = sp.send(&data).await {
         warn!("Failed to send data: {e}");
         return;
      }
   }
   debug!("Sender for {adr} closed");
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_try_send_queues_packets() {
      let (tx, mut rx) = mpsc::channel(2);
      let sender = L2CapSender { tx };

      sender.try_send(&[0xff, 0x5a]).unwrap();
      assert_eq!(rx.recv().await.unwrap().as_slice(), &[0xff, 0x5a]);
   }

   #[tokio::test]
   async fn test_try_send_reports_backpressure_and_close() {
      let (tx, rx) = mpsc::channel(1);
      let sender = L2CapSender { tx };

      sender.try_send(&[1]).unwrap();
      assert!(matches!(
         sender.try_send(&[2]),
         Err(LinkError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock
      ));

      drop(rx);
      assert!(matches!(sender.try_send(&[3]), Err(LinkError::ChannelClosed)));
   }

   #[tokio::test]
   async fn test_receiver_reports_closed_channel() {
      let (tx, rx) = mpsc::channel(1);
      let mut receiver = L2CapReceiver { rx };
      tx.send(Err(LinkError::ConnectionLost)).await.unwrap();
      drop(tx);

      assert!(matches!(receiver.recv().await, Err(LinkError::ConnectionLost)));
      assert!(matches!(receiver.recv().await, Err(LinkError::ChannelClosed)));
   }
}
