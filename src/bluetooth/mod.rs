//! Bluetooth transport layer for the iAP2 link.
//!
//! This module provides the BlueZ-backed control interface, L2CAP service
//! channel handling and the peer directory used for admission.

pub mod control;
pub mod l2cap;
pub mod peers;
