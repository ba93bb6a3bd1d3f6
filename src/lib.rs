//! Serial Port Profile connector.
//!
//! Finds nearby Bluetooth devices, opens an RFCOMM serial channel to a
//! bonded peer and streams what it sends. Status goes to an
//! [`EventSink`](event::EventSink), payload bytes to a
//! [`ByteSink`](event::ByteSink).

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;

pub use bluetooth::{
   manager::Connector,
   platform::{AdapterState, DiscoveredDevice, Platform, SPP_UUID},
};
pub use error::{ConnectorError, Result};
