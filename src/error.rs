//! Error types for the SPP connector.
//!
//! This module defines every error that can terminate a connector
//! operation: adapter gating, bonding lookup, transport setup, stream
//! reads, plus the ambient BlueZ, D-Bus, I/O and configuration failures.

use bluer::Address;
use thiserror::Error;

/// Main error type for the connector.
#[derive(Error, Debug)]
pub enum ConnectorError {
   #[error("Bluetooth not supported")]
   AdapterUnsupported,

   #[error("Bluetooth not enabled")]
   AdapterDisabled,

   #[error("Device not bonded: {0}")]
   DeviceNotBonded(Address),

   #[error("Connection failed: {0}")]
   ConnectionFailed(String),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Already connecting to a device")]
   AlreadyConnecting,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Connector has been shut down")]
   ConnectorShutdown,
}

/// Convenience type alias for Results with `ConnectorError`.
pub type Result<T> = std::result::Result<T, ConnectorError>;
