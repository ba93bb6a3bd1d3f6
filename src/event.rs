//! Event handling for connector status updates.
//!
//! Every outward notification (adapter gating, discovery progress,
//! connection lifecycle, stream termination) is a [`ConnectorEvent`]
//! delivered to an [`EventSink`]. Received payload bytes travel separately
//! through a [`ByteSink`].

use std::sync::Arc;

use bluer::Address;
use smol_str::{SmolStr, format_smolstr};

use crate::bluetooth::platform::DiscoveredDevice;

/// Events that can be emitted by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
   AdapterUnsupported,
   AdapterDisabled,
   LocalInformation(SmolStr),
   Searching,
   DiscoveryFailed(SmolStr),
   DeviceFound(DiscoveredDevice),
   DeviceNotBonded(Address),
   Connected(Address),
   Disconnected(Address),
   ConnectionFailed(Address, SmolStr),
   StreamClosed(Address),
   StreamReadError(Address, SmolStr),
}

impl ConnectorEvent {
   /// Stable identifier of the event kind.
   pub const fn tag(&self) -> &'static str {
      match self {
         Self::AdapterUnsupported => "adapter_unsupported",
         Self::AdapterDisabled => "adapter_disabled",
         Self::LocalInformation(_) => "local_information",
         Self::Searching => "searching",
         Self::DiscoveryFailed(_) => "discovery_failed",
         Self::DeviceFound(_) => "device_found",
         Self::DeviceNotBonded(_) => "device_not_bonded",
         Self::Connected(_) => "connected",
         Self::Disconnected(_) => "disconnected",
         Self::ConnectionFailed(..) => "connection_failed",
         Self::StreamClosed(_) => "stream_closed",
         Self::StreamReadError(..) => "stream_read_error",
      }
   }

   pub const fn is_error(&self) -> bool {
      matches!(
         self,
         Self::AdapterUnsupported
            | Self::AdapterDisabled
            | Self::DiscoveryFailed(_)
            | Self::DeviceNotBonded(_)
            | Self::ConnectionFailed(..)
            | Self::StreamReadError(..)
      )
   }

   /// Human readable message carried with the tag.
   pub fn message(&self) -> SmolStr {
      match self {
         Self::AdapterUnsupported => SmolStr::new_static("Bluetooth not supported."),
         Self::AdapterDisabled => SmolStr::new_static("Bluetooth not enabled."),
         Self::LocalInformation(info) => info.clone(),
         Self::Searching => SmolStr::new_static("Searching Bluetooth Devices"),
         Self::DiscoveryFailed(cause) => format_smolstr!("Discovery failed: {cause}"),
         Self::DeviceFound(device) => format_smolstr!("device found [{}]", device.name),
         Self::DeviceNotBonded(addr) => format_smolstr!("Device not bonded: {addr}"),
         Self::Connected(addr) => format_smolstr!("Connected to {addr}"),
         Self::Disconnected(addr) => format_smolstr!("Disconnected from {addr}"),
         Self::ConnectionFailed(_, cause) => format_smolstr!("Connection failed: {cause}"),
         Self::StreamClosed(_) => SmolStr::new_static("Stream closed."),
         Self::StreamReadError(_, cause) => format_smolstr!("Stream read error: {cause}"),
      }
   }
}

/// Receiver of connector events.
///
/// Implementors only need the two tagged entry points; sinks that want the
/// structured event (e.g. to forward a found device's address) override
/// [`EventSink::emit`].
pub trait EventSink: Send + Sync {
   fn emit_success(&self, tag: &str, message: &str);

   fn emit_error(&self, tag: &str, message: &str);

   fn emit(&self, event: &ConnectorEvent) {
      let message = event.message();
      if event.is_error() {
         self.emit_error(event.tag(), &message);
      } else {
         self.emit_success(event.tag(), &message);
      }
   }
}

/// Type alias for a thread-safe event sink.
pub type EventSender = Arc<dyn EventSink>;

/// Consumer of raw bytes read from the open connection.
pub trait ByteSink: Send + Sync {
   fn on_chunk(&self, address: Address, chunk: &[u8]);
}

impl<F> ByteSink for F
where
   F: Fn(Address, &[u8]) + Send + Sync,
{
   fn on_chunk(&self, address: Address, chunk: &[u8]) {
      self(address, chunk);
   }
}

/// Type alias for a thread-safe byte sink.
pub type ByteSender = Arc<dyn ByteSink>;
