//! Boundary to the operating system's Bluetooth stack.
//!
//! The connector never talks to BlueZ directly; everything it needs from the
//! OS (radio state, the pairing registry, discovery notifications and the
//! secure serial transport) goes through [`Platform`].

use std::{fmt, future::Future};

use bluer::Address;
use futures::stream::BoxStream;
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::Result;

/// Serial Port Profile service class UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Local radio availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum AdapterState {
   Unsupported,
   Disabled,
   Enabling,
   Enabled,
   Disabling,
}

impl AdapterState {
   /// Power-state label reported as local information.
   pub const fn label(self) -> &'static str {
      match self {
         Self::Unsupported => "State UNSUPPORTED",
         Self::Disabled => "State OFF",
         Self::Enabling => "State TURNING_ON",
         Self::Enabled => "State ON",
         Self::Disabling => "State TURNING_OFF",
      }
   }
}

/// Visibility of the local radio to other devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScanMode {
   #[strum(to_string = "ScanMode NONE")]
   None,
   #[strum(to_string = "ScanMode CONNECTABLE")]
   Connectable,
   #[strum(to_string = "ScanMode CONNECTABLE_DISCOVERABLE")]
   ConnectableDiscoverable,
}

/// A peer reported by a discovery scan. The address is the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub address: Address,
   pub name: SmolStr,
}

/// A peer already paired at the OS level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
   pub address: Address,
   pub name: SmolStr,
}

pub type Inbound = Box<dyn AsyncRead + Send + Unpin>;
pub type Outbound = Box<dyn AsyncWrite + Send + Unpin>;
pub type DiscoveryStream = BoxStream<'static, DiscoveredDevice>;

/// Resource that must stay alive for as long as a channel is in use.
pub type ChannelGuard = Box<dyn Send>;

/// Both directions of an opened serial channel.
pub struct Channel {
   inbound: Inbound,
   outbound: Outbound,
   guard: Option<ChannelGuard>,
}

impl Channel {
   pub fn new(inbound: Inbound, outbound: Outbound) -> Self {
      Self {
         inbound,
         outbound,
         guard: None,
      }
   }

   /// Ties `guard`'s lifetime to the channel's.
   pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
      self.guard = Some(Box::new(guard));
      self
   }

   pub fn into_parts(self) -> (Inbound, Outbound, Option<ChannelGuard>) {
      (self.inbound, self.outbound, self.guard)
   }
}

impl fmt::Debug for Channel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Channel")
         .field("guarded", &self.guard.is_some())
         .finish_non_exhaustive()
   }
}

/// Operating system services consumed by the connector.
pub trait Platform: Send + Sync + 'static {
   /// Current state of the local radio.
   fn adapter_state(&self) -> impl Future<Output = AdapterState> + Send;

   fn scan_mode(&self) -> impl Future<Output = Result<ScanMode>> + Send;

   /// Asks the OS to power the radio on. Fire-and-forget: the outcome is
   /// only visible through later [`Platform::adapter_state`] calls.
   fn request_enable(&self);

   /// Devices in the OS pairing registry.
   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<BondedDevice>>> + Send;

   /// Starts a scan. Dropping the stream ends it.
   fn discover(&self) -> impl Future<Output = Result<DiscoveryStream>> + Send;

   /// Opens an authenticated RFCOMM channel to `address` on `profile`.
   fn open_secure_channel(
      &self,
      address: Address,
      profile: Uuid,
   ) -> impl Future<Output = Result<Channel>> + Send;
}
