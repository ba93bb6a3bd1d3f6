//! BlueZ-backed [`Platform`] implementation.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
   bluetooth::{
      platform::{
         AdapterState, BondedDevice, Channel, DiscoveredDevice, DiscoveryStream, Platform,
         ScanMode,
      },
      rfcomm,
   },
   config::Config,
   error::{ConnectorError, Result},
};

/// Platform over a BlueZ session and one local adapter.
pub struct BluezPlatform {
   session: Session,
   adapter: Option<Adapter>,
   enabling: Arc<AtomicBool>,
   enable_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezPlatform {
   /// Opens a BlueZ session and selects the configured (or default) adapter.
   ///
   /// A missing adapter is not an error here; it surfaces as
   /// [`AdapterState::Unsupported`].
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;

      let adapter = match &config.adapter {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      };
      let adapter = match adapter {
         Ok(adapter) => {
            info!("Using Bluetooth adapter: {}", adapter.name());
            Some(adapter)
         },
         Err(e) => {
            warn!("No usable Bluetooth adapter: {e}");
            None
         },
      };

      Ok(Self {
         session,
         adapter,
         enabling: Arc::new(AtomicBool::new(false)),
         enable_task: Mutex::new(None),
      })
   }

   fn adapter(&self) -> Result<&Adapter> {
      self.adapter.as_ref().ok_or(ConnectorError::AdapterUnsupported)
   }
}

impl Drop for BluezPlatform {
   fn drop(&mut self) {
      if let Some(task) = self.enable_task.lock().take() {
         task.abort();
      }
   }
}

async fn device_name(adapter: &Adapter, address: Address) -> SmolStr {
   let Ok(device) = adapter.device(address) else {
      return SmolStr::default();
   };
   device
      .name()
      .await
      .ok()
      .flatten()
      .map(SmolStr::from)
      .unwrap_or_default()
}

impl Platform for BluezPlatform {
   async fn adapter_state(&self) -> AdapterState {
      let Some(adapter) = &self.adapter else {
         return AdapterState::Unsupported;
      };
      match adapter.is_powered().await {
         Ok(true) => {
            self.enabling.store(false, Ordering::Relaxed);
            AdapterState::Enabled
         },
         Ok(false) if self.enabling.load(Ordering::Relaxed) => AdapterState::Enabling,
         Ok(false) => AdapterState::Disabled,
         Err(e) => {
            warn!("Adapter {} unavailable: {e}", adapter.name());
            AdapterState::Unsupported
         },
      }
   }

   async fn scan_mode(&self) -> Result<ScanMode> {
      let adapter = self.adapter()?;
      if !adapter.is_powered().await? {
         return Ok(ScanMode::None);
      }
      if adapter.is_discoverable().await? {
         Ok(ScanMode::ConnectableDiscoverable)
      } else {
         Ok(ScanMode::Connectable)
      }
   }

   fn request_enable(&self) {
      let Some(adapter) = self.adapter.clone() else {
         return;
      };
      if self.enabling.swap(true, Ordering::Relaxed) {
         debug!("Enable request already in flight");
         return;
      }

      let enabling = self.enabling.clone();
      let task = tokio::spawn(async move {
         info!("Powering on adapter {}", adapter.name());
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {}: {e}", adapter.name());
         }
         enabling.store(false, Ordering::Relaxed);
      });
      if let Some(prev) = self.enable_task.lock().replace(task) {
         prev.abort();
      }
   }

   async fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
      let adapter = self.adapter()?;
      let mut bonded = Vec::new();
      for address in adapter.device_addresses().await? {
         let device = adapter.device(address)?;
         if device.is_paired().await.unwrap_or(false) {
            bonded.push(BondedDevice {
               address,
               name: device_name(adapter, address).await,
            });
         }
      }
      debug!("{} bonded devices", bonded.len());
      Ok(bonded)
   }

   async fn discover(&self) -> Result<DiscoveryStream> {
      let adapter = self.adapter()?.clone();
      let events = adapter.discover_devices().await?;

      let stream = events.filter_map(move |event| {
         let adapter = adapter.clone();
         async move {
            match event {
               AdapterEvent::DeviceAdded(address) => Some(DiscoveredDevice {
                  address,
                  name: device_name(&adapter, address).await,
               }),
               _ => None,
            }
         }
      });
      Ok(stream.boxed())
   }

   async fn open_secure_channel(&self, address: Address, profile: Uuid) -> Result<Channel> {
      rfcomm::connect(&self.session, self.adapter()?, address, profile).await
   }
}
