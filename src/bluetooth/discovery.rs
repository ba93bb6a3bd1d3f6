//! Device discovery.
//!
//! A scan is a stream of found-device notifications drained by a single
//! task into a [`DeviceSet`]. The set deduplicates by address, so repeated
//! notifications for one peer are reported once per session.

use std::{collections::HashSet, sync::Arc, time::Duration};

use bluer::Address;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::ToSmolStr;
use tokio::{task::JoinHandle, time};

use crate::{
   bluetooth::{
      adapter::AdapterStateMonitor,
      platform::{DiscoveredDevice, DiscoveryStream, Platform},
   },
   error::{ConnectorError, Result},
   event::{ConnectorEvent, EventSender},
};

#[derive(Debug, Default)]
struct DeviceSetInner {
   session: u64,
   seen: HashSet<Address>,
   devices: Vec<DiscoveredDevice>,
}

/// Devices found during the current discovery session, in first-seen order.
///
/// Safe to feed from any thread.
#[derive(Debug, Default)]
pub struct DeviceSet {
   inner: Mutex<DeviceSetInner>,
}

impl DeviceSet {
   /// Clears the set and opens a new session.
   fn begin_session(&self) -> u64 {
      let mut inner = self.inner.lock();
      inner.session += 1;
      inner.seen.clear();
      inner.devices.clear();
      inner.session
   }

   /// Inserts `device` if it belongs to the current session and its address
   /// is new. Returns whether it was inserted.
   pub fn record(&self, session: u64, device: DiscoveredDevice) -> bool {
      let mut inner = self.inner.lock();
      if inner.session != session || !inner.seen.insert(device.address) {
         return false;
      }
      inner.devices.push(device);
      true
   }

   pub fn current_session(&self) -> u64 {
      self.inner.lock().session
   }

   pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
      self.inner.lock().devices.clone()
   }

   pub fn contains(&self, address: Address) -> bool {
      self.inner.lock().seen.contains(&address)
   }

   pub fn len(&self) -> usize {
      self.inner.lock().devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

/// Drives scans and reports newly found devices.
pub struct DiscoveryCoordinator<P> {
   platform: Arc<P>,
   events: EventSender,
   devices: Arc<DeviceSet>,
   scan: Option<JoinHandle<()>>,
   stop_timeout: Duration,
}

impl<P: Platform> DiscoveryCoordinator<P> {
   pub fn new(platform: Arc<P>, events: EventSender, stop_timeout: Duration) -> Self {
      Self {
         platform,
         events,
         devices: Arc::new(DeviceSet::default()),
         scan: None,
         stop_timeout,
      }
   }

   pub fn devices(&self) -> Arc<DeviceSet> {
      self.devices.clone()
   }

   pub fn is_running(&self) -> bool {
      self.scan.as_ref().is_some_and(|scan| !scan.is_finished())
   }

   /// Starts a new discovery session, replacing any running one.
   ///
   /// Refuses while the radio is not enabled or while a connection is being
   /// set up.
   pub async fn start(
      &mut self,
      monitor: &AdapterStateMonitor<P>,
      connection_pending: bool,
   ) -> Result<()> {
      monitor.ensure_enabled().await?;
      if connection_pending {
         warn!("Refusing to discover while a connection is being set up");
         return Err(ConnectorError::AlreadyConnecting);
      }

      self.stop().await;
      self.events.emit(&ConnectorEvent::Searching);
      let session = self.devices.begin_session();

      let stream = match self.platform.discover().await {
         Ok(stream) => stream,
         Err(e) => {
            error!("Failed to start discovery: {e}");
            self
               .events
               .emit(&ConnectorEvent::DiscoveryFailed(e.to_smolstr()));
            return Err(e);
         },
      };
      info!("Discovery session {session} started");
      self.scan = Some(tokio::spawn(drain(
         session,
         stream,
         self.devices.clone(),
         self.events.clone(),
      )));
      Ok(())
   }

   /// Handles one found-device notification for the current session.
   pub fn on_device_found(&self, device: DiscoveredDevice) -> bool {
      report_found(
         &self.devices,
         &self.events,
         self.devices.current_session(),
         device,
      )
   }

   /// Stops the running scan, keeping the devices found so far. Returns
   /// whether a scan was running.
   pub async fn stop(&mut self) -> bool {
      let Some(scan) = self.scan.take() else {
         return false;
      };
      scan.abort();
      if time::timeout(self.stop_timeout, scan).await.is_err() {
         warn!("Discovery task did not stop within {:?}", self.stop_timeout);
      }
      info!("Discovery stopped with {} devices", self.devices.len());
      true
   }
}

impl<P> Drop for DiscoveryCoordinator<P> {
   fn drop(&mut self) {
      if let Some(scan) = self.scan.take() {
         scan.abort();
      }
   }
}

fn report_found(
   devices: &DeviceSet,
   events: &EventSender,
   session: u64,
   device: DiscoveredDevice,
) -> bool {
   if !devices.record(session, device.clone()) {
      return false;
   }
   info!("Found device {} [{}]", device.address, device.name);
   events.emit(&ConnectorEvent::DeviceFound(device));
   true
}

async fn drain(
   session: u64,
   mut stream: DiscoveryStream,
   devices: Arc<DeviceSet>,
   events: EventSender,
) {
   while let Some(device) = stream.next().await {
      report_found(&devices, &events, session, device);
   }
   debug!("Discovery session {session} stream ended");
}
