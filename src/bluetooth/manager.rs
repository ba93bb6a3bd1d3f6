//! Connector facade and its actor.
//!
//! The actor owns the adapter monitor, the discovery coordinator and the
//! connection manager, and runs every command to completion before taking
//! the next one. Callers hold a cheap [`Connector`] handle.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::{
      adapter::{AdapterStateMonitor, SharedAdapterState},
      connection::{ConnectionManager, ConnectionStatus, SharedLink},
      discovery::{DeviceSet, DiscoveryCoordinator},
      platform::{AdapterState, DiscoveredDevice, Platform},
   },
   config::Config,
   error::{ConnectorError, Result},
   event::{ByteSender, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   StartDiscovery(oneshot::Sender<Result<()>>),
   StopDiscovery(oneshot::Sender<bool>),
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<bool>),
   CheckAvailability(oneshot::Sender<AdapterState>),
   RequestEnable(oneshot::Sender<AdapterState>),
   ReportLocalInformation(oneshot::Sender<Result<()>>),
   Shutdown(oneshot::Sender<()>),
}

// === Handle ===

/// Handle to a running connector.
///
/// This type is cheaply cloneable. Devices, connection status and the last
/// adapter state are read without going through the actor.
#[derive(Clone)]
pub struct Connector {
   inbox: mpsc::Sender<ManagerCommand>,
   devices: Arc<DeviceSet>,
   link: SharedLink,
   adapter_state: SharedAdapterState,
   actor: Arc<Mutex<Option<JoinHandle<()>>>>,
   shutdown_timeout: Duration,
}

impl Connector {
   /// Spawns the connector actor on the current runtime.
   pub fn spawn<P: Platform>(
      platform: Arc<P>,
      events: EventSender,
      bytes: ByteSender,
      config: &Config,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ConnectorActor::new(platform, events, bytes, config, command_rx);

      let devices = actor.discovery.devices();
      let link = actor.connection.link();
      let adapter_state = actor.monitor.shared_state();
      let handle = tokio::spawn(actor.run());

      Self {
         inbox: command_tx,
         devices,
         link,
         adapter_state,
         actor: Arc::new(Mutex::new(Some(handle))),
         shutdown_timeout: config.shutdown_timeout(),
      }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| ConnectorError::ConnectorShutdown)?;
      rx.await.map_err(|_| ConnectorError::ConnectorShutdown)
   }

   pub async fn start_discovery(&self) -> Result<()> {
      self.request(ManagerCommand::StartDiscovery).await?
   }

   /// Returns whether a scan was running.
   pub async fn stop_discovery(&self) -> Result<bool> {
      self.request(ManagerCommand::StopDiscovery).await
   }

   pub async fn connect(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(address, tx))
         .await?
   }

   /// Returns whether there was a connection to close.
   pub async fn disconnect(&self) -> Result<bool> {
      self.request(ManagerCommand::Disconnect).await
   }

   pub async fn check_availability(&self) -> Result<AdapterState> {
      self.request(ManagerCommand::CheckAvailability).await
   }

   pub async fn request_enable(&self) -> Result<AdapterState> {
      self.request(ManagerCommand::RequestEnable).await
   }

   pub async fn report_local_information(&self) -> Result<()> {
      self
         .request(ManagerCommand::ReportLocalInformation)
         .await?
   }

   /// Devices found by the current (or last) discovery session.
   pub fn devices(&self) -> Vec<DiscoveredDevice> {
      self.devices.snapshot()
   }

   pub fn status(&self) -> ConnectionStatus {
      self.link.lock().status()
   }

   /// Adapter state as of the connector's last observation.
   pub fn adapter_state(&self) -> Option<AdapterState> {
      self.adapter_state.load()
   }

   /// Stops discovery, the read task and the connection, in that order, and
   /// waits (bounded) for the actor to exit.
   pub async fn shutdown(&self) {
      match self.request(ManagerCommand::Shutdown).await {
         Ok(()) => {},
         Err(e) => debug!("Shutdown request: {e}"),
      }
      let handle = self.actor.lock().take();
      if let Some(handle) = handle
         && time::timeout(self.shutdown_timeout, handle).await.is_err()
      {
         warn!("Connector actor did not exit within {:?}", self.shutdown_timeout);
      }
   }
}

// === Actor ===

struct ConnectorActor<P> {
   monitor: AdapterStateMonitor<P>,
   discovery: DiscoveryCoordinator<P>,
   connection: ConnectionManager<P>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   adapter_poll_interval: Duration,
}

impl<P: Platform> ConnectorActor<P> {
   fn new(
      platform: Arc<P>,
      events: EventSender,
      bytes: ByteSender,
      config: &Config,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      Self {
         monitor: AdapterStateMonitor::new(platform.clone(), events.clone()),
         discovery: DiscoveryCoordinator::new(
            platform.clone(),
            events.clone(),
            config.shutdown_timeout(),
         ),
         connection: ConnectionManager::new(platform, events, bytes, config),
         command_rx,
         adapter_poll_interval: config.adapter_poll_interval(),
      }
   }

   async fn run(mut self) {
      info!("Connector starting up");

      let mut adapter_interval = time::interval(self.adapter_poll_interval);
      adapter_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = adapter_interval.tick() => {
                 self.monitor.refresh().await;
             }
             Some(end) = self.connection.stream_ended() => {
                 debug!("Stream from {} ended", end.address);
                 self.connection.on_stream_end(end).await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("All connector handles dropped");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     return;
                 }
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::StartDiscovery(reply) => {
            let pending = self.connection.is_connecting();
            let result = self.discovery.start(&self.monitor, pending).await;
            let _ = reply.send(result);
         },
         ManagerCommand::StopDiscovery(reply) => {
            let _ = reply.send(self.discovery.stop().await);
         },
         ManagerCommand::Connect(addr, reply) => {
            let result = self.connect(addr).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            let _ = reply.send(self.connection.disconnect().await);
         },
         ManagerCommand::CheckAvailability(reply) => {
            let _ = reply.send(self.monitor.check_availability().await);
         },
         ManagerCommand::RequestEnable(reply) => {
            let _ = reply.send(self.monitor.request_enable().await);
         },
         ManagerCommand::ReportLocalInformation(reply) => {
            let _ = reply.send(self.monitor.report_local_information().await);
         },
         ManagerCommand::Shutdown(reply) => {
            self.cleanup().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   async fn connect(&mut self, addr: Address) -> Result<()> {
      if self.discovery.stop().await {
         info!("Discovery cancelled for connection to {addr}");
      }
      self.monitor.ensure_enabled().await?;
      self.connection.connect(addr).await
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connector");
      self.discovery.stop().await;
      self.connection.disconnect().await;
   }
}

#[cfg(test)]
mod tests {
   use std::{str::FromStr, sync::OnceLock};

   use smol_str::SmolStr;
   use tokio::io::{AsyncReadExt, AsyncWriteExt};

   use super::*;
   use crate::{
      bluetooth::{
         connection::LifecycleState,
         mock::{ChunkRecorder, MockPlatform, RecordingSink, addr, eventually},
      },
      event::ConnectorEvent,
   };

   fn spawn(
      state: AdapterState,
   ) -> (Connector, Arc<MockPlatform>, Arc<RecordingSink>, Arc<ChunkRecorder>) {
      let platform = Arc::new(MockPlatform::new(state));
      let sink = RecordingSink::new();
      let chunks = ChunkRecorder::new();
      let connector = Connector::spawn(
         platform.clone(),
         sink.clone(),
         chunks.clone(),
         &Config::default(),
      );
      (connector, platform, sink, chunks)
   }

   #[tokio::test]
   async fn test_disabled_adapter_blocks_connect() {
      let (connector, platform, sink, _) = spawn(AdapterState::Disabled);
      platform.bond(addr(1), "bonded");
      let target = Address::from_str("AA:BB:CC:DD:EE:FF").unwrap();

      assert!(matches!(
         connector.connect(target).await,
         Err(ConnectorError::AdapterDisabled)
      ));
      assert!(sink.messages().contains(&"Bluetooth not enabled.".to_string()));
      assert_eq!(platform.enable_requests(), 1);
      assert!(platform.opened().is_empty());
      assert_eq!(connector.status().address, None);
      connector.shutdown().await;
   }

   #[tokio::test]
   async fn test_unsupported_adapter_blocks_discovery() {
      let (connector, platform, sink, _) = spawn(AdapterState::Unsupported);
      assert!(matches!(
         connector.start_discovery().await,
         Err(ConnectorError::AdapterUnsupported)
      ));
      assert_eq!(sink.messages(), vec!["Bluetooth not supported."]);
      assert_eq!(platform.scans_started(), 0);
      assert_eq!(connector.adapter_state(), Some(AdapterState::Unsupported));
      connector.shutdown().await;
   }

   #[tokio::test]
   async fn test_discover_connect_stream_and_shutdown() {
      let (connector, platform, sink, chunks) = spawn(AdapterState::Enabled);
      let target = Address::from_str("11:22:33:44:55:66").unwrap();
      platform.bond(target, "HC-05");

      connector.start_discovery().await.unwrap();
      platform.announce(DiscoveredDevice {
         address: target,
         name: SmolStr::new_static("HC-05"),
      });
      eventually(|| connector.devices().len() == 1).await;

      connector.connect(target).await.unwrap();
      // Connecting cancelled the scan but kept its results.
      assert!(!connector.stop_discovery().await.unwrap());
      assert_eq!(connector.devices()[0].address, target);
      assert_eq!(connector.status().state, LifecycleState::Open);

      let mut remote = platform.take_remote(target).unwrap();
      remote.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
      eventually(|| chunks.concat() == [0xde, 0xad, 0xbe, 0xef]).await;

      connector.shutdown().await;
      assert_eq!(connector.status().state, LifecycleState::Closed);
      assert_eq!(
         sink.tags(),
         vec!["searching", "device_found", "connected", "disconnected"]
      );
      assert!(matches!(
         connector.disconnect().await,
         Err(ConnectorError::ConnectorShutdown)
      ));
   }

   #[tokio::test]
   async fn test_remote_close_reports_stream_closed_once() {
      let (connector, platform, sink, _) = spawn(AdapterState::Enabled);
      platform.bond(addr(1), "bonded");
      connector.connect(addr(1)).await.unwrap();

      drop(platform.take_remote(addr(1)));
      eventually(|| sink.tags().contains(&"stream_closed")).await;
      assert_eq!(connector.status().state, LifecycleState::Closed);

      // Released before it was reported: nothing is left to disconnect.
      assert!(!connector.disconnect().await.unwrap());
      let closes = sink
         .events()
         .into_iter()
         .filter(|e| {
            matches!(
               e,
               ConnectorEvent::StreamClosed(_) | ConnectorEvent::Disconnected(_)
            )
         })
         .count();
      assert_eq!(closes, 1);
      connector.shutdown().await;
   }

   #[tokio::test]
   async fn test_read_error_releases_channel_before_reporting() {
      let (connector, platform, sink, _) = spawn(AdapterState::Enabled);
      platform.bond(addr(1), "flaky");
      platform.break_reads(addr(1));
      connector.connect(addr(1)).await.unwrap();
      let mut remote = platform.take_remote(addr(1)).unwrap();

      eventually(|| sink.tags().contains(&"stream_read_error")).await;
      // The outbound half was already shut down when the error was reported.
      let mut buf = [0u8; 4];
      let read = time::timeout(Duration::from_millis(100), remote.read(&mut buf)).await;
      assert_eq!(read.unwrap().unwrap(), 0);
      assert_eq!(connector.status().state, LifecycleState::Failed);
      assert!(!connector.disconnect().await.unwrap());
      assert_eq!(
         sink.messages().last().unwrap(),
         "Stream read error: link lost"
      );
      connector.shutdown().await;
   }

   #[tokio::test]
   async fn test_byte_sink_can_query_status() {
      let platform = Arc::new(MockPlatform::new(AdapterState::Enabled));
      platform.bond(addr(1), "bonded");
      let handle: Arc<OnceLock<Connector>> = Arc::default();
      let seen = Arc::new(Mutex::new(Vec::new()));
      let bytes: ByteSender = {
         let handle = handle.clone();
         let seen = seen.clone();
         Arc::new(move |_: Address, _: &[u8]| {
            if let Some(connector) = handle.get() {
               seen.lock().push(connector.status());
            }
         })
      };
      let connector = Connector::spawn(
         platform.clone(),
         RecordingSink::new(),
         bytes,
         &Config::default(),
      );
      let _ = handle.set(connector.clone());

      connector.connect(addr(1)).await.unwrap();
      let mut remote = platform.take_remote(addr(1)).unwrap();
      remote.write_all(b"x").await.unwrap();
      eventually(|| !seen.lock().is_empty()).await;
      assert_eq!(seen.lock()[0].state, LifecycleState::Open);
      assert_eq!(connector.status().address, Some(addr(1)));

      time::timeout(Duration::from_secs(2), connector.shutdown())
         .await
         .unwrap();
      assert_eq!(connector.status().state, LifecycleState::Closed);
   }

   #[tokio::test]
   async fn test_shutdown_with_scan_and_connection() {
      let (connector, platform, sink, chunks) = spawn(AdapterState::Enabled);
      platform.bond(addr(1), "bonded");
      connector.connect(addr(1)).await.unwrap();
      connector.start_discovery().await.unwrap();

      assert!(platform.announce(DiscoveredDevice {
         address: addr(2),
         name: SmolStr::new_static("nearby"),
      }));
      eventually(|| connector.devices().len() == 1).await;
      let mut remote = platform.take_remote(addr(1)).unwrap();
      remote.write_all(b"live").await.unwrap();
      eventually(|| chunks.concat() == b"live").await;

      connector.shutdown().await;

      assert!(!platform.announce(DiscoveredDevice {
         address: addr(3),
         name: SmolStr::default(),
      }));
      let _ = remote.write_all(b"late").await;
      time::sleep(Duration::from_millis(20)).await;
      assert_eq!(chunks.concat(), b"live");
      assert_eq!(connector.status().state, LifecycleState::Closed);
      assert_eq!(
         sink.tags(),
         vec!["connected", "searching", "device_found", "disconnected"]
      );
   }

   #[tokio::test]
   async fn test_local_information_through_handle() {
      let (connector, _platform, sink, _) = spawn(AdapterState::Enabled);
      connector.report_local_information().await.unwrap();
      assert_eq!(sink.messages(), vec!["ScanMode CONNECTABLE", "State ON"]);
      assert_eq!(
         connector.check_availability().await.unwrap(),
         AdapterState::Enabled
      );
      connector.shutdown().await;
   }
}
