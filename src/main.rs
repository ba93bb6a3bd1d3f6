//! Serial Port Profile connector daemon.
//!
//! Exposes the connector on the session bus: discovery, connect and
//! disconnect as methods, status and received bytes as signals.

use std::{str::FromStr, sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use spp_connector::{
   Connector, DiscoveredDevice,
   bluetooth::bluez::BluezPlatform,
   config::Config,
   dbus::{BUS_NAME, ConnectorService, ConnectorServiceSignals, OBJECT_PATH},
   error::Result,
   event::{ByteSink, ConnectorEvent, EventSink},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting SPP connector D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, chunk size: {})",
      config.adapter.as_deref().unwrap_or("default"),
      config.chunk_size()
   );

   let processor = EventProcessor::new();

   let platform = Arc::new(BluezPlatform::new(&config).await?);
   let connector = Connector::spawn(platform, processor.clone(), processor.clone(), &config);

   let service = ConnectorService::new(connector.clone());
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("SPP connector D-Bus service started at {BUS_NAME}");

   processor.spawn_dispatcher(connection).await?;

   connector.report_local_information().await?;
   if config.discover_on_start
      && let Err(e) = connector.start_discovery().await
   {
      warn!("Initial discovery failed: {e}");
   }
   if let Some(target) = config.auto_connect.as_deref() {
      match Address::from_str(target) {
         Ok(addr) => {
            if let Err(e) = connector.connect(addr).await {
               warn!("Auto-connect to {addr} failed: {e}");
            }
         },
         Err(e) => error!("Invalid auto_connect address {target:?}: {e}"),
      }
   }

   signal::ctrl_c().await?;
   info!("Shutting down SPP connector...");
   connector.shutdown().await;

   Ok(())
}

enum Dispatch {
   Tagged {
      success: bool,
      tag: &'static str,
      message: SmolStr,
   },
   Found(DiscoveredDevice),
   Chunk(Address, SmallVec<[u8; 16]>),
}

struct EventProcessor {
   queue: SegQueue<Dispatch>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, item: Dispatch) {
      self.queue.push(item);
      self.notifier.notify_waiters();
   }

   async fn recv(self: &Arc<Self>) -> Option<Dispatch> {
      loop {
         if let Some(item) = self.queue.pop() {
            return Some(item);
         }
         let notify = self.notifier.notified();
         if let Some(item) = self.queue.pop() {
            return Some(item);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<ConnectorService>, item: Dispatch) -> Result<()> {
      match item {
         Dispatch::Tagged {
            success: true,
            tag,
            message,
         } => {
            iface.on_success(tag, &message).await?;
         },
         Dispatch::Tagged {
            success: false,
            tag,
            message,
         } => {
            iface.on_error(tag, &message).await?;
         },
         Dispatch::Found(device) => {
            iface
               .device_found(&device.address.to_string(), &device.name)
               .await?;
         },
         Dispatch::Chunk(addr, bytes) => {
            iface.data_received(&addr.to_string(), &bytes).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ConnectorService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(item) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, item).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventSink for EventProcessor {
   fn emit_success(&self, tag: &str, message: &str) {
      info!("[{tag}] {message}");
   }

   fn emit_error(&self, tag: &str, message: &str) {
      warn!("[{tag}] {message}");
   }

   fn emit(&self, event: &ConnectorEvent) {
      let message = event.message();
      let success = !event.is_error();
      if success {
         self.emit_success(event.tag(), &message);
      } else {
         self.emit_error(event.tag(), &message);
      }
      if let ConnectorEvent::DeviceFound(device) = event {
         self.push(Dispatch::Found(device.clone()));
      }
      self.push(Dispatch::Tagged {
         success,
         tag: event.tag(),
         message,
      });
   }
}

impl ByteSink for EventProcessor {
   fn on_chunk(&self, address: Address, chunk: &[u8]) {
      debug!("Queueing {} bytes from {address}", chunk.len());
      self.push(Dispatch::Chunk(address, SmallVec::from_slice(chunk)));
   }
}
