//! Connection lifecycle: bonded lookup, channel setup, teardown.
//!
//! At most one connection exists at a time. Its lifecycle lives in a
//! [`Link`] shared with the read task; every transition happens under the
//! link's lock, and the read task checks its generation there before each
//! delivery, which keeps a stale read task from reaching the byte sink.
//!
//! A stream that ends on its own is released by the manager before the end
//! is reported.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{io::AsyncWriteExt, sync::mpsc, time};

use crate::{
   bluetooth::{
      platform::{ChannelGuard, Outbound, Platform, SPP_UUID},
      reader::{ReadContext, ReadTask},
   },
   config::Config,
   error::{ConnectorError, Result},
   event::{ByteSender, ConnectorEvent, EventSender},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum LifecycleState {
   Connecting,
   Open,
   Closed,
   Failed,
}

/// Point-in-time view of the connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
   pub address: Option<Address>,
   pub state: LifecycleState,
}

/// Lifecycle shared between the manager and the read task.
#[derive(Debug)]
pub struct Link {
   generation: u64,
   address: Option<Address>,
   state: LifecycleState,
   reading: bool,
}

impl Default for Link {
   fn default() -> Self {
      Self {
         generation: 0,
         address: None,
         state: LifecycleState::Closed,
         reading: false,
      }
   }
}

impl Link {
   pub const fn state(&self) -> LifecycleState {
      self.state
   }

   pub const fn status(&self) -> ConnectionStatus {
      ConnectionStatus {
         address: self.address,
         state: self.state,
      }
   }

   fn begin(&mut self, generation: u64, address: Address) {
      self.generation = generation;
      self.address = Some(address);
      self.state = LifecycleState::Connecting;
      self.reading = false;
   }

   pub(crate) fn open(&mut self, generation: u64, address: Address) {
      self.generation = generation;
      self.address = Some(address);
      self.state = LifecycleState::Open;
      self.reading = true;
   }

   /// Whether a read task of `generation` may still deliver bytes.
   pub(crate) const fn accepts(&self, generation: u64) -> bool {
      self.generation == generation && self.reading
   }

   pub(crate) fn stop_reading(&mut self, generation: u64) {
      if self.generation == generation {
         self.reading = false;
      }
   }

   /// Read task termination. Returns whether this call performed the
   /// transition (and so owns reporting it).
   pub(crate) fn finish(&mut self, generation: u64, state: LifecycleState) -> bool {
      if !self.accepts(generation) {
         return false;
      }
      self.reading = false;
      self.state = state;
      true
   }

   fn transition(&mut self, generation: u64, from: LifecycleState, to: LifecycleState) -> bool {
      if self.generation != generation || self.state != from {
         return false;
      }
      self.state = to;
      true
   }
}

pub type SharedLink = Arc<Mutex<Link>>;

/// A read task's report that its stream ended without being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnd {
   pub address: Address,
   pub generation: u64,
   /// Read error, or `None` for end of stream.
   pub error: Option<SmolStr>,
}

impl StreamEnd {
   fn event(&self) -> ConnectorEvent {
      match &self.error {
         None => ConnectorEvent::StreamClosed(self.address),
         Some(cause) => ConnectorEvent::StreamReadError(self.address, cause.clone()),
      }
   }
}

/// The connection currently owned by the manager.
struct Connection {
   address: Address,
   generation: u64,
   outbound: Outbound,
   reader: ReadTask,
   _guard: Option<ChannelGuard>,
}

/// Opens, replaces and closes the single serial connection.
pub struct ConnectionManager<P> {
   platform: Arc<P>,
   events: EventSender,
   bytes: ByteSender,
   link: SharedLink,
   ended_tx: mpsc::UnboundedSender<StreamEnd>,
   ended_rx: mpsc::UnboundedReceiver<StreamEnd>,
   current: Option<Connection>,
   generation: u64,
   chunk_size: usize,
   connect_timeout: Duration,
   shutdown_timeout: Duration,
}

impl<P: Platform> ConnectionManager<P> {
   pub fn new(platform: Arc<P>, events: EventSender, bytes: ByteSender, config: &Config) -> Self {
      let (ended_tx, ended_rx) = mpsc::unbounded_channel();
      Self {
         platform,
         events,
         bytes,
         link: Arc::new(Mutex::new(Link::default())),
         ended_tx,
         ended_rx,
         current: None,
         generation: 0,
         chunk_size: config.chunk_size(),
         connect_timeout: config.connect_timeout(),
         shutdown_timeout: config.shutdown_timeout(),
      }
   }

   pub fn link(&self) -> SharedLink {
      self.link.clone()
   }

   pub fn status(&self) -> ConnectionStatus {
      self.link.lock().status()
   }

   pub fn is_connecting(&self) -> bool {
      self.link.lock().state() == LifecycleState::Connecting
   }

   /// Connects to the bonded device at `address`, replacing any open
   /// connection.
   ///
   /// Discovery must already be stopped and the adapter checked; the
   /// connector does both before calling this.
   pub async fn connect(&mut self, address: Address) -> Result<()> {
      let bonded = match self.platform.bonded_devices().await {
         Ok(bonded) => bonded,
         Err(e) => {
            warn!("Failed to read bonded devices: {e}");
            let cause = SmolStr::new(e.to_string());
            self
               .events
               .emit(&ConnectorEvent::ConnectionFailed(address, cause.clone()));
            return Err(ConnectorError::ConnectionFailed(cause.into()));
         },
      };
      let Some(device) = bonded.into_iter().find(|d| d.address == address) else {
         warn!("{address} is not bonded");
         self.events.emit(&ConnectorEvent::DeviceNotBonded(address));
         return Err(ConnectorError::DeviceNotBonded(address));
      };

      // Latest call wins: the old connection goes before the new one opens.
      self.disconnect().await;

      self.generation += 1;
      let generation = self.generation;
      self.link.lock().begin(generation, address);
      info!("Opening serial channel to {} [{}]", address, device.name);

      let opened = time::timeout(
         self.connect_timeout,
         self.platform.open_secure_channel(address, SPP_UUID),
      )
      .await;
      let channel = match opened {
         Ok(Ok(channel)) => channel,
         Ok(Err(e)) => return Err(self.fail(generation, address, e.to_string())),
         Err(_) => {
            let cause = format!("timed out after {:?}", self.connect_timeout);
            return Err(self.fail(generation, address, cause));
         },
      };

      let (inbound, outbound, guard) = channel.into_parts();
      self.link.lock().open(generation, address);
      info!("Connected to {address}");
      self.events.emit(&ConnectorEvent::Connected(address));

      let reader = ReadTask::spawn(
         ReadContext {
            address,
            generation,
            link: self.link.clone(),
            ended: self.ended_tx.clone(),
            bytes: self.bytes.clone(),
            chunk_size: self.chunk_size,
         },
         inbound,
      );
      self.current = Some(Connection {
         address,
         generation,
         outbound,
         reader,
         _guard: guard,
      });
      Ok(())
   }

   /// Stops the read task, closes both directions and marks the connection
   /// Closed. Returns whether there was anything to close.
   ///
   /// A connection whose stream already ended is reported with its stream
   /// event instead of a disconnect.
   pub async fn disconnect(&mut self) -> bool {
      let Some(conn) = self.current.take() else {
         return false;
      };
      let address = conn.address;
      let generation = conn.generation;
      release(&self.link, self.shutdown_timeout, conn).await;

      let closed = self
         .link
         .lock()
         .transition(generation, LifecycleState::Open, LifecycleState::Closed);
      if closed {
         info!("Disconnected from {address}");
         self.events.emit(&ConnectorEvent::Disconnected(address));
      }
      while let Ok(end) = self.ended_rx.try_recv() {
         self.events.emit(&end.event());
      }
      true
   }

   /// Waits for a read task to report that its stream ended on its own.
   ///
   /// Cancel safe. Never yields `None` while the manager is alive.
   pub async fn stream_ended(&mut self) -> Option<StreamEnd> {
      self.ended_rx.recv().await
   }

   /// Releases the connection a [`StreamEnd`] belongs to, then reports the
   /// end.
   pub async fn on_stream_end(&mut self, end: StreamEnd) {
      let owned = self
         .current
         .as_ref()
         .is_some_and(|conn| conn.generation == end.generation);
      if owned && let Some(conn) = self.current.take() {
         debug!("Releasing ended connection to {}", conn.address);
         release(&self.link, self.shutdown_timeout, conn).await;
      }
      self.events.emit(&end.event());
   }

   fn fail(&self, generation: u64, address: Address, cause: String) -> ConnectorError {
      warn!("Connection to {address} failed: {cause}");
      self.link.lock().transition(
         generation,
         LifecycleState::Connecting,
         LifecycleState::Failed,
      );
      self.events.emit(&ConnectorEvent::ConnectionFailed(
         address,
         SmolStr::new(&cause),
      ));
      ConnectorError::ConnectionFailed(cause)
   }
}

/// Stops the read task, then closes the outbound half. Both waits are
/// bounded by `wait`.
async fn release(link: &SharedLink, wait: Duration, mut conn: Connection) {
   conn.reader.stop(link, conn.generation, wait).await;
   match time::timeout(wait, conn.outbound.shutdown()).await {
      Ok(Ok(())) => {},
      Ok(Err(e)) => debug!("{}: outbound shutdown: {e}", conn.address),
      Err(_) => warn!("{}: outbound shutdown timed out", conn.address),
   }
}
