//! In-memory platform and recording sinks for tests.

use std::{
   collections::{HashMap, HashSet},
   io,
   pin::Pin,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   task::{Context, Poll},
   time::Duration,
};

use bluer::Address;
use futures::{StreamExt, channel::mpsc};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use uuid::Uuid;

use crate::{
   bluetooth::platform::{
      AdapterState, BondedDevice, Channel, DiscoveredDevice, DiscoveryStream, Inbound, Platform,
      ScanMode,
   },
   error::{ConnectorError, Result},
   event::{ByteSink, ConnectorEvent, EventSink},
};

pub fn addr(n: u8) -> Address {
   Address([0x11, 0x22, 0x33, 0x44, 0x55, n])
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn eventually(cond: impl Fn() -> bool) {
   for _ in 0..400 {
      if cond() {
         return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
   }
   panic!("condition not reached in time");
}

pub struct MockPlatform {
   state: Mutex<AdapterState>,
   scan_mode: Mutex<ScanMode>,
   bonded: Mutex<Vec<BondedDevice>>,
   refused: Mutex<HashSet<Address>>,
   hanging: Mutex<HashSet<Address>>,
   broken_reads: Mutex<HashSet<Address>>,
   discovery_fails: AtomicBool,
   scan: Mutex<Option<mpsc::UnboundedSender<DiscoveredDevice>>>,
   remotes: Mutex<HashMap<Address, DuplexStream>>,
   opened: Mutex<Vec<(Address, Uuid)>>,
   enable_requests: AtomicUsize,
   scans_started: AtomicUsize,
}

impl MockPlatform {
   pub fn new(state: AdapterState) -> Self {
      Self {
         state: Mutex::new(state),
         scan_mode: Mutex::new(ScanMode::Connectable),
         bonded: Mutex::default(),
         refused: Mutex::default(),
         hanging: Mutex::default(),
         broken_reads: Mutex::default(),
         discovery_fails: AtomicBool::new(false),
         scan: Mutex::new(None),
         remotes: Mutex::default(),
         opened: Mutex::default(),
         enable_requests: AtomicUsize::new(0),
         scans_started: AtomicUsize::new(0),
      }
   }

   pub fn set_state(&self, state: AdapterState) {
      *self.state.lock() = state;
   }

   pub fn set_scan_mode(&self, mode: ScanMode) {
      *self.scan_mode.lock() = mode;
   }

   pub fn bond(&self, address: Address, name: &str) {
      self.bonded.lock().push(BondedDevice {
         address,
         name: SmolStr::new(name),
      });
   }

   /// The transport rejects connections to `address`.
   pub fn refuse(&self, address: Address) {
      self.refused.lock().insert(address);
   }

   /// The transport never answers for `address`.
   pub fn hang(&self, address: Address) {
      self.hanging.lock().insert(address);
   }

   /// Channels to `address` fail on their first read.
   pub fn break_reads(&self, address: Address) {
      self.broken_reads.lock().insert(address);
   }

   /// The next scans fail to start.
   pub fn fail_discovery(&self) {
      self.discovery_fails.store(true, Ordering::SeqCst);
   }

   /// Delivers a found-device notification to the running scan. Returns
   /// false when no scan is listening.
   pub fn announce(&self, device: DiscoveredDevice) -> bool {
      self
         .scan
         .lock()
         .as_ref()
         .is_some_and(|tx| tx.unbounded_send(device).is_ok())
   }

   /// Peer end of the last channel opened to `address`.
   pub fn take_remote(&self, address: Address) -> Option<DuplexStream> {
      self.remotes.lock().remove(&address)
   }

   pub fn opened(&self) -> Vec<(Address, Uuid)> {
      self.opened.lock().clone()
   }

   pub fn enable_requests(&self) -> usize {
      self.enable_requests.load(Ordering::SeqCst)
   }

   pub fn scans_started(&self) -> usize {
      self.scans_started.load(Ordering::SeqCst)
   }
}

impl Platform for MockPlatform {
   async fn adapter_state(&self) -> AdapterState {
      *self.state.lock()
   }

   async fn scan_mode(&self) -> Result<ScanMode> {
      Ok(*self.scan_mode.lock())
   }

   fn request_enable(&self) {
      self.enable_requests.fetch_add(1, Ordering::SeqCst);
   }

   async fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
      Ok(self.bonded.lock().clone())
   }

   async fn discover(&self) -> Result<DiscoveryStream> {
      if self.discovery_fails.load(Ordering::SeqCst) {
         return Err(ConnectorError::Io(io::Error::other(
            "discovery already in progress",
         )));
      }
      let (tx, rx) = mpsc::unbounded();
      *self.scan.lock() = Some(tx);
      self.scans_started.fetch_add(1, Ordering::SeqCst);
      Ok(rx.boxed())
   }

   async fn open_secure_channel(&self, address: Address, profile: Uuid) -> Result<Channel> {
      self.opened.lock().push((address, profile));
      if self.hanging.lock().contains(&address) {
         futures::future::pending::<()>().await;
      }
      if self.refused.lock().contains(&address) {
         return Err(ConnectorError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
         )));
      }

      let (local, remote) = tokio::io::duplex(64);
      self.remotes.lock().insert(address, remote);
      let (inbound, outbound) = tokio::io::split(local);
      let inbound: Inbound = if self.broken_reads.lock().contains(&address) {
         Box::new(BrokenRead)
      } else {
         Box::new(inbound)
      };
      Ok(Channel::new(inbound, Box::new(outbound)))
   }
}

/// Inbound half whose reads always fail.
pub struct BrokenRead;

impl AsyncRead for BrokenRead {
   fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "link lost")))
   }
}

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
   events: Mutex<Vec<ConnectorEvent>>,
}

impl RecordingSink {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn events(&self) -> Vec<ConnectorEvent> {
      self.events.lock().clone()
   }

   pub fn messages(&self) -> Vec<String> {
      self.events().iter().map(|e| e.message().to_string()).collect()
   }

   pub fn tags(&self) -> Vec<&'static str> {
      self.events().iter().map(ConnectorEvent::tag).collect()
   }
}

impl EventSink for RecordingSink {
   fn emit_success(&self, _tag: &str, _message: &str) {}

   fn emit_error(&self, _tag: &str, _message: &str) {}

   fn emit(&self, event: &ConnectorEvent) {
      self.events.lock().push(event.clone());
   }
}

/// Byte sink that keeps every chunk.
#[derive(Default)]
pub struct ChunkRecorder {
   chunks: Mutex<Vec<(Address, Vec<u8>)>>,
}

impl ChunkRecorder {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn concat(&self) -> Vec<u8> {
      self
         .chunks
         .lock()
         .iter()
         .flat_map(|(_, chunk)| chunk.iter().copied())
         .collect()
   }

   pub fn sizes(&self) -> Vec<usize> {
      self.chunks.lock().iter().map(|(_, c)| c.len()).collect()
   }

   pub fn addresses(&self) -> Vec<Address> {
      self.chunks.lock().iter().map(|(a, _)| *a).collect()
   }
}

impl ByteSink for ChunkRecorder {
   fn on_chunk(&self, address: Address, chunk: &[u8]) {
      self.chunks.lock().push((address, chunk.to_vec()));
   }
}
