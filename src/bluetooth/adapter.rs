//! Local radio availability and enable requests.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::{info, warn};
use smol_str::SmolStr;

use crate::{
   bluetooth::platform::{AdapterState, Platform},
   error::{ConnectorError, Result},
   event::{ConnectorEvent, EventSender},
};

/// Last observed adapter state, shareable with readers outside the actor.
pub type SharedAdapterState = Arc<AtomicCell<Option<AdapterState>>>;

/// Observes the local radio and gates every operation that needs it.
///
/// State is re-read from the platform on every call; the cached value only
/// serves transition logging and lock-free status queries.
pub struct AdapterStateMonitor<P> {
   platform: Arc<P>,
   events: EventSender,
   last: SharedAdapterState,
}

impl<P: Platform> AdapterStateMonitor<P> {
   pub fn new(platform: Arc<P>, events: EventSender) -> Self {
      Self {
         platform,
         events,
         last: Arc::new(AtomicCell::new(None)),
      }
   }

   pub fn shared_state(&self) -> SharedAdapterState {
      self.last.clone()
   }

   pub fn last_known(&self) -> Option<AdapterState> {
      self.last.load()
   }

   /// Returns the current state, reporting a missing radio as an error event.
   pub async fn check_availability(&self) -> AdapterState {
      let state = self.observe().await.1;
      if state == AdapterState::Unsupported {
         warn!("Bluetooth not supported");
         self.events.emit(&ConnectorEvent::AdapterUnsupported);
      }
      state
   }

   /// Reports a disabled radio and asks the OS to enable it.
   ///
   /// Does not wait for the radio; the new state shows up in later
   /// observations.
   pub async fn request_enable(&self) -> AdapterState {
      let state = self.observe().await.1;
      if state == AdapterState::Disabled {
         self.report_disabled(true);
      }
      state
   }

   /// Gate for discovery and connect.
   pub async fn ensure_enabled(&self) -> Result<()> {
      match self.check_availability().await {
         AdapterState::Enabled => Ok(()),
         AdapterState::Unsupported => Err(ConnectorError::AdapterUnsupported),
         AdapterState::Disabled => {
            self.report_disabled(true);
            Err(ConnectorError::AdapterDisabled)
         },
         AdapterState::Enabling | AdapterState::Disabling => {
            self.report_disabled(false);
            Err(ConnectorError::AdapterDisabled)
         },
      }
   }

   /// Emits the radio's scan mode and power state.
   pub async fn report_local_information(&self) -> Result<()> {
      let state = self.check_availability().await;
      if state == AdapterState::Unsupported {
         return Err(ConnectorError::AdapterUnsupported);
      }
      let mode = self.platform.scan_mode().await?;
      self
         .events
         .emit(&ConnectorEvent::LocalInformation(SmolStr::new(mode.to_string())));
      self
         .events
         .emit(&ConnectorEvent::LocalInformation(SmolStr::new_static(state.label())));
      Ok(())
   }

   /// Polls the radio and reports a transition since the previous
   /// observation. Returns the new state when it changed.
   pub async fn refresh(&self) -> Option<AdapterState> {
      let (prev, state) = self.observe().await;
      let prev = prev?;
      if prev == state {
         return None;
      }
      if state == AdapterState::Unsupported {
         self.events.emit(&ConnectorEvent::AdapterUnsupported);
      } else {
         self
            .events
            .emit(&ConnectorEvent::LocalInformation(SmolStr::new_static(state.label())));
      }
      Some(state)
   }

   fn report_disabled(&self, request: bool) {
      warn!("Bluetooth not enabled");
      self.events.emit(&ConnectorEvent::AdapterDisabled);
      if request {
         info!("Requesting adapter enable");
         self.platform.request_enable();
      }
   }

   async fn observe(&self) -> (Option<AdapterState>, AdapterState) {
      let state = self.platform.adapter_state().await;
      let prev = self.last.swap(Some(state));
      if let Some(prev) = prev
         && prev != state
      {
         info!("Adapter state changed: {prev} -> {state}");
      }
      (prev, state)
   }
}
