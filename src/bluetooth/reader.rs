//! Background read loop for an open connection.
//!
//! One task per connection pulls fixed-size chunks from the inbound half and
//! hands them to the byte sink. The task is bound to its connection's
//! generation: once the connection is stopped or superseded the task
//! delivers nothing more, and cancellation interrupts a pending read.
//!
//! The sink is never called with the link lock held. A stop that races an
//! accepted chunk waits for that delivery by joining the task.
//!
//! End of stream and read errors are not reported from here: the task hands
//! a [`StreamEnd`] to the connection manager, which releases the connection
//! first and reports afterwards.

use std::time::Duration;

use bluer::Address;
use log::{debug, info, warn};
use smol_str::ToSmolStr;
use tokio::{
   io::AsyncReadExt,
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      connection::{LifecycleState, SharedLink, StreamEnd},
      platform::Inbound,
   },
   event::ByteSender,
};

/// Everything the read loop needs besides the inbound half.
pub(crate) struct ReadContext {
   pub address: Address,
   pub generation: u64,
   pub link: SharedLink,
   pub ended: mpsc::UnboundedSender<StreamEnd>,
   pub bytes: ByteSender,
   pub chunk_size: usize,
}

/// Handle to a running read loop.
#[derive(Debug)]
pub(crate) struct ReadTask {
   cancel: Option<oneshot::Sender<()>>,
   handle: JoinHandle<()>,
}

impl ReadTask {
   pub fn spawn(ctx: ReadContext, inbound: Inbound) -> Self {
      let (cancel, cancelled) = oneshot::channel();
      let handle = tokio::spawn(read_loop(ctx, inbound, cancelled));
      Self {
         cancel: Some(cancel),
         handle,
      }
   }

   #[cfg(test)]
   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }

   /// Fences further deliveries, cancels the pending read and waits up to
   /// `wait` for the task to exit, aborting it past that.
   pub async fn stop(&mut self, link: &SharedLink, generation: u64, wait: Duration) {
      let Some(cancel) = self.cancel.take() else {
         return;
      };
      link.lock().stop_reading(generation);
      let _ = cancel.send(());

      if time::timeout(wait, &mut self.handle).await.is_err() {
         warn!("Read task did not stop within {wait:?}, aborting");
         self.handle.abort();
      }
   }
}

impl Drop for ReadTask {
   fn drop(&mut self) {
      self.handle.abort();
   }
}

async fn read_loop(ctx: ReadContext, mut inbound: Inbound, mut cancelled: oneshot::Receiver<()>) {
   let ReadContext {
      address,
      generation,
      link,
      ended,
      bytes,
      chunk_size,
   } = ctx;
   let mut buf = vec![0u8; chunk_size];
   debug!("{address}: read loop started");

   loop {
      let read = select! {
         biased;
         _ = &mut cancelled => {
            debug!("{address}: read loop cancelled");
            return;
         },
         read = inbound.read(&mut buf) => read,
      };

      match read {
         Ok(0) => {
            if link.lock().finish(generation, LifecycleState::Closed) {
               info!("{address}: stream closed");
               let _ = ended.send(StreamEnd {
                  address,
                  generation,
                  error: None,
               });
            }
            return;
         },
         Ok(n) => {
            let chunk = &buf[..n];
            debug!("← {address}: {}", hex::encode(chunk));
            let accepted = link.lock().accepts(generation);
            if !accepted {
               debug!("{address}: dropping chunk from superseded connection");
               return;
            }
            bytes.on_chunk(address, chunk);
         },
         Err(e) => {
            if link.lock().finish(generation, LifecycleState::Failed) {
               warn!("{address}: stream read error: {e}");
               let _ = ended.send(StreamEnd {
                  address,
                  generation,
                  error: Some(e.to_smolstr()),
               });
            }
            return;
         },
      }
   }
}
