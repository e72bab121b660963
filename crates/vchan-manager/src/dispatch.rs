//! Dispatch loop handing queued events to the channel handlers.
//!
//! Events of one channel are delivered in order on a dedicated lane. Handlers run on
//! the blocking thread pool, outside of the manager guard.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, Span};

use crate::handle::OpenHandle;
use crate::queue::QueuedEvent;
use crate::ChannelManager;

/// Running dispatch loop
///
/// The loop ends on its own once the manager is closed. Dropping this aborts it.
pub struct DispatchTask(ChildTask<()>);

impl DispatchTask {
    /// Waits for the loop to end, that is, for the manager to be closed.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.0.join().await
    }

    pub fn abort(&self) {
        self.0.abort()
    }

    /// Lets the loop run until the manager is closed.
    pub fn detach(self) {
        self.0.detach()
    }
}

/// Spawns the loop on the current runtime.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub(crate) fn spawn(manager: ChannelManager) -> DispatchTask {
    let fut = dispatch_loop(manager).instrument(info_span!("dispatch"));
    DispatchTask(ChildTask(tokio::spawn(fut)))
}

type LaneSender = mpsc::UnboundedSender<QueuedEvent>;

async fn dispatch_loop(manager: ChannelManager) {
    let mut lanes: HashMap<OpenHandle, LaneSender> = HashMap::new();

    debug!("Dispatch loop started");

    // A notification sent while no one is waiting is kept, so no wakeup is lost between draining and waiting.
    while let Some(batch) = manager.next_batch() {
        // Dropping the sender of a released channel lets its lane drain and end.
        lanes.retain(|handle, lane_tx| !lane_tx.is_closed() && manager.is_tracked(*handle));

        if batch.is_empty() {
            manager.wait_for_events().await;
            continue;
        }

        trace!(len = batch.len(), "Dispatching batch");

        for queued in batch {
            route(&manager, &mut lanes, queued);
        }
    }

    debug!(lanes = lanes.len(), "Dispatch loop stopped");
}

fn route(manager: &ChannelManager, lanes: &mut HashMap<OpenHandle, LaneSender>, queued: QueuedEvent) {
    let handle = queued.handle;

    let queued = match lanes.get(&handle) {
        Some(lane_tx) => match lane_tx.send(queued) {
            Ok(()) => return,
            Err(mpsc::error::SendError(queued)) => queued,
        },
        None => queued,
    };

    if !queued.event.is_closed() && !manager.is_tracked(handle) {
        trace!(%handle, "Discarding event of a released channel");
        return;
    }

    let name = manager.channel_name(handle).unwrap_or_default();
    let (lane_tx, lane_rx) = mpsc::unbounded_channel();

    let span = info_span!("channel", %handle, %name);
    ChildTask(tokio::spawn(lane(manager.clone(), lane_rx).instrument(span))).detach();

    if lane_tx.send(queued).is_ok() {
        lanes.insert(handle, lane_tx);
    }
}

async fn lane(manager: ChannelManager, mut lane_rx: mpsc::UnboundedReceiver<QueuedEvent>) {
    while let Some(queued) = lane_rx.recv().await {
        let is_closed = queued.event.is_closed();

        let span = Span::current();
        let manager = manager.clone();

        let result = tokio::task::spawn_blocking(move || span.in_scope(|| manager.deliver(queued))).await;

        if let Err(error) = result {
            error!(%error, "Channel event handler panicked");
        }

        if is_closed {
            break;
        }
    }

    trace!("Lane closed");
}

struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    fn abort(&self) {
        self.0.abort()
    }

    fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}
