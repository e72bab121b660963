use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::ChannelError;
use crate::event::ChannelEvent;
use crate::handle::OpenHandle;
use crate::plugin::ChannelEventHandler;
use crate::wait::WaitHandle;

pub(crate) struct QueuedEvent {
    pub(crate) handle: OpenHandle,
    pub(crate) event: ChannelEvent,
    /// Handler captured at enqueue time, so `Closed` still reaches it once the record is gone.
    pub(crate) handler: Arc<dyn ChannelEventHandler>,
}

/// FIFO shared by every callback channel
///
/// Its wait handle is set while the queue is non-empty.
pub(crate) struct EventQueue {
    entries: VecDeque<QueuedEvent>,
    capacity: Option<usize>,
    signal: WaitHandle,
}

impl EventQueue {
    pub(crate) fn new(capacity: Option<usize>) -> std::io::Result<Self> {
        Ok(Self {
            entries: VecDeque::new(),
            capacity,
            signal: WaitHandle::new()?,
        })
    }

    /// `Closed` events are accepted even when the queue is full.
    pub(crate) fn push(&mut self, event: QueuedEvent) -> Result<(), ChannelError> {
        if let Some(capacity) = self.capacity {
            if !event.event.is_closed() && self.entries.len() >= capacity {
                return Err(ChannelError::QueueFull { capacity });
            }
        }

        self.entries.push_back(event);
        self.signal.set();

        Ok(())
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedEvent> {
        self.signal.reset();
        self.entries.drain(..).collect()
    }

    /// Discards every pending event of `handle`.
    pub(crate) fn purge(&mut self, handle: OpenHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);

        if self.entries.is_empty() {
            self.signal.reset();
        }

        before - self.entries.len()
    }

    pub(crate) fn signal(&self) -> &WaitHandle {
        &self.signal
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
