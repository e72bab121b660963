//! Events delivered to plugins.

use bytes::Bytes;
use smol_str::SmolStr;
use vchan_proto::svc::ChunkFlags;

use crate::ffi;
use crate::handle::UserTag;

/// Runtime event of an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A dynamic channel was created by the peer. Always the first event of that channel.
    Created { name: SmolStr },

    /// A chunk of received data.
    ///
    /// Static channels deliver chunks as the transport received them: `total_length` is
    /// the size of the whole message and `flags` tell which chunk this is. Dynamic channels
    /// deliver whole messages.
    DataReceived {
        data: Bytes,
        total_length: u32,
        flags: ChunkFlags,
    },

    /// A write previously accepted by `ChannelManager::write` reached the transport.
    WriteComplete { tag: UserTag },

    /// The channel was torn down by the peer or by a transport failure.
    ///
    /// Always the last event of that channel, never emitted after a local close.
    Closed,
}

impl ChannelEvent {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelEvent::Closed)
    }

    pub(crate) fn ffi_code(&self) -> u32 {
        match self {
            ChannelEvent::Created { .. } => ffi::CHANNEL_EVENT_CREATED,
            ChannelEvent::DataReceived { .. } => ffi::CHANNEL_EVENT_DATA_RECEIVED,
            ChannelEvent::WriteComplete { .. } => ffi::CHANNEL_EVENT_WRITE_COMPLETE,
            ChannelEvent::Closed => ffi::CHANNEL_EVENT_CLOSED,
        }
    }
}

/// Lifecycle notification delivered to every registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitEvent {
    /// Delivered by `pre_connect`.
    Initialized,
    /// Delivered by `post_connect`, once remote channel ids are bound.
    Connected,
    /// Delivered by `disconnect`.
    Disconnected,
    /// Delivered by `close`.
    Terminated,
}

impl InitEvent {
    pub(crate) fn ffi_code(self) -> u32 {
        match self {
            InitEvent::Initialized => ffi::CHANNEL_EVENT_INITIALIZED,
            InitEvent::Connected => ffi::CHANNEL_EVENT_CONNECTED,
            InitEvent::Disconnected => ffi::CHANNEL_EVENT_DISCONNECTED,
            InitEvent::Terminated => ffi::CHANNEL_EVENT_TERMINATED,
        }
    }
}
