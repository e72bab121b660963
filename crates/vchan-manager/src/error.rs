use core::fmt;
use std::io;

use smol_str::SmolStr;
use vchan_proto::DynamicChannelId;

use crate::ffi;
use crate::handle::{InitHandle, OpenHandle, RemoteChannelId, WriteToken};
use crate::state::ConnectionState;
use crate::transport::TransportError;

/// What a failed lookup was looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Plugin(InitHandle),
    Name(SmolStr),
    Handle(OpenHandle),
    Remote(RemoteChannelId),
    Dynamic(DynamicChannelId),
    Listener(SmolStr),
    Write(WriteToken),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Plugin(handle) => write!(f, "plugin {handle}"),
            Lookup::Name(name) => write!(f, "channel named `{name}`"),
            Lookup::Handle(handle) => write!(f, "channel {handle}"),
            Lookup::Remote(id) => write!(f, "channel bound to {id}"),
            Lookup::Dynamic(id) => write!(f, "channel bound to {id}"),
            Lookup::Listener(name) => write!(f, "listener for `{name}`"),
            Lookup::Write(token) => write!(f, "pending {token}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("`{operation}` is illegal in the {state} state")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("{table} is full ({max} entries)")]
    CapacityExceeded { table: &'static str, max: usize },
    #[error("a channel named `{0}` is already open")]
    DuplicateName(SmolStr),
    #[error("entry point is already registered as {0}")]
    AlreadyRegistered(InitHandle),
    #[error("channel {0} is not open")]
    NotOpen(OpenHandle),
    #[error("no {0}")]
    NotFound(Lookup),
    #[error("event queue is full ({capacity} events)")]
    QueueFull { capacity: usize },
    #[error("invalid channel name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("transport refused the request")]
    Transport(#[from] TransportError),
    #[error("malformed dynamic channel PDU")]
    Protocol(#[from] vchan_proto::Error),
    #[error("entry point of plugin `{plugin}` reported a failure")]
    EntryFailed { plugin: SmolStr },
    #[error("channel {0} does not use signaled delivery")]
    NotSignaled(OpenHandle),
    #[error("failed to create a wait handle")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Stable return code exposed through the C ABI.
    pub fn code(&self) -> u32 {
        match self {
            ChannelError::InvalidState { state, .. } => match state {
                ConnectionState::Uninitialized => ffi::CHANNEL_RC_NOT_INITIALIZED,
                ConnectionState::Connected => ffi::CHANNEL_RC_ALREADY_CONNECTED,
                ConnectionState::PreConnect | ConnectionState::Disconnecting | ConnectionState::Closed => {
                    ffi::CHANNEL_RC_NOT_CONNECTED
                }
            },
            ChannelError::CapacityExceeded { .. } => ffi::CHANNEL_RC_TOO_MANY_CHANNELS,
            ChannelError::DuplicateName(_) => ffi::CHANNEL_RC_ALREADY_OPEN,
            ChannelError::AlreadyRegistered(_) => ffi::CHANNEL_RC_ALREADY_INITIALIZED,
            ChannelError::NotOpen(_) => ffi::CHANNEL_RC_NOT_OPEN,
            ChannelError::NotFound(lookup) => match lookup {
                Lookup::Plugin(_) => ffi::CHANNEL_RC_BAD_INIT_HANDLE,
                Lookup::Name(_) | Lookup::Listener(_) => ffi::CHANNEL_RC_UNKNOWN_CHANNEL_NAME,
                Lookup::Handle(_) | Lookup::Remote(_) | Lookup::Dynamic(_) | Lookup::Write(_) => {
                    ffi::CHANNEL_RC_BAD_CHANNEL_HANDLE
                }
            },
            ChannelError::QueueFull { .. } => ffi::CHANNEL_RC_NO_BUFFER,
            ChannelError::InvalidName { .. } => ffi::CHANNEL_RC_BAD_CHANNEL,
            ChannelError::Transport(_) => ffi::CHANNEL_RC_NOT_CONNECTED,
            ChannelError::Protocol(_) => ffi::CHANNEL_RC_BAD_PROC,
            ChannelError::EntryFailed { .. } => ffi::CHANNEL_RC_INITIALIZATION_ERROR,
            ChannelError::NotSignaled(_) => ffi::CHANNEL_RC_BAD_CHANNEL_HANDLE,
            ChannelError::Io(_) => ffi::CHANNEL_RC_NO_MEMORY,
        }
    }
}
