use core::fmt;
use std::any::Any;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::ChannelError;
use crate::event::{ChannelEvent, InitEvent};
use crate::ffi::VirtualChannelEntryFn;
use crate::handle::{ChannelOptions, InitHandle, OpenHandle};
use crate::ChannelManager;

/// Opaque data attached to a plugin at registration.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Interface object a plugin exposes to the host.
pub type Interface = Arc<dyn Any + Send + Sync>;

/// Channel handling add-in implemented in Rust.
pub trait VirtualChannelEntry: Send + Sync {
    fn name(&self) -> &str;

    /// Called exactly once, during `ChannelManager::register`.
    ///
    /// Returning an error aborts the registration.
    fn entry(&self, ctx: &mut InitContext<'_>) -> Result<(), ChannelError>;

    fn on_init_event(&self, manager: &ChannelManager, init_handle: InitHandle, event: InitEvent) {
        let _ = (manager, init_handle, event);
    }
}

/// Plugin entry point, either native or loaded through the C ABI.
#[derive(Clone)]
pub enum EntryPoint {
    Native(Arc<dyn VirtualChannelEntry>),
    Ffi(VirtualChannelEntryFn),
}

impl EntryPoint {
    pub fn native(entry: impl VirtualChannelEntry + 'static) -> Self {
        Self::Native(Arc::new(entry))
    }

    /// Two entry points are the same plugin if they share this value.
    pub(crate) fn identity(&self) -> usize {
        match self {
            EntryPoint::Native(entry) => Arc::as_ptr(entry).cast::<()>() as usize,
            EntryPoint::Ffi(entry) => *entry as *const () as usize,
        }
    }

    pub(crate) fn name(&self) -> SmolStr {
        match self {
            EntryPoint::Native(entry) => SmolStr::new(entry.name()),
            EntryPoint::Ffi(_) => SmolStr::new_inline("ffi"),
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Native(entry) => f.debug_tuple("Native").field(&entry.name()).finish(),
            EntryPoint::Ffi(entry) => f.debug_tuple("Ffi").field(&(*entry as *const ())).finish(),
        }
    }
}

/// Receives the runtime events of a channel.
///
/// Called outside of the manager guard: calling back into the manager is allowed.
pub trait ChannelEventHandler: Send + Sync {
    fn on_event(&self, manager: &ChannelManager, handle: OpenHandle, event: ChannelEvent);
}

impl<F> ChannelEventHandler for F
where
    F: Fn(&ChannelManager, OpenHandle, ChannelEvent) + Send + Sync,
{
    fn on_event(&self, manager: &ChannelManager, handle: OpenHandle, event: ChannelEvent) {
        self(manager, handle, event)
    }
}

/// How the events of a channel reach its owner.
#[derive(Clone)]
pub enum Delivery {
    /// Events go through the shared queue and are handed to the handler by the dispatcher.
    Callback(Arc<dyn ChannelEventHandler>),
    /// Events are kept in a per-channel inbox whose wait handle is set while non-empty.
    ///
    /// Drain with `ChannelManager::take_events`.
    Signaled,
}

impl Delivery {
    pub fn callback(handler: impl ChannelEventHandler + 'static) -> Self {
        Self::Callback(Arc::new(handler))
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self, Delivery::Signaled)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Callback(_) => f.write_str("Callback"),
            Delivery::Signaled => f.write_str("Signaled"),
        }
    }
}

/// Static channel a plugin asks the transport to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticChannelDef {
    pub name: SmolStr,
    pub options: ChannelOptions,
}

/// Snapshot of a registered plugin.
#[derive(Clone)]
pub struct PluginInfo {
    pub init_handle: InitHandle,
    pub name: SmolStr,
    pub user_data: Option<UserData>,
    pub declared_channels: Vec<StaticChannelDef>,
}

impl fmt::Debug for PluginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInfo")
            .field("init_handle", &self.init_handle)
            .field("name", &self.name)
            .field("declared_channels", &self.declared_channels)
            .finish_non_exhaustive()
    }
}

/// What a plugin can do while its entry point runs
pub struct InitContext<'a> {
    manager: &'a ChannelManager,
    init_handle: InitHandle,
    user_data: Option<UserData>,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(manager: &'a ChannelManager, init_handle: InitHandle, user_data: Option<UserData>) -> Self {
        Self {
            manager,
            init_handle,
            user_data,
        }
    }

    pub fn init_handle(&self) -> InitHandle {
        self.init_handle
    }

    pub fn manager(&self) -> &ChannelManager {
        self.manager
    }

    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Declares a static channel for the transport to join.
    pub fn declare_channel(&mut self, name: &str, options: ChannelOptions) -> Result<(), ChannelError> {
        self.manager.declare_channel(self.init_handle, name, options)
    }

    /// Attaches the interface object copied into every channel this plugin opens.
    pub fn set_interface(&mut self, interface: Interface) -> Result<(), ChannelError> {
        self.manager.set_interface(self.init_handle, interface)
    }

    pub fn register_listener(&mut self, name: &str, delivery: Delivery) -> Result<(), ChannelError> {
        self.manager.register_listener(self.init_handle, name, delivery)
    }

    pub fn open(
        &mut self,
        name: &str,
        options: ChannelOptions,
        delivery: Delivery,
    ) -> Result<OpenHandle, ChannelError> {
        self.manager.open(self.init_handle, name, options, delivery)
    }
}
