//! Virtual channel multiplexer.
//!
//! A [`ChannelManager`] lets one connection carry many named channels, each driven by a
//! plugin. It owns the plugin registry, the open channel table and the event queue, all
//! behind a single guard. Events are handed to plugins outside of the guard, so handlers
//! may call back into the manager.
//!
//! Lifecycle, driven by the transport layer:
//! `new` → `pre_connect` → `post_connect` → `disconnect` → `close` → `destroy`.

#[macro_use]
extern crate tracing;

mod config;
mod dispatch;
mod dvc;
mod error;
mod event;
pub mod ffi;
mod handle;
mod plugin;
mod queue;
mod registry;
mod state;
mod table;
mod transport;
mod wait;

pub use self::config::ManagerConfig;
pub use self::dispatch::DispatchTask;
pub use self::error::{ChannelError, Lookup};
pub use self::event::{ChannelEvent, InitEvent};
pub use self::handle::{ChannelOptions, InitHandle, OpenHandle, RemoteChannelId, UserTag, WriteToken};
pub use self::plugin::{
    ChannelEventHandler, Delivery, EntryPoint, InitContext, Interface, PluginInfo, StaticChannelDef, UserData,
    VirtualChannelEntry,
};
pub use self::state::ConnectionState;
pub use self::transport::{ChannelTransport, QueuedTransport, SendRequest, TransportError};
pub use self::wait::WaitHandle;
pub use vchan_proto::svc::ChunkFlags;
pub use vchan_proto::DynamicChannelId;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::Notify;
use vchan_proto::svc::CHANNEL_CHUNK_LENGTH;
use vchan_proto::ClientPdu;

use self::dvc::DynamicChannelBridge;
use self::ffi::FfiHooks;
use self::handle::TokenAllocator;
use self::queue::{EventQueue, QueuedEvent};
use self::registry::{InitSessions, Listener, Listeners, PluginRegistry};
use self::state::{ensure, Operation};
use self::table::{Binding, ChannelTable, NewChannel, Status};

/// Static channel the transport joined, as reported to `post_connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChannel {
    pub name: SmolStr,
    pub id: RemoteChannelId,
}

impl JoinedChannel {
    pub fn new(name: impl Into<SmolStr>, id: RemoteChannelId) -> Self {
        Self { name: name.into(), id }
    }
}

/// Snapshot of an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub handle: OpenHandle,
    pub name: SmolStr,
    pub options: ChannelOptions,
    pub owner: InitHandle,
    pub remote_id: Option<RemoteChannelId>,
    pub dynamic_id: Option<DynamicChannelId>,
}

/// Key accepted by [`ChannelManager::find`]
#[derive(Debug, Clone, Copy)]
pub enum ChannelKey<'a> {
    Name(&'a str),
    Handle(OpenHandle),
}

impl<'a> From<&'a str> for ChannelKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl From<OpenHandle> for ChannelKey<'_> {
    fn from(handle: OpenHandle) -> Self {
        Self::Handle(handle)
    }
}

/// Handle to a channel manager instance
///
/// Cloning is cheap and every clone refers to the same manager.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    config: ManagerConfig,
    transport: Arc<dyn ChannelTransport>,
    inner: Mutex<Inner>,
    /// Wakes the dispatch loop on enqueue and on close.
    wakeup: Notify,
}

struct Inner {
    state: ConnectionState,
    plugins: PluginRegistry,
    sessions: InitSessions,
    listeners: Listeners,
    channels: ChannelTable,
    queue: EventQueue,
    joined: HashMap<SmolStr, RemoteChannelId>,
    pending_writes: HashMap<WriteToken, PendingWrite>,
    tokens: TokenAllocator,
    dispatch: DispatchMode,
    /// Static channel carrying the dynamic channel sub-protocol.
    drdynvc: Option<OpenHandle>,
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    handle: OpenHandle,
    tag: UserTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    Unset,
    Loop,
    Manual,
}

enum InitTarget {
    Native(Arc<dyn VirtualChannelEntry>),
    Ffi(FfiHooks),
}

impl ChannelManager {
    pub fn new(config: ManagerConfig, transport: Arc<dyn ChannelTransport>) -> std::io::Result<Self> {
        let inner = Inner {
            state: ConnectionState::Uninitialized,
            plugins: PluginRegistry::new(config.max_plugins),
            sessions: InitSessions::default(),
            listeners: Listeners::default(),
            channels: ChannelTable::new(config.max_open_channels),
            queue: EventQueue::new(config.queue_capacity)?,
            joined: HashMap::new(),
            pending_writes: HashMap::new(),
            tokens: TokenAllocator::default(),
            dispatch: DispatchMode::Unset,
            drdynvc: None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                inner: Mutex::new(inner),
                wakeup: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    // -- plugin registry -- //

    /// Registers a plugin and runs its entry point.
    pub fn register(&self, entry: EntryPoint, user_data: Option<UserData>) -> Result<InitHandle, ChannelError> {
        let init_handle = {
            let mut inner = self.shared.inner.lock();
            ensure(inner.state, Operation::Register)?;
            let init_handle = inner.plugins.insert(entry.clone(), user_data.clone())?;
            inner.sessions.begin(init_handle);
            init_handle
        };

        let result = match &entry {
            EntryPoint::Native(native) => native.entry(&mut InitContext::new(self, init_handle, user_data)),
            EntryPoint::Ffi(entry_fn) => ffi::call_entry(self, *entry_fn, init_handle),
        };

        if let Err(error) = result {
            warn!(%init_handle, plugin = %entry.name(), error = format!("{error:#}"), "Plugin entry point failed");
            self.abort_registration(init_handle);
            return Err(error);
        }

        let late = {
            let mut inner = self.shared.inner.lock();
            inner.sessions.entry_returned(init_handle);
            inner.state == ConnectionState::PreConnect
        };

        info!(%init_handle, plugin = %entry.name(), "Plugin registered");

        // Plugins registered after `pre_connect` still observe initialization.
        if late {
            self.notify_plugin(init_handle, InitEvent::Initialized);
        }

        Ok(init_handle)
    }

    fn abort_registration(&self, init_handle: InitHandle) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        inner.plugins.remove(init_handle);
        inner.sessions.remove(init_handle);
        inner.listeners.remove_owned_by(init_handle);

        for handle in inner.channels.handles_where(|record| record.owner == init_handle) {
            inner.channels.remove(handle);
            inner.queue.purge(handle);
        }
    }

    pub fn lookup(&self, init_handle: InitHandle) -> Result<PluginInfo, ChannelError> {
        let inner = self.shared.inner.lock();
        inner.plugins.get(init_handle).map(|plugin| plugin.info())
    }

    /// Static channels declared by the registered plugins, for the transport to join.
    pub fn declared_channels(&self) -> Vec<StaticChannelDef> {
        let inner = self.shared.inner.lock();
        inner
            .plugins
            .iter()
            .flat_map(|plugin| plugin.declared.iter().cloned())
            .collect()
    }

    pub(crate) fn declare_channel(
        &self,
        init_handle: InitHandle,
        name: &str,
        options: ChannelOptions,
    ) -> Result<(), ChannelError> {
        let mut inner = self.shared.inner.lock();

        if !inner.sessions.is_in_entry(init_handle) {
            return Err(ChannelError::InvalidState {
                operation: "declare_channel",
                state: inner.state,
            });
        }

        let name = validate_name(name, self.shared.config.max_static_name_length)?;

        if inner.plugins.iter().any(|plugin| plugin.declared.iter().any(|def| def.name == name)) {
            return Err(ChannelError::DuplicateName(name));
        }

        let max = self.shared.config.max_open_channels;
        if inner.plugins.declared_count() >= max {
            return Err(ChannelError::CapacityExceeded {
                table: "channel definitions",
                max,
            });
        }

        inner
            .plugins
            .get_mut(init_handle)?
            .declared
            .push(StaticChannelDef { name, options });

        Ok(())
    }

    pub(crate) fn set_interface(&self, init_handle: InitHandle, interface: Interface) -> Result<(), ChannelError> {
        let mut inner = self.shared.inner.lock();
        inner.plugins.get_mut(init_handle)?.interface = Some(interface);
        Ok(())
    }

    pub(crate) fn is_in_entry(&self, init_handle: InitHandle) -> bool {
        self.shared.inner.lock().sessions.is_in_entry(init_handle)
    }

    pub(crate) fn set_ffi_hooks(&self, init_handle: InitHandle, hooks: FfiHooks) -> Result<(), ChannelError> {
        let mut inner = self.shared.inner.lock();
        inner.plugins.get_mut(init_handle)?.ffi = Some(hooks);
        Ok(())
    }

    pub(crate) fn ffi_hooks(&self, init_handle: InitHandle) -> Result<Option<FfiHooks>, ChannelError> {
        let inner = self.shared.inner.lock();
        Ok(inner.plugins.get(init_handle)?.ffi)
    }

    /// Interface object attached by the plugin owning the channel named `name`.
    pub fn channel_interface(&self, name: &str) -> Option<Interface> {
        let inner = self.shared.inner.lock();
        let handle = inner.channels.find_name(name)?;
        inner.channels.get(handle)?.interface.clone()
    }

    // -- lifecycle -- //

    pub fn pre_connect(&self) -> Result<(), ChannelError> {
        {
            let mut inner = self.shared.inner.lock();
            ensure(inner.state, Operation::PreConnect)?;
            inner.state = ConnectionState::PreConnect;
        }

        info!("Pre-connect");

        self.notify_plugins(InitEvent::Initialized);

        if self.shared.config.dynamic_channels {
            if let Err(error) = self.register(EntryPoint::native(DynamicChannelBridge::new()), None) {
                warn!(error = format!("{error:#}"), "Dynamic channels are not available");
            }
        }

        Ok(())
    }

    /// Binds the channels opened so far to the ids assigned by the peer.
    ///
    /// Channels whose name is not part of `joined` are torn down with a `Closed` event.
    pub fn post_connect(&self, joined: &[JoinedChannel]) -> Result<(), ChannelError> {
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            ensure(inner.state, Operation::PostConnect)?;
            inner.state = ConnectionState::Connected;
            inner.joined = joined.iter().map(|channel| (channel.name.clone(), channel.id)).collect();

            let pending = inner
                .channels
                .handles_where(|record| record.binding == Binding::Pending && record.status == Status::Open);

            for handle in pending {
                let Some(name) = inner.channels.get(handle).map(|record| record.name.clone()) else {
                    continue;
                };

                match inner.joined.get(&name) {
                    Some(id) => {
                        debug!(%handle, %name, remote_id = %id, "Channel bound");
                        inner.channels.bind_static(handle, *id);
                    }
                    None => {
                        warn!(%handle, %name, "Channel was not joined by the transport");
                        self.shared.teardown(inner, handle);
                    }
                }
            }
        }

        info!(joined = joined.len(), "Post-connect");

        self.notify_plugins(InitEvent::Connected);

        self.shared.inner.lock().sessions.clear();

        Ok(())
    }

    /// Tears down every channel with a `Closed` event. Idempotent.
    ///
    /// Also the path taken on transport failure.
    pub fn disconnect(&self) {
        let was_active = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            match inner.state {
                ConnectionState::Disconnecting | ConnectionState::Closed => return,
                ConnectionState::Uninitialized => {
                    inner.state = ConnectionState::Disconnecting;
                    false
                }
                ConnectionState::PreConnect | ConnectionState::Connected => {
                    inner.state = ConnectionState::Disconnecting;

                    for handle in inner.channels.handles_where(|record| record.status == Status::Open) {
                        self.shared.teardown(inner, handle);
                    }

                    inner.pending_writes.clear();
                    true
                }
            }
        };

        info!("Disconnected");

        if was_active {
            self.notify_plugins(InitEvent::Disconnected);
        }
    }

    /// Releases every channel and ends the dispatch loop. Idempotent.
    ///
    /// `Closed` events still queued are delivered before returning, other pending events are discarded.
    pub fn close(&self) {
        self.disconnect();

        let leftover = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            if inner.state == ConnectionState::Closed {
                return;
            }

            inner.state = ConnectionState::Closed;
            inner.joined.clear();
            inner.pending_writes.clear();
            inner.drdynvc = None;

            let released = inner.channels.drain();
            debug!(released = released.len(), "Channels released");

            inner.queue.drain()
        };

        self.shared.wakeup.notify_one();

        for queued in leftover.into_iter().filter(|queued| queued.event.is_closed()) {
            queued.handler.on_event(self, queued.handle, queued.event);
        }

        info!("Closed");

        self.notify_plugins(InitEvent::Terminated);
    }

    /// Closes the manager and releases every plugin. Idempotent.
    pub fn destroy(&self) {
        self.close();

        let mut inner = self.shared.inner.lock();
        inner.listeners.clear();
        inner.sessions.clear();
        inner.plugins.clear();
    }

    // -- open channel table -- //

    /// Opens a static channel for the plugin `init_handle`.
    ///
    /// Before `post_connect` the channel waits for the transport to join it. Afterwards the
    /// name must have been joined and the channel is bound immediately.
    pub fn open(
        &self,
        init_handle: InitHandle,
        name: &str,
        options: ChannelOptions,
        delivery: Delivery,
    ) -> Result<OpenHandle, ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::Open)?;

        let name = validate_name(name, self.shared.config.max_static_name_length)?;
        let interface = inner.plugins.get(init_handle)?.interface.clone();

        let binding = if inner.state == ConnectionState::Connected {
            let id = inner
                .joined
                .get(&name)
                .ok_or_else(|| ChannelError::NotFound(Lookup::Name(name.clone())))?;
            Binding::Static(*id)
        } else {
            Binding::Pending
        };

        let handle = inner.channels.insert(NewChannel {
            name: name.clone(),
            options: options.union(ChannelOptions::INITIALIZED),
            owner: init_handle,
            binding,
            delivery,
            interface,
        })?;

        info!(%handle, %name, %init_handle, "Channel opened");

        Ok(handle)
    }

    /// Registers a listener for dynamic channels named `name`.
    pub fn register_listener(
        &self,
        init_handle: InitHandle,
        name: &str,
        delivery: Delivery,
    ) -> Result<(), ChannelError> {
        let mut inner = self.shared.inner.lock();

        ensure(inner.state, Operation::RegisterListener)?;

        let name = validate_name(name, self.shared.config.max_dynamic_name_length)?;
        inner.plugins.get(init_handle)?;
        inner.listeners.insert(
            name.clone(),
            Listener {
                owner: init_handle,
                delivery,
            },
        )?;

        debug!(%name, %init_handle, "Dynamic channel listener registered");

        Ok(())
    }

    /// Closes a channel locally.
    ///
    /// Pending events of the channel are discarded and no `Closed` event is delivered.
    ///
    /// An event already handed to the handler on another thread is not recalled: with the
    /// dispatch loop, the handler may still be running that one event when this returns.
    /// Called from the handler itself, no further event reaches it.
    pub fn close_channel(&self, handle: OpenHandle) -> Result<(), ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::CloseChannel)?;

        let binding = inner.channels.get_open(handle)?.binding;

        if let Binding::Dynamic(id) = binding {
            if inner.state == ConnectionState::Connected {
                if let Err(error) = self.shared.send_dynamic_close(inner, id) {
                    warn!(%handle, dynamic_id = %id, %error, "Failed to send dynamic channel close");
                }
            }
        }

        inner.channels.remove(handle);
        let purged = inner.queue.purge(handle);

        // Lets the dispatch loop release the delivery lane.
        if inner.dispatch == DispatchMode::Loop {
            self.shared.wakeup.notify_one();
        }

        debug!(%handle, purged, "Channel closed");

        Ok(())
    }

    /// Queues `data` for transmission on the channel.
    ///
    /// A `WriteComplete` event carrying `tag` is delivered once the transport reports completion.
    pub fn write(&self, handle: OpenHandle, data: Bytes, tag: UserTag) -> Result<(), ChannelError> {
        let transport_error = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            ensure(inner.state, Operation::Write)?;

            let record = inner.channels.get_open(handle)?;
            let (binding, options) = (record.binding, record.options);
            let token = inner.tokens.alloc();

            let result = match binding {
                Binding::Static(id) => {
                    let show_protocol = options.contains(ChannelOptions::SHOW_PROTOCOL);
                    self.shared.send_chunks(id, data, show_protocol, Some(token))
                }
                Binding::Dynamic(id) => {
                    let svc_id = inner.drdynvc_remote_id().ok_or(ChannelError::NotOpen(handle))?;
                    let pdus = vchan_proto::fragment(id, data, self.shared.config.dynamic_chunk_size)?;
                    let encoded = pdus.iter().map(ClientPdu::to_bytes).collect::<Result<Vec<_>, _>>()?;
                    let last_idx = encoded.len().saturating_sub(1);

                    encoded.into_iter().enumerate().try_for_each(|(idx, pdu)| {
                        let completion = (idx == last_idx).then_some(token);
                        self.shared.send_chunks(svc_id, pdu, false, completion)
                    })
                }
                Binding::Pending => return Err(ChannelError::NotOpen(handle)),
            };

            match result {
                Ok(()) => {
                    inner.pending_writes.insert(token, PendingWrite { handle, tag });
                    trace!(%handle, %token, "Write queued");
                    return Ok(());
                }
                Err(error) => error,
            }
        };

        error!(%handle, error = %transport_error, "Transport failure");

        self.disconnect();

        Err(ChannelError::Transport(transport_error))
    }

    pub fn find<'a>(&self, key: impl Into<ChannelKey<'a>>) -> Result<ChannelInfo, ChannelError> {
        let inner = self.shared.inner.lock();

        let handle = match key.into() {
            ChannelKey::Name(name) => inner
                .channels
                .find_name(name)
                .ok_or_else(|| ChannelError::NotFound(Lookup::Name(SmolStr::new(name))))?,
            ChannelKey::Handle(handle) => handle,
        };

        let record = inner
            .channels
            .get_open(handle)
            .map_err(|_| ChannelError::NotFound(Lookup::Handle(handle)))?;

        let (remote_id, dynamic_id) = match record.binding {
            Binding::Pending => (None, None),
            Binding::Static(id) => (Some(id), None),
            Binding::Dynamic(id) => (None, Some(id)),
        };

        Ok(ChannelInfo {
            handle,
            name: record.name.clone(),
            options: record.options,
            owner: record.owner,
            remote_id,
            dynamic_id,
        })
    }

    // -- transport-side producers -- //

    /// Reports a static channel chunk received from the peer.
    pub fn on_data_received(
        &self,
        id: RemoteChannelId,
        data: Bytes,
        total_length: u32,
        flags: ChunkFlags,
    ) -> Result<(), ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::NetworkEvent)?;

        if inner.state == ConnectionState::Disconnecting {
            debug!(remote_id = %id, "Dropping data received while disconnecting");
            return Ok(());
        }

        let handle = inner
            .channels
            .find_remote(id)
            .ok_or(ChannelError::NotFound(Lookup::Remote(id)))?;

        let options = inner.channels.get_open(handle)?.options;

        let flags = if options.contains(ChannelOptions::SHOW_PROTOCOL) {
            flags
        } else {
            flags.without(ChunkFlags::SHOW_PROTOCOL)
        };

        trace!(%handle, len = data.len(), total_length, %flags, "Data received");

        self.shared.enqueue(
            inner,
            handle,
            ChannelEvent::DataReceived {
                data,
                total_length,
                flags,
            },
        )
    }

    /// Reports that the transport sent the last chunk of a write.
    pub fn on_write_complete(&self, token: WriteToken) -> Result<(), ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::NetworkEvent)?;

        if inner.state == ConnectionState::Disconnecting {
            debug!(%token, "Dropping write completion received while disconnecting");
            return Ok(());
        }

        let pending = inner
            .pending_writes
            .remove(&token)
            .ok_or(ChannelError::NotFound(Lookup::Write(token)))?;

        if inner.channels.get_open(pending.handle).is_err() {
            trace!(handle = %pending.handle, %token, "Write completed on a closed channel");
            return Ok(());
        }

        self.shared
            .enqueue(inner, pending.handle, ChannelEvent::WriteComplete { tag: pending.tag })
    }

    // -- delivery -- //

    /// Spawns the dispatch loop on the current tokio runtime.
    ///
    /// Each channel gets its own delivery lane, so a slow handler only delays its own channel.
    pub fn spawn_dispatch_loop(&self) -> Result<DispatchTask, ChannelError> {
        self.set_dispatch_mode(DispatchMode::Loop, "spawn_dispatch_loop")?;
        Ok(dispatch::spawn(self.clone()))
    }

    /// Delivers every queued event inline, in FIFO order.
    ///
    /// For hosts driving the manager from their own loop, typically after a queue handle
    /// returned by [`Self::registered_handles`] became ready. Returns the number of delivered events.
    pub fn dispatch_pending(&self) -> Result<usize, ChannelError> {
        self.set_dispatch_mode(DispatchMode::Manual, "dispatch_pending")?;

        let batch = self.shared.inner.lock().queue.drain();

        let mut delivered = 0;

        for queued in batch {
            if self.deliver(queued) {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    fn set_dispatch_mode(&self, mode: DispatchMode, operation: &'static str) -> Result<(), ChannelError> {
        let mut inner = self.shared.inner.lock();

        ensure(inner.state, Operation::Dispatch)?;

        let conflict = match inner.dispatch {
            DispatchMode::Unset => false,
            DispatchMode::Manual => mode != DispatchMode::Manual,
            DispatchMode::Loop => true,
        };

        if conflict {
            return Err(ChannelError::InvalidState {
                operation,
                state: inner.state,
            });
        }

        inner.dispatch = mode;

        Ok(())
    }

    /// Takes the events of the next batch, `None` once the manager is closed.
    pub(crate) fn next_batch(&self) -> Option<Vec<QueuedEvent>> {
        let mut inner = self.shared.inner.lock();

        if inner.state == ConnectionState::Closed {
            return None;
        }

        Some(inner.queue.drain())
    }

    pub(crate) async fn wait_for_events(&self) {
        self.shared.wakeup.notified().await;
    }

    /// Returns `true` while `handle` can still receive events.
    pub(crate) fn is_tracked(&self, handle: OpenHandle) -> bool {
        self.shared.inner.lock().channels.get(handle).is_some()
    }

    pub(crate) fn channel_name(&self, handle: OpenHandle) -> Option<SmolStr> {
        let inner = self.shared.inner.lock();
        inner.channels.get(handle).map(|record| record.name.clone())
    }

    /// Hands one event to its handler, if the channel is still there.
    pub(crate) fn deliver(&self, queued: QueuedEvent) -> bool {
        let QueuedEvent { handle, event, handler } = queued;
        let is_closed = event.is_closed();

        if !is_closed && !self.is_tracked(handle) {
            trace!(%handle, "Discarding event of a released channel");
            return false;
        }

        handler.on_event(self, handle, event);

        if is_closed {
            let mut inner = self.shared.inner.lock();
            if inner.channels.get(handle).is_some_and(|record| record.status == Status::Closing) {
                inner.channels.remove(handle);
            }
        }

        true
    }

    /// Drains the inbox of a signaled channel and resets its wait handle.
    pub fn take_events(&self, handle: OpenHandle) -> Result<Vec<ChannelEvent>, ChannelError> {
        let mut inner = self.shared.inner.lock();

        let record = inner.channels.get_mut(handle).ok_or(ChannelError::NotOpen(handle))?;
        let inbox = record.inbox.as_mut().ok_or(ChannelError::NotSignaled(handle))?;
        let events = inbox.take();

        if events.iter().any(ChannelEvent::is_closed) {
            inner.channels.remove(handle);
        }

        Ok(events)
    }

    /// Waitable handles: the shared queue first, then one per open signaled channel.
    ///
    /// This is a snapshot. Query again after opening or closing channels.
    pub fn registered_handles(&self) -> Vec<WaitHandle> {
        let inner = self.shared.inner.lock();

        let mut handles = vec![inner.queue.signal().clone()];

        handles.extend(
            inner
                .channels
                .records()
                .filter(|record| record.status == Status::Open)
                .filter_map(|record| record.inbox.as_ref().map(|inbox| inbox.signal().clone())),
        );

        handles
    }

    // -- init events -- //

    fn init_targets(&self, only: Option<InitHandle>) -> Vec<(InitHandle, InitTarget)> {
        let inner = self.shared.inner.lock();

        inner
            .plugins
            .iter()
            .filter(|plugin| only.is_none_or(|init_handle| plugin.init_handle == init_handle))
            .filter_map(|plugin| {
                let target = match &plugin.entry {
                    EntryPoint::Native(native) => InitTarget::Native(Arc::clone(native)),
                    EntryPoint::Ffi(_) => InitTarget::Ffi(plugin.ffi?),
                };
                Some((plugin.init_handle, target))
            })
            .collect()
    }

    fn notify_plugins(&self, event: InitEvent) {
        for (init_handle, target) in self.init_targets(None) {
            self.notify_target(init_handle, target, event);
        }
    }

    fn notify_plugin(&self, init_handle: InitHandle, event: InitEvent) {
        for (init_handle, target) in self.init_targets(Some(init_handle)) {
            self.notify_target(init_handle, target, event);
        }
    }

    fn notify_target(&self, init_handle: InitHandle, target: InitTarget, event: InitEvent) {
        trace!(%init_handle, ?event, "Init event");

        match target {
            InitTarget::Native(native) => native.on_init_event(self, init_handle, event),
            InitTarget::Ffi(hooks) => hooks.notify_init(init_handle, event),
        }
    }

    // -- dynamic channel bridge -- //

    pub(crate) fn set_bridge_channel(&self, handle: OpenHandle) {
        self.shared.inner.lock().drdynvc = Some(handle);
    }

    /// Creates the record of a dynamic channel the peer asked for, and queues `Created`.
    pub(crate) fn create_dynamic_channel(&self, id: DynamicChannelId, name: &str) -> Result<OpenHandle, ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::Open)?;

        let name = validate_name(name, self.shared.config.max_dynamic_name_length)?;
        let listener = inner.listeners.get(&name)?.clone();
        let interface = inner.plugins.get(listener.owner)?.interface.clone();

        if let Some(previous) = inner.channels.find_dynamic(id) {
            warn!(dynamic_id = %id, handle = %previous, "Dynamic channel id reused by the peer");
            self.shared.teardown(inner, previous);
        }

        let handle = inner.channels.insert(NewChannel {
            name: name.clone(),
            options: ChannelOptions::INITIALIZED | ChannelOptions::DYNAMIC,
            owner: listener.owner,
            binding: Binding::Dynamic(id),
            delivery: listener.delivery,
            interface,
        })?;

        info!(%handle, %name, dynamic_id = %id, "Dynamic channel created");

        self.shared.enqueue(inner, handle, ChannelEvent::Created { name })?;

        Ok(handle)
    }

    pub(crate) fn deliver_dynamic_data(&self, id: DynamicChannelId, data: Bytes) -> Result<(), ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        ensure(inner.state, Operation::NetworkEvent)?;

        if inner.state == ConnectionState::Disconnecting {
            debug!(dynamic_id = %id, "Dropping dynamic data received while disconnecting");
            return Ok(());
        }

        let handle = inner
            .channels
            .find_dynamic(id)
            .ok_or(ChannelError::NotFound(Lookup::Dynamic(id)))?;

        let total_length = u32::try_from(data.len()).map_err(|_| {
            ChannelError::Protocol(vchan_proto::Error::PacketOversized {
                packet_size: data.len(),
                max: u32::MAX as usize,
            })
        })?;

        self.shared.enqueue(
            inner,
            handle,
            ChannelEvent::DataReceived {
                data,
                total_length,
                flags: ChunkFlags::ONLY,
            },
        )
    }

    /// Remote close of a dynamic channel: same teardown as a transport failure.
    pub(crate) fn close_dynamic_channel(&self, id: DynamicChannelId) -> Result<(), ChannelError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        let handle = inner
            .channels
            .find_dynamic(id)
            .ok_or(ChannelError::NotFound(Lookup::Dynamic(id)))?;

        info!(%handle, dynamic_id = %id, "Dynamic channel closed by peer");

        self.shared.teardown(inner, handle);

        Ok(())
    }

    // -- C ABI -- //

    pub(crate) fn as_ffi_ptr(&self) -> *const core::ffi::c_void {
        Arc::as_ptr(&self.shared).cast()
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Self::as_ffi_ptr`] on a manager that is still alive.
    pub(crate) unsafe fn from_ffi_ptr(ptr: *const core::ffi::c_void) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }

        let ptr = ptr.cast::<Shared>();

        // SAFETY: Per the function contract, `ptr` comes from `Arc::as_ptr` on a live `Arc<Shared>`.
        unsafe { Arc::increment_strong_count(ptr) };

        // SAFETY: The strong count was incremented above, so this `Arc` owns one reference.
        let shared = unsafe { Arc::from_raw(ptr) };

        Some(Self { shared })
    }
}

impl Inner {
    fn drdynvc_remote_id(&self) -> Option<RemoteChannelId> {
        let record = self.channels.get(self.drdynvc?)?;
        match record.binding {
            Binding::Static(id) => Some(id),
            Binding::Pending | Binding::Dynamic(_) => None,
        }
    }
}

impl Shared {
    /// Routes an event to the shared queue or to the channel inbox.
    fn enqueue(&self, inner: &mut Inner, handle: OpenHandle, event: ChannelEvent) -> Result<(), ChannelError> {
        let record = inner.channels.get_mut(handle).ok_or(ChannelError::NotOpen(handle))?;

        match &record.delivery {
            Delivery::Callback(handler) => {
                let handler = Arc::clone(handler);
                inner.queue.push(QueuedEvent { handle, event, handler })?;
                self.wakeup.notify_one();
            }
            Delivery::Signaled => match record.inbox.as_mut() {
                Some(inbox) => inbox.push(event, self.config.queue_capacity)?,
                None => warn!(%handle, "Signaled channel without inbox"),
            },
        }

        Ok(())
    }

    /// Remote or transport-driven teardown: the record stays until its `Closed` event is delivered.
    fn teardown(&self, inner: &mut Inner, handle: OpenHandle) {
        if !inner.channels.begin_closing(handle) {
            return;
        }

        if let Err(error) = self.enqueue(inner, handle, ChannelEvent::Closed) {
            error!(%handle, %error, "Failed to queue channel closure");
            inner.channels.remove(handle);
        }
    }

    /// Splits `data` into static channel chunks and hands them to the transport.
    fn send_chunks(
        &self,
        channel_id: RemoteChannelId,
        mut data: Bytes,
        show_protocol: bool,
        completion: Option<WriteToken>,
    ) -> Result<(), TransportError> {
        let extra = if show_protocol {
            ChunkFlags::SHOW_PROTOCOL
        } else {
            ChunkFlags::NONE
        };

        let mut flags = ChunkFlags::FIRST | extra;

        loop {
            let chunk = data.split_to(core::cmp::min(CHANNEL_CHUNK_LENGTH, data.len()));
            let is_last = data.is_empty();

            if is_last {
                flags = flags | ChunkFlags::LAST;
            }

            self.transport.send(SendRequest {
                channel_id,
                data: chunk,
                flags,
                completion: if is_last { completion } else { None },
            })?;

            if is_last {
                return Ok(());
            }

            flags = extra;
        }
    }

    fn send_dynamic_close(&self, inner: &Inner, id: DynamicChannelId) -> Result<(), ChannelError> {
        let svc_id = inner
            .drdynvc_remote_id()
            .ok_or_else(|| ChannelError::NotFound(Lookup::Name(SmolStr::new(vchan_proto::DRDYNVC_CHANNEL_NAME))))?;

        let pdu = ClientPdu::Close(vchan_proto::Close { channel_id: id }).to_bytes()?;
        self.send_chunks(svc_id, pdu, false, None)?;

        Ok(())
    }
}

fn validate_name(name: &str, max: usize) -> Result<SmolStr, ChannelError> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.len() > max {
        Some("too long")
    } else if name.contains('\0') {
        Some("contains a null character")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ChannelError::InvalidName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(SmolStr::new(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("cliprdr", 7).is_ok());
        assert!(matches!(
            validate_name("", 7),
            Err(ChannelError::InvalidName { reason: "empty", .. })
        ));
        assert!(matches!(
            validate_name("cliprdr2", 7),
            Err(ChannelError::InvalidName { reason: "too long", .. })
        ));
        assert!(matches!(
            validate_name("a\0b", 7),
            Err(ChannelError::InvalidName {
                reason: "contains a null character",
                ..
            })
        ));
    }
}
