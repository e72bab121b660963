#![allow(dead_code, unreachable_pub)]

use std::sync::Arc;

use parking_lot::Mutex;
use vchan_manager::*;

/// Transport keeping every request for inspection
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<SendRequest>>,
    fail: Mutex<bool>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<SendRequest> {
        core::mem::take(&mut *self.requests.lock())
    }

    pub fn fail_from_now_on(&self) {
        *self.fail.lock() = true;
    }
}

impl ChannelTransport for RecordingTransport {
    fn send(&self, request: SendRequest) -> Result<(), TransportError> {
        if *self.fail.lock() {
            return Err(TransportError::new("connection reset"));
        }

        self.requests.lock().push(request);
        Ok(())
    }
}

/// Records the events handed to a channel handler
#[derive(Default)]
pub struct Collector {
    events: Mutex<Vec<(OpenHandle, ChannelEvent)>>,
}

impl Collector {
    pub fn take(&self) -> Vec<(OpenHandle, ChannelEvent)> {
        core::mem::take(&mut *self.events.lock())
    }

    pub fn delivery(self: &Arc<Self>) -> Delivery {
        let collector = Arc::clone(self);
        Delivery::callback(move |_: &ChannelManager, handle: OpenHandle, event: ChannelEvent| {
            collector.events.lock().push((handle, event));
        })
    }
}

type EntryFn = dyn Fn(&mut InitContext<'_>) -> Result<(), ChannelError> + Send + Sync;

/// Plugin whose entry point is a closure
pub struct TestPlugin {
    name: &'static str,
    entry: Box<EntryFn>,
    pub init_events: Mutex<Vec<InitEvent>>,
}

impl TestPlugin {
    pub fn new(name: &'static str) -> Self {
        Self::with_entry(name, |_| Ok(()))
    }

    pub fn with_entry(
        name: &'static str,
        entry: impl Fn(&mut InitContext<'_>) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            entry: Box::new(entry),
            init_events: Mutex::new(Vec::new()),
        }
    }
}

impl VirtualChannelEntry for TestPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn entry(&self, ctx: &mut InitContext<'_>) -> Result<(), ChannelError> {
        (self.entry)(ctx)
    }

    fn on_init_event(&self, _: &ChannelManager, _: InitHandle, event: InitEvent) {
        self.init_events.lock().push(event);
    }
}

pub fn static_config() -> ManagerConfig {
    ManagerConfig::new().without_dynamic_channels()
}

pub fn manager_with(config: ManagerConfig) -> (ChannelManager, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let manager = ChannelManager::new(config, Arc::clone(&transport) as _).unwrap();
    (manager, transport)
}

pub fn register(manager: &ChannelManager, plugin: TestPlugin) -> (InitHandle, Arc<TestPlugin>) {
    let plugin = Arc::new(plugin);
    let init = manager
        .register(EntryPoint::Native(Arc::clone(&plugin) as _), None)
        .unwrap();
    (init, plugin)
}

/// Connected manager with one plugin owning `cliprdr` bound to remote id 1004.
pub fn connected_cliprdr(delivery: Delivery) -> (ChannelManager, Arc<RecordingTransport>, InitHandle, OpenHandle) {
    let (manager, transport) = manager_with(static_config());
    let (init, _) = register(&manager, TestPlugin::new("cliprdr"));

    manager.pre_connect().unwrap();
    let handle = manager.open(init, "cliprdr", ChannelOptions::NONE, delivery).unwrap();
    manager
        .post_connect(&[JoinedChannel::new("cliprdr", RemoteChannelId::new(1004))])
        .unwrap();

    (manager, transport, init, handle)
}
