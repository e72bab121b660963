use std::collections::{BTreeMap, HashMap, VecDeque};

use smol_str::SmolStr;
use vchan_proto::DynamicChannelId;

use crate::error::ChannelError;
use crate::event::ChannelEvent;
use crate::handle::{ChannelOptions, HandleAllocator, InitHandle, OpenHandle, RemoteChannelId};
use crate::plugin::{Delivery, Interface};
use crate::wait::WaitHandle;

/// What the record is attached to on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    /// Opened before post-connect, waiting for the transport to join it.
    Pending,
    Static(RemoteChannelId),
    Dynamic(DynamicChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    /// Torn down by the peer or the transport: the `Closed` event is pending.
    Closing,
}

pub(crate) struct Inbox {
    events: VecDeque<ChannelEvent>,
    signal: WaitHandle,
}

impl Inbox {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            events: VecDeque::new(),
            signal: WaitHandle::new()?,
        })
    }

    pub(crate) fn push(&mut self, event: ChannelEvent, capacity: Option<usize>) -> Result<(), ChannelError> {
        if let Some(capacity) = capacity {
            if !event.is_closed() && self.events.len() >= capacity {
                return Err(ChannelError::QueueFull { capacity });
            }
        }

        self.events.push_back(event);
        self.signal.set();

        Ok(())
    }

    pub(crate) fn take(&mut self) -> Vec<ChannelEvent> {
        self.signal.reset();
        self.events.drain(..).collect()
    }

    pub(crate) fn signal(&self) -> &WaitHandle {
        &self.signal
    }
}

pub(crate) struct ChannelRecord {
    pub(crate) handle: OpenHandle,
    pub(crate) name: SmolStr,
    pub(crate) options: ChannelOptions,
    pub(crate) owner: InitHandle,
    pub(crate) binding: Binding,
    pub(crate) status: Status,
    pub(crate) delivery: Delivery,
    pub(crate) interface: Option<Interface>,
    /// Present for signaled channels.
    pub(crate) inbox: Option<Inbox>,
}

pub(crate) struct NewChannel {
    pub(crate) name: SmolStr,
    pub(crate) options: ChannelOptions,
    pub(crate) owner: InitHandle,
    pub(crate) binding: Binding,
    pub(crate) delivery: Delivery,
    pub(crate) interface: Option<Interface>,
}

pub(crate) struct ChannelTable {
    records: BTreeMap<OpenHandle, ChannelRecord>,
    by_name: HashMap<SmolStr, OpenHandle>,
    by_remote: HashMap<RemoteChannelId, OpenHandle>,
    by_dynamic: HashMap<DynamicChannelId, OpenHandle>,
    allocator: HandleAllocator<OpenHandle>,
    max: usize,
}

impl ChannelTable {
    pub(crate) const NAME: &'static str = "open channel table";

    pub(crate) fn new(max: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            by_name: HashMap::new(),
            by_remote: HashMap::new(),
            by_dynamic: HashMap::new(),
            allocator: HandleAllocator::new(),
            max,
        }
    }

    pub(crate) fn insert(&mut self, channel: NewChannel) -> Result<OpenHandle, ChannelError> {
        if self.by_name.contains_key(&channel.name) {
            return Err(ChannelError::DuplicateName(channel.name));
        }

        if self.records.len() >= self.max {
            return Err(ChannelError::CapacityExceeded {
                table: Self::NAME,
                max: self.max,
            });
        }

        let inbox = if channel.delivery.is_signaled() {
            Some(Inbox::new()?)
        } else {
            None
        };

        let handle = self.allocator.alloc().ok_or(ChannelError::CapacityExceeded {
            table: Self::NAME,
            max: self.max,
        })?;

        match channel.binding {
            Binding::Pending => {}
            Binding::Static(id) => {
                self.by_remote.insert(id, handle);
            }
            Binding::Dynamic(id) => {
                self.by_dynamic.insert(id, handle);
            }
        }

        self.by_name.insert(channel.name.clone(), handle);

        self.records.insert(
            handle,
            ChannelRecord {
                handle,
                name: channel.name,
                options: channel.options,
                owner: channel.owner,
                binding: channel.binding,
                status: Status::Open,
                delivery: channel.delivery,
                interface: channel.interface,
                inbox,
            },
        );

        Ok(handle)
    }

    pub(crate) fn bind_static(&mut self, handle: OpenHandle, id: RemoteChannelId) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.binding = Binding::Static(id);
            self.by_remote.insert(id, handle);
        }
    }

    pub(crate) fn get(&self, handle: OpenHandle) -> Option<&ChannelRecord> {
        self.records.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: OpenHandle) -> Option<&mut ChannelRecord> {
        self.records.get_mut(&handle)
    }

    /// Returns the record if it is open for traffic.
    pub(crate) fn get_open(&self, handle: OpenHandle) -> Result<&ChannelRecord, ChannelError> {
        self.records
            .get(&handle)
            .filter(|record| record.status == Status::Open)
            .ok_or(ChannelError::NotOpen(handle))
    }

    pub(crate) fn find_name(&self, name: &str) -> Option<OpenHandle> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn find_remote(&self, id: RemoteChannelId) -> Option<OpenHandle> {
        self.by_remote.get(&id).copied()
    }

    pub(crate) fn find_dynamic(&self, id: DynamicChannelId) -> Option<OpenHandle> {
        self.by_dynamic.get(&id).copied()
    }

    /// Moves an open record to `Closing`, freeing its name and remote bindings.
    ///
    /// Returns `false` if the record was not open.
    pub(crate) fn begin_closing(&mut self, handle: OpenHandle) -> bool {
        let Some(record) = self.records.get_mut(&handle) else {
            return false;
        };

        if record.status != Status::Open {
            return false;
        }

        record.status = Status::Closing;
        let (name, binding) = (record.name.clone(), record.binding);
        self.unindex(handle, &name, binding);

        true
    }

    pub(crate) fn remove(&mut self, handle: OpenHandle) -> Option<ChannelRecord> {
        let record = self.records.remove(&handle)?;
        self.unindex(handle, &record.name, record.binding);
        Some(record)
    }

    fn unindex(&mut self, handle: OpenHandle, name: &SmolStr, binding: Binding) {
        if self.by_name.get(name) == Some(&handle) {
            self.by_name.remove(name);
        }

        match binding {
            Binding::Pending => {}
            Binding::Static(id) => {
                if self.by_remote.get(&id) == Some(&handle) {
                    self.by_remote.remove(&id);
                }
            }
            Binding::Dynamic(id) => {
                if self.by_dynamic.get(&id) == Some(&handle) {
                    self.by_dynamic.remove(&id);
                }
            }
        }
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.records.values()
    }

    pub(crate) fn handles_where(&self, predicate: impl Fn(&ChannelRecord) -> bool) -> Vec<OpenHandle> {
        self.records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.handle)
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<ChannelRecord> {
        self.by_name.clear();
        self.by_remote.clear();
        self.by_dynamic.clear();
        core::mem::take(&mut self.records).into_values().collect()
    }
}
