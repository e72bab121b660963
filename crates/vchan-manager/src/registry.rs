use std::collections::{BTreeMap, HashMap};

use smol_str::SmolStr;

use crate::error::{ChannelError, Lookup};
use crate::ffi::FfiHooks;
use crate::handle::{HandleAllocator, InitHandle};
use crate::plugin::{Delivery, EntryPoint, Interface, PluginInfo, StaticChannelDef, UserData};

pub(crate) struct PluginRecord {
    pub(crate) init_handle: InitHandle,
    pub(crate) name: SmolStr,
    pub(crate) entry: EntryPoint,
    pub(crate) user_data: Option<UserData>,
    pub(crate) declared: Vec<StaticChannelDef>,
    pub(crate) interface: Option<Interface>,
    /// Set for C plugins once `virtual_channel_init` ran.
    pub(crate) ffi: Option<FfiHooks>,
}

impl PluginRecord {
    pub(crate) fn info(&self) -> PluginInfo {
        PluginInfo {
            init_handle: self.init_handle,
            name: self.name.clone(),
            user_data: self.user_data.clone(),
            declared_channels: self.declared.clone(),
        }
    }
}

/// Plugins by init handle, iterated in registration order
pub(crate) struct PluginRegistry {
    plugins: BTreeMap<InitHandle, PluginRecord>,
    by_identity: HashMap<usize, InitHandle>,
    allocator: HandleAllocator<InitHandle>,
    max: usize,
}

impl PluginRegistry {
    pub(crate) const NAME: &'static str = "plugin registry";

    pub(crate) fn new(max: usize) -> Self {
        Self {
            plugins: BTreeMap::new(),
            by_identity: HashMap::new(),
            allocator: HandleAllocator::new(),
            max,
        }
    }

    pub(crate) fn insert(
        &mut self,
        entry: EntryPoint,
        user_data: Option<UserData>,
    ) -> Result<InitHandle, ChannelError> {
        let identity = entry.identity();

        if let Some(existing) = self.by_identity.get(&identity) {
            return Err(ChannelError::AlreadyRegistered(*existing));
        }

        if self.plugins.len() >= self.max {
            return Err(ChannelError::CapacityExceeded {
                table: Self::NAME,
                max: self.max,
            });
        }

        let init_handle = self.allocator.alloc().ok_or(ChannelError::CapacityExceeded {
            table: Self::NAME,
            max: self.max,
        })?;

        let record = PluginRecord {
            init_handle,
            name: entry.name(),
            entry,
            user_data,
            declared: Vec::new(),
            interface: None,
            ffi: None,
        };

        self.by_identity.insert(identity, init_handle);
        self.plugins.insert(init_handle, record);

        Ok(init_handle)
    }

    pub(crate) fn remove(&mut self, init_handle: InitHandle) -> Option<PluginRecord> {
        let record = self.plugins.remove(&init_handle)?;
        self.by_identity.remove(&record.entry.identity());
        Some(record)
    }

    pub(crate) fn get(&self, init_handle: InitHandle) -> Result<&PluginRecord, ChannelError> {
        self.plugins
            .get(&init_handle)
            .ok_or(ChannelError::NotFound(Lookup::Plugin(init_handle)))
    }

    pub(crate) fn get_mut(&mut self, init_handle: InitHandle) -> Result<&mut PluginRecord, ChannelError> {
        self.plugins
            .get_mut(&init_handle)
            .ok_or(ChannelError::NotFound(Lookup::Plugin(init_handle)))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PluginRecord> {
        self.plugins.values()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn declared_count(&self) -> usize {
        self.plugins.values().map(|plugin| plugin.declared.len()).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.plugins.clear();
        self.by_identity.clear();
    }
}

/// Binding between a plugin and the manager while its handshake is in progress.
pub(crate) struct InitSession {
    /// The entry point is still running.
    pub(crate) in_entry: bool,
}

#[derive(Default)]
pub(crate) struct InitSessions {
    sessions: HashMap<InitHandle, InitSession>,
}

impl InitSessions {
    pub(crate) fn begin(&mut self, init_handle: InitHandle) {
        self.sessions.insert(init_handle, InitSession { in_entry: true });
    }

    pub(crate) fn entry_returned(&mut self, init_handle: InitHandle) {
        if let Some(session) = self.sessions.get_mut(&init_handle) {
            session.in_entry = false;
        }
    }

    pub(crate) fn is_in_entry(&self, init_handle: InitHandle) -> bool {
        self.sessions.get(&init_handle).is_some_and(|session| session.in_entry)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, init_handle: InitHandle) -> bool {
        self.sessions.contains_key(&init_handle)
    }

    pub(crate) fn remove(&mut self, init_handle: InitHandle) {
        self.sessions.remove(&init_handle);
    }

    pub(crate) fn clear(&mut self) {
        self.sessions.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Dynamic channel listener registered by a plugin.
#[derive(Clone)]
pub(crate) struct Listener {
    pub(crate) owner: InitHandle,
    pub(crate) delivery: Delivery,
}

#[derive(Default)]
pub(crate) struct Listeners {
    by_name: HashMap<SmolStr, Listener>,
}

impl Listeners {
    pub(crate) fn insert(&mut self, name: SmolStr, listener: Listener) -> Result<(), ChannelError> {
        if self.by_name.contains_key(&name) {
            return Err(ChannelError::DuplicateName(name));
        }
        self.by_name.insert(name, listener);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Listener, ChannelError> {
        self.by_name
            .get(name)
            .ok_or_else(|| ChannelError::NotFound(Lookup::Listener(SmolStr::new(name))))
    }

    pub(crate) fn remove_owned_by(&mut self, owner: InitHandle) {
        self.by_name.retain(|_, listener| listener.owner != owner);
    }

    pub(crate) fn clear(&mut self) {
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::{InitContext, VirtualChannelEntry};

    struct Dummy(&'static str);

    impl VirtualChannelEntry for Dummy {
        fn name(&self) -> &str {
            self.0
        }

        fn entry(&self, _: &mut InitContext<'_>) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn same_entry_point_twice_is_rejected() {
        let mut registry = PluginRegistry::new(4);
        let entry = EntryPoint::Native(Arc::new(Dummy("rdpsnd")));

        let first = registry.insert(entry.clone(), None).unwrap();
        let error = registry.insert(entry, None).unwrap_err();

        assert!(matches!(error, ChannelError::AlreadyRegistered(handle) if handle == first));
        assert_eq!(1, registry.len());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = PluginRegistry::new(1);
        registry.insert(EntryPoint::native(Dummy("a")), None).unwrap();

        let error = registry.insert(EntryPoint::native(Dummy("b")), None).unwrap_err();
        assert!(matches!(error, ChannelError::CapacityExceeded { max: 1, .. }));
    }

    #[test]
    fn removed_handles_are_not_reused() {
        let mut registry = PluginRegistry::new(4);
        let first = registry.insert(EntryPoint::native(Dummy("a")), None).unwrap();
        registry.remove(first);

        let second = registry.insert(EntryPoint::native(Dummy("a")), None).unwrap();
        assert_ne!(first, second);
        assert!(registry.get(first).is_err());
    }

    #[test]
    fn sessions_track_entry() {
        let mut sessions = InitSessions::default();
        let handle = InitHandle::new(1);

        sessions.begin(handle);
        assert!(sessions.is_in_entry(handle));

        sessions.entry_returned(handle);
        assert!(!sessions.is_in_entry(handle));
        assert!(sessions.contains(handle));

        sessions.remove(handle);
        assert_eq!(0, sessions.len());
    }
}
