#![expect(clippy::unwrap_used, reason = "test code can panic on errors")]

mod common;

use core::ffi::{c_char, c_void, CStr};

use bytes::Bytes;
use common::*;
use parking_lot::Mutex;
use vchan_manager::ffi::*;
use vchan_manager::*;

/// Functions received by a C plugin in its entry point
#[derive(Clone, Copy)]
struct EntryTable {
    manager: *const c_void,
    init: VirtualChannelInitFn,
    open: VirtualChannelOpenFn,
    close: VirtualChannelCloseFn,
    write: VirtualChannelWriteFn,
}

// SAFETY: The manager pointer is only ever handed back to the manager, which is thread-safe.
unsafe impl Send for EntryTable {}

/// State of a C plugin, reached through its `user_param` in callbacks
struct CPlugin {
    table: Mutex<Option<EntryTable>>,
    init_results: Mutex<Vec<u32>>,
    init_events: Mutex<Vec<u32>>,
    opened: Mutex<Option<(u32, u32)>>,
    events: Mutex<Vec<(u32, u32, Vec<u8>)>>,
}

impl CPlugin {
    const fn new() -> Self {
        Self {
            table: Mutex::new(None),
            init_results: Mutex::new(Vec::new()),
            init_events: Mutex::new(Vec::new()),
            opened: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    fn user_param(&'static self) -> *mut c_void {
        core::ptr::from_ref(self).cast_mut().cast()
    }

    fn table(&self) -> EntryTable {
        self.table.lock().unwrap()
    }

    /// Keeps the table and calls `virtual_channel_init` with one definition per name.
    fn init(&'static self, entry_points: &ChannelEntryPoints, init_handle: u32, names: &[&str]) -> u32 {
        *self.table.lock() = Some(EntryTable {
            manager: entry_points.manager,
            init: entry_points.virtual_channel_init,
            open: entry_points.virtual_channel_open,
            close: entry_points.virtual_channel_close,
            write: entry_points.virtual_channel_write,
        });

        let defs = names.iter().map(|name| channel_def(name)).collect::<Vec<_>>();

        let table = self.table();

        // SAFETY: `defs` holds `defs.len()` definitions and lives for the whole call.
        let rc = unsafe {
            (table.init)(
                table.manager,
                init_handle,
                self.user_param(),
                defs.as_ptr(),
                u32::try_from(defs.len()).unwrap(),
                VIRTUAL_CHANNEL_VERSION_WIN2000,
                Some(on_init_event),
            )
        };

        self.init_results.lock().push(rc);

        rc
    }

    fn open(&self, init_handle: u32, name: &CStr) -> (u32, u32) {
        let table = self.table();
        let mut open_handle = 0;

        // SAFETY: `open_handle` and `name` are valid for the whole call.
        let rc = unsafe {
            (table.open)(
                table.manager,
                init_handle,
                &mut open_handle,
                name.as_ptr(),
                Some(on_open_event),
            )
        };

        (rc, open_handle)
    }

    fn write(&self, open_handle: u32, data: &[u8], user_tag: u64) -> u32 {
        let table = self.table();

        // SAFETY: `data` is valid for its length for the whole call.
        unsafe {
            (table.write)(
                table.manager,
                open_handle,
                data.as_ptr().cast(),
                u32::try_from(data.len()).unwrap(),
                user_tag,
            )
        }
    }

    fn close(&self, open_handle: u32) -> u32 {
        let table = self.table();

        // SAFETY: The manager pointer comes from the entry point table.
        unsafe { (table.close)(table.manager, open_handle) }
    }
}

fn channel_def(name: &str) -> ChannelDef {
    let mut raw: [c_char; 8] = [0; 8];
    for (dst, src) in raw.iter_mut().zip(name.bytes()) {
        *dst = c_char::try_from(src).unwrap();
    }

    ChannelDef { name: raw, options: 0 }
}

/// # Safety
///
/// `user_param` must point to a static `CPlugin`.
unsafe fn plugin(user_param: *mut c_void) -> &'static CPlugin {
    // SAFETY: Forwarded from the caller contract.
    unsafe { &*user_param.cast::<CPlugin>() }
}

unsafe extern "C" fn on_init_event(
    user_param: *mut c_void,
    init_handle: u32,
    event: u32,
    _data: *const c_void,
    _data_length: u32,
) {
    // SAFETY: Every plugin of this file passes a static `CPlugin` as user parameter.
    let plugin = unsafe { plugin(user_param) };

    plugin.init_events.lock().push(event);

    if event == CHANNEL_EVENT_CONNECTED {
        let opened = plugin.open(init_handle, c"cliprdr");
        *plugin.opened.lock() = Some(opened);
    }
}

unsafe extern "C" fn on_open_event(
    user_param: *mut c_void,
    open_handle: u32,
    event: u32,
    data: *const c_void,
    data_length: u32,
    _total_length: u32,
    _data_flags: u32,
) {
    // SAFETY: Every plugin of this file passes a static `CPlugin` as user parameter.
    let plugin = unsafe { plugin(user_param) };

    let payload = if data.is_null() {
        Vec::new()
    } else {
        // SAFETY: The manager guarantees `data` is valid for `data_length` bytes during the call.
        unsafe { core::slice::from_raw_parts(data.cast::<u8>(), data_length as usize) }.to_vec()
    };

    plugin.events.lock().push((open_handle, event, payload));
}

static CLIPRDR: CPlugin = CPlugin::new();

unsafe extern "C" fn cliprdr_entry(entry_points: *const ChannelEntryPoints, init_handle: u32) -> i32 {
    // SAFETY: The table is valid for the duration of the entry point.
    let entry_points = unsafe { &*entry_points };
    i32::from(CLIPRDR.init(entry_points, init_handle, &["cliprdr"]) == CHANNEL_RC_OK)
}

static TWICE: CPlugin = CPlugin::new();

unsafe extern "C" fn init_twice_entry(entry_points: *const ChannelEntryPoints, init_handle: u32) -> i32 {
    // SAFETY: The table is valid for the duration of the entry point.
    let entry_points = unsafe { &*entry_points };
    TWICE.init(entry_points, init_handle, &["rail"]);
    TWICE.init(entry_points, init_handle, &["rdpdr"]);
    1
}

static REFUSING: CPlugin = CPlugin::new();

unsafe extern "C" fn refusing_entry(entry_points: *const ChannelEntryPoints, init_handle: u32) -> i32 {
    // SAFETY: The table is valid for the duration of the entry point.
    let entry_points = unsafe { &*entry_points };
    REFUSING.init(entry_points, init_handle, &["rdpsnd"]);
    0
}

#[test]
fn c_plugin_opens_writes_and_receives() {
    let (manager, transport) = manager_with(static_config());
    let init = manager.register(EntryPoint::Ffi(cliprdr_entry), None).unwrap();
    assert_eq!(vec![CHANNEL_RC_OK], *CLIPRDR.init_results.lock());
    assert_eq!("cliprdr", manager.declared_channels()[0].name);

    manager.pre_connect().unwrap();
    manager
        .post_connect(&[JoinedChannel::new("cliprdr", RemoteChannelId::new(1004))])
        .unwrap();

    assert_eq!(
        vec![CHANNEL_EVENT_INITIALIZED, CHANNEL_EVENT_CONNECTED],
        *CLIPRDR.init_events.lock()
    );
    let (rc, handle) = CLIPRDR.opened.lock().unwrap();
    assert_eq!(CHANNEL_RC_OK, rc);
    assert_eq!(Some(handle), manager.find("cliprdr").map(|info| info.handle.get()).ok());

    assert_eq!(CHANNEL_RC_OK, CLIPRDR.write(handle, b"hi", 77));
    let requests = transport.take();
    assert_eq!(1, requests.len());
    assert_eq!(Bytes::from_static(b"hi"), requests[0].data);

    manager.on_write_complete(requests[0].completion.unwrap()).unwrap();
    manager
        .on_data_received(
            RemoteChannelId::new(1004),
            Bytes::from_static(b"yo"),
            2,
            ChunkFlags::ONLY,
        )
        .unwrap();
    assert_eq!(2, manager.dispatch_pending().unwrap());

    assert_eq!(
        vec![
            (handle, CHANNEL_EVENT_WRITE_COMPLETE, vec![77, 0, 0, 0, 0, 0, 0, 0]),
            (handle, CHANNEL_EVENT_DATA_RECEIVED, b"yo".to_vec()),
        ],
        *CLIPRDR.events.lock()
    );

    let table = CLIPRDR.table();

    // SAFETY: A null buffer is rejected before being read.
    let rc = unsafe { (table.write)(table.manager, handle, core::ptr::null(), 2, 1) };
    assert_eq!(CHANNEL_RC_NULL_DATA, rc);

    assert_eq!(CHANNEL_RC_ZERO_LENGTH, CLIPRDR.write(handle, &[], 1));
    assert_eq!(CHANNEL_RC_UNKNOWN_CHANNEL_NAME, CLIPRDR.open(init.get(), c"rdpsnd").0);

    // SAFETY: No definition is read, the call is rejected outside of the entry point.
    let rc = unsafe {
        (table.init)(
            table.manager,
            init.get(),
            CLIPRDR.user_param(),
            core::ptr::null(),
            0,
            VIRTUAL_CHANNEL_VERSION_WIN2000,
            None,
        )
    };
    assert_eq!(CHANNEL_RC_NOT_IN_VIRTUALCHANNELENTRY, rc);

    // SAFETY: A null manager is rejected before anything else.
    let rc = unsafe { (table.close)(core::ptr::null(), handle) };
    assert_eq!(CHANNEL_RC_INVALID_INSTANCE, rc);

    assert_eq!(CHANNEL_RC_OK, CLIPRDR.close(handle));
    assert_eq!(CHANNEL_RC_NOT_OPEN, CLIPRDR.write(handle, b"late", 78));
    assert_eq!(0, manager.dispatch_pending().unwrap());
    assert_eq!(2, CLIPRDR.events.lock().len());
}

#[test]
fn second_init_in_entry_is_rejected() {
    let (manager, _) = manager_with(static_config());
    manager.register(EntryPoint::Ffi(init_twice_entry), None).unwrap();

    assert_eq!(
        vec![CHANNEL_RC_OK, CHANNEL_RC_ALREADY_INITIALIZED],
        *TWICE.init_results.lock()
    );

    let declared = manager.declared_channels();
    assert_eq!(1, declared.len());
    assert_eq!("rail", declared[0].name);
}

#[test]
fn failing_c_entry_point_aborts_registration() {
    let (manager, _) = manager_with(static_config());

    let error = manager.register(EntryPoint::Ffi(refusing_entry), None).unwrap_err();
    assert!(matches!(error, ChannelError::EntryFailed { .. }));
    assert_eq!(CHANNEL_RC_INITIALIZATION_ERROR, error.code());

    assert_eq!(vec![CHANNEL_RC_OK], *REFUSING.init_results.lock());
    assert!(manager.declared_channels().is_empty());
}
