//! Frozen C ABI for channel plugins built as shared libraries.
//!
//! A plugin exports `VirtualChannelEntryEx`. It is called once at registration with a
//! table of manager functions and the init handle assigned to the plugin. Layouts,
//! signatures and numeric codes in this module must never change.

use core::ffi::{c_char, c_void};

use crate::error::ChannelError;
use crate::event::{ChannelEvent, InitEvent};
use crate::handle::{ChannelOptions, InitHandle, OpenHandle, UserTag};
use crate::plugin::{ChannelEventHandler, Delivery};
use crate::ChannelManager;

pub const CHANNEL_RC_OK: u32 = 0;
pub const CHANNEL_RC_ALREADY_INITIALIZED: u32 = 1;
pub const CHANNEL_RC_NOT_INITIALIZED: u32 = 2;
pub const CHANNEL_RC_ALREADY_CONNECTED: u32 = 3;
pub const CHANNEL_RC_NOT_CONNECTED: u32 = 4;
pub const CHANNEL_RC_TOO_MANY_CHANNELS: u32 = 5;
pub const CHANNEL_RC_BAD_CHANNEL: u32 = 6;
pub const CHANNEL_RC_BAD_CHANNEL_HANDLE: u32 = 7;
pub const CHANNEL_RC_NO_BUFFER: u32 = 8;
pub const CHANNEL_RC_BAD_INIT_HANDLE: u32 = 9;
pub const CHANNEL_RC_NOT_OPEN: u32 = 10;
pub const CHANNEL_RC_BAD_PROC: u32 = 11;
pub const CHANNEL_RC_NO_MEMORY: u32 = 12;
pub const CHANNEL_RC_UNKNOWN_CHANNEL_NAME: u32 = 13;
pub const CHANNEL_RC_ALREADY_OPEN: u32 = 14;
pub const CHANNEL_RC_NOT_IN_VIRTUALCHANNELENTRY: u32 = 15;
pub const CHANNEL_RC_NULL_DATA: u32 = 16;
pub const CHANNEL_RC_ZERO_LENGTH: u32 = 17;
pub const CHANNEL_RC_INVALID_INSTANCE: u32 = 18;
pub const CHANNEL_RC_UNSUPPORTED_VERSION: u32 = 19;
pub const CHANNEL_RC_INITIALIZATION_ERROR: u32 = 20;

pub const CHANNEL_EVENT_INITIALIZED: u32 = 0;
pub const CHANNEL_EVENT_CONNECTED: u32 = 1;
pub const CHANNEL_EVENT_DISCONNECTED: u32 = 3;
pub const CHANNEL_EVENT_TERMINATED: u32 = 4;
pub const CHANNEL_EVENT_DATA_RECEIVED: u32 = 10;
pub const CHANNEL_EVENT_WRITE_COMPLETE: u32 = 11;
/// Reserved, never emitted.
pub const CHANNEL_EVENT_WRITE_CANCELLED: u32 = 12;
pub const CHANNEL_EVENT_CREATED: u32 = 20;
pub const CHANNEL_EVENT_CLOSED: u32 = 21;

pub const VIRTUAL_CHANNEL_VERSION_WIN2000: u32 = 1;

/// Symbol a plugin library must export.
pub const ENTRY_POINT_SYMBOL: &str = "VirtualChannelEntryEx";

/// Static channel declaration passed to `virtual_channel_init`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChannelDef {
    /// NUL-terminated unless all 8 bytes are used.
    pub name: [c_char; 8],
    pub options: u32,
}

impl ChannelDef {
    pub fn name(&self) -> Option<&str> {
        // SAFETY: `c_char` and `u8` have the same size and alignment, and the array is 8 bytes long.
        let bytes = unsafe { core::slice::from_raw_parts(self.name.as_ptr().cast::<u8>(), self.name.len()) };
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..len]).ok()
    }
}

pub type InitEventFn = unsafe extern "C" fn(
    user_param: *mut c_void,
    init_handle: u32,
    event: u32,
    data: *const c_void,
    data_length: u32,
);

pub type OpenEventFn = unsafe extern "C" fn(
    user_param: *mut c_void,
    open_handle: u32,
    event: u32,
    data: *const c_void,
    data_length: u32,
    total_length: u32,
    data_flags: u32,
);

pub type VirtualChannelInitFn = unsafe extern "C" fn(
    manager: *const c_void,
    init_handle: u32,
    user_param: *mut c_void,
    channels: *const ChannelDef,
    channel_count: u32,
    version: u32,
    init_event: Option<InitEventFn>,
) -> u32;

pub type VirtualChannelOpenFn = unsafe extern "C" fn(
    manager: *const c_void,
    init_handle: u32,
    open_handle: *mut u32,
    name: *const c_char,
    open_event: Option<OpenEventFn>,
) -> u32;

pub type VirtualChannelCloseFn = unsafe extern "C" fn(manager: *const c_void, open_handle: u32) -> u32;

pub type VirtualChannelWriteFn = unsafe extern "C" fn(
    manager: *const c_void,
    open_handle: u32,
    data: *const c_void,
    length: u32,
    user_tag: u64,
) -> u32;

/// Table handed to `VirtualChannelEntryEx`.
#[repr(C)]
pub struct ChannelEntryPoints {
    pub cb_size: u32,
    pub protocol_version: u32,
    pub manager: *const c_void,
    pub virtual_channel_init: VirtualChannelInitFn,
    pub virtual_channel_open: VirtualChannelOpenFn,
    pub virtual_channel_close: VirtualChannelCloseFn,
    pub virtual_channel_write: VirtualChannelWriteFn,
}

/// Returns non-zero on success.
pub type VirtualChannelEntryFn = unsafe extern "C" fn(entry_points: *const ChannelEntryPoints, init_handle: u32) -> i32;

/// Opaque pointer owned by the plugin, handed back on every callback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserParam(*mut c_void);

// SAFETY: The manager never dereferences the pointer, it only passes it back to the plugin,
// which is responsible for its own synchronization.
unsafe impl Send for UserParam {}

// SAFETY: Same as above.
unsafe impl Sync for UserParam {}

/// Init event callback of a C plugin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FfiHooks {
    init_event: Option<InitEventFn>,
    user_param: UserParam,
}

impl FfiHooks {
    pub(crate) fn notify_init(&self, init_handle: InitHandle, event: InitEvent) {
        let Some(init_event) = self.init_event else {
            return;
        };

        // SAFETY: The callback was supplied by the plugin in `virtual_channel_init`, and the plugin library
        // outlives the manager.
        unsafe {
            init_event(
                self.user_param.0,
                init_handle.get(),
                event.ffi_code(),
                core::ptr::null(),
                0,
            )
        };
    }
}

/// Forwards channel events to the open event callback of a C plugin.
struct FfiChannelHandler {
    open_event: OpenEventFn,
    user_param: UserParam,
}

impl ChannelEventHandler for FfiChannelHandler {
    fn on_event(&self, _: &ChannelManager, handle: OpenHandle, event: ChannelEvent) {
        let code = event.ffi_code();

        match &event {
            ChannelEvent::Created { name } => {
                self.call(handle, code, name.as_bytes(), 0, 0);
            }
            ChannelEvent::DataReceived {
                data,
                total_length,
                flags,
            } => {
                self.call(handle, code, data, *total_length, flags.bits());
            }
            ChannelEvent::WriteComplete { tag } => {
                let tag = u64::from(*tag);
                self.call(handle, code, &tag.to_ne_bytes(), 0, 0);
            }
            ChannelEvent::Closed => {
                self.call(handle, code, &[], 0, 0);
            }
        }
    }
}

impl FfiChannelHandler {
    fn call(&self, handle: OpenHandle, code: u32, data: &[u8], total_length: u32, flags: u32) {
        let Ok(data_length) = u32::try_from(data.len()) else {
            error!(%handle, len = data.len(), "Event payload is too large for the C ABI");
            return;
        };

        let data_ptr = if data.is_empty() {
            core::ptr::null()
        } else {
            data.as_ptr().cast::<c_void>()
        };

        // SAFETY: The callback was supplied by the plugin in `virtual_channel_open`. `data_ptr` is valid for
        // `data_length` bytes for the duration of the call.
        unsafe {
            (self.open_event)(
                self.user_param.0,
                handle.get(),
                code,
                data_ptr,
                data_length,
                total_length,
                flags,
            )
        };
    }
}

/// Runs the entry point of a C plugin.
pub(crate) fn call_entry(
    manager: &ChannelManager,
    entry: VirtualChannelEntryFn,
    init_handle: InitHandle,
) -> Result<(), ChannelError> {
    #[expect(clippy::cast_possible_truncation)] // The table is a few dozen bytes.
    let cb_size = core::mem::size_of::<ChannelEntryPoints>() as u32;

    let entry_points = ChannelEntryPoints {
        cb_size,
        protocol_version: VIRTUAL_CHANNEL_VERSION_WIN2000,
        manager: manager.as_ffi_ptr(),
        virtual_channel_init,
        virtual_channel_open,
        virtual_channel_close,
        virtual_channel_write,
    };

    // SAFETY: `entry` was resolved from a plugin library exporting the frozen entry point signature.
    // `entry_points` lives for the whole call.
    let ret = unsafe { entry(&entry_points, init_handle.get()) };

    if ret != 0 {
        Ok(())
    } else {
        Err(ChannelError::EntryFailed {
            plugin: manager
                .lookup(init_handle)
                .map(|info| info.name)
                .unwrap_or_else(|_| smol_str::SmolStr::new_inline("ffi")),
        })
    }
}

fn result_code(result: Result<(), ChannelError>) -> u32 {
    match result {
        Ok(()) => CHANNEL_RC_OK,
        Err(error) => {
            debug!(%error, "C ABI call failed");
            error.code()
        }
    }
}

/// # Safety
///
/// `manager` must be the pointer handed to the plugin in `ChannelEntryPoints`.
unsafe fn manager_from_ptr(manager: *const c_void) -> Option<ChannelManager> {
    // SAFETY: Forwarded from the caller contract.
    unsafe { ChannelManager::from_ffi_ptr(manager) }
}

unsafe extern "C" fn virtual_channel_init(
    manager: *const c_void,
    init_handle: u32,
    user_param: *mut c_void,
    channels: *const ChannelDef,
    channel_count: u32,
    version: u32,
    init_event: Option<InitEventFn>,
) -> u32 {
    // SAFETY: The plugin passes back the manager pointer it received.
    let Some(manager) = (unsafe { manager_from_ptr(manager) }) else {
        return CHANNEL_RC_INVALID_INSTANCE;
    };

    let init_handle = InitHandle::new(init_handle);

    if version < VIRTUAL_CHANNEL_VERSION_WIN2000 {
        return CHANNEL_RC_UNSUPPORTED_VERSION;
    }

    if !manager.is_in_entry(init_handle) {
        return CHANNEL_RC_NOT_IN_VIRTUALCHANNELENTRY;
    }

    if let Ok(Some(_)) = manager.ffi_hooks(init_handle) {
        return CHANNEL_RC_ALREADY_INITIALIZED;
    }

    let defs = if channel_count == 0 {
        &[][..]
    } else if channels.is_null() {
        return CHANNEL_RC_BAD_CHANNEL;
    } else {
        // SAFETY: The plugin guarantees `channels` points to `channel_count` definitions.
        unsafe { core::slice::from_raw_parts(channels, channel_count as usize) }
    };

    for def in defs {
        let Some(name) = def.name() else {
            return CHANNEL_RC_BAD_CHANNEL;
        };

        let code = result_code(manager.declare_channel(init_handle, name, ChannelOptions::from_bits(def.options)));
        if code != CHANNEL_RC_OK {
            return code;
        }
    }

    let hooks = FfiHooks {
        init_event,
        user_param: UserParam(user_param),
    };

    result_code(manager.set_ffi_hooks(init_handle, hooks))
}

unsafe extern "C" fn virtual_channel_open(
    manager: *const c_void,
    init_handle: u32,
    open_handle: *mut u32,
    name: *const c_char,
    open_event: Option<OpenEventFn>,
) -> u32 {
    // SAFETY: The plugin passes back the manager pointer it received.
    let Some(manager) = (unsafe { manager_from_ptr(manager) }) else {
        return CHANNEL_RC_INVALID_INSTANCE;
    };

    let init_handle = InitHandle::new(init_handle);

    if open_handle.is_null() || name.is_null() {
        return CHANNEL_RC_BAD_CHANNEL;
    }

    let Some(open_event) = open_event else {
        return CHANNEL_RC_BAD_PROC;
    };

    // SAFETY: `name` is non-null and the plugin guarantees it is NUL-terminated.
    let name = unsafe { core::ffi::CStr::from_ptr(name) };
    let Ok(name) = name.to_str() else {
        return CHANNEL_RC_BAD_CHANNEL;
    };

    let info = match manager.lookup(init_handle) {
        Ok(info) => info,
        Err(error) => return error.code(),
    };

    let Some(options) = info
        .declared_channels
        .iter()
        .find(|def| def.name == name)
        .map(|def| def.options)
    else {
        return CHANNEL_RC_UNKNOWN_CHANNEL_NAME;
    };

    let user_param = match manager.ffi_hooks(init_handle) {
        Ok(hooks) => hooks.map_or(UserParam(core::ptr::null_mut()), |hooks| hooks.user_param),
        Err(error) => return error.code(),
    };

    let handler = FfiChannelHandler { open_event, user_param };

    match manager.open(init_handle, name, options, Delivery::callback(handler)) {
        Ok(handle) => {
            // SAFETY: `open_handle` is non-null and points to a `u32` owned by the plugin.
            unsafe { open_handle.write(handle.get()) };
            CHANNEL_RC_OK
        }
        Err(error) => error.code(),
    }
}

unsafe extern "C" fn virtual_channel_close(manager: *const c_void, open_handle: u32) -> u32 {
    // SAFETY: The plugin passes back the manager pointer it received.
    let Some(manager) = (unsafe { manager_from_ptr(manager) }) else {
        return CHANNEL_RC_INVALID_INSTANCE;
    };

    result_code(manager.close_channel(OpenHandle::new(open_handle)))
}

unsafe extern "C" fn virtual_channel_write(
    manager: *const c_void,
    open_handle: u32,
    data: *const c_void,
    length: u32,
    user_tag: u64,
) -> u32 {
    // SAFETY: The plugin passes back the manager pointer it received.
    let Some(manager) = (unsafe { manager_from_ptr(manager) }) else {
        return CHANNEL_RC_INVALID_INSTANCE;
    };

    if data.is_null() {
        return CHANNEL_RC_NULL_DATA;
    }

    if length == 0 {
        return CHANNEL_RC_ZERO_LENGTH;
    }

    // SAFETY: `data` is non-null and the plugin guarantees it is valid for `length` bytes.
    let data = unsafe { core::slice::from_raw_parts(data.cast::<u8>(), length as usize) };

    // The plugin may reuse its buffer as soon as the call returns.
    let data = bytes::Bytes::copy_from_slice(data);

    result_code(manager.write(OpenHandle::new(open_handle), data, UserTag::new(user_tag)))
}
