use core::fmt;
use core::marker::PhantomData;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
        pub struct $name($inner);

        impl $name {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Handle assigned to a registered plugin
    InitHandle(u32),
    "init"
);

handle_type!(
    /// Handle assigned to an open channel
    OpenHandle(u32),
    "ch"
);

handle_type!(
    /// Static channel identifier assigned by the peer when the channel is joined
    RemoteChannelId(u16),
    "remote"
);

handle_type!(
    /// Opaque caller tag echoed back in write-complete events
    UserTag(u64),
    "tag"
);

handle_type!(
    /// Identifies an in-flight write between the manager and the transport
    WriteToken(u64),
    "write"
);

/// Static channel option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelOptions(u32);

impl ChannelOptions {
    pub const NONE: Self = Self(0);
    pub const INITIALIZED: Self = Self(0x8000_0000);
    pub const ENCRYPT_RDP: Self = Self(0x4000_0000);
    pub const ENCRYPT_SC: Self = Self(0x2000_0000);
    pub const ENCRYPT_CS: Self = Self(0x1000_0000);
    pub const PRI_HIGH: Self = Self(0x0800_0000);
    pub const PRI_MED: Self = Self(0x0400_0000);
    pub const PRI_LOW: Self = Self(0x0200_0000);
    pub const COMPRESS_RDP: Self = Self(0x0080_0000);
    pub const COMPRESS: Self = Self(0x0040_0000);
    pub const SHOW_PROTOCOL: Self = Self(0x0020_0000);
    pub const REMOTE_CONTROL_PERSISTENT: Self = Self(0x0010_0000);

    /// Not sent on the wire: marks channels created through the dynamic channel bridge.
    pub const DYNAMIC: Self = Self(0x0000_0001);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for ChannelOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

pub(crate) trait Id: Copy + From<u32> {}

impl Id for InitHandle {}

impl Id for OpenHandle {}

/// Monotonic handle allocator
///
/// Handles start at 1 and are never handed out twice, so a stale handle can never
/// alias a record created later.
pub(crate) struct HandleAllocator<T: Id> {
    next: u32,
    _pd: PhantomData<T>,
}

impl<T: Id> Default for HandleAllocator<T> {
    fn default() -> Self {
        Self {
            next: 1,
            _pd: PhantomData,
        }
    }
}

impl<T: Id> HandleAllocator<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle
    ///
    /// Returns `None` once the handle space is exhausted.
    pub(crate) fn alloc(&mut self) -> Option<T> {
        let value = self.next;
        self.next = value.checked_add(1)?;
        Some(T::from(value))
    }
}

#[derive(Default)]
pub(crate) struct TokenAllocator {
    next: u64,
}

impl TokenAllocator {
    pub(crate) fn alloc(&mut self) -> WriteToken {
        self.next = self.next.wrapping_add(1);
        WriteToken(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_monotonic() {
        let mut allocator = HandleAllocator::<OpenHandle>::new();
        let first = allocator.alloc().unwrap();
        let second = allocator.alloc().unwrap();
        assert_eq!(OpenHandle::new(1), first);
        assert!(second > first);
    }

    #[test]
    fn allocator_exhaustion() {
        let mut allocator = HandleAllocator::<InitHandle> {
            next: u32::MAX,
            _pd: PhantomData,
        };
        assert!(allocator.alloc().is_none());
    }

    #[test]
    fn display() {
        assert_eq!("ch#4", OpenHandle::new(4).to_string());
        assert_eq!("init#2", InitHandle::new(2).to_string());
        assert_eq!("remote#1004", RemoteChannelId::new(1004).to_string());
    }

    #[test]
    fn options() {
        let options = ChannelOptions::INITIALIZED | ChannelOptions::SHOW_PROTOCOL;
        assert!(options.contains(ChannelOptions::SHOW_PROTOCOL));
        assert!(!options.contains(ChannelOptions::DYNAMIC));
        assert_eq!("0x80200000", options.to_string());
    }
}
