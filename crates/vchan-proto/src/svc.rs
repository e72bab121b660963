//! Static virtual channel constants shared by the channel manager and its transports.

use core::fmt;

/// Maximum payload carried by one static channel chunk.
pub const CHANNEL_CHUNK_LENGTH: usize = 1600;

/// Maximum length of a static channel name, excluding the null terminator.
pub const CHANNEL_NAME_LEN: usize = 7;

/// Flags attached to each chunk of a static channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChunkFlags(u32);

impl ChunkFlags {
    pub const NONE: Self = Self(0);
    pub const FIRST: Self = Self(0x0000_0001);
    pub const LAST: Self = Self(0x0000_0002);
    /// Complete message in a single chunk.
    pub const ONLY: Self = Self(0x0000_0003);
    pub const SHOW_PROTOCOL: Self = Self(0x0000_0010);
    pub const SUSPEND: Self = Self(0x0000_0020);
    pub const RESUME: Self = Self(0x0000_0040);

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

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_first(self) -> bool {
        self.contains(Self::FIRST)
    }

    pub const fn is_last(self) -> bool {
        self.contains(Self::LAST)
    }
}

impl core::ops::BitOr for ChunkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for ChunkFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Returns `true` if `name` is acceptable as a static channel name.
///
/// Names are 1 to 7 printable ASCII characters.
pub fn is_valid_static_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= CHANNEL_NAME_LEN && name.bytes().all(|b| b.is_ascii_graphic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_flags_only_is_first_and_last() {
        assert!(ChunkFlags::ONLY.is_first());
        assert!(ChunkFlags::ONLY.is_last());
        assert_eq!(ChunkFlags::FIRST | ChunkFlags::LAST, ChunkFlags::ONLY);
        assert!(!ChunkFlags::FIRST.is_last());
        assert_eq!(ChunkFlags::LAST, ChunkFlags::ONLY.without(ChunkFlags::FIRST));
    }

    #[test]
    fn static_names() {
        assert!(is_valid_static_name("cliprdr"));
        assert!(is_valid_static_name("rdpdr"));
        assert!(!is_valid_static_name(""));
        assert!(!is_valid_static_name("toolongname"));
        assert!(!is_valid_static_name("a b"));
    }
}
