//! Unified kernel event mask.
//!
//! fanotify mirrors the low inotify bits (`FAN_ACCESS == IN_ACCESS`,
//! `FAN_MODIFY == IN_MODIFY`, and so on up to `FAN_ONDIR == IN_ISDIR`),
//! so events from both channels can be folded into one mask and the
//! aggregator never has to care which driver observed an access.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u64 {
        const ACCESS = 0x0000_0001;
        const MODIFY = 0x0000_0002;
        const ATTRIB = 0x0000_0004;
        const CLOSE_WRITE = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN = 0x0000_0020;
        const MOVED_FROM = 0x0000_0040;
        const MOVED_TO = 0x0000_0080;
        const CREATE = 0x0000_0100;
        const DELETE = 0x0000_0200;
        const DELETE_SELF = 0x0000_0400;
        const MOVE_SELF = 0x0000_0800;
        const UNMOUNT = 0x0000_2000;
        const Q_OVERFLOW = 0x0000_4000;
        const IGNORED = 0x0000_8000;
        const OPEN_PERM = 0x0001_0000;
        const ACCESS_PERM = 0x0002_0000;
        const ISDIR = 0x4000_0000;

        /// The inode left its path: either half of a rename, or the
        /// watched object itself moved.
        const INODE_MOVED = Self::MOVED_FROM.bits()
            | Self::MOVED_TO.bits()
            | Self::MOVE_SELF.bits();

        /// Permission-decision events; only fanotify produces these.
        const PERM = Self::OPEN_PERM.bits() | Self::ACCESS_PERM.bits();
    }
}

impl EventMask {
    /// Fold a raw inotify event mask into the unified mask.
    pub fn from_inotify_bits(bits: u32) -> EventMask {
        EventMask::from_bits_truncate(u64::from(bits))
    }

    /// Fold a raw fanotify event mask into the unified mask. Bits with
    /// no inotify counterpart are dropped.
    pub fn from_fanotify_bits(bits: u64) -> EventMask {
        EventMask::from_bits_truncate(bits)
    }
}
