use std::fmt;

use modular_bitfield::prelude::*;

/// Protection descriptor of a region. Bit positions follow the kernel's
/// `NK_ASPACE_*` flag layout.
#[bitfield(bits = 8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub pin: bool,
    pub kern: bool,
    pub swap: bool,
    pub eager: bool,
    #[skip]
    __: B1,
}

impl Protection {
    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    pub const EXEC: u8 = 1 << 2;
    pub const PIN: u8 = 1 << 3;
    pub const KERN: u8 = 1 << 4;
    pub const SWAP: u8 = 1 << 5;
    pub const EAGER: u8 = 1 << 6;

    pub fn from_flags(flags: u8) -> Self {
        Self::from_bytes([flags & 0x7f])
    }

    pub fn flags(self) -> u8 {
        self.into_bytes()[0]
    }

    /// True if `self` claims no more access than `other`: read, write and
    /// exec are each `<=`, and kernel-only is `>=`.
    pub fn leq(self, other: Protection) -> bool {
        self.read() <= other.read()
            && self.write() <= other.write()
            && self.exec() <= other.exec()
            && self.kern() >= other.kern()
    }

    /// A writable region grants reads too.
    pub fn allows(self, access: RequestedPermission) -> bool {
        match access {
            RequestedPermission::None => true,
            RequestedPermission::Read => self.write() || self.read(),
            RequestedPermission::Write => self.write(),
        }
    }
}

impl Default for Protection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.flags())
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            bit(self.read(), 'r'),
            bit(self.write(), 'w'),
            bit(self.exec(), 'x'),
            bit(self.kern(), 'k'),
            bit(self.pin(), 'p'),
        )
    }
}

/// Which fields of a region must match for a removal to succeed.
#[bitfield(bits = 8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MatchFlags {
    pub va: bool,
    pub pa: bool,
    pub len: bool,
    pub protect: bool,
    #[skip]
    __: B4,
}

impl MatchFlags {
    pub fn all() -> Self {
        Self::new()
            .with_va(true)
            .with_pa(true)
            .with_len(true)
            .with_protect(true)
    }

    pub fn matches(self, tracked: &Region, query: &Region) -> bool {
        (!self.va() || tracked.va_start == query.va_start)
            && (!self.pa() || tracked.pa_start == query.pa_start)
            && (!self.len() || tracked.len_bytes == query.len_bytes)
            && (!self.protect() || tracked.protection == query.protection)
    }
}

/// Strongest access latched on a region by `request_permission`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestedPermission {
    #[default]
    None,
    Read,
    Write,
}

impl RequestedPermission {
    pub fn for_access(is_write: bool) -> Self {
        if is_write {
            Self::Write
        } else {
            Self::Read
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub va_start: usize,
    pub pa_start: usize,
    pub len_bytes: usize,
    pub protection: Protection,
    pub requested: RequestedPermission,
}

impl Region {
    pub fn new(va_start: usize, pa_start: usize, len_bytes: usize, protection: Protection) -> Self {
        Self {
            va_start,
            pa_start,
            len_bytes,
            protection,
            requested: RequestedPermission::None,
        }
    }

    /// An identity-mapped region.
    pub fn identity(start: usize, len_bytes: usize, protection: Protection) -> Self {
        Self::new(start, start, len_bytes, protection)
    }

    /// Exclusive end of the virtual range.
    pub fn end(&self) -> usize {
        self.va_start.saturating_add(self.len_bytes)
    }

    pub fn is_identity(&self) -> bool {
        self.va_start == self.pa_start
    }

    pub fn is_pinned(&self) -> bool {
        self.protection.pin()
    }

    pub fn contains_address(&self, address: usize) -> bool {
        address >= self.va_start && address < self.end()
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.va_start >= self.va_start && other.end() <= self.end()
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.va_start < other.end() && other.va_start < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(VA={:#x} to PA={:#x}, len={:#x}, prot={:#x})",
            self.va_start,
            self.pa_start,
            self.len_bytes,
            self.protection.flags()
        )
    }
}
