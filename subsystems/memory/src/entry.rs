//! # Translation Entries
//!
//! The leaf translation word: a line-aligned physical address plus a set
//! of software flag bits, packed into one `u64` so the word can be read
//! and published atomically.

use core::fmt;

use lattice_hal::PhysicalAddress;

/// Mask selecting the physical-address bits of an entry word.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Flag bits of a leaf translation entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// The entry maps a live cache line.
        const PRESENT = 1 << 0;
        /// Writes through this translation are allowed.
        const WRITABLE = 1 << 1;
        /// The mapping is reachable from user context.
        const USER_ACCESSIBLE = 1 << 2;
        /// The translation has been used since install (recently used).
        const ACCESSED = 1 << 5;
        /// The cached content differs from the remote copy.
        const DIRTY = 1 << 6;
    }
}

/// A decoded leaf translation entry.
///
/// `Entry` is a plain value; the atomic storage lives in the leaf table
/// slot it was read from. Comparing two entries (the original `pte_same`
/// check) compares the full raw word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// The empty (never-mapped) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build an entry mapping `addr` with `flags`.
    ///
    /// The address must be line-aligned; only the bits under
    /// [`ENTRY_ADDR_MASK`] are kept.
    #[inline]
    pub const fn new(addr: PhysicalAddress, flags: EntryFlags) -> Self {
        Self((addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Reconstruct an entry from a raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check whether the entry has never been populated.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check the present bit.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Check the writable bit.
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & EntryFlags::WRITABLE.bits() != 0
    }

    /// Check the dirty bit.
    #[inline]
    pub const fn is_dirty(self) -> bool {
        self.0 & EntryFlags::DIRTY.bits() != 0
    }

    /// Check the accessed bit.
    #[inline]
    pub const fn is_accessed(self) -> bool {
        self.0 & EntryFlags::ACCESSED.bits() != 0
    }

    /// Get the mapped physical address.
    #[inline]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ENTRY_ADDR_MASK)
    }

    /// Get the flag bits.
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Return this entry with the dirty bit set.
    #[inline]
    pub const fn mk_dirty(self) -> Self {
        Self(self.0 | EntryFlags::DIRTY.bits())
    }

    /// Return this entry with the accessed bit set.
    #[inline]
    pub const fn mk_young(self) -> Self {
        Self(self.0 | EntryFlags::ACCESSED.bits())
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Entry(none)")
        } else {
            write!(f, "Entry({} {:?})", self.address(), self.flags())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
