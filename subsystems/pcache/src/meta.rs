//! # Cache Line Metadata
//!
//! One descriptor per cache line: a small atomic state word, the mapping
//! count, and the reverse-mapping collection. Descriptors live in their
//! own contiguous arena (not co-located with the data they describe) and
//! are addressed by the same set-index/way decomposition.
//!
//! ## State bits
//!
//! - `locked`:    exclusive ownership of this line's metadata/content
//!   transition. Paths that may wait use [`PcacheMeta::lock`]; paths that
//!   must never block use [`PcacheMeta::try_lock`] and abort on failure.
//! - `allocated`: the line is claimed, but may not hold valid data yet.
//! - `valid`:     content and mapping are live; the line is visible to
//!   eviction scanning and can satisfy future accesses.
//! - `dirty`:     content differs from the remote copy.
//! - `writeback`: a flush to the remote owner is in flight.
//!
//! Every bit has atomic test/set/clear and test-and-set/test-and-clear
//! forms plus relaxed variants for callers that already hold the line
//! lock. Transitions are invariant-preserving: `allocated` is set before
//! any fill starts, `valid` only after the translation entry and reverse
//! map both exist, and clearing `valid` then `allocated` is the terminal
//! step of eviction.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::geometry::PCACHE_META_SIZE;
use crate::rmap::RmapEntry;

bitflags::bitflags! {
    /// The state word of one cache line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineState: u8 {
        /// Line is locked; do not touch.
        const LOCKED = 1 << 0;
        /// Line is allocated, but may not be valid.
        const ALLOCATED = 1 << 1;
        /// Line has a valid mapping and content.
        const VALID = 1 << 2;
        /// Line content differs from remote memory.
        const DIRTY = 1 << 3;
        /// Line is being written back to remote memory.
        const WRITEBACK = 1 << 4;
    }
}

/// Generates the access-method family for one state bit: test, set,
/// clear, atomic test-and-set / test-and-clear, and relaxed set/clear
/// for callers that already hold the line lock.
macro_rules! meta_bit {
    ($bit:expr,
     $is:ident, $set:ident, $clear:ident,
     $test_set:ident, $test_clear:ident,
     $set_relaxed:ident, $clear_relaxed:ident) => {
        #[inline]
        pub fn $is(&self) -> bool {
            self.bits.load(Ordering::Acquire) & $bit.bits() != 0
        }

        #[inline]
        pub fn $set(&self) {
            self.bits.fetch_or($bit.bits(), Ordering::AcqRel);
        }

        #[inline]
        pub fn $clear(&self) {
            self.bits.fetch_and(!$bit.bits(), Ordering::AcqRel);
        }

        /// Set the bit, returning whether it was already set.
        #[inline]
        pub fn $test_set(&self) -> bool {
            self.bits.fetch_or($bit.bits(), Ordering::AcqRel) & $bit.bits() != 0
        }

        /// Clear the bit, returning whether it was set.
        #[inline]
        pub fn $test_clear(&self) -> bool {
            self.bits.fetch_and(!$bit.bits(), Ordering::AcqRel) & $bit.bits() != 0
        }

        /// Relaxed set; the caller must hold the line lock.
        #[inline]
        pub fn $set_relaxed(&self) {
            self.bits.fetch_or($bit.bits(), Ordering::Relaxed);
        }

        /// Relaxed clear; the caller must hold the line lock.
        #[inline]
        pub fn $clear_relaxed(&self) {
            self.bits.fetch_and(!$bit.bits(), Ordering::Relaxed);
        }
    };
}

/// Metadata for one cache line.
///
/// Aligned to the CPU cacheline size to keep descriptor ping-pong between
/// cores off the fault path.
#[repr(align(64))]
pub struct PcacheMeta {
    bits: AtomicU8,
    mapcount: AtomicU32,
    rmap: Mutex<Vec<RmapEntry>>,
}

// A descriptor must fit the slot the geometry reserves for it.
const_assert!(core::mem::size_of::<PcacheMeta>() <= PCACHE_META_SIZE as usize);

impl PcacheMeta {
    /// Create an unlocked, unallocated descriptor.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
            mapcount: AtomicU32::new(0),
            rmap: Mutex::new(Vec::new()),
        }
    }

    meta_bit!(
        LineState::LOCKED,
        is_locked, set_locked, clear_locked,
        test_and_set_locked, test_and_clear_locked,
        set_locked_relaxed, clear_locked_relaxed
    );
    meta_bit!(
        LineState::ALLOCATED,
        is_allocated, set_allocated, clear_allocated,
        test_and_set_allocated, test_and_clear_allocated,
        set_allocated_relaxed, clear_allocated_relaxed
    );
    meta_bit!(
        LineState::VALID,
        is_valid, set_valid, clear_valid,
        test_and_set_valid, test_and_clear_valid,
        set_valid_relaxed, clear_valid_relaxed
    );
    meta_bit!(
        LineState::DIRTY,
        is_dirty, set_dirty, clear_dirty,
        test_and_set_dirty, test_and_clear_dirty,
        set_dirty_relaxed, clear_dirty_relaxed
    );
    meta_bit!(
        LineState::WRITEBACK,
        is_writeback, set_writeback, clear_writeback,
        test_and_set_writeback, test_and_clear_writeback,
        set_writeback_relaxed, clear_writeback_relaxed
    );

    /// Snapshot the state word.
    #[inline]
    pub fn state(&self) -> LineState {
        LineState::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// Blocking line-lock acquisition.
    ///
    /// May wait; callers must hold no translation-entry lock here.
    pub fn lock(&self) {
        loop {
            if !self.test_and_set_locked() {
                return;
            }
            while self.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    /// Non-blocking line-lock acquisition.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.test_and_set_locked()
    }

    /// Release the line lock.
    #[inline]
    pub fn unlock(&self) {
        self.clear_locked();
    }

    /// Number of translation entries currently pointing at this line.
    #[inline]
    pub fn mapcount(&self) -> u32 {
        self.mapcount.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn inc_mapcount(&self) -> u32 {
        self.mapcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub(crate) fn dec_mapcount(&self) -> u32 {
        self.mapcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Lock the reverse-mapping collection.
    ///
    /// Cross-way consistency additionally requires the owning set's lock;
    /// this inner lock only makes the storage itself sound.
    #[inline]
    pub(crate) fn rmap(&self) -> MutexGuard<'_, Vec<RmapEntry>> {
        self.rmap.lock()
    }

    /// Dump this descriptor through the logger with a reason tag.
    pub fn dump(&self, reason: &str) {
        log::error!(
            "pcache: meta dump ({}): state={:?} mapcount={} rmaps={}",
            reason,
            self.state(),
            self.mapcount(),
            self.rmap.lock().len()
        );
    }
}

impl Default for PcacheMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PcacheMeta {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcacheMeta")
            .field("state", &self.state())
            .field("mapcount", &self.mapcount())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
