//! # Reverse Mapping
//!
//! Records linking a cache line back to the translation entries and
//! owning tasks that reference it. A record is added when a translation
//! entry is installed and removed when that entry is torn down or the
//! line is evicted; a line's mapping count always equals the length of
//! its collection, and only a line with an empty collection is evictable.

use lattice_hal::VirtualAddress;
use lattice_memory::{AddressSpace, SlotPtr};

use alloc::vec::Vec;

use crate::fill::NodeId;
use crate::task::Task;
use crate::Pcache;

/// One translation entry currently mapping a cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmapEntry {
    /// Location of the leaf translation slot.
    pub slot: SlotPtr,
    /// Identity of the owning address space.
    pub aspace_id: u64,
    /// Thread-group id of the owning task.
    pub owner_tgid: u32,
    /// Remote node holding the owner's backing memory.
    pub home_node: NodeId,
    /// Virtual address mapped through the slot.
    pub address: VirtualAddress,
}

impl Pcache<'_> {
    /// Record that `slot` now maps the line at `index`.
    ///
    /// Called with the translation-entry lock held, after the entry has
    /// been installed and before the line is marked valid: eviction must
    /// never see a valid line whose reverse map is missing. The recorded
    /// address is line-aligned; pending lists and flushes key on it.
    pub(crate) fn add_rmap(
        &self,
        index: usize,
        slot: SlotPtr,
        aspace_id: u64,
        task: &Task,
        address: VirtualAddress,
    ) {
        let entry = RmapEntry {
            slot,
            aspace_id,
            owner_tgid: task.tgid,
            home_node: task.home_node,
            address: self.geometry().line_align(address),
        };
        let set = self.set_of_line(index);
        let meta = self.meta(index);

        let _guard = set.lock();
        meta.rmap().push(entry);
        meta.inc_mapcount();
    }

    /// Remove the record for `slot` from the line at `index`.
    ///
    /// Used by translation teardown; eviction drains the whole collection
    /// with [`Pcache::take_rmaps`] instead.
    pub(crate) fn remove_rmap(&self, index: usize, slot: SlotPtr) -> Option<RmapEntry> {
        let set = self.set_of_line(index);
        let meta = self.meta(index);

        let _guard = set.lock();
        let mut rmap = meta.rmap();
        let position = rmap.iter().position(|r| r.slot == slot)?;
        let entry = rmap.swap_remove(position);
        meta.dec_mapcount();
        Some(entry)
    }

    /// Drain every reverse-mapping record of the line at `index`.
    ///
    /// The mapping count is left untouched: the caller decrements it as
    /// it actually clears each translation entry.
    pub(crate) fn take_rmaps(&self, index: usize) -> Vec<RmapEntry> {
        let set = self.set_of_line(index);
        let meta = self.meta(index);

        let _guard = set.lock();
        let mut rmap = meta.rmap();
        core::mem::take(&mut *rmap)
    }

    /// Tear down the translation of `address`, detaching it from its
    /// cache line.
    ///
    /// The dirty bit of the cleared entry is folded into the line's
    /// state; when the last mapping goes, dirty content is flushed to its
    /// owner right here, because a line with an empty reverse map keeps
    /// no record of where it belongs. The line itself stays resident and
    /// becomes a freeable eviction candidate. Returns whether a mapping
    /// existed.
    pub fn zap(&self, mm: &AddressSpace, address: VirtualAddress) -> bool {
        let Some(slot) = mm.walk(address) else {
            return false;
        };

        let removed = {
            let guard = slot.lock();
            let entry = guard.get();
            if !entry.is_present() {
                return false;
            }
            let Some(index) = self.line_index_of_entry(entry) else {
                return false;
            };

            if entry.is_dirty() {
                self.meta(index).set_dirty();
            }
            guard.clear();
            self.remove_rmap(index, slot.slot_ptr()).map(|rmap| (index, rmap))
        };
        let Some((index, rmap)) = removed else {
            return true;
        };

        // Last mapping gone and content dirty: flush now, with the entry
        // lock already dropped and the line lock taken the blocking way.
        let meta = self.meta(index);
        if meta.mapcount() == 0 && meta.is_dirty() {
            meta.lock();
            if meta.is_valid() && meta.test_and_clear_dirty() && !self.flush_line(index, &[rmap])
            {
                meta.set_dirty_relaxed();
            }
            meta.unlock();
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
