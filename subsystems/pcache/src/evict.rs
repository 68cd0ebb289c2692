//! # Line Eviction
//!
//! Reclaims a valid line so allocation can reuse its way. A candidate
//! must be valid and unlocked; the scan takes line locks non-blockingly
//! and counts every collision with a concurrent owner. Reclaim then
//! tears down all reverse-mapped translation entries, flushes dirty
//! content back to the owner node, hands the line to the victim cache
//! when that policy is selected, and finally clears `valid` then
//! `allocated` - the terminal transition.
//!
//! Under the per-set-list policy the evicted addresses stay on the set's
//! pending-eviction list for the whole flush, so a refault of the same
//! address waits at the outer fault entry instead of reading a line
//! mid-flush.

use crate::fill::DEF_NET_TIMEOUT;
use crate::rmap::RmapEntry;
use crate::set::PsetEvent;
use crate::stat::PcacheEvent;
use crate::Pcache;

impl Pcache<'_> {
    /// Try to reclaim one way of `set_index`.
    ///
    /// Returns whether a way became allocatable.
    pub(crate) fn evict_line(&self, set_index: usize) -> bool {
        self.events().inc(PcacheEvent::EvictionTriggered);

        let Some(index) = self.find_candidate(set_index) else {
            self.events().inc(PcacheEvent::EvictionFailureFind);
            return false;
        };

        // The line lock is held from here to the terminal clears.
        let rmaps = self.take_rmaps(index);
        if rmaps.is_empty() {
            // Already unmapped (for example an earlier flush failure):
            // directly reclaimable.
            self.finish_reclaim(index);
            self.events().inc(PcacheEvent::EvictionEagainFreeable);
            return true;
        }

        #[cfg(feature = "eviction-perset-list")]
        for rmap in &rmaps {
            self.set(set_index).begin_eviction(rmap.aspace_id, rmap.address);
        }

        let dirty = self.unmap_rmaps(index, &rmaps);

        if dirty && !self.flush_line(index, &rmaps) {
            // The content could not reach its owner. Leave the line
            // valid-but-unmapped; a later pass reclaims it as freeable.
            self.events().inc(PcacheEvent::EvictionFailureEvict);
            self.meta(index).unlock();
            self.finish_pending(set_index, &rmaps);
            return false;
        }

        #[cfg(feature = "eviction-victim")]
        self.insert_victim(index, &rmaps);

        self.finish_reclaim(index);
        self.finish_pending(set_index, &rmaps);

        self.set(set_index).inc_stat(PsetEvent::Eviction);
        self.events().inc(PcacheEvent::EvictionSucceed);
        true
    }

    /// Scan the ways of a set for a valid, unowned line.
    ///
    /// On success the returned line's lock is held by this context.
    fn find_candidate(&self, set_index: usize) -> Option<usize> {
        let set = self.set(set_index);
        let _guard = set.lock();

        for slot in self.geometry().ways_of_set(set_index) {
            let meta = self.meta(slot.index);
            if !meta.is_valid() {
                continue;
            }
            if !meta.try_lock() {
                self.events().inc(PcacheEvent::EvictionEagainConcurrent);
                continue;
            }
            if meta.is_writeback() {
                meta.unlock();
                self.events().inc(PcacheEvent::EvictionEagainConcurrent);
                continue;
            }
            return Some(slot.index);
        }
        None
    }

    /// Clear every translation entry pointing at the line.
    ///
    /// Returns whether any cleared entry carried the dirty bit; that
    /// propagates into the line's dirty state before the flush decision.
    fn unmap_rmaps(&self, index: usize, rmaps: &[RmapEntry]) -> bool {
        let meta = self.meta(index);
        for rmap in rmaps {
            // SAFETY: a recorded slot's address space is alive; records
            // are removed before any address space is torn down.
            let slot = unsafe { rmap.slot.entry_ref() };
            let guard = slot.lock();
            if guard.get().is_dirty() {
                meta.set_dirty();
            }
            guard.clear();
            meta.dec_mapcount();
        }
        meta.test_and_clear_dirty()
    }

    /// Write the line's content back to every owning node.
    ///
    /// Caller holds the line lock; no translation may still reach the
    /// line.
    pub(crate) fn flush_line(&self, index: usize, rmaps: &[RmapEntry]) -> bool {
        let meta = self.meta(index);
        meta.set_writeback();

        // SAFETY: the line lock is held and all translations are gone, so
        // nothing can touch the bytes during the flush.
        let data = unsafe { self.line_data(index) };

        for rmap in rmaps {
            if let Err(err) = self.client().flush_line(
                rmap.home_node,
                rmap.owner_tgid,
                rmap.address,
                data,
                DEF_NET_TIMEOUT,
            ) {
                log::error!(
                    "pcache: flush of address {} tgid {} to node {} failed: {}",
                    rmap.address,
                    rmap.owner_tgid,
                    rmap.home_node,
                    err
                );
                meta.clear_writeback();
                return false;
            }
            self.events().inc(PcacheEvent::Clflush);
        }

        meta.clear_writeback();
        true
    }

    /// Hand the reclaimed content to the victim cache.
    #[cfg(feature = "eviction-victim")]
    fn insert_victim(&self, index: usize, rmaps: &[RmapEntry]) {
        // SAFETY: line lock held, no translations left.
        let data = unsafe { self.line_data(index) };
        for rmap in rmaps {
            self.victim()
                .insert(self.events(), rmap.aspace_id, rmap.owner_tgid, rmap.address, data);
        }
    }

    /// Terminal transition: the line leaves the cache.
    fn finish_reclaim(&self, index: usize) {
        let meta = self.meta(index);
        debug_assert_eq!(meta.mapcount(), 0);
        meta.clear_valid();
        meta.clear_allocated();
        meta.unlock();
    }

    /// Retire the pending-eviction notes taken for the flush.
    fn finish_pending(&self, set_index: usize, rmaps: &[RmapEntry]) {
        #[cfg(feature = "eviction-perset-list")]
        for rmap in rmaps {
            self.set(set_index).finish_eviction(rmap.aspace_id, rmap.address);
        }
        #[cfg(not(feature = "eviction-perset-list"))]
        let _ = (set_index, rmaps);
    }

    /// Arena indices of the currently valid lines.
    #[cfg(test)]
    pub(crate) fn valid_lines(&self) -> alloc::vec::Vec<usize> {
        (0..self.geometry().nr_lines() as usize)
            .filter(|&i| self.meta(i).is_valid())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::fault::FaultFlags;
    use crate::set::PsetEvent;
    use crate::stat::PcacheEvent;
    use crate::task::Task;
    use crate::testutil::{small_pcache, TestMemoryNode};
    use crate::Pcache;
    use lattice_hal::VirtualAddress;
    use lattice_memory::AddressSpace;

    fn task() -> Task {
        Task::new(7, 7, 1)
    }

    fn same_set_addr(pcache: &Pcache<'_>, k: u64) -> VirtualAddress {
        let stride = pcache.geometry().nr_sets() * pcache.geometry().line_size() as u64;
        VirtualAddress::new(0x40_0000 + k * stride)
    }

    #[test]
    fn test_full_set_evicts_and_refaults() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let mm = AddressSpace::new();
        let ways = pcache.geometry().associativity() as u64;

        for k in 0..ways {
            pcache
                .handle_fault(&mm, &task(), same_set_addr(&pcache, k), FaultFlags::USER)
                .expect("set fills up");
        }
        assert_eq!(pcache.valid_lines().len(), ways as usize);

        // One more address in the same set forces an eviction.
        let newcomer = same_set_addr(&pcache, ways);
        pcache
            .handle_fault(&mm, &task(), newcomer, FaultFlags::USER)
            .expect("eviction makes room");

        assert_eq!(pcache.events().read(PcacheEvent::EvictionTriggered), 1);
        assert_eq!(pcache.events().read(PcacheEvent::EvictionSucceed), 1);
        assert_eq!(pcache.valid_lines().len(), ways as usize);
        assert!(mm.walk(newcomer).expect("mapped").read().is_present());

        // Exactly one earlier translation was torn down, refault-able.
        let evicted: alloc::vec::Vec<VirtualAddress> = (0..ways)
            .map(|k| same_set_addr(&pcache, k))
            .filter(|&a| mm.walk(a).expect("levels exist").read().is_none())
            .collect();
        assert_eq!(evicted.len(), 1);

        let fetches = node.fetches();
        pcache
            .handle_fault(&mm, &task(), evicted[0], FaultFlags::USER)
            .expect("evicted address refaults");
        assert_eq!(node.fetches(), fetches + 1);

        let set = pcache.set(pcache.geometry().set_of(newcomer));
        assert_eq!(set.stat(PsetEvent::Eviction), 2);
    }

    #[test]
    fn test_clean_eviction_skips_flush() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let mm = AddressSpace::new();
        let address = same_set_addr(&pcache, 0);

        pcache.handle_fault(&mm, &task(), address, FaultFlags::USER).expect("fill");
        let set_index = pcache.geometry().set_of(address);

        assert!(pcache.evict_line(set_index));
        assert_eq!(node.flushes(), 0, "read-only content is not written back");
        assert_eq!(pcache.events().read(PcacheEvent::Clflush), 0);
        assert!(pcache.valid_lines().is_empty());
        assert!(mm.walk(address).expect("levels exist").read().is_none());
    }

    #[test]
    fn test_dirty_eviction_flushes_content() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let mm = AddressSpace::new();
        let address = same_set_addr(&pcache, 0);
        let aligned = pcache.geometry().line_align(address);

        pcache.handle_fault(&mm, &task(), address, FaultFlags::USER).expect("fill");
        pcache
            .handle_fault(&mm, &task(), address, FaultFlags::WRITE)
            .expect("dirty the translation");

        let entry = mm.walk(address).expect("mapped").read();
        let index = pcache.line_index_of_entry(entry).expect("maps a line");
        // SAFETY: the test owns this settled line; nothing else runs.
        let expected = unsafe { pcache.line_data(index) }.to_vec();

        let set_index = pcache.geometry().set_of(address);
        assert!(pcache.evict_line(set_index));

        assert_eq!(node.flushes(), 1);
        assert_eq!(pcache.events().read(PcacheEvent::Clflush), 1);
        assert_eq!(node.flushed_content(aligned).expect("flushed"), expected);

        let meta = pcache.meta(index);
        assert!(!meta.is_valid());
        assert!(!meta.is_allocated());
        assert!(!meta.is_dirty());
        assert!(!meta.is_writeback());
        assert!(!meta.is_locked());
        assert_eq!(meta.mapcount(), 0);
    }

    #[test]
    fn test_eviction_finds_nothing_in_empty_set() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);

        assert!(!pcache.evict_line(0));
        assert_eq!(pcache.events().read(PcacheEvent::EvictionTriggered), 1);
        assert_eq!(pcache.events().read(PcacheEvent::EvictionFailureFind), 1);
    }

    #[cfg(feature = "eviction-perset-list")]
    #[test]
    fn test_eviction_retires_pending_entries() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let mm = AddressSpace::new();
        let address = same_set_addr(&pcache, 0);
        let aligned = pcache.geometry().line_align(address);

        pcache.handle_fault(&mm, &task(), address, FaultFlags::USER).expect("fill");
        let set_index = pcache.geometry().set_of(address);
        assert!(pcache.evict_line(set_index));

        // The flush is over; nothing may linger on the pending list.
        assert!(!pcache.set(set_index).eviction_pending(mm.id(), aligned));
    }

    #[cfg(feature = "eviction-victim")]
    #[test]
    fn test_eviction_feeds_the_victim_cache() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let mm = AddressSpace::new();
        let address = same_set_addr(&pcache, 0);
        let aligned = pcache.geometry().line_align(address);

        pcache.handle_fault(&mm, &task(), address, FaultFlags::USER).expect("fill");
        let set_index = pcache.geometry().set_of(address);
        assert!(pcache.evict_line(set_index));

        assert!(pcache.victim().may_hit(mm.id(), aligned));
        assert_eq!(pcache.victim().owner_of(mm.id(), aligned), Some(task().tgid));
        assert_eq!(pcache.events().read(PcacheEvent::VictimFinishInsert), 1);

        // The next miss on that address comes from the victim store.
        let fetches = node.fetches();
        pcache.handle_fault(&mm, &task(), address, FaultFlags::USER).expect("refault");
        assert_eq!(node.fetches(), fetches, "victim hit avoids the fetch");
        assert_eq!(pcache.events().read(PcacheEvent::FillFromVictim), 1);
    }
}
