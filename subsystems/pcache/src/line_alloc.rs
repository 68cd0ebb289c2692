//! # Line Allocation
//!
//! Picks a free way within the faulting address's set. The set lock
//! arbitrates the scan; the claim itself is an atomic test-and-set of the
//! `allocated` bit, so a claimed line is private to its owner until the
//! owner marks it valid.
//!
//! When every way is taken, allocation triggers one eviction pass over
//! the set and retries once; a second failure surfaces as out-of-memory
//! to the fault caller, which never retries internally.

use lattice_hal::VirtualAddress;

use crate::Pcache;

impl Pcache<'_> {
    /// Allocate a line for `address`, evicting once if the set is full.
    ///
    /// Returns the arena index of a line whose `allocated` bit this
    /// context now owns, or `None` when the set stays full.
    pub(crate) fn alloc_line(&self, address: VirtualAddress) -> Option<usize> {
        let set_index = self.geometry().set_of(address);

        for attempt in 0..2 {
            if let Some(index) = self.alloc_line_once(set_index) {
                return Some(index);
            }
            if attempt == 0 && !self.evict_line(set_index) {
                break;
            }
        }
        None
    }

    /// One scan over the set's ways.
    fn alloc_line_once(&self, set_index: usize) -> Option<usize> {
        let set = self.set(set_index);
        let _guard = set.lock();

        for slot in self.geometry().ways_of_set(set_index) {
            let meta = self.meta(slot.index);
            if !meta.test_and_set_allocated() {
                debug_assert!(!meta.is_valid());
                debug_assert_eq!(meta.mapcount(), 0);
                return Some(slot.index);
            }
        }
        None
    }

    /// Return a claimed line that never became valid.
    ///
    /// The rollback half of fill failure: the caller owns the line
    /// (allocated, not valid), so dropping the claim makes the way free
    /// again with no other state to undo.
    pub(crate) fn release_line(&self, index: usize) {
        let meta = self.meta(index);
        debug_assert!(meta.is_allocated());
        debug_assert!(!meta.is_valid());
        debug_assert_eq!(meta.mapcount(), 0);

        meta.clear_dirty();
        meta.clear_allocated();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::testutil::{small_pcache, TestMemoryNode};
    use lattice_hal::VirtualAddress;

    #[test]
    fn test_alloc_claims_distinct_ways() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let addr = VirtualAddress::new(0x4_0000);
        let ways = pcache.geometry().associativity() as usize;

        let mut claimed = alloc::vec::Vec::new();
        for _ in 0..ways {
            let index = pcache.alloc_line(addr).expect("way available");
            assert!(!claimed.contains(&index));
            assert!(pcache.meta(index).is_allocated());
            claimed.push(index);
        }

        // All ways taken and none is evictable (none ever became valid,
        // so eviction finds no candidate).
        assert!(pcache.alloc_line(addr).is_none());

        for index in claimed {
            pcache.release_line(index);
            assert!(!pcache.meta(index).is_allocated());
        }
        assert!(pcache.alloc_line(addr).is_some());
    }

    #[test]
    fn test_release_clears_dirty_claim() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let index = pcache.alloc_line(VirtualAddress::new(0x8000)).expect("way");

        pcache.meta(index).set_dirty();
        pcache.release_line(index);

        assert!(!pcache.meta(index).is_allocated());
        assert!(!pcache.meta(index).is_dirty());
    }
}
