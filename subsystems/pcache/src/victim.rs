//! # Victim Cache
//!
//! A small, fully associative store of recently evicted lines. Under the
//! `eviction-victim` miss policy a fault consults this store before
//! paying for a remote fetch: a hit moves the content straight back into
//! a freshly allocated line.
//!
//! Entries are keyed by (address-space, line-aligned virtual address).
//! The store is bounded; inserting into a full store drops the oldest
//! entry. Lines arrive here already flushed, so dropping one never loses
//! data.

use alloc::vec::Vec;
use lattice_hal::VirtualAddress;
use spin::Mutex;

use crate::stat::{EventCounters, PcacheEvent};

/// Capacity of the victim cache, in lines.
pub const VICTIM_NR_ENTRIES: usize = 8;

struct VictimLine {
    aspace_id: u64,
    owner_tgid: u32,
    address: VirtualAddress,
    data: Vec<u8>,
}

/// Bounded store of recently evicted lines.
pub struct VictimCache {
    lines: Mutex<Vec<VictimLine>>,
}

impl VictimCache {
    /// Create an empty victim cache.
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Whether `address` could be served from this store.
    ///
    /// A cheap predicate for the miss path; the authoritative check is
    /// the subsequent [`VictimCache::take`].
    pub fn may_hit(&self, aspace_id: u64, address: VirtualAddress) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|line| line.aspace_id == aspace_id && line.address == address)
    }

    /// Capture one evicted line.
    pub fn insert(
        &self,
        events: &EventCounters,
        aspace_id: u64,
        owner_tgid: u32,
        address: VirtualAddress,
        data: &[u8],
    ) {
        events.inc(PcacheEvent::VictimPrepareInsert);
        let mut lines = self.lines.lock();

        // One slot per translation: a re-evicted address replaces its
        // stale copy instead of shadowing it.
        if let Some(position) = lines
            .iter()
            .position(|line| line.aspace_id == aspace_id && line.address == address)
        {
            lines.remove(position);
        } else if lines.len() >= VICTIM_NR_ENTRIES {
            events.inc(PcacheEvent::VictimEvictionTriggered);
            lines.remove(0);
            events.inc(PcacheEvent::VictimEvictionSucceed);
        }

        lines.push(VictimLine {
            aspace_id,
            owner_tgid,
            address,
            data: data.to_vec(),
        });
        events.inc(PcacheEvent::VictimFinishInsert);
    }

    /// Remove and return the content cached for `address`.
    pub fn take(&self, aspace_id: u64, address: VirtualAddress) -> Option<Vec<u8>> {
        let mut lines = self.lines.lock();
        let position = lines
            .iter()
            .position(|line| line.aspace_id == aspace_id && line.address == address)?;
        Some(lines.remove(position).data)
    }

    /// Number of lines currently held.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Thread-group owning the cached copy of `address`, if any.
    pub fn owner_of(&self, aspace_id: u64, address: VirtualAddress) -> Option<u32> {
        self.lines
            .lock()
            .iter()
            .find(|line| line.aspace_id == aspace_id && line.address == address)
            .map(|line| line.owner_tgid)
    }
}

impl Default for VictimCache {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for VictimCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VictimCache").field("lines", &self.len()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u64) -> VirtualAddress {
        VirtualAddress::new(a)
    }

    #[test]
    fn test_insert_then_take() {
        let victim = VictimCache::new();
        let events = EventCounters::new();

        victim.insert(&events, 1, 100, addr(0x4000), &[0xAB; 64]);
        assert!(victim.may_hit(1, addr(0x4000)));
        assert!(!victim.may_hit(2, addr(0x4000)));
        assert_eq!(victim.owner_of(1, addr(0x4000)), Some(100));

        let data = victim.take(1, addr(0x4000)).expect("hit");
        assert_eq!(data, alloc::vec![0xAB; 64]);
        assert!(victim.is_empty());
        assert!(victim.take(1, addr(0x4000)).is_none());

        assert_eq!(events.read(PcacheEvent::VictimPrepareInsert), 1);
        assert_eq!(events.read(PcacheEvent::VictimFinishInsert), 1);
    }

    #[test]
    fn test_full_store_drops_oldest() {
        let victim = VictimCache::new();
        let events = EventCounters::new();

        for i in 0..VICTIM_NR_ENTRIES as u64 + 1 {
            victim.insert(&events, 1, 100, addr(0x1000 * (i + 1)), &[i as u8]);
        }

        assert_eq!(victim.len(), VICTIM_NR_ENTRIES);
        assert!(!victim.may_hit(1, addr(0x1000)));
        assert!(victim.may_hit(1, addr(0x1000 * (VICTIM_NR_ENTRIES as u64 + 1))));
        assert_eq!(events.read(PcacheEvent::VictimEvictionTriggered), 1);
        assert_eq!(events.read(PcacheEvent::VictimEvictionSucceed), 1);
    }

    #[test]
    fn test_reinsert_replaces_stale_copy() {
        let victim = VictimCache::new();
        let events = EventCounters::new();

        victim.insert(&events, 1, 100, addr(0x2000), &[1]);
        victim.insert(&events, 1, 100, addr(0x2000), &[2]);

        assert_eq!(victim.len(), 1);
        assert_eq!(victim.take(1, addr(0x2000)).expect("hit"), alloc::vec![2]);
        assert_eq!(events.read(PcacheEvent::VictimEvictionTriggered), 0);
    }
}
