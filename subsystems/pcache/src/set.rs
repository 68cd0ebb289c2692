//! # Cache Sets
//!
//! Per-set state: the lock arbitrating allocation, eviction, and
//! reverse-map mutation across all ways of the set, the per-set event
//! counters, and the pending-address lists that let concurrent faults
//! coordinate with in-flight fills and evictions without holding any
//! fine-grained lock while they wait.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;
use lattice_hal::VirtualAddress;
use spin::{Mutex, MutexGuard};

/// Per-set event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PsetEvent {
    /// A line of this set was filled.
    Fill,
    /// A line of this set was evicted.
    Eviction,
}

/// Number of distinct per-set events.
pub const NR_PSET_EVENTS: usize = PsetEvent::Eviction as usize + 1;

/// An address a fault path is currently filling or evicting.
///
/// Two tasks may map the same virtual address through different address
/// spaces, so pending entries are keyed by both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    aspace_id: u64,
    address: VirtualAddress,
}

/// Metadata for one cache set.
pub struct PcacheSet {
    /// Protects (de-)allocation and rmap operations across all ways.
    lock: Mutex<()>,
    stat: [AtomicU64; NR_PSET_EVENTS],
    /// Line-aligned addresses whose fill is in flight.
    filling: Mutex<Vec<Pending>>,
    /// Line-aligned addresses whose eviction flush is in flight.
    evicting: Mutex<Vec<Pending>>,
}

impl PcacheSet {
    /// Create an idle set.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            stat: [AtomicU64::new(0), AtomicU64::new(0)],
            filling: Mutex::new(Vec::new()),
            evicting: Mutex::new(Vec::new()),
        }
    }

    /// Take the set lock.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Count one per-set event.
    #[inline]
    pub fn inc_stat(&self, event: PsetEvent) {
        self.stat[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Read one per-set counter.
    #[inline]
    pub fn stat(&self, event: PsetEvent) -> u64 {
        self.stat[event as usize].load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Pending fills
    // -------------------------------------------------------------------------

    /// Claim the fill of `address`; false if another context already has.
    pub fn begin_fill(&self, aspace_id: u64, address: VirtualAddress) -> bool {
        let key = Pending { aspace_id, address };
        let mut filling = self.filling.lock();
        if filling.contains(&key) {
            false
        } else {
            filling.push(key);
            true
        }
    }

    /// Retire a fill claimed with [`PcacheSet::begin_fill`].
    pub fn finish_fill(&self, aspace_id: u64, address: VirtualAddress) {
        let key = Pending { aspace_id, address };
        let mut filling = self.filling.lock();
        if let Some(position) = filling.iter().position(|p| *p == key) {
            filling.swap_remove(position);
        }
    }

    /// Whether a fill of `address` is in flight.
    #[inline]
    pub fn fill_pending(&self, aspace_id: u64, address: VirtualAddress) -> bool {
        self.filling.lock().contains(&Pending { aspace_id, address })
    }

    /// Wait until no fill of `address` is in flight.
    ///
    /// Cooperative spin with an observable exit predicate; only ever
    /// called from the outer fault entry with no locks held.
    pub fn wait_fill_done(&self, aspace_id: u64, address: VirtualAddress) {
        while self.fill_pending(aspace_id, address) {
            core::hint::spin_loop();
        }
    }

    // -------------------------------------------------------------------------
    // Pending evictions
    // -------------------------------------------------------------------------

    /// Note that `address` is being evicted and flushed.
    pub fn begin_eviction(&self, aspace_id: u64, address: VirtualAddress) {
        self.evicting.lock().push(Pending { aspace_id, address });
    }

    /// Retire a pending eviction of `address`.
    pub fn finish_eviction(&self, aspace_id: u64, address: VirtualAddress) {
        let key = Pending { aspace_id, address };
        let mut evicting = self.evicting.lock();
        if let Some(position) = evicting.iter().position(|p| *p == key) {
            evicting.swap_remove(position);
        }
    }

    /// Whether an eviction of `address` is still flushing.
    #[inline]
    pub fn eviction_pending(&self, aspace_id: u64, address: VirtualAddress) -> bool {
        self.evicting.lock().contains(&Pending { aspace_id, address })
    }
}

impl Default for PcacheSet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PcacheSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcacheSet")
            .field("fills", &self.stat(PsetEvent::Fill))
            .field("evictions", &self.stat(PsetEvent::Eviction))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_counters() {
        let set = PcacheSet::new();
        set.inc_stat(PsetEvent::Fill);
        set.inc_stat(PsetEvent::Fill);
        set.inc_stat(PsetEvent::Eviction);

        assert_eq!(set.stat(PsetEvent::Fill), 2);
        assert_eq!(set.stat(PsetEvent::Eviction), 1);
    }

    #[test]
    fn test_fill_claim_is_exclusive() {
        let set = PcacheSet::new();
        let addr = VirtualAddress::new(0x4000);

        assert!(set.begin_fill(1, addr));
        assert!(!set.begin_fill(1, addr));
        // A different address space is a different translation.
        assert!(set.begin_fill(2, addr));

        assert!(set.fill_pending(1, addr));
        set.finish_fill(1, addr);
        assert!(!set.fill_pending(1, addr));
        assert!(set.fill_pending(2, addr));
        set.finish_fill(2, addr);
    }

    #[test]
    fn test_eviction_pending_roundtrip() {
        let set = PcacheSet::new();
        let addr = VirtualAddress::new(0x8000);

        assert!(!set.eviction_pending(7, addr));
        set.begin_eviction(7, addr);
        assert!(set.eviction_pending(7, addr));
        assert!(!set.eviction_pending(7, VirtualAddress::new(0x9000)));
        set.finish_eviction(7, addr);
        assert!(!set.eviction_pending(7, addr));
    }

    #[test]
    fn test_wait_fill_done_returns_when_idle() {
        let set = PcacheSet::new();
        // Nothing pending: must not spin.
        set.wait_fill_done(1, VirtualAddress::new(0x1000));
    }
}
