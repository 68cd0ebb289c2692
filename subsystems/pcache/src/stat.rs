//! # Cache Event Counters
//!
//! Monotonically increasing counters describing fault, fill, and eviction
//! outcomes. Increment is the only mutation; a pull-based dump renders
//! every counter by name for an external telemetry consumer.
//!
//! The event enumeration and the name table must stay in lock-step; the
//! compile-time assertion below refuses mismatched lengths.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Cache-wide event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PcacheEvent {
    /// A fault entered the resolver.
    Fault,
    /// A line was flushed back to its memory owner.
    Clflush,
    /// A fault hit the write-protection path.
    FaultWp,
    /// A write-protection fault resolved by duplication (unimplemented).
    FaultWpCow,
    /// A write-protection fault resolved by reusing the line.
    FaultWpReuse,
    /// A fault collided with an eviction in progress.
    FaultConcurrentEviction,
    /// A fault collided with a fill in progress for the same address.
    FaultConcurrentFill,
    /// A line was filled from remote memory.
    FillFromMemory,
    /// A line was filled from the victim cache.
    FillFromVictim,
    /// Line eviction was triggered.
    EvictionTriggered,
    /// Eviction found a line that was already freeable.
    EvictionEagainFreeable,
    /// Eviction skipped a line another context had locked.
    EvictionEagainConcurrent,
    /// Eviction found no candidate at all.
    EvictionFailureFind,
    /// Eviction found a candidate but could not reclaim it.
    EvictionFailureEvict,
    /// Eviction reclaimed a line.
    EvictionSucceed,
    /// Victim-cache eviction was triggered.
    VictimEvictionTriggered,
    /// Victim-cache eviction dropped an entry.
    VictimEvictionSucceed,
    /// Victim-cache insertion started.
    VictimPrepareInsert,
    /// Victim-cache insertion completed.
    VictimFinishInsert,
}

/// Number of distinct cache events.
pub const NR_PCACHE_EVENTS: usize = PcacheEvent::VictimFinishInsert as usize + 1;

const EVENT_TEXT: &[&str] = &[
    "nr_pgfault",
    "nr_clflush",
    "nr_pgfault_wp",
    "nr_pgfault_wp_cow",
    "nr_pgfault_wp_reuse",
    "nr_pgfault_due_to_concurrent_eviction",
    "nr_pgfault_due_to_concurrent_fill",
    "nr_pcache_fill_from_memory",
    "nr_pcache_fill_from_victim",
    "nr_pcache_eviction_triggered",
    "nr_pcache_eviction_eagain_freeable",
    "nr_pcache_eviction_eagain_concurrent",
    "nr_pcache_eviction_failure_find",
    "nr_pcache_eviction_failure_evict",
    "nr_pcache_eviction_succeed",
    "nr_victim_eviction_triggered",
    "nr_victim_eviction_succeed",
    "nr_victim_prepare_insert",
    "nr_victim_finish_insert",
];

// The name table and the enumeration must not drift apart.
const_assert_eq!(EVENT_TEXT.len(), NR_PCACHE_EVENTS);

/// One counter per [`PcacheEvent`].
pub struct EventCounters {
    events: [AtomicU64; NR_PCACHE_EVENTS],
}

impl EventCounters {
    /// Create a zeroed counter array.
    pub fn new() -> Self {
        Self {
            events: [0u64; NR_PCACHE_EVENTS].map(AtomicU64::new),
        }
    }

    /// Count one occurrence of `event`.
    #[inline]
    pub fn inc(&self, event: PcacheEvent) {
        self.events[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current value of `event`.
    #[inline]
    pub fn read(&self, event: PcacheEvent) -> u64 {
        self.events[event as usize].load(Ordering::Relaxed)
    }

    /// Visit every counter with its name, in enumeration order.
    pub fn report(&self, mut visit: impl FnMut(&'static str, u64)) {
        for (name, counter) in EVENT_TEXT.iter().zip(self.events.iter()) {
            visit(name, counter.load(Ordering::Relaxed));
        }
    }

    /// Render all counters through the logger.
    pub fn log_events(&self) {
        self.report(|name, value| log::info!("pcache: {}: {}", name, value));
    }
}

impl Default for EventCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventCounters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventCounters")
            .field("nr_pgfault", &self.read(PcacheEvent::Fault))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
