//! # Fault Resolution
//!
//! The page-fault entry point of the cache: looks up the translation,
//! decides miss versus write-protection versus benign race, drives line
//! allocation and the selected fill strategy, installs the translation,
//! and records the reverse mapping.
//!
//! ## Locking
//!
//! Lock ordering here is fixed and must never invert:
//!
//! - the blocking line lock is only ever taken with no translation-entry
//!   lock held;
//! - a held translation-entry lock tolerates a *non-blocking* line-lock
//!   attempt and brief set-lock sections, nothing more;
//! - no lock at all is held across the network fetch. Concurrent faults
//!   on one address are serialized by the set's pending-fill list
//!   instead, so exactly one context performs the fetch and the rest
//!   wait at this outer entry.
//!
//! A fault that cannot complete always leaves the address space
//! consistent and refault-able: no partial translation entries survive a
//! failure.

use core::fmt;

use lattice_hal::VirtualAddress;
use lattice_memory::{AddressSpace, Entry, EntryFlags, EntryGuard, EntryRef};

use crate::fill::{FillError, FillSource, RemoteFill};
use crate::stat::PcacheEvent;
use crate::task::Task;
use crate::Pcache;

#[cfg(feature = "eviction-victim")]
use crate::fill::VictimFill;

bitflags::bitflags! {
    /// How a fault happened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The faulting access was a write.
        const WRITE = 1 << 0;
        /// The access came from user context.
        const USER = 1 << 1;
        /// The access was an instruction fetch.
        const INSTRUCTION = 1 << 2;
    }
}

/// Fault signal reported back to the architecture fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A line or translation level could not be allocated.
    OutOfMemory,
    /// The remote owner rejected the access.
    InvalidAccess,
    /// The translation or transport broke underneath the access.
    BusError,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::OutOfMemory => write!(f, "out of memory"),
            Fault::InvalidAccess => write!(f, "invalid memory access"),
            Fault::BusError => write!(f, "bus error"),
        }
    }
}

impl<'a> Pcache<'a> {
    /// Resolve a miss or protection fault on `address`.
    ///
    /// Ensures the translation path down to the leaf entry exists, then
    /// dispatches on the entry's state. Synchronous: a genuine miss
    /// performs the remote fetch before returning.
    pub fn handle_fault(
        &self,
        mm: &AddressSpace,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
    ) -> Result<(), Fault> {
        let slot = mm.walk_alloc(address).map_err(|_| Fault::OutOfMemory)?;

        self.events().inc(PcacheEvent::Fault);
        self.handle_entry_fault(mm, task, address, flags, slot)
    }

    fn handle_entry_fault(
        &self,
        mm: &AddressSpace,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        slot: EntryRef<'_>,
    ) -> Result<(), Fault> {
        let entry = slot.read();

        if !entry.is_present() {
            if entry.is_none() {
                return self.miss(mm, task, address, flags, slot);
            }
            // A non-empty entry with no live line behind it means the
            // translation and the cache have desynchronized.
            self.dump_bad_entry(mm, address, entry);
            panic!(
                "pcache: translation entry {:#x} has no backing line",
                entry.raw()
            );
        }

        let entry_lock = slot.lock();
        if entry_lock.get() != entry {
            // The entry changed while we were unlocked; whatever raced us
            // is authoritative. Refault if the access still needs it.
            return Ok(());
        }

        let mut entry = entry;
        if flags.contains(FaultFlags::WRITE) {
            if !entry.is_writable() {
                return self.wp_fault(mm, address, entry, entry_lock);
            }
            entry = entry.mk_dirty();
        }

        // Present and writable, yet we faulted: another context installed
        // the mapping first. Mark the entry recently used and go home.
        let young = entry.mk_young();
        if young != entry_lock.get() && flags.contains(FaultFlags::WRITE) {
            entry_lock.set(young);
        }
        Ok(())
    }

    /// A genuine miss: run the configured miss policy, then fill.
    fn miss(
        &self,
        mm: &AddressSpace,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        slot: EntryRef<'_>,
    ) -> Result<(), Fault> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "eviction-perset-list")] {
                // The line may still be flushing out. Wait until the
                // address leaves the set's eviction list, then fill.
                let aligned = self.geometry().line_align(address);
                let set = self.set(self.geometry().set_of(address));
                let mut counted = false;
                while set.eviction_pending(mm.id(), aligned) {
                    if !counted {
                        counted = true;
                        self.events().inc(PcacheEvent::FaultConcurrentEviction);
                    }
                    core::hint::spin_loop();
                }
            } else if #[cfg(feature = "eviction-victim")] {
                // A recently evicted copy short-circuits the remote fetch.
                let aligned = self.geometry().line_align(address);
                if self.victim().may_hit(mm.id(), aligned) {
                    if let Some(data) = self.victim().take(mm.id(), aligned) {
                        return self.fill(mm, task, address, flags, slot, &VictimFill::new(&data));
                    }
                }
            }
        }

        self.fill(mm, task, address, flags, slot, &RemoteFill)
    }

    /// The common fill path shared by every miss strategy.
    ///
    /// Serializes same-address faults through the set's pending-fill
    /// list: the claim is taken under the entry lock, but the lock is
    /// dropped before the fetch. Losers wait here, unlocked, and almost
    /// always find the entry installed when they re-look.
    fn fill(
        &self,
        mm: &AddressSpace,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        slot: EntryRef<'_>,
        source: &dyn FillSource,
    ) -> Result<(), Fault> {
        let aligned = self.geometry().line_align(address);
        let set = self.set(self.geometry().set_of(address));

        loop {
            {
                let entry_lock = slot.lock();
                if !entry_lock.get().is_none() {
                    // Raced: a mapping appeared since the lookup. The new
                    // entry is the redundant work's discard point.
                    return Ok(());
                }
                if set.begin_fill(mm.id(), aligned) {
                    break;
                }
            }
            // Another context is fetching this very address. Wait with no
            // locks held, then re-examine what it left behind.
            self.events().inc(PcacheEvent::FaultConcurrentFill);
            set.wait_fill_done(mm.id(), aligned);
            if slot.read().is_present() {
                return Ok(());
            }
        }

        let result = self.fill_as_owner(mm, task, address, flags, slot, source);
        set.finish_fill(mm.id(), aligned);
        result
    }

    /// Fill with the pending-fill claim held: allocate, fetch, install.
    fn fill_as_owner(
        &self,
        mm: &AddressSpace,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        slot: EntryRef<'_>,
        source: &dyn FillSource,
    ) -> Result<(), Fault> {
        let Some(index) = self.alloc_line(address) else {
            return Err(Fault::OutOfMemory);
        };

        // The fetch happens while the line is still private: allocated,
        // not valid, unreachable from any translation entry.
        if let Err(err) = source.fill_line(self, task, address, flags, index) {
            self.release_line(index);
            return Err(match err {
                FillError::Denied(code) => {
                    log::warn!(
                        "pcache: remote denied address {} for tgid {} (code {})",
                        address,
                        task.tgid,
                        code
                    );
                    Fault::InvalidAccess
                },
                FillError::Net(net) => {
                    log::warn!("pcache: fetch of address {} failed: {}", address, net);
                    Fault::BusError
                },
            });
        }

        // TODO: derive protection bits from the owning region once region
        // tracking lands; everything is shared-writable for now.
        let entry = Entry::new(
            self.line_paddr(index),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
        );

        let entry_lock = slot.lock();
        debug_assert!(
            entry_lock.get().is_none(),
            "pending-fill claim guarantees an empty entry"
        );

        // Set the entry before adding the reverse map, then mark valid
        // last. The order is load-bearing: eviction scans valid lines and
        // must never find one whose reverse map does not exist yet.
        entry_lock.set(entry);
        self.add_rmap(index, slot.slot_ptr(), mm.id(), task, address);
        self.meta(index).set_valid();

        Ok(())
    }

    /// A write hit a present, read-only entry.
    ///
    /// Entered with the translation-entry lock held; `_entry_lock` is
    /// released on every return path.
    fn wp_fault(
        &self,
        mm: &AddressSpace,
        address: VirtualAddress,
        entry: Entry,
        _entry_lock: EntryGuard<'_>,
    ) -> Result<(), Fault> {
        let result = self.do_wp_fault(mm, address, entry);
        self.events().inc(PcacheEvent::FaultWp);
        result
    }

    fn do_wp_fault(
        &self,
        mm: &AddressSpace,
        address: VirtualAddress,
        entry: Entry,
    ) -> Result<(), Fault> {
        let Some(index) = self.line_index_of_entry(entry) else {
            self.dump_bad_entry(mm, address, entry);
            return Err(Fault::BusError);
        };

        // The line may be locked by an in-progress eviction, and we hold
        // the entry lock, so we must not wait. Back out entirely; the
        // access simply refaults once the eviction settles.
        if !self.meta(index).try_lock() {
            self.events().inc(PcacheEvent::FaultConcurrentEviction);
            return Ok(());
        }

        // Shared-writable duplication is the correct behavior here, and
        // callers must not believe it exists.
        panic!("pcache: copy-on-write duplication is not implemented");
    }

    /// Resolve a present entry back to its arena index, if it really
    /// points into the line area at a claimed line.
    pub(crate) fn line_index_of_entry(&self, entry: Entry) -> Option<usize> {
        let addr = entry.address();
        if !self.geometry().contains_line(addr) {
            return None;
        }
        let index = self.geometry().line_index(addr);
        self.meta(index).is_allocated().then_some(index)
    }

    fn dump_bad_entry(&self, mm: &AddressSpace, address: VirtualAddress, entry: Entry) {
        log::error!(
            "pcache: bad translation entry {:#x} for address {} in address space {}",
            entry.raw(),
            address,
            mm.id()
        );
        if let Some(index) = self.line_index_of_entry(entry) {
            self.meta(index).dump("bad entry");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
