//! # Address Spaces
//!
//! The per-task root of the translation structure plus the walk
//! operations used by the cache fault path.
//!
//! `walk` descends read-only and reports whether a leaf slot exists;
//! `walk_alloc` builds missing intermediate levels on demand. Level
//! allocation draws from a table budget so exhaustion is a real,
//! reportable condition: the fault path surfaces it to its caller as an
//! out-of-memory fault and never retries internally.

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;

use lattice_hal::VirtualAddress;

use crate::table::{Directory, EntryRef, LeafTable, UpperDirectory};

// =============================================================================
// Errors
// =============================================================================

/// Error type for translation-structure operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No table budget left for a missing intermediate level.
    OutOfMemory,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of translation-table memory"),
        }
    }
}

// =============================================================================
// Address Space
// =============================================================================

/// A task's software-translated address space.
///
/// Concurrent fault handlers may walk and grow one address space from
/// several execution contexts at once; the structure synchronizes itself
/// (atomic child publication, per-leaf-table entry locks) and needs no
/// outer lock.
pub struct AddressSpace {
    id: u64,
    root: Directory<UpperDirectory>,
    /// Remaining allocatable tables; `usize::MAX` means unbounded.
    tables_remaining: AtomicUsize,
}

impl AddressSpace {
    /// Create an address space with an unbounded table budget.
    pub fn new() -> Self {
        Self::with_table_budget(usize::MAX)
    }

    /// Create an address space that may allocate at most `budget`
    /// tables (the root is not counted).
    pub fn with_table_budget(budget: usize) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            root: Directory::new(),
            tables_remaining: AtomicUsize::new(budget),
        }
    }

    /// Unique identity of this address space.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Walk to the leaf slot for `virt` without allocating.
    ///
    /// Returns `None` when any intermediate level is missing.
    pub fn walk(&self, virt: VirtualAddress) -> Option<EntryRef<'_>> {
        let upper = self.root.get(virt.table_index(4))?;
        let middle = upper.get(virt.table_index(3))?;
        let leaf = middle.get(virt.table_index(2))?;
        Some(EntryRef::new(leaf, virt.table_index(1)))
    }

    /// Walk to the leaf slot for `virt`, allocating missing levels.
    ///
    /// Each missing level costs one unit of table budget; running out
    /// surfaces as [`MemoryError::OutOfMemory`] with no partial charge.
    pub fn walk_alloc(&self, virt: VirtualAddress) -> Result<EntryRef<'_>, MemoryError> {
        let upper = self.level_alloc(&self.root, virt.table_index(4), || {
            Box::new(Directory::new())
        })?;
        let middle = self.level_alloc(upper, virt.table_index(3), || {
            Box::new(Directory::new())
        })?;
        let leaf = self.level_alloc(middle, virt.table_index(2), || {
            Box::new(LeafTable::new())
        })?;
        Ok(EntryRef::new(leaf, virt.table_index(1)))
    }

    /// Get or build one child level, charging the table budget for a
    /// genuine insertion and refunding it on a lost publication race.
    fn level_alloc<'a, T>(
        &self,
        dir: &'a Directory<T>,
        index: usize,
        make: impl FnOnce() -> Box<T>,
    ) -> Result<&'a T, MemoryError> {
        if let Some(child) = dir.get(index) {
            return Ok(child);
        }
        self.charge_table()?;
        let (child, inserted) = dir.get_or_insert_with(index, make);
        if !inserted {
            self.refund_table();
        }
        Ok(child)
    }

    fn charge_table(&self) -> Result<(), MemoryError> {
        self.tables_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == usize::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .map(|_| ())
            .map_err(|_| MemoryError::OutOfMemory)
    }

    fn refund_table(&self) {
        let _ = self
            .tables_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == usize::MAX {
                    None
                } else {
                    Some(n + 1)
                }
            });
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
