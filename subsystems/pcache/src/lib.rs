//! # Lattice Processor-Side Cache
//!
//! The software-managed last-level cache of a Lattice processor node.
//!
//! In a disaggregated machine the processor node carries only a sliver of
//! local memory; "main memory" lives on remote memory nodes reached over
//! the interconnect. This crate turns the local physical range into a
//! set-associative cache of page-sized lines: the virtual-memory fault
//! path lands in [`Pcache::handle_fault`], which fetches the missing line
//! from its remote owner, installs the translation, and records the
//! reverse mapping that eviction later needs.
//!
//! ## Components
//!
//! - [`geometry`]: partitions the registered range and derives the
//!   tag/set/offset address decomposition
//! - [`meta`]: per-line state bits, mapping counts, reverse maps
//! - [`fault`]: the fault-resolution state machine
//! - [`fill`]: the remote-fetch boundary and fill strategies
//! - [`victim`]: recently evicted lines, consulted before a fetch
//! - [`stat`]: monotonically increasing event counters
//!
//! ## Miss policies
//!
//! Exactly one of the mutually exclusive build-time policies applies:
//! `eviction-perset-list` (wait out in-flight evictions), or
//! `eviction-victim` (consult the victim cache first), or neither (fill
//! unconditionally).

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod evict;
pub mod fault;
pub mod fill;
pub mod geometry;
pub mod line_alloc;
pub mod meta;
pub mod rmap;
pub mod set;
pub mod stat;
pub mod task;
pub mod victim;

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(all(feature = "eviction-perset-list", feature = "eviction-victim"))]
compile_error!(
    "miss policies `eviction-perset-list` and `eviction-victim` are mutually exclusive"
);

use core::cell::UnsafeCell;

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use lattice_hal::PhysicalAddress;

pub use fault::{Fault, FaultFlags};
pub use fill::{MemoryNodeClient, MissRequest, NetError, NodeId};
pub use geometry::{CacheGeometry, GeometryConfig, GeometryError};
pub use stat::{EventCounters, PcacheEvent};
pub use task::Task;

use meta::PcacheMeta;
use set::PcacheSet;
use victim::VictimCache;

// =============================================================================
// Line Data Arena
// =============================================================================

/// Backing storage for the line-data area.
///
/// Access discipline replaces a lock: a line's bytes are touched only by
/// the context that owns the line - the filler between `allocated` and
/// `valid`, or the evictor holding the line lock after all translations
/// are gone.
struct LineArena {
    bytes: Box<[UnsafeCell<u8>]>,
}

// SAFETY: concurrent access to the same line is excluded by the line
// ownership discipline above; distinct lines never alias.
unsafe impl Sync for LineArena {}

impl LineArena {
    fn new(len: usize) -> Self {
        let mut bytes = Vec::with_capacity(len);
        bytes.resize_with(len, || UnsafeCell::new(0));
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// # Safety
    ///
    /// The caller must own the line covering `[offset, offset + len)`.
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.bytes[offset].get(), len) }
    }

    /// # Safety
    ///
    /// The caller must own the line covering `[offset, offset + len)`
    /// exclusively.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.bytes[offset].get(), len) }
    }
}

// =============================================================================
// The Cache
// =============================================================================

/// The processor-side cache.
///
/// One instance is built at boot over the registered physical range (see
/// [`register_range`] / [`init`]); tests construct independent instances
/// directly from a [`CacheGeometry`].
pub struct Pcache<'a> {
    geometry: CacheGeometry,
    sets: Box<[PcacheSet]>,
    meta: Box<[PcacheMeta]>,
    data: LineArena,
    victim: VictimCache,
    events: EventCounters,
    client: &'a dyn MemoryNodeClient,
}

impl<'a> Pcache<'a> {
    /// Build a cache over `geometry`, fetching through `client`.
    pub fn new(geometry: CacheGeometry, client: &'a dyn MemoryNodeClient) -> Self {
        let nr_lines = geometry.nr_lines() as usize;
        let nr_sets = geometry.nr_sets() as usize;

        let mut sets = Vec::with_capacity(nr_sets);
        sets.resize_with(nr_sets, PcacheSet::new);

        let mut meta = Vec::with_capacity(nr_lines);
        meta.resize_with(nr_lines, PcacheMeta::new);

        let data = LineArena::new(nr_lines * geometry.line_size());

        Self {
            geometry,
            sets: sets.into_boxed_slice(),
            meta: meta.into_boxed_slice(),
            data,
            victim: VictimCache::new(),
            events: EventCounters::new(),
            client,
        }
    }

    /// The computed cache shape.
    #[inline]
    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// The cache-wide event counters.
    #[inline]
    pub fn events(&self) -> &EventCounters {
        &self.events
    }

    /// The victim cache.
    #[inline]
    pub fn victim(&self) -> &VictimCache {
        &self.victim
    }

    /// The set at `set_index`.
    #[inline]
    pub fn set(&self, set_index: usize) -> &PcacheSet {
        &self.sets[set_index]
    }

    /// The set owning the line at arena index `index`.
    #[inline]
    pub fn set_of_line(&self, index: usize) -> &PcacheSet {
        self.set(self.geometry.set_of_index(index))
    }

    #[inline]
    pub(crate) fn meta(&self, index: usize) -> &PcacheMeta {
        &self.meta[index]
    }

    #[inline]
    pub(crate) fn client(&self) -> &dyn MemoryNodeClient {
        self.client
    }

    /// Line-data physical address of an arena index.
    #[inline]
    pub(crate) fn line_paddr(&self, index: usize) -> PhysicalAddress {
        self.geometry.line_paddr(index)
    }

    /// Read access to a line's bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the line per the arena access discipline.
    pub(crate) unsafe fn line_data(&self, index: usize) -> &[u8] {
        let line_size = self.geometry.line_size();
        unsafe { self.data.slice(index * line_size, line_size) }
    }

    /// Write access to a line's bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the line exclusively: allocated-but-not-valid
    /// during fill, or line-locked with no translations during eviction.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn line_data_mut(&self, index: usize) -> &mut [u8] {
        let line_size = self.geometry.line_size();
        unsafe { self.data.slice_mut(index * line_size, line_size) }
    }
}

impl core::fmt::Debug for Pcache<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pcache")
            .field("nr_sets", &self.geometry.nr_sets())
            .field("associativity", &self.geometry.associativity())
            .finish()
    }
}

// =============================================================================
// Boot-Time Registration
// =============================================================================

static REGISTERED_RANGE: Mutex<Option<(u64, u64)>> = Mutex::new(None);
static PCACHE: Once<Pcache<'static>> = Once::new();

/// Register a consecutive physical memory range as the processor cache.
///
/// Invoked at early boot, before anything else about memory is up; a
/// later registration overwrites an earlier one. Rejects the unregistered
/// `(0, 0)` shape.
pub fn register_range(start: u64, size: u64) -> Result<(), GeometryError> {
    if start == 0 && size == 0 {
        log::warn!("pcache: refusing empty cache range");
        return Err(GeometryError::InvalidRange);
    }
    *REGISTERED_RANGE.lock() = Some((start, size));
    Ok(())
}

/// Build the process-wide cache over the registered range.
///
/// Must follow exactly one successful [`register_range`]; anything else
/// is a fatal configuration error. The first call wins; later calls
/// return the same instance.
pub fn init(client: &'static dyn MemoryNodeClient) -> &'static Pcache<'static> {
    PCACHE.call_once(|| {
        let (start, size) = REGISTERED_RANGE
            .lock()
            .take()
            .unwrap_or_else(|| panic!("pcache: processor cache not registered"));

        let geometry = CacheGeometry::compute(
            GeometryConfig::default(),
            PhysicalAddress::new(start),
            size,
        )
        .unwrap_or_else(|err| panic!("pcache: unusable cache range: {}", err));
        geometry.log_configuration();

        Pcache::new(geometry, client)
    })
}

/// The process-wide cache, if [`init`] has run.
pub fn get() -> Option<&'static Pcache<'static>> {
    PCACHE.get()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_pcache, TestMemoryNode};
    use lattice_hal::VirtualAddress;
    use lattice_memory::AddressSpace;

    #[test]
    fn test_register_rejects_empty_range() {
        assert_eq!(register_range(0, 0), Err(GeometryError::InvalidRange));
    }

    #[test]
    fn test_register_then_init_serves_faults() {
        // The global is one-shot per process; this test owns it.
        let node: &'static TestMemoryNode = Box::leak(Box::new(TestMemoryNode::new()));
        register_range(0x1000_0000, 4 << 20).expect("valid range");

        let pcache = init(node);
        assert!(core::ptr::eq(pcache, get().expect("initialized")));

        let mm = AddressSpace::new();
        let task = Task::new(1, 1, 0);
        pcache
            .handle_fault(&mm, &task, VirtualAddress::new(0x7000_2000), FaultFlags::USER)
            .expect("fault resolves");
        assert_eq!(pcache.events().read(PcacheEvent::FillFromMemory), 1);
    }

    #[test]
    fn test_line_arena_is_line_granular() {
        let node = TestMemoryNode::new();
        let pcache = small_pcache(&node);
        let line_size = pcache.geometry().line_size();

        let a = pcache.alloc_line(VirtualAddress::new(0)).expect("way");
        // SAFETY: `a` is allocated and private to this test.
        unsafe { pcache.line_data_mut(a) }.fill(0x5A);
        // SAFETY: as above.
        assert!(unsafe { pcache.line_data(a) }.iter().all(|&b| b == 0x5A));
        assert_eq!(unsafe { pcache.line_data(a) }.len(), line_size);
        pcache.release_line(a);
    }
}
