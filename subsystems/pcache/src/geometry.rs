//! # Cache Geometry
//!
//! Partitions the registered physical range into a power-of-two number of
//! cache sets and ways plus a metadata area, and derives the address-bit
//! decomposition (tag / set-index / line-offset) used by every lookup.
//!
//! The carving unit is one metadata page together with the cache lines it
//! describes. The registered size is divided into such units and the unit
//! count is rounded *down* to a power of two: capacity only ever shrinks
//! from the registered size, which keeps the set count a power of two so
//! set-index extraction is a mask, never a modulo.
//!
//! Storage is way-major: all lines of physical way N are contiguous, so
//! walking the ways of one set strides by `set_count * line_size` through
//! the data area and by `set_count * meta_size` through the metadata
//! area. This lets the metadata area be scanned independently of cache-set
//! iteration.

use core::fmt;

use lattice_hal::{prev_power_of_two, PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};

// =============================================================================
// Configuration
// =============================================================================

/// Default cache-line size shift (one page per line).
pub const PCACHE_LINE_SHIFT: u32 = PAGE_SHIFT;

/// Default associativity shift (eight ways).
pub const PCACHE_ASSOCIATIVITY_SHIFT: u32 = 3;

/// Bytes reserved per line descriptor in the metadata area.
pub const PCACHE_META_SIZE: u32 = 64;

/// Build-time style cache parameters.
///
/// The defaults mirror the shipped configuration; tests construct
/// independent geometries with other values.
#[derive(Debug, Clone, Copy)]
pub struct GeometryConfig {
    /// log2 of the cache-line size in bytes.
    pub line_shift: u32,
    /// log2 of the associativity.
    pub associativity_shift: u32,
    /// Bytes per line descriptor; must divide the page size.
    pub meta_size: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            line_shift: PCACHE_LINE_SHIFT,
            associativity_shift: PCACHE_ASSOCIATIVITY_SHIFT,
            meta_size: PCACHE_META_SIZE,
        }
    }
}

/// Error type for geometry registration and computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// `(0, 0)` was offered as the physical range.
    InvalidRange,
    /// The configured line size or metadata size is not usable.
    BadConfig,
    /// The registered range cannot hold even one allocation unit.
    TooSmall,
    /// Fewer lines than ways.
    AssociativityExceedsLines,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::InvalidRange => write!(f, "physical range is not registered"),
            GeometryError::BadConfig => write!(f, "line/metadata sizes are not usable"),
            GeometryError::TooSmall => write!(f, "range too small for one allocation unit"),
            GeometryError::AssociativityExceedsLines => {
                write!(f, "associativity exceeds total line count")
            },
        }
    }
}

// =============================================================================
// Cache Geometry
// =============================================================================

/// The computed shape of the processor-side cache.
///
/// Built once at init from the registered physical range; read-only
/// afterwards. All address decomposition and way iteration goes through
/// this value, so stride arithmetic never leaks into callers.
#[derive(Debug, Clone)]
pub struct CacheGeometry {
    start: PhysicalAddress,
    registered_size: u64,
    usable_size: u64,

    line_size: u32,
    meta_size: u32,
    associativity: u32,

    nr_lines: u64,
    nr_sets: u64,

    data_start: PhysicalAddress,
    meta_start: PhysicalAddress,

    line_bits: u32,
    set_bits: u32,
    tag_bits: u32,

    line_mask: u64,
    set_mask: u64,
    tag_mask: u64,

    way_data_stride: u64,
    way_meta_stride: u64,
}

impl CacheGeometry {
    /// Compute the cache shape for a registered physical range.
    pub fn compute(
        config: GeometryConfig,
        start: PhysicalAddress,
        registered_size: u64,
    ) -> Result<Self, GeometryError> {
        if start.is_null() && registered_size == 0 {
            return Err(GeometryError::InvalidRange);
        }
        if config.line_shift < PAGE_SHIFT
            || config.meta_size == 0
            || !config.meta_size.is_power_of_two()
            || config.meta_size as usize > PAGE_SIZE
        {
            return Err(GeometryError::BadConfig);
        }

        let line_size = 1u64 << config.line_shift;
        let meta_size = config.meta_size as u64;
        let associativity = 1u64 << config.associativity_shift;

        // One unit is the set of lines one metadata page describes, plus
        // the metadata page itself. lines_per_meta_page is a power of two
        // because both factors are, so rounding the unit count down to a
        // power of two makes the total line count one as well.
        let lines_per_meta_page = PAGE_SIZE as u64 / meta_size;
        let unit_size = lines_per_meta_page * line_size + PAGE_SIZE as u64;

        let raw_units = registered_size / unit_size;
        let nr_units = prev_power_of_two(raw_units);
        if nr_units == 0 {
            return Err(GeometryError::TooSmall);
        }
        log::info!("pcache: original nr_units: {}", raw_units);
        log::info!("pcache: rounddown nr_units: {}", nr_units);

        let usable_size = nr_units * unit_size;
        let nr_lines = nr_units * lines_per_meta_page;
        if associativity > nr_lines {
            return Err(GeometryError::AssociativityExceedsLines);
        }
        let nr_sets = nr_lines / associativity;

        let data_start = start;
        let meta_start = data_start + nr_lines * line_size;

        let line_bits = config.line_shift;
        let set_bits = nr_sets.ilog2();
        let tag_bits = 64 - line_bits - set_bits;

        let line_mask = line_size - 1;
        let set_mask = ((1u64 << (line_bits + set_bits)) - 1) & !line_mask;
        let tag_mask = !((1u64 << (line_bits + set_bits)) - 1);

        Ok(Self {
            start,
            registered_size,
            usable_size,
            line_size: line_size as u32,
            meta_size: meta_size as u32,
            associativity: associativity as u32,
            nr_lines,
            nr_sets,
            data_start,
            meta_start,
            line_bits,
            set_bits,
            tag_bits,
            line_mask,
            set_mask,
            tag_mask,
            way_data_stride: nr_sets * line_size,
            way_meta_stride: nr_sets * meta_size,
        })
    }

    /// Render the computed configuration through the logger.
    pub fn log_configuration(&self) {
        log::info!("pcache: processor cache configuration:");
        log::info!("pcache:     start:             {:#x}", self.start);
        log::info!("pcache:     registered size:   {:#x}", self.registered_size);
        log::info!("pcache:     actual used size:  {:#x}", self.usable_size);
        log::info!("pcache:     nr cachelines:     {}", self.nr_lines);
        log::info!("pcache:     associativity:     {}", self.associativity);
        log::info!("pcache:     nr sets:           {}", self.nr_sets);
        log::info!("pcache:     cacheline size:    {} B", self.line_size);
        log::info!("pcache:     metadata size:     {} B", self.meta_size);
        log::info!(
            "pcache:     nr cacheline bits: {:2} [{:2} - {:2}] {:#x}",
            self.line_bits,
            0,
            self.line_bits - 1,
            self.line_mask
        );
        log::info!(
            "pcache:     nr set-index bits: {:2} [{:2} - {:2}] {:#x}",
            self.set_bits,
            self.line_bits,
            self.line_bits + self.set_bits - 1,
            self.set_mask
        );
        log::info!(
            "pcache:     nr tag bits:       {:2} [{:2} - {:2}] {:#x}",
            self.tag_bits,
            self.line_bits + self.set_bits,
            self.line_bits + self.set_bits + self.tag_bits - 1,
            self.tag_mask
        );
        log::info!(
            "pcache:     cacheline range:   [{:#018x} - {:#018x}]",
            self.data_start,
            self.meta_start - 1
        );
        log::info!(
            "pcache:     metadata range:    [{:#018x} - {:#018x}]",
            self.meta_start,
            self.meta_start.as_u64() + self.nr_lines * self.meta_size as u64 - 1
        );
        log::info!("pcache:     way cache stride:  {:#x}", self.way_data_stride);
        log::info!("pcache:     way meta stride:   {:#x}", self.way_meta_stride);
    }

    // -------------------------------------------------------------------------
    // Shape accessors
    // -------------------------------------------------------------------------

    /// Registered range base.
    #[inline]
    pub fn start(&self) -> PhysicalAddress {
        self.start
    }

    /// Registered range size in bytes.
    #[inline]
    pub fn registered_size(&self) -> u64 {
        self.registered_size
    }

    /// Size actually used after round-down, in bytes.
    #[inline]
    pub fn usable_size(&self) -> u64 {
        self.usable_size
    }

    /// Cache-line size in bytes.
    #[inline]
    pub fn line_size(&self) -> usize {
        self.line_size as usize
    }

    /// Bytes per line descriptor in the metadata area.
    #[inline]
    pub fn meta_size(&self) -> usize {
        self.meta_size as usize
    }

    /// Ways per set.
    #[inline]
    pub fn associativity(&self) -> u32 {
        self.associativity
    }

    /// Total number of cache lines.
    #[inline]
    pub fn nr_lines(&self) -> u64 {
        self.nr_lines
    }

    /// Number of cache sets.
    #[inline]
    pub fn nr_sets(&self) -> u64 {
        self.nr_sets
    }

    /// Base of the line-data area.
    #[inline]
    pub fn data_start(&self) -> PhysicalAddress {
        self.data_start
    }

    /// Base of the metadata area (strictly above the data area).
    #[inline]
    pub fn meta_start(&self) -> PhysicalAddress {
        self.meta_start
    }

    /// (line-offset, set-index, tag) bit widths; they sum to 64.
    #[inline]
    pub fn bit_widths(&self) -> (u32, u32, u32) {
        (self.line_bits, self.set_bits, self.tag_bits)
    }

    /// (line-offset, set-index, tag) masks.
    #[inline]
    pub fn masks(&self) -> (u64, u64, u64) {
        (self.line_mask, self.set_mask, self.tag_mask)
    }

    // -------------------------------------------------------------------------
    // Address decomposition
    // -------------------------------------------------------------------------

    /// Extract the set index of a virtual address.
    #[inline]
    pub fn set_of(&self, addr: VirtualAddress) -> usize {
        ((addr.as_u64() & self.set_mask) >> self.line_bits) as usize
    }

    /// Extract the tag bits of a virtual address.
    #[inline]
    pub fn tag_of(&self, addr: VirtualAddress) -> u64 {
        addr.as_u64() & self.tag_mask
    }

    /// Align a virtual address down to its line base.
    #[inline]
    pub fn line_align(&self, addr: VirtualAddress) -> VirtualAddress {
        addr.align_down(self.line_size as u64)
    }

    /// Walk the ways an address can occupy.
    ///
    /// Yields exactly `associativity` entries; way 0 sits at the set's
    /// base line and metadata addresses, each further way one stride on.
    #[inline]
    pub fn ways(&self, addr: VirtualAddress) -> WayWalker<'_> {
        self.ways_of_set(self.set_of(addr))
    }

    /// Walk the ways of a set given directly by index.
    pub fn ways_of_set(&self, set_index: usize) -> WayWalker<'_> {
        debug_assert!((set_index as u64) < self.nr_sets);
        WayWalker {
            geometry: self,
            set_index,
            line: self.data_start + ((set_index as u64) << self.line_bits),
            meta: self.meta_start + set_index as u64 * self.meta_size as u64,
            way: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Arena indexing
    // -------------------------------------------------------------------------

    /// Whether a physical address falls inside the line-data area on a
    /// line boundary.
    #[inline]
    pub fn contains_line(&self, addr: PhysicalAddress) -> bool {
        addr >= self.data_start && addr < self.meta_start && addr.is_aligned(self.line_size as u64)
    }

    /// Arena index of a line-data physical address.
    #[inline]
    pub fn line_index(&self, line: PhysicalAddress) -> usize {
        debug_assert!(self.contains_line(line));
        ((line - self.data_start) >> self.line_bits) as usize
    }

    /// Line-data physical address of an arena index.
    #[inline]
    pub fn line_paddr(&self, index: usize) -> PhysicalAddress {
        debug_assert!((index as u64) < self.nr_lines);
        self.data_start + ((index as u64) << self.line_bits)
    }

    /// Metadata physical address of an arena index.
    #[inline]
    pub fn meta_paddr(&self, index: usize) -> PhysicalAddress {
        debug_assert!((index as u64) < self.nr_lines);
        self.meta_start + index as u64 * self.meta_size as u64
    }

    /// Set index a line (by arena index) belongs to.
    #[inline]
    pub fn set_of_index(&self, index: usize) -> usize {
        index & (self.nr_sets as usize - 1)
    }

    /// Way number of a line given by arena index.
    #[inline]
    pub fn way_of_index(&self, index: usize) -> u32 {
        (index >> self.set_bits) as u32
    }
}

// =============================================================================
// Way Walker
// =============================================================================

/// One way of a set, as produced by [`CacheGeometry::ways`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaySlot {
    /// Physical address of the cache line.
    pub line: PhysicalAddress,
    /// Physical address of the line's metadata descriptor.
    pub meta: PhysicalAddress,
    /// Way number within the set.
    pub way: u32,
    /// Arena index of the line (`way * nr_sets + set`).
    pub index: usize,
}

/// Iterator over all ways of one set; finite and restartable.
#[derive(Debug, Clone)]
pub struct WayWalker<'a> {
    geometry: &'a CacheGeometry,
    set_index: usize,
    line: PhysicalAddress,
    meta: PhysicalAddress,
    way: u32,
}

impl Iterator for WayWalker<'_> {
    type Item = WaySlot;

    fn next(&mut self) -> Option<WaySlot> {
        if self.way >= self.geometry.associativity {
            return None;
        }
        let slot = WaySlot {
            line: self.line,
            meta: self.meta,
            way: self.way,
            index: self.way as usize * self.geometry.nr_sets as usize + self.set_index,
        };
        self.way += 1;
        self.line += self.geometry.way_data_stride;
        self.meta += self.geometry.way_meta_stride;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.geometry.associativity - self.way) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for WayWalker<'_> {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(size: u64) -> CacheGeometry {
        CacheGeometry::compute(
            GeometryConfig::default(),
            PhysicalAddress::new(0x1000_0000),
            size,
        )
        .expect("usable geometry")
    }

    #[test]
    fn test_bit_partition_is_exact() {
        for size in [1 << 21, 1 << 24, 64 << 20, 517 << 20] {
            let g = geometry(size);
            let (line, set, tag) = g.bit_widths();
            assert_eq!(line + set + tag, 64);
            assert!(g.nr_sets().is_power_of_two());
            assert!(g.nr_lines().is_power_of_two());

            let (line_mask, set_mask, tag_mask) = g.masks();
            assert_eq!(line_mask ^ set_mask ^ tag_mask, u64::MAX);
            assert_eq!(line_mask & set_mask, 0);
            assert_eq!(set_mask & tag_mask, 0);
        }
    }

    #[test]
    fn test_rounddown_only_shrinks() {
        let config = GeometryConfig::default();
        let unit = (PAGE_SIZE as u64 / PCACHE_META_SIZE as u64) * PAGE_SIZE as u64
            + PAGE_SIZE as u64;

        for raw_units in [1u64, 2, 3, 5, 127, 252] {
            let size = raw_units * unit + unit / 2;
            let g = geometry(size);
            assert!(g.usable_size() <= size);
            let units = g.nr_lines() / (PAGE_SIZE as u64 / config.meta_size as u64);
            assert_eq!(units, prev_power_of_two(raw_units));
        }
    }

    #[test]
    fn test_too_small_range_rejected() {
        let err = CacheGeometry::compute(
            GeometryConfig::default(),
            PhysicalAddress::new(0x1000),
            PAGE_SIZE as u64,
        )
        .unwrap_err();
        assert_eq!(err, GeometryError::TooSmall);
    }

    #[test]
    fn test_unregistered_range_rejected() {
        let err =
            CacheGeometry::compute(GeometryConfig::default(), PhysicalAddress::null(), 0)
                .unwrap_err();
        assert_eq!(err, GeometryError::InvalidRange);
    }

    #[test]
    fn test_bad_meta_size_rejected() {
        let config = GeometryConfig {
            meta_size: 48,
            ..GeometryConfig::default()
        };
        let err = CacheGeometry::compute(config, PhysicalAddress::new(0x1000), 64 << 20)
            .unwrap_err();
        assert_eq!(err, GeometryError::BadConfig);
    }

    #[test]
    fn test_way_walk_shares_one_set() {
        let g = geometry(16 << 20);
        let addr = VirtualAddress::new(0x7F00_1234_5678);
        let set = g.set_of(addr);

        let slots: alloc::vec::Vec<WaySlot> = g.ways(addr).collect();
        assert_eq!(slots.len(), g.associativity() as usize);

        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.way, i as u32);
            assert_eq!(g.set_of_index(slot.index), set);
            assert_eq!(g.way_of_index(slot.index), slot.way);
            assert_eq!(g.line_paddr(slot.index), slot.line);
            assert_eq!(g.meta_paddr(slot.index), slot.meta);
        }

        // Successive fixed strides, all (line, meta) pairs distinct.
        for pair in slots.windows(2) {
            assert_eq!(pair[1].line - pair[0].line, g.nr_sets() * g.line_size() as u64);
            assert_eq!(pair[1].meta - pair[0].meta, g.nr_sets() * g.meta_size() as u64);
        }
    }

    #[test]
    fn test_example_64mib_4way() {
        // register(start=0x1000_0000, size=64 MiB), 4 KiB lines, 4 ways.
        let config = GeometryConfig {
            line_shift: 12,
            associativity_shift: 2,
            meta_size: 64,
        };
        let g = CacheGeometry::compute(config, PhysicalAddress::new(0x1000_0000), 64 << 20)
            .expect("usable geometry");

        assert!(g.nr_sets().is_power_of_two());
        assert_eq!(g.associativity(), 4);
        assert!(g.usable_size() <= 64 << 20);

        let addr = VirtualAddress::new(0x1234_5678);
        let slots: alloc::vec::Vec<WaySlot> = g.ways(addr).collect();
        assert_eq!(slots.len(), 4);
        for slot in &slots {
            // Metadata addresses lie strictly above all data addresses.
            assert!(slot.meta >= g.meta_start());
            assert!(slot.line < g.meta_start());
        }
    }

    #[test]
    fn test_decompose_matches_masks() {
        let g = geometry(32 << 20);
        let addr = VirtualAddress::new(0xABCD_EF12_3456);
        let (_, set_mask, _) = g.masks();
        let (line_bits, _, _) = g.bit_widths();

        assert_eq!(g.set_of(addr), ((addr.as_u64() & set_mask) >> line_bits) as usize);
        assert_eq!(g.tag_of(addr) & !g.masks().2, 0);
        assert_eq!(g.line_align(addr).as_u64() & (g.line_size() as u64 - 1), 0);
    }

    #[test]
    fn test_line_index_roundtrip() {
        let g = geometry(8 << 20);
        for index in [0usize, 1, 7, g.nr_lines() as usize - 1] {
            let paddr = g.line_paddr(index);
            assert!(g.contains_line(paddr));
            assert_eq!(g.line_index(paddr), index);
        }
        assert!(!g.contains_line(g.meta_start()));
        assert!(!g.contains_line(g.data_start() + 1));
    }
}
