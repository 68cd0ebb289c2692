//! Shared test fixtures: a scriptable in-process memory node and a small
//! cache instance most suites start from.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

use lattice_hal::{PhysicalAddress, VirtualAddress};

use crate::fill::{MemoryNodeClient, MissRequest, NetError, NodeId};
use crate::geometry::{CacheGeometry, GeometryConfig};
use crate::Pcache;

/// What the scripted node does with the next miss request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReplyMode {
    /// Serve a full line of deterministic pattern bytes.
    Serve,
    /// Report a remote error with this code.
    Deny(i32),
    /// Fail at the transport level.
    Fail(NetError),
    /// Reply with a protocol-violating length.
    BadLength(usize),
}

/// Deterministic content byte for offset `i` of the line at `address`.
pub(crate) fn pattern_byte(address: u64, i: usize) -> u8 {
    ((address >> 12) as u8) ^ (i as u8) ^ 0x3C
}

/// An in-process memory node with scriptable failure modes.
pub(crate) struct TestMemoryNode {
    mode: Mutex<ReplyMode>,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicU64,
    flushes: AtomicU64,
    flushed: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl TestMemoryNode {
    pub(crate) fn new() -> Self {
        Self {
            mode: Mutex::new(ReplyMode::Serve),
            delay: Mutex::new(None),
            fetches: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flushed: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn set_mode(&self, mode: ReplyMode) {
        *self.mode.lock() = mode;
    }

    /// Stretch each fetch, widening race windows in concurrency tests.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub(crate) fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn flushed_content(&self, address: VirtualAddress) -> Option<Vec<u8>> {
        self.flushed.lock().get(&address.as_u64()).cloned()
    }
}

impl MemoryNodeClient for TestMemoryNode {
    fn request_line(
        &self,
        _node: NodeId,
        request: &MissRequest,
        line: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, NetError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        match *self.mode.lock() {
            ReplyMode::Serve => {
                let base = request.missing_vaddr & !(line.len() as u64 - 1);
                for (i, byte) in line.iter_mut().enumerate() {
                    *byte = pattern_byte(base, i);
                }
                Ok(line.len())
            },
            ReplyMode::Deny(code) => {
                line[..4].copy_from_slice(&code.to_ne_bytes());
                Ok(core::mem::size_of::<i32>())
            },
            ReplyMode::Fail(err) => Err(err),
            ReplyMode::BadLength(len) => Ok(len),
        }
    }

    fn flush_line(
        &self,
        _node: NodeId,
        _tgid: u32,
        address: VirtualAddress,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), NetError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed.lock().insert(address.as_u64(), data.to_vec());
        Ok(())
    }
}

/// One allocation unit of default geometry: 64 lines, 8 sets, 8 ways.
pub(crate) fn small_pcache(node: &TestMemoryNode) -> Pcache<'_> {
    let geometry = CacheGeometry::compute(
        GeometryConfig::default(),
        PhysicalAddress::new(0x1000_0000),
        300 * 1024,
    )
    .expect("usable test geometry");
    Pcache::new(geometry, node)
}

/// Verify a filled line against the pattern the node serves.
pub(crate) fn assert_line_matches(pcache: &Pcache<'_>, index: usize, address: VirtualAddress) {
    let base = pcache.geometry().line_align(address).as_u64();
    // SAFETY: test-only read; the suites only call this on settled lines.
    let data = unsafe { pcache.line_data(index) };
    for (i, &byte) in data.iter().enumerate() {
        assert_eq!(byte, pattern_byte(base, i), "byte {} of line {}", i, index);
    }
}
