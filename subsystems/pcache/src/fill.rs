//! # Line Fill
//!
//! The network boundary of the cache and the pluggable fill strategies.
//!
//! A miss produces a [`MissRequest`] that is sent to the remote node
//! owning the faulting task's memory; the reply body is written directly
//! into the allocated line's storage. Exactly three outcomes exist:
//!
//! 1. the reply carries one full line of bytes - success;
//! 2. the reply is a single integer - the remote rejected the access;
//! 3. the transport itself failed - its error is surfaced unchanged.
//!
//! Any other reply length means the remote and local views of the cache
//! have desynchronized; that is unrecoverable and aborts after logging.

use core::fmt;
use core::time::Duration;

use lattice_hal::VirtualAddress;

use crate::fault::FaultFlags;
use crate::set::PsetEvent;
use crate::stat::PcacheEvent;
use crate::task::Task;
use crate::Pcache;

/// Identity of a remote memory node.
pub type NodeId = u32;

/// Bounded timeout applied to every remote request.
pub const DEF_NET_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Wire Types
// =============================================================================

/// Payload of a line-miss request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissRequest {
    /// Requesting process id.
    pub pid: u32,
    /// Thread-group id owning the address space.
    pub tgid: u32,
    /// Raw fault flags, as carried by the faulting access.
    pub flags: u32,
    /// The faulting virtual address.
    pub missing_vaddr: u64,
}

/// Transport-level failure, propagated unchanged to the fault caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The interconnect is not available.
    Unavailable,
    /// No reply arrived within the bounded timeout.
    TimedOut,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Unavailable => write!(f, "interconnect unavailable"),
            NetError::TimedOut => write!(f, "reply timed out"),
        }
    }
}

/// Access to the remote memory service.
///
/// `request_line` writes the reply body into `line` and returns the reply
/// length; the caller decodes the three-outcome protocol above.
/// `flush_line` writes one line of dirty content back to its owner.
pub trait MemoryNodeClient: Sync {
    /// Send a line-miss request and await its reply.
    fn request_line(
        &self,
        node: NodeId,
        request: &MissRequest,
        line: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, NetError>;

    /// Write one line of content back to its owner.
    fn flush_line(
        &self,
        node: NodeId,
        tgid: u32,
        address: VirtualAddress,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), NetError>;
}

// =============================================================================
// Fill Strategies
// =============================================================================

/// Why a fill attempt failed; mapped to a fault signal by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    /// The remote owner rejected the access with this code.
    Denied(i32),
    /// The transport failed.
    Net(NetError),
}

impl fmt::Display for FillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillError::Denied(code) => write!(f, "remote denied access (code {})", code),
            FillError::Net(err) => write!(f, "{}", err),
        }
    }
}

/// A source that can populate a freshly allocated line.
///
/// The two variants - remote fetch and victim cache - are selected
/// statically by the miss policy; both funnel through the common fill
/// path of the fault resolver.
pub(crate) trait FillSource {
    fn fill_line(
        &self,
        pcache: &Pcache<'_>,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        index: usize,
    ) -> Result<(), FillError>;
}

/// Fill from the remote memory owner.
pub(crate) struct RemoteFill;

impl FillSource for RemoteFill {
    fn fill_line(
        &self,
        pcache: &Pcache<'_>,
        task: &Task,
        address: VirtualAddress,
        flags: FaultFlags,
        index: usize,
    ) -> Result<(), FillError> {
        let request = MissRequest {
            pid: task.pid,
            tgid: task.tgid,
            flags: flags.bits(),
            missing_vaddr: address.as_u64(),
        };
        log::debug!(
            "pcache: miss fetch pid:{} tgid:{} address:{} flags:{:#x}",
            request.pid,
            request.tgid,
            address,
            request.flags
        );

        // SAFETY: `index` was just allocated and is not yet valid, so this
        // context has exclusive access to the line's bytes.
        let line = unsafe { pcache.line_data_mut(index) };
        let line_size = line.len();

        let len = pcache
            .client()
            .request_line(task.home_node, &request, line, DEF_NET_TIMEOUT)
            .map_err(FillError::Net)?;

        if len == line_size {
            pcache.set_of_line(index).inc_stat(PsetEvent::Fill);
            pcache.events().inc(PcacheEvent::FillFromMemory);
            return Ok(());
        }

        if len == core::mem::size_of::<i32>() {
            let mut code = [0u8; 4];
            code.copy_from_slice(&line[..4]);
            return Err(FillError::Denied(i32::from_ne_bytes(code)));
        }

        log::error!(
            "pcache: invalid miss reply length {} (expected {} or {}) for address {} tgid {}",
            len,
            line_size,
            core::mem::size_of::<i32>(),
            address,
            request.tgid
        );
        panic!("pcache: miss reply violates the line-fetch protocol");
    }
}

/// Fill from a victim-cache entry captured at eviction time.
#[cfg(feature = "eviction-victim")]
pub(crate) struct VictimFill<'d> {
    data: &'d [u8],
}

#[cfg(feature = "eviction-victim")]
impl<'d> VictimFill<'d> {
    pub(crate) fn new(data: &'d [u8]) -> Self {
        Self { data }
    }
}

#[cfg(feature = "eviction-victim")]
impl FillSource for VictimFill<'_> {
    fn fill_line(
        &self,
        pcache: &Pcache<'_>,
        _task: &Task,
        _address: VirtualAddress,
        _flags: FaultFlags,
        index: usize,
    ) -> Result<(), FillError> {
        // SAFETY: as above - the line is allocated and private to us.
        let line = unsafe { pcache.line_data_mut(index) };
        line.copy_from_slice(self.data);

        pcache.set_of_line(index).inc_stat(PsetEvent::Fill);
        pcache.events().inc(PcacheEvent::FillFromVictim);
        Ok(())
    }
}
