//! Interfaces to the external queue-pair transport and the SGL pool.
//!
//! The engine never touches rings or doorbell registers itself: it
//! hands fully-built descriptors to a `QueueTransport` and gets raw
//! completed descriptors back through `SecContext::complete`, which
//! the transport's interrupt context is expected to invoke. Likewise
//! scatter-gather DMA setup goes through an `SglPool` collaborator
//! that turns a caller scatter list into a device-walkable entry
//! table.

use crate::descriptor::SecDescriptor;
use crate::prelude::*;
use crate::request::ScatterList;
use ostd::Pod;

/// One entry of a device-walkable scatter-gather table.
#[repr(C)]
#[derive(Copy, Clone, Pod, Debug, Default)]
pub struct SglEntry {
    pub addr: u64,
    pub len: u32,
    pub reserved: u32,
}

/// Header preceding the entries of a device-walkable table.
#[repr(C)]
#[derive(Copy, Clone, Pod, Debug, Default)]
pub struct SglHeader {
    pub entry_count: u32,
    pub total_len: u32,
}

/// A live SGL mapping: the bus address of the entry table plus the
/// pool's handle for releasing it.
#[derive(Debug)]
pub struct SglMapping {
    pub dma_addr: u64,
    pub handle: u64,
}

/// The hardware queue-pair transport.
pub trait QueueTransport: Send + Sync {
    /// Ring the doorbell for one descriptor on queue-pair `qp`.
    ///
    /// `Retry` reports a transient full ring; any other error is a
    /// hard submission failure.
    fn send(&self, qp: usize, desc: &SecDescriptor) -> Result<()>;

    /// Number of descriptors the device currently holds for `qp`.
    fn used_count(&self, qp: usize) -> usize;
}

/// The IOMMU-backed scatter-gather-list pool.
pub trait SglPool: Send + Sync {
    /// Map a caller scatter list into a device-walkable entry table.
    fn map_scatterlist(&self, list: &ScatterList) -> Result<SglMapping>;

    /// Release a mapping produced by `map_scatterlist`.
    fn unmap(&self, mapping: SglMapping);
}
