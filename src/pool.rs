//! Per-slot DMA scratch resources.
//!
//! Each queue-pair owns one DMA-coherent region carved into `depth`
//! fixed-size slots. A slot provides the scratch memory one in-flight
//! request needs: an IV buffer, a doubled MAC buffer (one half for the
//! device to write into, one half holding the expected tag to verify
//! against), and a pooled small-packet buffer (`pbuf`) laid out as
//! `payload || IV || MAC` for requests small enough to skip
//! scatter-gather mapping.
//!
//! Slots are allocated once and reused across requests; a slot is
//! exclusively owned by its request from allocation until the slot id
//! is freed on the completion path.

use crate::os::{Pages, PAGE_SIZE};
use crate::prelude::*;
use crate::queue::SlotId;

/// Capacity of the pooled small-packet data area.
pub const PBUF_DATA_SIZE: usize = 512;

const IV_SIZE: usize = 16;
const MAC_HALF_SIZE: usize = 32;

const IV_OFF: usize = 0;
const MAC_SCRATCH_OFF: usize = IV_OFF + IV_SIZE;
const MAC_VERIFY_OFF: usize = MAC_SCRATCH_OFF + MAC_HALF_SIZE;
const PBUF_OFF: usize = MAC_VERIFY_OFF + MAC_HALF_SIZE;
const PBUF_IV_OFF: usize = PBUF_OFF + PBUF_DATA_SIZE;
const PBUF_MAC_OFF: usize = PBUF_IV_OFF + IV_SIZE;
const SLOT_BYTES: usize = PBUF_MAC_OFF + MAC_HALF_SIZE - IV_OFF;

/// DMA scratch buffers for one queue-pair, indexed by slot id.
pub(crate) struct ResourcePool {
    pages: Pages,
    depth: usize,
}

impl ResourcePool {
    pub fn new(depth: usize) -> Result<Self> {
        let bytes = depth
            .checked_mul(SLOT_BYTES)
            .ok_or(Error::new(InvalidArgs))?;
        let pages = Pages::alloc((bytes + PAGE_SIZE - 1) / PAGE_SIZE)?;
        Ok(Self { pages, depth })
    }

    fn slot_off(&self, slot: SlotId) -> usize {
        let slot = slot as usize;
        assert!(slot < self.depth, "slot id out of range");
        slot * SLOT_BYTES
    }

    /// Borrow a sub-region of a slot mutably.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `slot`: the slot id was handed
    /// out by the allocator and has not been freed, and no other
    /// reference into the same slot is alive.
    unsafe fn region(&self, slot: SlotId, off: usize, len: usize) -> &mut [u8] {
        let base = self.pages.base().as_ptr();
        // SAFETY: the offset stays inside the allocation and the
        // exclusive-slot contract rules out aliasing.
        unsafe { core::slice::from_raw_parts_mut(base.add(self.slot_off(slot) + off), len) }
    }

    pub fn iv_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + IV_OFF)
    }

    pub fn mac_scratch_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + MAC_SCRATCH_OFF)
    }

    pub fn mac_verify_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + MAC_VERIFY_OFF)
    }

    pub fn pbuf_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + PBUF_OFF)
    }

    pub fn pbuf_iv_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + PBUF_IV_OFF)
    }

    pub fn pbuf_mac_addr(&self, slot: SlotId) -> u64 {
        self.pages.bus_addr(self.slot_off(slot) + PBUF_MAC_OFF)
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn iv_mut(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, IV_OFF, IV_SIZE) }
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn mac_scratch(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, MAC_SCRATCH_OFF, MAC_HALF_SIZE) }
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn mac_verify(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, MAC_VERIFY_OFF, MAC_HALF_SIZE) }
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn pbuf_data(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, PBUF_OFF, PBUF_DATA_SIZE) }
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn pbuf_iv(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, PBUF_IV_OFF, IV_SIZE) }
    }

    /// # Safety
    ///
    /// See [`ResourcePool::region`].
    pub unsafe fn pbuf_mac(&self, slot: SlotId) -> &mut [u8] {
        unsafe { self.region(slot, PBUF_MAC_OFF, MAC_HALF_SIZE) }
    }
}
