// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Descriptor ring memory and index arithmetic.
//!
//! A ring of `slots` descriptors is followed in the same allocation by an
//! 8-byte status block that hardware writes with its consumer index. One slot
//! is always left empty so `pidx == cidx` means empty, which gives the
//! invariant `avail + in_flight == slots - 1`.

use crate::descriptor::{RingStatus, WireFormat};
use crate::dma::{DmaBuffer, DmaSpace};
use crate::error::QdmaResult;

/// `new - old` on a ring of `size` slots.
#[inline]
pub const fn idx_delta(new: u32, old: u32, size: u32) -> u32 {
    if new >= old {
        new - old
    } else {
        new + size - old
    }
}

/// `idx + n` on a ring of `size` slots.
#[inline]
pub const fn idx_incr(idx: u32, n: u32, size: u32) -> u32 {
    (idx + n) % size
}

/// `idx - n` on a ring of `size` slots.
#[inline]
pub const fn idx_decr(idx: u32, n: u32, size: u32) -> u32 {
    (idx + size - (n % size)) % size
}

/// Hardware-visible descriptor ring with its trailing status block.
pub struct DescRing {
    mem: DmaBuffer,
    slots: u32,
    desc_size: usize,
    size_idx: u8,
    /// Next slot software fills.
    pub(crate) pidx: u32,
    /// Oldest slot hardware has not consumed, as last observed.
    pub(crate) cidx: u32,
    /// Slots software may still fill.
    pub(crate) avail: u32,
}

impl DescRing {
    /// Allocate a zeroed ring of `slots` descriptors of `desc_size` bytes.
    pub fn alloc(
        dma: &DmaSpace,
        slots: u32,
        desc_size: usize,
        size_idx: u8,
        what: &'static str,
    ) -> QdmaResult<Self> {
        let len = slots as usize * desc_size + RingStatus::SIZE;
        let mem = dma.alloc(len, what)?;
        Ok(Self {
            mem,
            slots,
            desc_size,
            size_idx,
            pidx: 0,
            cidx: 0,
            avail: slots - 1,
        })
    }

    /// Hardware slot count.
    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Descriptors that can be in flight at once.
    #[inline]
    pub fn usable(&self) -> u32 {
        self.slots - 1
    }

    /// Index into the ring-size CSR table.
    #[inline]
    pub fn size_idx(&self) -> u8 {
        self.size_idx
    }

    #[inline]
    pub fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// Bus address of slot 0.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.mem.bus_addr()
    }

    #[inline]
    pub fn pidx(&self) -> u32 {
        self.pidx
    }

    #[inline]
    pub fn cidx(&self) -> u32 {
        self.cidx
    }

    #[inline]
    pub fn avail(&self) -> u32 {
        self.avail
    }

    /// Byte offset of the status block.
    #[inline]
    pub fn status_offset(&self) -> usize {
        self.slots as usize * self.desc_size
    }

    /// Store a descriptor at slot `idx`.
    pub fn write<D: WireFormat>(&self, idx: u32, desc: &D) {
        let mut raw = vec![0u8; self.desc_size.max(D::SIZE)];
        desc.encode_into(&mut raw);
        self.mem
            .write(idx as usize * self.desc_size, &raw[..self.desc_size]);
    }

    /// Load the descriptor at slot `idx`.
    pub fn read<D: WireFormat>(&self, idx: u32) -> D {
        let mut raw = vec![0u8; self.desc_size.max(D::SIZE)];
        self.mem.read(idx as usize * self.desc_size, &mut raw);
        D::decode(&raw)
    }

    /// Status block as hardware last wrote it.
    pub fn status(&self) -> RingStatus {
        let mut raw = [0u8; RingStatus::SIZE];
        self.mem.read(self.status_offset(), &mut raw);
        RingStatus::decode(&raw)
    }

    /// Descriptors submitted and not yet consumed.
    #[inline]
    pub fn in_flight(&self) -> u32 {
        idx_delta(self.pidx, self.cidx, self.slots)
    }

    /// Claim the slot at `pidx` and advance. Caller checks `avail > 0`.
    pub(crate) fn produce(&mut self) -> u32 {
        let idx = self.pidx;
        self.pidx = idx_incr(self.pidx, 1, self.slots);
        self.avail -= 1;
        idx
    }

    /// Take credit for descriptors hardware consumed up to `hw_cidx`.
    ///
    /// Returns the recovered credit, or a description of the mismatch when
    /// the reported index is impossible for what software submitted.
    pub(crate) fn reclaim(&mut self, hw_cidx: u32) -> Result<u32, String> {
        if hw_cidx >= self.slots {
            return Err(format!(
                "writeback cidx {} beyond ring of {} slots",
                hw_cidx, self.slots
            ));
        }
        let delta = idx_delta(hw_cidx, self.cidx, self.slots);
        let in_flight = self.in_flight();
        if delta > in_flight {
            return Err(format!(
                "writeback cidx {} consumed {} descriptors, only {} in flight (pidx {}, cidx {})",
                hw_cidx, delta, in_flight, self.pidx, self.cidx
            ));
        }
        self.cidx = hw_cidx;
        self.avail += delta;
        Ok(delta)
    }

    /// `avail + in_flight == slots - 1`.
    pub fn invariant_holds(&self) -> bool {
        self.avail + self.in_flight() == self.slots - 1
    }

    /// The backing allocation, for device-side access in tests.
    pub fn memory(&self) -> &DmaBuffer {
        &self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MmDesc;

    #[test]
    fn test_index_math() {
        assert_eq!(idx_delta(5, 3, 8), 2);
        assert_eq!(idx_delta(1, 6, 8), 3);
        assert_eq!(idx_delta(4, 4, 8), 0);
        assert_eq!(idx_incr(7, 1, 8), 0);
        assert_eq!(idx_incr(6, 5, 8), 3);
        assert_eq!(idx_decr(0, 1, 8), 7);
        assert_eq!(idx_decr(3, 2, 8), 1);
    }

    #[test]
    fn test_produce_and_reclaim() {
        let dma = DmaSpace::new();
        let mut ring = DescRing::alloc(&dma, 9, MmDesc::SIZE, 0, "ring").unwrap();
        assert_eq!(ring.avail(), 8);

        for _ in 0..8 {
            let idx = ring.produce();
            ring.write(idx, &MmDesc::new(0, 0, 64));
            assert!(ring.invariant_holds());
        }
        assert_eq!(ring.avail(), 0);
        assert_eq!(ring.in_flight(), 8);

        assert_eq!(ring.reclaim(5), Ok(5));
        assert_eq!(ring.avail(), 5);
        assert!(ring.invariant_holds());

        for _ in 0..5 {
            ring.produce();
        }
        assert_eq!(ring.pidx(), 4);
        assert_eq!(ring.reclaim(4), Ok(8));
        assert_eq!(ring.avail(), 8);
        assert!(ring.invariant_holds());
    }

    #[test]
    fn test_reclaim_rejects_impossible_cidx() {
        let dma = DmaSpace::new();
        let mut ring = DescRing::alloc(&dma, 9, MmDesc::SIZE, 0, "ring").unwrap();
        ring.produce();
        ring.produce();
        assert!(ring.reclaim(3).is_err());
        assert!(ring.reclaim(9).is_err());
        assert_eq!(ring.cidx(), 0);
        assert_eq!(ring.avail(), 6);
    }

    #[test]
    fn test_status_block_trails_ring() {
        let dma = DmaSpace::new();
        let ring = DescRing::alloc(&dma, 17, MmDesc::SIZE, 14, "ring").unwrap();
        assert_eq!(ring.status_offset(), 17 * 32);
        ring.memory()
            .write(ring.status_offset(), &RingStatus::new(3, 2).to_bytes());
        assert_eq!(ring.status().cidx, 2);

        let desc = MmDesc::new(0x10, 0x20, 99);
        ring.write(16, &desc);
        assert_eq!(ring.read::<MmDesc>(16), desc);
    }
}
