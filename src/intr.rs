// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interrupt vectors and coalescing rings.
//!
//! Vector layout per function:
//!
//! | Function | Vector 0 | Vector 1 | Data vectors |
//! |----------|----------|----------|--------------|
//! | privileged | error | mailbox | 2.. |
//! | restricted | mailbox | - | 1.. |
//!
//! In direct mode each queue is bound to one data vector and an interrupt on
//! that vector services every queue bound to it. In coalesced mode each data
//! vector owns a ring that hardware fills with `(qid, direction)` entries;
//! the handler walks entries while their color bit matches, services the
//! named queues and publishes the ring's consumer index.

use crate::context::CoalContext;
use crate::descriptor::{IntrEntry, WireFormat};
use crate::dma::{DmaBuffer, DmaSpace};
use crate::error::{QdmaError, QdmaResult};
use crate::queue::{Direction, QueueHandle};
use crate::regs::{intr_cidx_reg, RegisterAccess};
use crate::ring::idx_incr;
use std::fmt;

/// Default coalescing ring size index (512 entries).
pub const DEFAULT_COAL_RING_IDX: u8 = 0;

/// How completions reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqMode {
    /// Worker threads poll writeback and completion status.
    #[default]
    Poll,
    /// One vector per queue group.
    Direct,
    /// Per-vector coalescing rings.
    Coalesced,
    /// Coalesce when there are fewer data vectors than queues.
    Auto,
}

impl IrqMode {
    /// Resolve `Auto` and fall back to polling without data vectors.
    pub fn resolve(self, data_vectors: u16, qmax: u32) -> Self {
        if data_vectors == 0 {
            return Self::Poll;
        }
        match self {
            Self::Auto if (data_vectors as u32) < qmax => Self::Coalesced,
            Self::Auto => Self::Direct,
            other => other,
        }
    }
}

impl fmt::Display for IrqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Poll => "poll",
            Self::Direct => "direct",
            Self::Coalesced => "coalesced",
            Self::Auto => "auto",
        })
    }
}

/// What an interrupt vector is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorRole {
    Error,
    Mailbox,
    Data,
}

/// A queue's interrupt assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorBinding {
    /// Absolute vector number.
    pub vector: u16,
    /// Completions go through the coalescing ring of `vector`.
    pub coalesced: bool,
}

/// Coalescing ring owned by one data vector.
pub struct CoalRing {
    mem: DmaBuffer,
    vector: u16,
    size_idx: u8,
    slots: u32,
    cidx: u32,
    color: bool,
}

impl CoalRing {
    /// Allocate the ring for `vector` with `CoalContext::slots_for(size_idx)`
    /// entries.
    pub fn alloc(dma: &DmaSpace, vector: u16, size_idx: u8) -> QdmaResult<Self> {
        let slots = CoalContext::slots_for(size_idx);
        let mem = dma.alloc(slots as usize * IntrEntry::SIZE, "coalescing ring")?;
        Ok(Self {
            mem,
            vector,
            size_idx,
            slots,
            cidx: 0,
            color: true,
        })
    }

    /// Context that points hardware at this ring.
    pub fn context(&self) -> CoalContext {
        CoalContext {
            valid: true,
            vec_id: self.vector,
            color: true,
            ring_size_idx: self.size_idx,
            base: self.mem.bus_addr(),
            pidx: 0,
        }
    }

    pub fn vector(&self) -> u16 {
        self.vector
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Collect every valid entry and publish the new consumer index.
    ///
    /// `qbase` converts hardware queue ids back into handles; entries for
    /// queues outside `[qbase, qbase + qmax)` are logged and skipped.
    pub fn drain(&mut self, regs: &dyn RegisterAccess, qbase: u32, qmax: u32) -> Vec<QueueHandle> {
        let mut out = Vec::new();
        let mut raw = [0u8; IntrEntry::SIZE];
        let start = self.cidx;
        loop {
            self.mem.read(self.cidx as usize * IntrEntry::SIZE, &mut raw);
            let entry = IntrEntry::decode(&raw);
            if entry.color != self.color {
                break;
            }
            let qid = entry.qid as u32;
            if qid >= qbase && qid < qbase + qmax {
                let dir = if entry.c2h {
                    Direction::C2h
                } else {
                    Direction::H2c
                };
                let handle = QueueHandle::new((qid - qbase) as u16, dir);
                if !out.contains(&handle) {
                    out.push(handle);
                }
            } else {
                log::warn!(
                    "vector {}: coalescing entry for foreign queue {:#x}",
                    self.vector,
                    qid
                );
            }
            self.cidx = idx_incr(self.cidx, 1, self.slots);
            if self.cidx == 0 {
                self.color = !self.color;
            }
            if self.cidx == start {
                break;
            }
        }
        if self.cidx != start {
            regs.write32(intr_cidx_reg(self.vector as u32), self.cidx);
        }
        out
    }
}

/// Vector bookkeeping for one function.
pub struct VectorTable {
    vec_base: u16,
    count: u16,
    reserved: u16,
    mode: IrqMode,
    /// Queues bound to each data vector.
    bound: Vec<Vec<QueueHandle>>,
}

impl VectorTable {
    /// `count` vectors starting at `vec_base`; the first one (restricted) or
    /// two (privileged) are reserved. `mode` must already be resolved.
    pub fn new(vec_base: u16, count: u16, privileged: bool, mode: IrqMode) -> Self {
        let reserved = if privileged { 2 } else { 1 };
        let data = count.saturating_sub(reserved);
        Self {
            vec_base,
            count,
            reserved,
            mode,
            bound: vec![Vec::new(); data as usize],
        }
    }

    /// Number of vectors usable for queues.
    pub fn data_vectors(&self) -> u16 {
        self.bound.len() as u16
    }

    pub fn mode(&self) -> IrqMode {
        self.mode
    }

    pub fn vec_base(&self) -> u16 {
        self.vec_base
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// Absolute vector numbers of the data vectors.
    pub fn data_vector_ids(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.data_vectors()).map(move |i| self.vec_base + self.reserved + i)
    }

    /// Classify an absolute vector number.
    pub fn role(&self, vector: u16, privileged: bool) -> Option<VectorRole> {
        let rel = vector.checked_sub(self.vec_base)?;
        if rel >= self.count {
            return None;
        }
        Some(match (privileged, rel) {
            (true, 0) => VectorRole::Error,
            (true, 1) | (false, 0) => VectorRole::Mailbox,
            _ => VectorRole::Data,
        })
    }

    /// Bind `handle` to the least-loaded data vector; `None` in poll mode.
    ///
    /// # Errors
    ///
    /// [`QdmaError::ResourceExhausted`] when interrupts are enabled but no
    /// data vector exists.
    pub fn assign(&mut self, handle: QueueHandle) -> QdmaResult<Option<VectorBinding>> {
        if self.mode == IrqMode::Poll {
            return Ok(None);
        }
        let (slot, queues) = self
            .bound
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, q)| q.len())
            .ok_or_else(|| QdmaError::ResourceExhausted("no data interrupt vector".into()))?;
        queues.push(handle);
        Ok(Some(VectorBinding {
            vector: self.vec_base + self.reserved + slot as u16,
            coalesced: self.mode == IrqMode::Coalesced,
        }))
    }

    /// Undo [`assign`](Self::assign).
    pub fn release(&mut self, handle: QueueHandle, binding: VectorBinding) {
        if let Some(queues) = self.slot_mut(binding.vector) {
            queues.retain(|h| *h != handle);
        }
    }

    /// Queues bound to data vector `vector`.
    pub fn queues_on(&self, vector: u16) -> &[QueueHandle] {
        let rel = vector.wrapping_sub(self.vec_base + self.reserved) as usize;
        self.bound.get(rel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of queues bound to `vector`.
    pub fn load(&self, vector: u16) -> usize {
        self.queues_on(vector).len()
    }

    fn slot_mut(&mut self, vector: u16) -> Option<&mut Vec<QueueHandle>> {
        let rel = vector.wrapping_sub(self.vec_base + self.reserved) as usize;
        self.bound.get_mut(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRegs {
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl RegisterAccess for RecordingRegs {
        fn read32(&self, _offset: u32) -> u32 {
            0
        }

        fn write32(&self, offset: u32, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    #[test]
    fn test_irq_mode_resolution() {
        assert_eq!(IrqMode::Auto.resolve(4, 16), IrqMode::Coalesced);
        assert_eq!(IrqMode::Auto.resolve(16, 16), IrqMode::Direct);
        assert_eq!(IrqMode::Direct.resolve(0, 16), IrqMode::Poll);
        assert_eq!(IrqMode::Direct.resolve(2, 16), IrqMode::Direct);
    }

    #[test]
    fn test_vector_roles() {
        let pf = VectorTable::new(0, 8, true, IrqMode::Direct);
        assert_eq!(pf.data_vectors(), 6);
        assert_eq!(pf.role(0, true), Some(VectorRole::Error));
        assert_eq!(pf.role(1, true), Some(VectorRole::Mailbox));
        assert_eq!(pf.role(2, true), Some(VectorRole::Data));
        assert_eq!(pf.role(8, true), None);

        let vf = VectorTable::new(16, 4, false, IrqMode::Direct);
        assert_eq!(vf.role(16, false), Some(VectorRole::Mailbox));
        assert_eq!(vf.role(17, false), Some(VectorRole::Data));
        assert_eq!(vf.data_vector_ids().collect::<Vec<_>>(), vec![17, 18, 19]);
    }

    #[test]
    fn test_assign_balances_load() {
        let mut table = VectorTable::new(0, 4, true, IrqMode::Direct);
        let mut bindings = Vec::new();
        for i in 0..5 {
            let h = QueueHandle::new(i, Direction::H2c);
            bindings.push((h, table.assign(h).unwrap().unwrap()));
        }
        assert_eq!(table.load(2), 3);
        assert_eq!(table.load(3), 2);

        let (h, b) = bindings[0];
        assert_eq!(b.vector, 2);
        table.release(h, b);
        assert_eq!(table.load(2), 2);
        assert_eq!(table.queues_on(3).len(), 2);
    }

    #[test]
    fn test_assign_in_poll_mode() {
        let mut table = VectorTable::new(0, 0, true, IrqMode::Poll);
        assert_eq!(table.assign(QueueHandle::new(0, Direction::C2h)).unwrap(), None);

        let mut table = VectorTable::new(0, 2, true, IrqMode::Direct);
        let err = table.assign(QueueHandle::new(0, Direction::C2h)).unwrap_err();
        assert!(matches!(err, QdmaError::ResourceExhausted(_)));
    }

    #[test]
    fn test_coalescing_ring_drain() {
        let dma = DmaSpace::new();
        let mut ring = CoalRing::alloc(&dma, 2, 0).unwrap();
        assert_eq!(ring.slots(), 512);

        let put = |idx: usize, qid: u16, c2h: bool, color: bool| {
            let e = IntrEntry { qid, c2h, color };
            ring.mem.write(idx * IntrEntry::SIZE, &e.to_bytes());
        };
        put(0, 10, true, true);
        put(1, 11, false, true);
        put(2, 10, true, true);

        let regs = RecordingRegs::default();
        let handles = ring.drain(&regs, 8, 8);
        assert_eq!(
            handles,
            vec![
                QueueHandle::new(2, Direction::C2h),
                QueueHandle::new(3, Direction::H2c)
            ]
        );
        assert_eq!(ring.cidx, 3);
        assert_eq!(*regs.writes.lock().unwrap(), vec![(intr_cidx_reg(2), 3)]);

        assert!(ring.drain(&regs, 8, 8).is_empty());
        assert_eq!(regs.writes.lock().unwrap().len(), 1);
    }
}
