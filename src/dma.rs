// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host DMA address space.
//!
//! Rings, free buffers and request buffers are all [`DmaBuffer`]s handed out
//! by a [`DmaSpace`]. Each buffer has a stable bus address that is written
//! into descriptors and contexts; the device side (the emulator, or an IOMMU
//! mapping on real hardware) resolves bus addresses back to memory through
//! the same space. A buffer unregisters itself when its last handle drops,
//! so ring memory can never be freed while a queue still holds it.

use crate::error::{QdmaError, QdmaResult};
use crate::lock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Alignment of every allocation's bus address.
pub const DMA_ALIGN: u64 = 4096;

/// First bus address handed out.
pub const DMA_BASE: u64 = 0x1_0000_0000;

struct SpaceInner {
    regions: Mutex<BTreeMap<u64, Weak<BufInner>>>,
    next: AtomicU64,
    used: AtomicUsize,
    limit: usize,
}

/// Bus address space shared by the host side and the device side.
#[derive(Clone)]
pub struct DmaSpace {
    inner: Arc<SpaceInner>,
}

impl DmaSpace {
    /// Unbounded address space.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Address space that fails allocations beyond `limit` live bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(SpaceInner {
                regions: Mutex::new(BTreeMap::new()),
                next: AtomicU64::new(DMA_BASE),
                used: AtomicUsize::new(0),
                limit,
            }),
        }
    }

    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// `what` names the allocation in the error if the space is exhausted.
    pub fn alloc(&self, len: usize, what: &'static str) -> QdmaResult<DmaBuffer> {
        if len == 0 {
            return Err(QdmaError::AllocFailed { what, len });
        }
        let prev = self.inner.used.fetch_add(len, Ordering::AcqRel);
        if prev.saturating_add(len) > self.inner.limit {
            self.inner.used.fetch_sub(len, Ordering::AcqRel);
            return Err(QdmaError::AllocFailed { what, len });
        }

        let span = (len as u64).div_ceil(DMA_ALIGN) * DMA_ALIGN;
        let bus = self.inner.next.fetch_add(span, Ordering::Relaxed);
        let buf = Arc::new(BufInner {
            bus,
            len,
            data: Mutex::new(vec![0u8; len].into_boxed_slice()),
            space: Arc::downgrade(&self.inner),
        });
        lock(&self.inner.regions).insert(bus, Arc::downgrade(&buf));
        Ok(DmaBuffer { inner: buf })
    }

    /// Find the live buffer containing `[bus, bus + len)`.
    ///
    /// Returns the buffer and the offset of `bus` within it.
    pub fn resolve(&self, bus: u64, len: usize) -> Option<(DmaBuffer, usize)> {
        // The guard must be gone before `inner` can drop, since dropping the
        // last handle re-enters the region map.
        let weak = {
            let regions = lock(&self.inner.regions);
            regions.range(..=bus).next_back()?.1.clone()
        };
        let inner = weak.upgrade()?;
        let offset = (bus - inner.bus) as usize;
        if offset.checked_add(len)? > inner.len {
            return None;
        }
        Some((DmaBuffer { inner }, offset))
    }

    /// Copy device-visible memory at `bus` into `out`.
    pub fn read(&self, bus: u64, out: &mut [u8]) -> bool {
        match self.resolve(bus, out.len()) {
            Some((buf, offset)) => buf.read(offset, out) == out.len(),
            None => false,
        }
    }

    /// Copy `data` into device-visible memory at `bus`.
    pub fn write(&self, bus: u64, data: &[u8]) -> bool {
        match self.resolve(bus, data.len()) {
            Some((buf, offset)) => buf.write(offset, data) == data.len(),
            None => false,
        }
    }

    /// Live allocated bytes.
    pub fn allocated(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        lock(&self.inner.regions).len()
    }
}

impl Default for DmaSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DmaSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaSpace")
            .field("allocated", &self.allocated())
            .field("buffers", &self.buffer_count())
            .finish()
    }
}

struct BufInner {
    bus: u64,
    len: usize,
    data: Mutex<Box<[u8]>>,
    space: Weak<SpaceInner>,
}

impl Drop for BufInner {
    fn drop(&mut self) {
        if let Some(space) = self.space.upgrade() {
            lock(&space.regions).remove(&self.bus);
            space.used.fetch_sub(self.len, Ordering::AcqRel);
        }
    }
}

/// Handle to a DMA-able buffer. Clones share the same memory.
#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<BufInner>,
}

impl DmaBuffer {
    /// Bus address of the first byte.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.inner.bus
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True if the buffer has no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Copy from `offset` into `out`, returning the number of bytes copied.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let data = lock(&self.inner.data);
        let start = offset.min(data.len());
        let n = out.len().min(data.len() - start);
        out[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    /// Copy `src` to `offset`, returning the number of bytes copied.
    pub fn write(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = lock(&self.inner.data);
        let start = offset.min(data.len());
        let n = src.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&src[..n]);
        n
    }

    /// Little-endian u32 at `offset` (zero past the end).
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw);
        u32::from_le_bytes(raw)
    }

    /// Store a little-endian u32 at `offset`.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    /// Little-endian u64 at `offset` (zero past the end).
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw);
        u64::from_le_bytes(raw)
    }

    /// Store a little-endian u64 at `offset`.
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }

    /// Set every byte to `value`.
    pub fn fill(&self, value: u8) {
        lock(&self.inner.data).fill(value);
    }

    /// Copy the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.inner.data).to_vec()
    }

    /// True if both handles refer to the same allocation.
    pub fn same_buffer(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus", &format_args!("{:#x}", self.inner.bus))
            .field("len", &self.inner.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_resolve() {
        let space = DmaSpace::new();
        let a = space.alloc(100, "a").unwrap();
        let b = space.alloc(5000, "b").unwrap();
        assert_eq!(a.bus_addr() % DMA_ALIGN, 0);
        assert!(b.bus_addr() >= a.bus_addr() + DMA_ALIGN);

        let (found, offset) = space.resolve(b.bus_addr() + 10, 20).unwrap();
        assert!(found.same_buffer(&b));
        assert_eq!(offset, 10);

        // Past the end of `a` but before `b`.
        assert!(space.resolve(a.bus_addr() + 90, 20).is_none());
        assert!(space.resolve(DMA_BASE - 1, 1).is_none());
    }

    #[test]
    fn test_read_write_through_space() {
        let space = DmaSpace::new();
        let buf = space.alloc(64, "buf").unwrap();
        assert!(space.write(buf.bus_addr() + 8, &[1, 2, 3, 4]));
        let mut out = [0u8; 4];
        assert!(space.read(buf.bus_addr() + 8, &mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buf.read_u32(8), 0x0403_0201);

        buf.write_u64(16, 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(buf.read_u64(16), 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn test_drop_unregisters() {
        let space = DmaSpace::new();
        let buf = space.alloc(4096, "ring").unwrap();
        let bus = buf.bus_addr();
        assert_eq!(space.allocated(), 4096);
        assert_eq!(space.buffer_count(), 1);
        drop(buf);
        assert_eq!(space.allocated(), 0);
        assert!(space.resolve(bus, 1).is_none());
    }

    #[test]
    fn test_limit() {
        let space = DmaSpace::with_limit(8192);
        let _a = space.alloc(8000, "a").unwrap();
        let err = space.alloc(500, "free list").unwrap_err();
        assert!(matches!(err, QdmaError::AllocFailed { what: "free list", len: 500 }));
        assert_eq!(space.allocated(), 8000);
    }

    #[test]
    fn test_short_read_at_end() {
        let space = DmaSpace::new();
        let buf = space.alloc(8, "small").unwrap();
        let mut out = [0xFFu8; 16];
        assert_eq!(buf.read(4, &mut out), 4);
        assert_eq!(buf.write(6, &[9, 9, 9]), 2);
    }
}
