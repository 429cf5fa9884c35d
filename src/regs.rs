// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register access and the QDMA register map.
//!
//! Everything above this module talks to hardware through the
//! [`RegisterAccess`] trait: a 32-bit read/write window onto the function's
//! BAR. On Linux, [`MmioRegisters`] maps a PCI resource file; the software
//! emulator in [`crate::emu`] implements the same trait.
//!
//! Only the registers the engine actually touches are listed here.

use crate::context::TriggerMode;
use bitflags::bitflags;

/// 32-bit register window onto a QDMA function.
pub trait RegisterAccess: Send + Sync {
    /// Read the register at byte `offset`.
    fn read32(&self, offset: u32) -> u32;

    /// Write the register at byte `offset`.
    fn write32(&self, offset: u32, value: u32);
}

// ============================================================================
// Register map
// ============================================================================

/// Global ring-size table, 16 consecutive registers.
pub const GLBL_RNG_SZ_BASE: u32 = 0x204;
/// Global error status (write 1 to clear).
pub const GLBL_ERR_STAT: u32 = 0x248;
/// Writeback accumulation interval.
pub const GLBL_WB_ACC: u32 = 0x250;
/// Per-function queue map, one register per function.
pub const FMAP_BASE: u32 = 0x400;
/// Indirect context data block.
pub const IND_CTXT_DATA_BASE: u32 = 0x804;
/// Indirect context mask block.
pub const IND_CTXT_MASK_BASE: u32 = 0x814;
/// Indirect context command register.
pub const IND_CTXT_CMD: u32 = 0x824;
/// C2H timer count table, 16 registers.
pub const C2H_TIMER_CNT_BASE: u32 = 0xA00;
/// C2H counter threshold table, 16 registers.
pub const C2H_CNT_TH_BASE: u32 = 0xA40;
/// C2H buffer size table, 16 registers.
pub const C2H_BUF_SZ_BASE: u32 = 0xAB0;
/// Start of the per-queue doorbell block.
pub const DMAP_BASE: u32 = 0x18000;
/// Stride between queues in the doorbell block.
pub const DMAP_STRIDE: u32 = 0x10;

/// Number of words in the indirect data and mask blocks.
pub const IND_CTXT_REG_COUNT: usize = 4;

/// Interrupt-ring consumer index register for coalescing ring `ring`.
#[inline]
pub const fn intr_cidx_reg(ring: u32) -> u32 {
    DMAP_BASE + ring * DMAP_STRIDE
}

/// H2C producer index doorbell for hardware queue `qid`.
#[inline]
pub const fn h2c_pidx_reg(qid: u32) -> u32 {
    DMAP_BASE + qid * DMAP_STRIDE + 0x4
}

/// C2H producer index doorbell for hardware queue `qid`.
#[inline]
pub const fn c2h_pidx_reg(qid: u32) -> u32 {
    DMAP_BASE + qid * DMAP_STRIDE + 0x8
}

/// Completion-ring consumer index register for hardware queue `qid`.
#[inline]
pub const fn cmpt_cidx_reg(qid: u32) -> u32 {
    DMAP_BASE + qid * DMAP_STRIDE + 0xC
}

/// Function-map register for function `func_id`.
#[inline]
pub const fn fmap_reg(func_id: u8) -> u32 {
    FMAP_BASE + (func_id as u32) * 4
}

/// Which doorbell a DMAP offset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doorbell {
    IntrCidx(u32),
    H2cPidx(u32),
    C2hPidx(u32),
    CmptCidx(u32),
}

impl Doorbell {
    /// Decode a doorbell offset, `None` outside the DMAP block.
    pub fn decode(offset: u32) -> Option<Self> {
        if offset < DMAP_BASE || offset % 4 != 0 {
            return None;
        }
        let rel = offset - DMAP_BASE;
        let qid = rel / DMAP_STRIDE;
        match rel % DMAP_STRIDE {
            0x0 => Some(Self::IntrCidx(qid)),
            0x4 => Some(Self::H2cPidx(qid)),
            0x8 => Some(Self::C2hPidx(qid)),
            _ => Some(Self::CmptCidx(qid)),
        }
    }
}

bitflags! {
    /// Bits of [`GLBL_ERR_STAT`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalErrors: u32 {
        /// Single-bit RAM error.
        const RAM_SBE = 1 << 0;
        /// Double-bit RAM error.
        const RAM_DBE = 1 << 1;
        /// Descriptor fetch or address error.
        const DSC = 1 << 2;
        /// Register access to an unmapped target.
        const TRQ = 1 << 3;
        /// Streaming C2H engine error.
        const ST_C2H = 1 << 8;
        /// Streaming H2C engine error.
        const ST_H2C = 1 << 11;
    }
}

// ============================================================================
// Doorbell values
// ============================================================================

/// Producer index doorbell value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PidxUpdate {
    pub pidx: u16,
    /// Request an interrupt when hardware catches up.
    pub irq_arm: bool,
}

impl PidxUpdate {
    const IRQ_ARM: u32 = 1 << 16;

    pub const fn encode(self) -> u32 {
        self.pidx as u32 | if self.irq_arm { Self::IRQ_ARM } else { 0 }
    }

    pub const fn decode(value: u32) -> Self {
        Self {
            pidx: value as u16,
            irq_arm: value & Self::IRQ_ARM != 0,
        }
    }
}

/// Completion-ring consumer index update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmptCidxUpdate {
    pub cidx: u16,
    pub counter_idx: u8,
    pub timer_idx: u8,
    pub trig_mode: TriggerMode,
    pub stat_desc_en: bool,
    pub irq_en: bool,
}

impl CmptCidxUpdate {
    pub fn encode(self) -> u32 {
        self.cidx as u32
            | ((self.counter_idx as u32 & 0xF) << 16)
            | ((self.timer_idx as u32 & 0xF) << 20)
            | ((self.trig_mode as u32 & 0x7) << 24)
            | ((self.stat_desc_en as u32) << 27)
            | ((self.irq_en as u32) << 28)
    }

    pub fn decode(value: u32) -> Self {
        Self {
            cidx: value as u16,
            counter_idx: ((value >> 16) & 0xF) as u8,
            timer_idx: ((value >> 20) & 0xF) as u8,
            trig_mode: TriggerMode::from(((value >> 24) & 0x7) as u8),
            stat_desc_en: value & (1 << 27) != 0,
            irq_en: value & (1 << 28) != 0,
        }
    }
}

/// Per-function queue map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FmapEntry {
    pub qbase: u32,
    pub qmax: u32,
}

impl FmapEntry {
    pub const fn encode(self) -> u32 {
        (self.qbase & 0x7FF) | ((self.qmax & 0xFFF) << 11)
    }

    pub const fn decode(value: u32) -> Self {
        Self {
            qbase: value & 0x7FF,
            qmax: (value >> 11) & 0xFFF,
        }
    }
}

// ============================================================================
// Linux MMIO backend
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::RegisterAccess;
    use crate::error::{QdmaError, QdmaResult};
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    /// Memory-mapped register window, typically
    /// `/sys/bus/pci/devices/<bdf>/resource<N>` of the QDMA config BAR.
    pub struct MmioRegisters {
        #[allow(dead_code)]
        file: File,
        base: *mut u8,
        len: usize,
    }

    // SAFETY: the mapping is owned for the lifetime of the struct and every
    // access is a single aligned volatile 32-bit load or store.
    unsafe impl Send for MmioRegisters {}

    // SAFETY: concurrent 32-bit register accesses are independent at the
    // hardware level; higher layers serialize multi-register sequences.
    unsafe impl Sync for MmioRegisters {}

    impl MmioRegisters {
        /// Map `len` bytes of the resource file at `path`.
        pub fn open(path: &Path, len: usize) -> QdmaResult<Self> {
            let file = File::options().read(true).write(true).open(path)?;

            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(QdmaError::MmapFailed(format!(
                    "mmap of {} bytes failed for {}",
                    len,
                    path.display()
                )));
            }

            log::info!("mapped {} ({:#x} bytes)", path.display(), len);
            Ok(Self {
                file,
                base: base as *mut u8,
                len,
            })
        }

        /// Mapped length in bytes.
        pub fn len(&self) -> usize {
            self.len
        }

        /// True if nothing is mapped.
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        fn in_bounds(&self, offset: u32) -> bool {
            offset % 4 == 0 && (offset as usize) + 4 <= self.len
        }
    }

    impl RegisterAccess for MmioRegisters {
        fn read32(&self, offset: u32) -> u32 {
            if !self.in_bounds(offset) {
                // What a PCIe read of an unclaimed address returns.
                return u32::MAX;
            }
            // SAFETY: bounds and alignment checked above.
            unsafe { std::ptr::read_volatile(self.base.add(offset as usize) as *const u32) }
        }

        fn write32(&self, offset: u32, value: u32) {
            if !self.in_bounds(offset) {
                log::warn!("dropping write of {:#x} to unmapped offset {:#x}", value, offset);
                return;
            }
            // SAFETY: bounds and alignment checked above.
            unsafe { std::ptr::write_volatile(self.base.add(offset as usize) as *mut u32, value) }
        }
    }

    impl Drop for MmioRegisters {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::MmioRegisters;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doorbell_offsets() {
        assert_eq!(h2c_pidx_reg(0), 0x18004);
        assert_eq!(c2h_pidx_reg(1), 0x18018);
        assert_eq!(cmpt_cidx_reg(2), 0x1802C);
        assert_eq!(Doorbell::decode(h2c_pidx_reg(7)), Some(Doorbell::H2cPidx(7)));
        assert_eq!(Doorbell::decode(cmpt_cidx_reg(9)), Some(Doorbell::CmptCidx(9)));
        assert_eq!(Doorbell::decode(intr_cidx_reg(3)), Some(Doorbell::IntrCidx(3)));
        assert_eq!(Doorbell::decode(IND_CTXT_CMD), None);
    }

    #[test]
    fn test_pidx_update() {
        let v = PidxUpdate {
            pidx: 0x1234,
            irq_arm: true,
        };
        assert_eq!(v.encode(), 0x0001_1234);
        assert_eq!(PidxUpdate::decode(v.encode()), v);
    }

    #[test]
    fn test_cmpt_cidx_update() {
        let v = CmptCidxUpdate {
            cidx: 17,
            counter_idx: 3,
            timer_idx: 5,
            trig_mode: TriggerMode::UserTimerCount,
            stat_desc_en: true,
            irq_en: true,
        };
        assert_eq!(CmptCidxUpdate::decode(v.encode()), v);
    }

    #[test]
    fn test_fmap_entry() {
        let e = FmapEntry {
            qbase: 512,
            qmax: 2048,
        };
        assert_eq!(FmapEntry::decode(e.encode()), e);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_mmio_on_regular_file() {
        use std::io::Read;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(0x1000).unwrap();

        {
            let regs = MmioRegisters::open(file.path(), 0x1000).unwrap();
            regs.write32(0x10, 0xCAFE_F00D);
            assert_eq!(regs.read32(0x10), 0xCAFE_F00D);
            assert_eq!(regs.read32(0x1000), u32::MAX);
            assert_eq!(regs.read32(0x11), u32::MAX);
        }

        let mut bytes = Vec::new();
        file.as_file_mut().read_to_end(&mut bytes).unwrap();
        assert_eq!(&bytes[0x10..0x14], &0xCAFE_F00Du32.to_le_bytes());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_mmio_missing_file() {
        let err = MmioRegisters::open(std::path::Path::new("/nonexistent/resource0"), 4096)
            .err()
            .unwrap();
        assert!(matches!(err, crate::error::QdmaError::Io(_)));
    }
}
