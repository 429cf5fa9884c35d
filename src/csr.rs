// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Global CSR tables.
//!
//! Hardware does not take ring sizes or buffer sizes directly. Contexts carry
//! a 4-bit index into one of these 16-entry tables, which the privileged
//! function reads from registers and restricted functions fetch over the
//! mailbox.
//!
//! Ring-size entries count hardware slots, one of which is always reserved,
//! so a queue with `ring_size` usable descriptors needs an entry of
//! `ring_size + 1`.

use crate::regs::{
    RegisterAccess, C2H_BUF_SZ_BASE, C2H_CNT_TH_BASE, C2H_TIMER_CNT_BASE, GLBL_RNG_SZ_BASE,
    GLBL_WB_ACC,
};

/// Entries per CSR table.
pub const CSR_TABLE_LEN: usize = 16;

/// Power-on ring-size table (hardware slots).
pub const DEFAULT_RING_SIZES: [u32; CSR_TABLE_LEN] = [
    2049, 65, 129, 193, 257, 385, 513, 769, 1025, 1537, 3073, 4097, 6145, 8193, 17, 33,
];

/// Power-on C2H buffer-size table (bytes).
pub const DEFAULT_BUF_SIZES: [u32; CSR_TABLE_LEN] = [
    4096, 256, 512, 1024, 2048, 3968, 8192, 9018, 16384, 4096, 4096, 4096, 4096, 4096, 4096, 4096,
];

/// Power-on timer table (microseconds).
pub const DEFAULT_TIMER_COUNTS: [u32; CSR_TABLE_LEN] =
    [1, 2, 4, 5, 8, 10, 15, 20, 25, 30, 50, 75, 100, 125, 150, 200];

/// Power-on counter-threshold table (entries).
pub const DEFAULT_COUNTER_THRESHOLDS: [u32; CSR_TABLE_LEN] =
    [2, 4, 8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192];

/// Selects one CSR table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CsrKind {
    RingSize = 0,
    BufSize = 1,
    TimerCount = 2,
    CounterThreshold = 3,
}

impl CsrKind {
    /// All table kinds, in wire order.
    pub const ALL: [CsrKind; 4] = [
        Self::RingSize,
        Self::BufSize,
        Self::TimerCount,
        Self::CounterThreshold,
    ];

    /// Decode a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == value)
    }

    /// First register of the table.
    pub const fn base(self) -> u32 {
        match self {
            Self::RingSize => GLBL_RNG_SZ_BASE,
            Self::BufSize => C2H_BUF_SZ_BASE,
            Self::TimerCount => C2H_TIMER_CNT_BASE,
            Self::CounterThreshold => C2H_CNT_TH_BASE,
        }
    }
}

/// Snapshot of the global CSR tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalCsr {
    pub ring_sizes: [u32; CSR_TABLE_LEN],
    pub buf_sizes: [u32; CSR_TABLE_LEN],
    pub timer_counts: [u32; CSR_TABLE_LEN],
    pub counter_thresholds: [u32; CSR_TABLE_LEN],
    pub wb_acc: u32,
}

impl Default for GlobalCsr {
    fn default() -> Self {
        Self {
            ring_sizes: DEFAULT_RING_SIZES,
            buf_sizes: DEFAULT_BUF_SIZES,
            timer_counts: DEFAULT_TIMER_COUNTS,
            counter_thresholds: DEFAULT_COUNTER_THRESHOLDS,
            wb_acc: 0,
        }
    }
}

impl GlobalCsr {
    /// Read every table through the register window.
    pub fn read_from(regs: &dyn RegisterAccess) -> Self {
        let mut csr = Self::default();
        for kind in CsrKind::ALL {
            let base = kind.base();
            for (i, slot) in csr.table_mut(kind).iter_mut().enumerate() {
                *slot = regs.read32(base + (i as u32) * 4);
            }
        }
        csr.wb_acc = regs.read32(GLBL_WB_ACC);
        csr
    }

    /// Borrow one table.
    pub fn table(&self, kind: CsrKind) -> &[u32; CSR_TABLE_LEN] {
        match kind {
            CsrKind::RingSize => &self.ring_sizes,
            CsrKind::BufSize => &self.buf_sizes,
            CsrKind::TimerCount => &self.timer_counts,
            CsrKind::CounterThreshold => &self.counter_thresholds,
        }
    }

    /// Mutably borrow one table.
    pub fn table_mut(&mut self, kind: CsrKind) -> &mut [u32; CSR_TABLE_LEN] {
        match kind {
            CsrKind::RingSize => &mut self.ring_sizes,
            CsrKind::BufSize => &mut self.buf_sizes,
            CsrKind::TimerCount => &mut self.timer_counts,
            CsrKind::CounterThreshold => &mut self.counter_thresholds,
        }
    }

    /// Index of the ring-size entry giving `usable` descriptors.
    pub fn ring_size_index(&self, usable: u32) -> Option<u8> {
        let slots = usable.checked_add(1)?;
        self.ring_sizes
            .iter()
            .position(|&s| s == slots)
            .map(|i| i as u8)
    }

    /// Hardware slots of ring-size entry `idx`.
    pub fn ring_slots(&self, idx: u8) -> u32 {
        self.ring_sizes[(idx as usize) % CSR_TABLE_LEN]
    }

    /// Index of the buffer-size entry equal to `bytes`.
    pub fn buf_size_index(&self, bytes: u32) -> Option<u8> {
        self.buf_sizes
            .iter()
            .position(|&s| s == bytes)
            .map(|i| i as u8)
    }

    /// Bytes of buffer-size entry `idx`.
    pub fn buf_size(&self, idx: u8) -> u32 {
        self.buf_sizes[(idx as usize) % CSR_TABLE_LEN]
    }

    /// Smallest ring-size entry with strictly more than `slots` slots.
    pub fn cmpt_ring_index(&self, slots: u32) -> Option<u8> {
        self.ring_sizes
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, s)| s > slots)
            .min_by_key(|&(_, s)| s)
            .map(|(i, _)| i as u8)
    }
}
