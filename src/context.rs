// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Typed queue contexts.
//!
//! Hardware keeps per-queue state in context memory that is only reachable
//! through the indirect command/data registers (see [`crate::indirect`]).
//! Each context type here is a plain struct with an `encode` to the raw
//! words loaded into the data registers and a `decode` back.
//!
//! | Context | Words | Present for |
//! |---------|-------|-------------|
//! | [`SwContext`] | 4 | every queue |
//! | [`HwContext`] | 2 | every queue (read only) |
//! | [`CreditContext`] | 1 | every queue (read only) |
//! | [`QidVecMap`] | 1 | shared by the H2C and C2H side of a qid |
//! | [`PrefetchContext`] | 2 | streaming C2H |
//! | [`WritebackContext`] | 4 | streaming C2H completion ring |
//! | [`CoalContext`] | 4 | each coalescing ring |

use crate::queue::Direction;
use std::fmt;

#[inline]
const fn field(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u32 << width) - 1)
}

#[inline]
const fn bit(word: u32, shift: u32) -> bool {
    (word >> shift) & 1 != 0
}

#[inline]
const fn put(value: u32, shift: u32, width: u32) -> u32 {
    (value & ((1u32 << width) - 1)) << shift
}

#[inline]
const fn flag(value: bool, shift: u32) -> u32 {
    (value as u32) << shift
}

#[inline]
fn word(words: &[u32], i: usize) -> u32 {
    words.get(i).copied().unwrap_or(0)
}

// ============================================================================
// Command fields
// ============================================================================

/// Indirect context operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextOp {
    Clear = 0,
    Write = 1,
    Read = 2,
    Invalidate = 3,
}

impl ContextOp {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Clear => "CLEAR",
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::Invalidate => "INVALIDATE",
        }
    }

    pub const fn from_u8(value: u8) -> Self {
        match value & 0x3 {
            0 => Self::Clear,
            1 => Self::Write,
            2 => Self::Read,
            _ => Self::Invalidate,
        }
    }
}

impl fmt::Display for ContextOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which context an indirect command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextSelector {
    SwC2h = 0x0,
    SwH2c = 0x1,
    HwC2h = 0x2,
    HwH2c = 0x3,
    CreditC2h = 0x4,
    CreditH2c = 0x5,
    Writeback = 0x6,
    Prefetch = 0x7,
    Coalesce = 0x8,
    QidVec = 0xC,
}

impl ContextSelector {
    pub const fn sw(dir: Direction) -> Self {
        match dir {
            Direction::H2c => Self::SwH2c,
            Direction::C2h => Self::SwC2h,
        }
    }

    pub const fn hw(dir: Direction) -> Self {
        match dir {
            Direction::H2c => Self::HwH2c,
            Direction::C2h => Self::HwC2h,
        }
    }

    pub const fn credit(dir: Direction) -> Self {
        match dir {
            Direction::H2c => Self::CreditH2c,
            Direction::C2h => Self::CreditC2h,
        }
    }

    /// Meaningful data words for this selector.
    pub const fn words(self) -> usize {
        match self {
            Self::SwC2h | Self::SwH2c => SwContext::WORDS,
            Self::HwC2h | Self::HwH2c => HwContext::WORDS,
            Self::CreditC2h | Self::CreditH2c => CreditContext::WORDS,
            Self::Writeback => WritebackContext::WORDS,
            Self::Prefetch => PrefetchContext::WORDS,
            Self::Coalesce => CoalContext::WORDS,
            Self::QidVec => QidVecMap::WORDS,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::SwC2h => "SW_C2H",
            Self::SwH2c => "SW_H2C",
            Self::HwC2h => "HW_C2H",
            Self::HwH2c => "HW_H2C",
            Self::CreditC2h => "CR_C2H",
            Self::CreditH2c => "CR_H2C",
            Self::Writeback => "WRB",
            Self::Prefetch => "PFTCH",
            Self::Coalesce => "COAL",
            Self::QidVec => "QID2VEC",
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::SwC2h),
            0x1 => Some(Self::SwH2c),
            0x2 => Some(Self::HwC2h),
            0x3 => Some(Self::HwH2c),
            0x4 => Some(Self::CreditC2h),
            0x5 => Some(Self::CreditH2c),
            0x6 => Some(Self::Writeback),
            0x7 => Some(Self::Prefetch),
            0x8 => Some(Self::Coalesce),
            0xC => Some(Self::QidVec),
            _ => None,
        }
    }
}

impl fmt::Display for ContextSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-queue context lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unprogrammed,
    Programmed,
    Cleared,
}

/// Descriptor size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DescSize {
    #[default]
    B8 = 0,
    B16 = 1,
    B32 = 2,
    B64 = 3,
}

impl DescSize {
    pub const fn bytes(self) -> usize {
        8 << (self as usize)
    }

    pub const fn from_u8(value: u8) -> Self {
        match value & 0x3 {
            0 => Self::B8,
            1 => Self::B16,
            2 => Self::B32,
            _ => Self::B64,
        }
    }
}

/// Completion-ring interrupt trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TriggerMode {
    Disabled = 0,
    #[default]
    Every = 1,
    UserCount = 2,
    User = 3,
    UserTimer = 4,
    UserTimerCount = 5,
}

impl From<u8> for TriggerMode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Every,
            2 => Self::UserCount,
            3 => Self::User,
            4 => Self::UserTimer,
            5 => Self::UserTimerCount,
            _ => Self::Disabled,
        }
    }
}

// ============================================================================
// Software context
// ============================================================================

/// Software descriptor context: the ring as software configured it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwContext {
    pub pidx: u16,
    pub irq_arm: bool,
    pub enable: bool,
    pub fetch_credit: bool,
    pub wbi_check: bool,
    pub wbi_acc: bool,
    pub func_id: u8,
    pub ring_size_idx: u8,
    pub desc_size: DescSize,
    pub bypass: bool,
    pub mm_channel: u8,
    /// Write the status block after the ring.
    pub wbk_en: bool,
    pub irq_en: bool,
    pub is_mm: bool,
    /// Ring bus address.
    pub base: u64,
}

impl SwContext {
    pub const WORDS: usize = 4;

    pub fn encode(&self) -> [u32; 4] {
        let w0 = put(self.pidx as u32, 0, 16) | flag(self.irq_arm, 16);
        let w1 = flag(self.enable, 0)
            | flag(self.fetch_credit, 1)
            | flag(self.wbi_check, 2)
            | flag(self.wbi_acc, 3)
            | put(self.func_id as u32, 4, 8)
            | put(self.ring_size_idx as u32, 12, 4)
            | put(self.desc_size as u32, 16, 2)
            | flag(self.bypass, 18)
            | put(self.mm_channel as u32, 19, 1)
            | flag(self.wbk_en, 20)
            | flag(self.irq_en, 21)
            | flag(self.is_mm, 22);
        [w0, w1, self.base as u32, (self.base >> 32) as u32]
    }

    pub fn decode(words: &[u32]) -> Self {
        let (w0, w1) = (word(words, 0), word(words, 1));
        Self {
            pidx: field(w0, 0, 16) as u16,
            irq_arm: bit(w0, 16),
            enable: bit(w1, 0),
            fetch_credit: bit(w1, 1),
            wbi_check: bit(w1, 2),
            wbi_acc: bit(w1, 3),
            func_id: field(w1, 4, 8) as u8,
            ring_size_idx: field(w1, 12, 4) as u8,
            desc_size: DescSize::from_u8(field(w1, 16, 2) as u8),
            bypass: bit(w1, 18),
            mm_channel: field(w1, 19, 1) as u8,
            wbk_en: bit(w1, 20),
            irq_en: bit(w1, 21),
            is_mm: bit(w1, 22),
            base: word(words, 2) as u64 | ((word(words, 3) as u64) << 32),
        }
    }
}

/// Hardware descriptor context, maintained by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwContext {
    pub cidx: u16,
    pub credits_used: u16,
    pub desc_pending: bool,
    pub idle: bool,
}

impl HwContext {
    pub const WORDS: usize = 2;

    pub fn encode(&self) -> [u32; 2] {
        [
            put(self.cidx as u32, 0, 16) | put(self.credits_used as u32, 16, 16),
            flag(self.desc_pending, 0) | flag(self.idle, 1),
        ]
    }

    pub fn decode(words: &[u32]) -> Self {
        let (w0, w1) = (word(words, 0), word(words, 1));
        Self {
            cidx: field(w0, 0, 16) as u16,
            credits_used: field(w0, 16, 16) as u16,
            desc_pending: bit(w1, 0),
            idle: bit(w1, 1),
        }
    }
}

/// Descriptor credit context, maintained by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditContext {
    pub credit: u16,
}

impl CreditContext {
    pub const WORDS: usize = 1;

    pub fn encode(&self) -> [u32; 1] {
        [self.credit as u32]
    }

    pub fn decode(words: &[u32]) -> Self {
        Self {
            credit: field(word(words, 0), 0, 16) as u16,
        }
    }
}

// ============================================================================
// Interrupt mapping
// ============================================================================

/// Queue-to-vector map, one word per qid shared by both directions.
///
/// With `coal` set, `vec` is a coalescing-ring index rather than a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QidVecMap {
    pub c2h_vec: u16,
    pub c2h_coal: bool,
    pub h2c_vec: u16,
    pub h2c_coal: bool,
}

impl QidVecMap {
    pub const WORDS: usize = 1;

    pub fn encode(&self) -> [u32; 1] {
        [put(self.c2h_vec as u32, 0, 11)
            | flag(self.c2h_coal, 11)
            | put(self.h2c_vec as u32, 12, 11)
            | flag(self.h2c_coal, 23)]
    }

    pub fn decode(words: &[u32]) -> Self {
        let w0 = word(words, 0);
        Self {
            c2h_vec: field(w0, 0, 11) as u16,
            c2h_coal: bit(w0, 11),
            h2c_vec: field(w0, 12, 11) as u16,
            h2c_coal: bit(w0, 23),
        }
    }

    /// The (vector or ring, coalesced) pair for one direction.
    pub fn get(&self, dir: Direction) -> (u16, bool) {
        match dir {
            Direction::H2c => (self.h2c_vec, self.h2c_coal),
            Direction::C2h => (self.c2h_vec, self.c2h_coal),
        }
    }

    /// Replace one direction's fields, leaving the other untouched.
    pub fn set(&mut self, dir: Direction, vec: u16, coal: bool) {
        match dir {
            Direction::H2c => {
                self.h2c_vec = vec;
                self.h2c_coal = coal;
            }
            Direction::C2h => {
                self.c2h_vec = vec;
                self.c2h_coal = coal;
            }
        }
    }
}

/// Coalescing ring context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoalContext {
    pub valid: bool,
    /// Vector raised when the ring advances.
    pub vec_id: u16,
    pub color: bool,
    pub ring_size_idx: u8,
    pub base: u64,
    pub pidx: u16,
}

/// Entries per coalescing-ring size step.
pub const COAL_RING_UNIT: u32 = 512;

impl CoalContext {
    pub const WORDS: usize = 4;

    /// Ring entries for a size index.
    pub const fn slots_for(ring_size_idx: u8) -> u32 {
        COAL_RING_UNIT * (ring_size_idx as u32 + 1)
    }

    pub fn encode(&self) -> [u32; 4] {
        [
            flag(self.valid, 0)
                | put(self.vec_id as u32, 1, 11)
                | flag(self.color, 12)
                | put(self.ring_size_idx as u32, 13, 4),
            self.base as u32,
            (self.base >> 32) as u32,
            put(self.pidx as u32, 0, 16),
        ]
    }

    pub fn decode(words: &[u32]) -> Self {
        let w0 = word(words, 0);
        Self {
            valid: bit(w0, 0),
            vec_id: field(w0, 1, 11) as u16,
            color: bit(w0, 12),
            ring_size_idx: field(w0, 13, 4) as u8,
            base: word(words, 1) as u64 | ((word(words, 2) as u64) << 32),
            pidx: field(word(words, 3), 0, 16) as u16,
        }
    }
}

// ============================================================================
// Streaming C2H contexts
// ============================================================================

/// Prefetch context for a streaming C2H queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefetchContext {
    pub bypass: bool,
    pub buf_size_idx: u8,
    pub port_id: u8,
    pub enable: bool,
    pub valid: bool,
}

impl PrefetchContext {
    pub const WORDS: usize = 2;

    pub fn encode(&self) -> [u32; 2] {
        [
            flag(self.bypass, 0)
                | put(self.buf_size_idx as u32, 1, 4)
                | put(self.port_id as u32, 5, 3)
                | flag(self.enable, 8),
            flag(self.valid, 0),
        ]
    }

    pub fn decode(words: &[u32]) -> Self {
        let w0 = word(words, 0);
        Self {
            bypass: bit(w0, 0),
            buf_size_idx: field(w0, 1, 4) as u8,
            port_id: field(w0, 5, 3) as u8,
            enable: bit(w0, 8),
            valid: bit(word(words, 1), 0),
        }
    }
}

/// Writeback (completion ring) context for a streaming C2H queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WritebackContext {
    pub stat_desc_en: bool,
    pub irq_en: bool,
    pub trig_mode: TriggerMode,
    pub func_id: u8,
    pub timer_idx: u8,
    pub counter_idx: u8,
    /// Color hardware starts writing with.
    pub color: bool,
    pub ring_size_idx: u8,
    pub entry_size: DescSize,
    pub base: u64,
    pub valid: bool,
}

impl WritebackContext {
    pub const WORDS: usize = 4;

    pub fn encode(&self) -> [u32; 4] {
        [
            flag(self.stat_desc_en, 0)
                | flag(self.irq_en, 1)
                | put(self.trig_mode as u32, 2, 3)
                | put(self.func_id as u32, 5, 8)
                | put(self.timer_idx as u32, 13, 4)
                | put(self.counter_idx as u32, 17, 4)
                | flag(self.color, 21)
                | put(self.ring_size_idx as u32, 22, 4)
                | put(self.entry_size as u32, 26, 2),
            self.base as u32,
            (self.base >> 32) as u32,
            flag(self.valid, 0),
        ]
    }

    pub fn decode(words: &[u32]) -> Self {
        let w0 = word(words, 0);
        Self {
            stat_desc_en: bit(w0, 0),
            irq_en: bit(w0, 1),
            trig_mode: TriggerMode::from(field(w0, 2, 3) as u8),
            func_id: field(w0, 5, 8) as u8,
            timer_idx: field(w0, 13, 4) as u8,
            counter_idx: field(w0, 17, 4) as u8,
            color: bit(w0, 21),
            ring_size_idx: field(w0, 22, 4) as u8,
            entry_size: DescSize::from_u8(field(w0, 26, 2) as u8),
            base: word(words, 1) as u64 | ((word(words, 2) as u64) << 32),
            valid: bit(word(words, 3), 0),
        }
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// Everything hardware holds for one direction of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueContext {
    pub sw: SwContext,
    pub hw: HwContext,
    pub credit: CreditContext,
    pub qid_vec: QidVecMap,
    /// Streaming C2H only.
    pub prefetch: Option<PrefetchContext>,
    /// Streaming C2H only.
    pub writeback: Option<WritebackContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sw_context_fields() {
        let ctx = SwContext {
            pidx: 0x1234,
            irq_arm: true,
            enable: true,
            fetch_credit: true,
            wbi_check: true,
            wbi_acc: false,
            func_id: 0xA5,
            ring_size_idx: 14,
            desc_size: DescSize::B32,
            bypass: false,
            mm_channel: 1,
            wbk_en: true,
            irq_en: true,
            is_mm: true,
            base: 0x0000_0001_2345_6000,
        };
        let words = ctx.encode();
        assert_eq!(words[0], 0x0001_1234);
        assert_eq!(words[2], 0x2345_6000);
        assert_eq!(words[3], 0x1);
        assert_eq!((words[1] >> 4) & 0xFF, 0xA5);
        assert_eq!((words[1] >> 12) & 0xF, 14);
        assert_eq!(SwContext::decode(&words), ctx);
    }

    #[test]
    fn test_writeback_context_fields() {
        let ctx = WritebackContext {
            stat_desc_en: true,
            irq_en: true,
            trig_mode: TriggerMode::UserTimerCount,
            func_id: 3,
            timer_idx: 9,
            counter_idx: 4,
            color: true,
            ring_size_idx: 15,
            entry_size: DescSize::B8,
            base: 0xFFFF_0000_0000_1000,
            valid: true,
        };
        assert_eq!(WritebackContext::decode(&ctx.encode()), ctx);
    }

    #[test]
    fn test_prefetch_and_coal() {
        let pf = PrefetchContext {
            bypass: false,
            buf_size_idx: 5,
            port_id: 2,
            enable: true,
            valid: true,
        };
        assert_eq!(PrefetchContext::decode(&pf.encode()), pf);

        let coal = CoalContext {
            valid: true,
            vec_id: 33,
            color: true,
            ring_size_idx: 0,
            base: 0x1_0000_4000,
            pidx: 0,
        };
        assert_eq!(CoalContext::decode(&coal.encode()), coal);
        assert_eq!(CoalContext::slots_for(0), 512);
        assert_eq!(CoalContext::slots_for(3), 2048);
    }

    #[test]
    fn test_qid_vec_set_keeps_other_direction() {
        let mut map = QidVecMap::default();
        map.set(Direction::H2c, 7, false);
        map.set(Direction::C2h, 3, true);
        let back = QidVecMap::decode(&map.encode());
        assert_eq!(back.get(Direction::H2c), (7, false));
        assert_eq!(back.get(Direction::C2h), (3, true));

        let mut again = back;
        again.set(Direction::C2h, 4, false);
        assert_eq!(again.get(Direction::H2c), (7, false));
    }

    #[test]
    fn test_decode_short_slice() {
        let hw = HwContext::decode(&[0x0002_0010]);
        assert_eq!(hw.cidx, 0x10);
        assert_eq!(hw.credits_used, 2);
        assert!(!hw.idle);
    }

    #[test]
    fn test_selectors() {
        assert_eq!(ContextSelector::sw(Direction::H2c), ContextSelector::SwH2c);
        assert_eq!(ContextSelector::credit(Direction::C2h), ContextSelector::CreditC2h);
        assert_eq!(ContextSelector::Writeback.words(), 4);
        assert_eq!(ContextSelector::from_u8(0xC), Some(ContextSelector::QidVec));
        assert_eq!(ContextSelector::from_u8(0xF), None);
        assert_eq!(ContextOp::from_u8(2), ContextOp::Read);
        assert_eq!(DescSize::B32.bytes(), 32);
    }
}
