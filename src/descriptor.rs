// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! QDMA ring descriptor, writeback status and completion entry layouts.
//!
//! | Structure | Size | Ring |
//! |-----------|------|------|
//! | [`MmDesc`] | 32 | memory-mapped H2C and C2H |
//! | [`H2cDesc`] | 16 | streaming H2C |
//! | [`C2hDesc`] | 8 | streaming C2H free list |
//! | [`RingStatus`] | 8 | trails every descriptor ring |
//! | [`CmptEntry`] | 8 | streaming C2H completion ring |
//! | [`CmptStatus`] | 8 | trails the completion ring |
//! | [`IntrEntry`] | 8 | coalescing ring |
//!
//! All fields are little-endian on the wire.

use bitflags::bitflags;
use std::mem::size_of;

/// Fixed-size little-endian wire encoding for ring entries.
pub trait WireFormat: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode into `out[..Self::SIZE]`.
    fn encode_into(&self, out: &mut [u8]);

    /// Decode from `raw[..Self::SIZE]`.
    fn decode(raw: &[u8]) -> Self;

    /// Encode into a fresh vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        self.encode_into(&mut out);
        out
    }
}

#[inline]
fn get_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

#[inline]
fn get_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

#[inline]
fn get_u64(raw: &[u8], at: usize) -> u64 {
    (get_u32(raw, at) as u64) | ((get_u32(raw, at + 4) as u64) << 32)
}

#[inline]
fn put(out: &mut [u8], at: usize, bytes: &[u8]) {
    out[at..at + bytes.len()].copy_from_slice(bytes);
}

// ============================================================================
// Memory-mapped descriptor
// ============================================================================

bitflags! {
    /// Flag bits in the upper nibble of [`MmDesc::flag_len`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmFlags: u32 {
        /// Descriptor valid.
        const DV = 1 << 28;
        /// Start of packet.
        const SOP = 1 << 29;
        /// End of packet.
        const EOP = 1 << 30;
    }
}

/// Largest length a memory-mapped descriptor can carry.
pub const MM_DESC_LEN_MAX: u32 = (1 << 28) - 1;

/// 32-byte memory-mapped descriptor.
///
/// For H2C, `src_addr` is host memory and `dst_addr` is the card endpoint
/// address; C2H swaps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MmDesc {
    pub src_addr: u64,
    /// Length (bits [27:0]) and [`MmFlags`].
    pub flag_len: u32,
    reserved0: u32,
    pub dst_addr: u64,
    reserved1: u64,
}

const _: () = assert!(size_of::<MmDesc>() == 32);

impl MmDesc {
    /// Create a valid descriptor moving `len` bytes.
    pub fn new(src_addr: u64, dst_addr: u64, len: u32) -> Self {
        Self {
            src_addr,
            flag_len: (len & MM_DESC_LEN_MAX) | MmFlags::DV.bits(),
            reserved0: 0,
            dst_addr,
            reserved1: 0,
        }
    }

    /// Transfer length.
    #[inline]
    pub fn len(&self) -> u32 {
        self.flag_len & MM_DESC_LEN_MAX
    }

    /// True for a zero-length descriptor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag bits.
    #[inline]
    pub fn flags(&self) -> MmFlags {
        MmFlags::from_bits_truncate(self.flag_len)
    }

    /// OR in flag bits.
    #[inline]
    pub fn add_flags(&mut self, flags: MmFlags) {
        self.flag_len |= flags.bits();
    }
}

impl WireFormat for MmDesc {
    const SIZE: usize = 32;

    fn encode_into(&self, out: &mut [u8]) {
        put(out, 0, &self.src_addr.to_le_bytes());
        put(out, 8, &self.flag_len.to_le_bytes());
        put(out, 12, &0u32.to_le_bytes());
        put(out, 16, &self.dst_addr.to_le_bytes());
        put(out, 24, &0u64.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            src_addr: get_u64(raw, 0),
            flag_len: get_u32(raw, 8),
            reserved0: 0,
            dst_addr: get_u64(raw, 16),
            reserved1: 0,
        }
    }
}

// ============================================================================
// Streaming descriptors
// ============================================================================

bitflags! {
    /// Streaming H2C descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct H2cFlags: u16 {
        /// First fragment of a packet.
        const SOP = 1 << 0;
        /// Last fragment of a packet.
        const EOP = 1 << 1;
    }
}

/// 16-byte streaming H2C descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct H2cDesc {
    /// Custom header flags, unused.
    pub cdh_flags: u16,
    /// Payload length of the whole packet, filled on SOP only.
    pub pld_len: u16,
    /// Fragment length.
    pub len: u16,
    pub flags: u16,
    pub src_addr: u64,
}

const _: () = assert!(size_of::<H2cDesc>() == 16);

impl H2cDesc {
    pub fn new(src_addr: u64, len: u16, flags: H2cFlags) -> Self {
        Self {
            cdh_flags: 0,
            pld_len: 0,
            len,
            flags: flags.bits(),
            src_addr,
        }
    }

    #[inline]
    pub fn h2c_flags(&self) -> H2cFlags {
        H2cFlags::from_bits_truncate(self.flags)
    }
}

impl WireFormat for H2cDesc {
    const SIZE: usize = 16;

    fn encode_into(&self, out: &mut [u8]) {
        put(out, 0, &self.cdh_flags.to_le_bytes());
        put(out, 2, &self.pld_len.to_le_bytes());
        put(out, 4, &self.len.to_le_bytes());
        put(out, 6, &self.flags.to_le_bytes());
        put(out, 8, &self.src_addr.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            cdh_flags: get_u16(raw, 0),
            pld_len: get_u16(raw, 2),
            len: get_u16(raw, 4),
            flags: get_u16(raw, 6),
            src_addr: get_u64(raw, 8),
        }
    }
}

/// 8-byte streaming C2H free-list descriptor: just a buffer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct C2hDesc {
    pub dst_addr: u64,
}

const _: () = assert!(size_of::<C2hDesc>() == 8);

impl WireFormat for C2hDesc {
    const SIZE: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        put(out, 0, &self.dst_addr.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            dst_addr: get_u64(raw, 0),
        }
    }
}

// ============================================================================
// Writeback status
// ============================================================================

/// Status block hardware writes after the last descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RingStatus {
    pub pidx: u16,
    /// Hardware consumer index.
    pub cidx: u16,
    reserved: u32,
}

const _: () = assert!(size_of::<RingStatus>() == 8);

impl RingStatus {
    pub const fn new(pidx: u16, cidx: u16) -> Self {
        Self {
            pidx,
            cidx,
            reserved: 0,
        }
    }
}

impl WireFormat for RingStatus {
    const SIZE: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        put(out, 0, &self.pidx.to_le_bytes());
        put(out, 2, &self.cidx.to_le_bytes());
        put(out, 4, &0u32.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self::new(get_u16(raw, 0), get_u16(raw, 2))
    }
}

// ============================================================================
// Completion ring
// ============================================================================

bitflags! {
    /// Low bits of a completion entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmptFlags: u32 {
        /// Entry carries user-defined data instead of a length.
        const FORMAT = 1 << 0;
        /// Color of the pass that wrote this entry.
        const COLOR = 1 << 1;
        /// Hardware detected an error for this packet.
        const ERR = 1 << 2;
        /// Entry consumed free-list descriptors.
        const DESC_USED = 1 << 3;
        /// End of transfer.
        const EOT = 1 << 4;
    }
}

/// 8-byte streaming C2H completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmptEntry {
    pub flags: CmptFlags,
    /// Packet length in bytes (valid with `DESC_USED` and `!FORMAT`).
    pub len: u16,
    /// User-defined data word.
    pub udd: u32,
}

impl Default for CmptEntry {
    fn default() -> Self {
        Self {
            flags: CmptFlags::empty(),
            len: 0,
            udd: 0,
        }
    }
}

impl CmptEntry {
    /// A data entry as hardware writes it.
    pub fn data(len: u16, color: bool, eot: bool) -> Self {
        let mut flags = CmptFlags::DESC_USED;
        flags.set(CmptFlags::COLOR, color);
        flags.set(CmptFlags::EOT, eot);
        Self { flags, len, udd: 0 }
    }

    /// An error entry.
    pub fn error(color: bool) -> Self {
        let mut flags = CmptFlags::ERR;
        flags.set(CmptFlags::COLOR, color);
        Self {
            flags,
            len: 0,
            udd: 0,
        }
    }

    #[inline]
    pub fn color(&self) -> bool {
        self.flags.contains(CmptFlags::COLOR)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.flags.contains(CmptFlags::ERR)
    }

    #[inline]
    pub fn is_eot(&self) -> bool {
        self.flags.contains(CmptFlags::EOT)
    }

    #[inline]
    pub fn desc_used(&self) -> bool {
        self.flags.contains(CmptFlags::DESC_USED)
    }

    /// Entry shape the engine can deliver: length format with descriptors used.
    #[inline]
    pub fn is_well_formed(&self) -> bool {
        !self.flags.contains(CmptFlags::FORMAT) && self.desc_used()
    }
}

impl WireFormat for CmptEntry {
    const SIZE: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        let word0 = (self.flags.bits() & 0x1F) | ((self.len as u32) << 16);
        put(out, 0, &word0.to_le_bytes());
        put(out, 4, &self.udd.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        let word0 = get_u32(raw, 0);
        Self {
            flags: CmptFlags::from_bits_truncate(word0),
            len: (word0 >> 16) as u16,
            udd: get_u32(raw, 4),
        }
    }
}

/// Status block trailing the completion ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmptStatus {
    /// Hardware producer index.
    pub pidx: u16,
    /// Last consumer index software reported.
    pub cidx: u16,
    pub color: bool,
}

impl WireFormat for CmptStatus {
    const SIZE: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        put(out, 0, &self.pidx.to_le_bytes());
        put(out, 2, &self.cidx.to_le_bytes());
        put(out, 4, &(self.color as u32).to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            pidx: get_u16(raw, 0),
            cidx: get_u16(raw, 2),
            color: get_u32(raw, 4) & 1 != 0,
        }
    }
}

// ============================================================================
// Coalescing ring
// ============================================================================

/// 8-byte coalescing ring entry: "queue `qid` has new completions".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntrEntry {
    /// Hardware queue id.
    pub qid: u16,
    /// True for the C2H side of the queue.
    pub c2h: bool,
    pub color: bool,
}

impl IntrEntry {
    const QID_MASK: u32 = 0xFFF;
    const C2H: u32 = 1 << 12;
    const COLOR: u32 = 1 << 31;
}

impl WireFormat for IntrEntry {
    const SIZE: usize = 8;

    fn encode_into(&self, out: &mut [u8]) {
        let mut word0 = self.qid as u32 & Self::QID_MASK;
        if self.c2h {
            word0 |= Self::C2H;
        }
        if self.color {
            word0 |= Self::COLOR;
        }
        put(out, 0, &word0.to_le_bytes());
        put(out, 4, &0u32.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        let word0 = get_u32(raw, 0);
        Self {
            qid: (word0 & Self::QID_MASK) as u16,
            c2h: word0 & Self::C2H != 0,
            color: word0 & Self::COLOR != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_sizes() {
        assert_eq!(MmDesc::SIZE, size_of::<MmDesc>());
        assert_eq!(H2cDesc::SIZE, size_of::<H2cDesc>());
        assert_eq!(C2hDesc::SIZE, size_of::<C2hDesc>());
        assert_eq!(RingStatus::SIZE, size_of::<RingStatus>());
    }

    #[test]
    fn test_mm_desc_layout() {
        let mut desc = MmDesc::new(0x1000, 0x2000, 4096);
        desc.add_flags(MmFlags::SOP | MmFlags::EOP);
        assert_eq!(desc.len(), 4096);
        assert!(desc.flags().contains(MmFlags::DV | MmFlags::SOP | MmFlags::EOP));

        let raw = desc.to_bytes();
        assert_eq!(&raw[0..8], &0x1000u64.to_le_bytes());
        assert_eq!(&raw[16..24], &0x2000u64.to_le_bytes());
        assert_eq!(raw[11] & 0x70, 0x70);
        assert_eq!(MmDesc::decode(&raw), desc);
    }

    #[test]
    fn test_mm_desc_len_is_masked() {
        let desc = MmDesc::new(0, 0, u32::MAX);
        assert_eq!(desc.len(), MM_DESC_LEN_MAX);
        assert_eq!(desc.flags(), MmFlags::DV);
    }

    #[test]
    fn test_h2c_desc() {
        let desc = H2cDesc::new(0xABCD_0000, 1500, H2cFlags::SOP);
        let back = H2cDesc::decode(&desc.to_bytes());
        assert_eq!(back.len, 1500);
        assert_eq!(back.h2c_flags(), H2cFlags::SOP);
        assert_eq!(back.src_addr, 0xABCD_0000);
    }

    #[test]
    fn test_cmpt_entry_bits() {
        let entry = CmptEntry::data(256, true, true);
        let raw = entry.to_bytes();
        assert_eq!(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]), 0x0100_001A);

        let back = CmptEntry::decode(&raw);
        assert!(back.color() && back.is_eot() && back.desc_used());
        assert!(back.is_well_formed());
        assert!(!back.is_error());
        assert_eq!(back.len, 256);

        let err = CmptEntry::error(false);
        assert!(err.is_error());
        assert!(!err.is_well_formed());
    }

    #[test]
    fn test_intr_entry() {
        let entry = IntrEntry {
            qid: 0x7FF,
            c2h: true,
            color: true,
        };
        assert_eq!(IntrEntry::decode(&entry.to_bytes()), entry);
        assert_eq!(IntrEntry::decode(&[0u8; 8]), IntrEntry::default());
    }

    #[test]
    fn test_status_blocks() {
        let st = RingStatus::new(5, 3);
        assert_eq!(RingStatus::decode(&st.to_bytes()), st);

        let cs = CmptStatus {
            pidx: 9,
            cidx: 2,
            color: true,
        };
        assert_eq!(CmptStatus::decode(&cs.to_bytes()), cs);
    }
}
