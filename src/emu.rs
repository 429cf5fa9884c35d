// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software-emulated QDMA function.
//!
//! [`EmulatedDevice`] implements [`RegisterAccess`] on top of a register
//! file and a context store, and plays the hardware side of every ring the
//! engine hands it:
//!
//! - indirect context commands execute synchronously (the busy bit can be
//!   held high for fault injection)
//! - producer-index doorbells consume descriptors, move data between host
//!   DMA memory and card memory, and write the status block after the ring
//! - streaming H2C packets are gathered until end-of-packet and routed to a
//!   sink or looped back into the same queue's C2H side
//! - streaming C2H packets fill posted free-list buffers in order and write
//!   colored completion entries
//! - interrupts follow the queue's vector map, through a coalescing ring
//!   when the map says so, and are delivered on crossbeam channels
//!
//! Host memory is the shared [`DmaSpace`]; card memory is a flat byte array.

use crate::context::{
    CoalContext, ContextOp, ContextSelector, HwContext, PrefetchContext, QidVecMap, SwContext,
    TriggerMode, WritebackContext,
};
use crate::csr::{CsrKind, GlobalCsr};
use crate::descriptor::{
    C2hDesc, CmptEntry, CmptStatus, H2cDesc, H2cFlags, IntrEntry, MmDesc, RingStatus, WireFormat,
};
use crate::dma::DmaSpace;
use crate::indirect::ContextCommand;
use crate::lock;
use crate::queue::Direction;
use crate::regs::{
    fmap_reg, Doorbell, FmapEntry, GlobalErrors, PidxUpdate, RegisterAccess, GLBL_ERR_STAT,
    GLBL_WB_ACC, IND_CTXT_CMD, IND_CTXT_DATA_BASE, IND_CTXT_MASK_BASE, IND_CTXT_REG_COUNT,
};
use crate::ring::{idx_delta, idx_incr};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Default card memory size.
pub const DEFAULT_CARD_MEMORY: usize = 1 << 20;

/// Default number of interrupt vectors.
pub const DEFAULT_EMU_VECTORS: u16 = 32;

/// Largest packet one completion entry can describe.
const CMPT_LEN_MAX: usize = u16::MAX as usize;

/// Where streaming H2C packets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamRoute {
    /// Collected for [`EmulatedDevice::take_h2c_packets`].
    #[default]
    Sink,
    /// Received again on the C2H side of the same queue id.
    Loopback,
}

/// Emulated function setup.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub card_memory: usize,
    pub csr: GlobalCsr,
    pub stream: StreamRoute,
    /// Cap on live host DMA bytes.
    pub dma_limit: Option<usize>,
    /// Interrupt vectors the function has.
    pub vectors: u16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            card_memory: DEFAULT_CARD_MEMORY,
            csr: GlobalCsr::default(),
            stream: StreamRoute::Sink,
            dma_limit: None,
            vectors: DEFAULT_EMU_VECTORS,
        }
    }
}

impl EmulatorConfig {
    pub fn with_card_memory(mut self, bytes: usize) -> Self {
        self.card_memory = bytes;
        self
    }

    pub fn with_stream(mut self, route: StreamRoute) -> Self {
        self.stream = route;
        self
    }

    pub fn with_dma_limit(mut self, bytes: usize) -> Self {
        self.dma_limit = Some(bytes);
        self
    }

    pub fn with_vectors(mut self, vectors: u16) -> Self {
        self.vectors = vectors;
        self
    }

    pub fn with_csr(mut self, csr: GlobalCsr) -> Self {
        self.csr = csr;
        self
    }
}

/// A streaming H2C packet that reached the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2cPacket {
    pub qid: u32,
    pub data: Vec<u8>,
}

/// Hardware view of one descriptor ring.
#[derive(Debug, Clone, Copy, Default)]
struct HwRing {
    pidx: u32,
    cidx: u32,
    irq_arm: bool,
}

struct Packet {
    data: Vec<u8>,
    eot: bool,
    error: bool,
}

/// Hardware view of a streaming C2H queue.
#[derive(Default)]
struct HwC2h {
    /// Free-list producer index as posted by software.
    fl_pidx: u32,
    /// Next free-list slot to fill.
    fl_cidx: u32,
    cmpt_pidx: u32,
    cmpt_cidx: u32,
    color: bool,
    backlog: VecDeque<Packet>,
}

#[derive(Debug, Clone, Copy)]
struct HwCoal {
    pidx: u32,
    cidx: u32,
    color: bool,
}

struct IrqSub {
    base: u16,
    count: u16,
    tx: Sender<u16>,
}

struct EmuState {
    regs: HashMap<u32, u32>,
    ctx: HashMap<(u32, ContextSelector), [u32; IND_CTXT_REG_COUNT]>,
    stall: bool,
    held: bool,
    rings: HashMap<(u32, Direction), HwRing>,
    c2h: HashMap<u32, HwC2h>,
    coal: HashMap<u16, HwCoal>,
    card: Vec<u8>,
    /// Streaming H2C fragments waiting for end-of-packet.
    partial: HashMap<u32, Vec<u8>>,
    h2c_packets: Vec<H2cPacket>,
    corrupt: HashSet<(u32, Direction)>,
    /// Vectors raised while the state lock was held.
    fired: Vec<u16>,
}

impl EmuState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn table(&self, kind: CsrKind, idx: u8) -> u32 {
        self.reg(kind.base() + (idx as u32 & 0xF) * 4)
    }

    fn words(&self, qid: u32, sel: ContextSelector) -> Option<[u32; IND_CTXT_REG_COUNT]> {
        self.ctx.get(&(qid, sel)).copied()
    }

    fn sw(&self, qid: u32, dir: Direction) -> Option<SwContext> {
        self.words(qid, ContextSelector::sw(dir))
            .map(|w| SwContext::decode(&w))
    }

    fn flag_error(&mut self, bits: GlobalErrors) {
        let stat = self.reg(GLBL_ERR_STAT) | bits.bits();
        self.regs.insert(GLBL_ERR_STAT, stat);
    }
}

/// Emulated QDMA function.
pub struct EmulatedDevice {
    dma: DmaSpace,
    stream: StreamRoute,
    vectors: u16,
    state: Mutex<EmuState>,
    irq_subs: Mutex<Vec<IrqSub>>,
}

impl EmulatedDevice {
    pub fn new(cfg: EmulatorConfig) -> Self {
        let dma = match cfg.dma_limit {
            Some(limit) => DmaSpace::with_limit(limit),
            None => DmaSpace::new(),
        };
        let mut regs = HashMap::new();
        for kind in CsrKind::ALL {
            for (i, value) in cfg.csr.table(kind).iter().enumerate() {
                regs.insert(kind.base() + (i as u32) * 4, *value);
            }
        }
        regs.insert(GLBL_WB_ACC, cfg.csr.wb_acc);

        Self {
            dma,
            stream: cfg.stream,
            vectors: cfg.vectors,
            state: Mutex::new(EmuState {
                regs,
                ctx: HashMap::new(),
                stall: false,
                held: false,
                rings: HashMap::new(),
                c2h: HashMap::new(),
                coal: HashMap::new(),
                card: vec![0u8; cfg.card_memory],
                partial: HashMap::new(),
                h2c_packets: Vec::new(),
                corrupt: HashSet::new(),
                fired: Vec::new(),
            }),
            irq_subs: Mutex::new(Vec::new()),
        }
    }

    /// Host address space the emulated function reads and writes.
    pub fn dma(&self) -> DmaSpace {
        self.dma.clone()
    }

    /// Number of interrupt vectors.
    pub fn vectors(&self) -> u16 {
        self.vectors
    }

    /// Receive every vector in `[base, base + count)` that fires.
    pub fn subscribe_irq(&self, base: u16, count: u16) -> Receiver<u16> {
        let (tx, rx) = unbounded();
        lock(&self.irq_subs).push(IrqSub { base, count, tx });
        rx
    }

    // ========================================================================
    // Fault injection and test hooks
    // ========================================================================

    /// Queue a received packet for streaming C2H queue `qid`. Packets longer
    /// than one completion entry can describe are split; only the last piece
    /// carries `eot`.
    pub fn inject_c2h(&self, qid: u32, data: &[u8], eot: bool) {
        let mut st = lock(&self.state);
        Self::enqueue_c2h(&mut st, qid, data, eot);
        if !st.held {
            self.drain_c2h(&mut st, qid);
        }
        self.finish(st);
    }

    /// Queue a completion entry with the error flag set.
    pub fn inject_c2h_error(&self, qid: u32) {
        let mut st = lock(&self.state);
        st.c2h.entry(qid).or_default().backlog.push_back(Packet {
            data: Vec::new(),
            eot: false,
            error: true,
        });
        if !st.held {
            self.drain_c2h(&mut st, qid);
        }
        self.finish(st);
    }

    /// Received packets not yet written to a completion ring.
    pub fn c2h_backlog(&self, qid: u32) -> usize {
        lock(&self.state)
            .c2h
            .get(&qid)
            .map_or(0, |hw| hw.backlog.len())
    }

    /// Record doorbells without acting on them.
    pub fn hold(&self) {
        lock(&self.state).held = true;
    }

    /// Act on every doorbell recorded since [`hold`](Self::hold).
    pub fn release(&self) {
        let mut st = lock(&self.state);
        st.held = false;
        let mut rings: Vec<(u32, Direction)> = st
            .rings
            .iter()
            .filter(|(_, r)| r.pidx != r.cidx)
            .map(|(k, _)| *k)
            .collect();
        rings.sort();
        for (qid, dir) in rings {
            self.process_ring(&mut st, qid, dir);
        }
        let mut queues: Vec<u32> = st.c2h.keys().copied().collect();
        queues.sort_unstable();
        for qid in queues {
            self.drain_c2h(&mut st, qid);
        }
        self.finish(st);
    }

    /// Streaming H2C packets delivered to the sink so far.
    pub fn take_h2c_packets(&self) -> Vec<H2cPacket> {
        std::mem::take(&mut lock(&self.state).h2c_packets)
    }

    /// Keep the indirect command busy bit set.
    pub fn stall_context_busy(&self, stall: bool) {
        lock(&self.state).stall = stall;
    }

    /// Report an impossible consumer index on the next status write.
    pub fn corrupt_writeback(&self, qid: u32, dir: Direction) {
        lock(&self.state).corrupt.insert((qid, dir));
    }

    /// Set bits in the global error status and fire `vector`.
    pub fn raise_error(&self, bits: GlobalErrors, vector: u16) {
        let mut st = lock(&self.state);
        st.flag_error(bits);
        st.fired.push(vector);
        self.finish(st);
    }

    /// Function-map entry of `func_id`.
    pub fn fmap(&self, func_id: u8) -> FmapEntry {
        FmapEntry::decode(lock(&self.state).reg(fmap_reg(func_id)))
    }

    /// Copy `len` bytes of card memory starting at `addr`.
    pub fn card_read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let st = lock(&self.state);
        let start = usize::try_from(addr).ok()?;
        st.card.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Store `data` in card memory at `addr`.
    pub fn card_write(&self, addr: u64, data: &[u8]) -> bool {
        let mut st = lock(&self.state);
        let Ok(start) = usize::try_from(addr) else {
            return false;
        };
        match st.card.get_mut(start..start + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Raw words of one stored context.
    pub fn context(&self, qid: u32, sel: ContextSelector) -> Option<[u32; IND_CTXT_REG_COUNT]> {
        lock(&self.state).words(qid, sel)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Drop the state lock, then deliver interrupts raised under it.
    fn finish(&self, mut st: MutexGuard<'_, EmuState>) {
        let fired = std::mem::take(&mut st.fired);
        drop(st);
        if fired.is_empty() {
            return;
        }
        let subs = lock(&self.irq_subs);
        for vector in fired {
            if vector >= self.vectors {
                log::warn!("emu: vector {} beyond {} vectors", vector, self.vectors);
                continue;
            }
            match subs
                .iter()
                .find(|s| vector >= s.base && vector - s.base < s.count)
            {
                Some(sub) => {
                    let _ = sub.tx.send(vector);
                }
                None => log::trace!("emu: vector {} has no listener", vector),
            }
        }
    }

    fn exec_context(&self, st: &mut EmuState, cmd: ContextCommand) {
        let key = (cmd.qid, cmd.sel);
        match cmd.op {
            ContextOp::Clear | ContextOp::Invalidate => {
                st.ctx.remove(&key);
                Self::context_cleared(st, cmd.qid, cmd.sel);
            }
            ContextOp::Write => {
                let old = st.words(cmd.qid, cmd.sel).unwrap_or_default();
                let mut merged = [0u32; IND_CTXT_REG_COUNT];
                for (i, w) in merged.iter_mut().enumerate() {
                    let off = (i as u32) * 4;
                    let data = st.reg(IND_CTXT_DATA_BASE + off);
                    let mask = st.reg(IND_CTXT_MASK_BASE + off);
                    *w = (old[i] & !mask) | (data & mask);
                }
                st.ctx.insert(key, merged);
                Self::context_written(st, cmd.qid, cmd.sel, &merged);
            }
            ContextOp::Read => {
                let words = match cmd.sel {
                    ContextSelector::HwH2c => Self::hw_context(st, cmd.qid, Direction::H2c),
                    ContextSelector::HwC2h => Self::hw_context(st, cmd.qid, Direction::C2h),
                    sel => st.words(cmd.qid, sel).unwrap_or_default(),
                };
                for (i, w) in words.iter().enumerate() {
                    st.regs.insert(IND_CTXT_DATA_BASE + (i as u32) * 4, *w);
                }
            }
        }
    }

    fn hw_context(st: &EmuState, qid: u32, dir: Direction) -> [u32; IND_CTXT_REG_COUNT] {
        let mut out = [0u32; IND_CTXT_REG_COUNT];
        if let Some(ring) = st.rings.get(&(qid, dir)) {
            let hw = HwContext {
                cidx: ring.cidx as u16,
                credits_used: 0,
                desc_pending: ring.pidx != ring.cidx,
                idle: ring.pidx == ring.cidx,
            };
            out[..HwContext::WORDS].copy_from_slice(&hw.encode());
        }
        out
    }

    fn context_written(st: &mut EmuState, qid: u32, sel: ContextSelector, words: &[u32]) {
        match sel {
            ContextSelector::SwH2c | ContextSelector::SwC2h => {
                let dir = if sel == ContextSelector::SwH2c {
                    Direction::H2c
                } else {
                    Direction::C2h
                };
                let sw = SwContext::decode(words);
                if dir == Direction::C2h && !sw.is_mm {
                    let hw = st.c2h.entry(qid).or_default();
                    hw.fl_pidx = 0;
                    hw.fl_cidx = 0;
                } else {
                    st.rings.insert((qid, dir), HwRing::default());
                    if dir == Direction::H2c {
                        st.partial.remove(&qid);
                    }
                }
            }
            ContextSelector::Writeback => {
                let wb = WritebackContext::decode(words);
                let hw = st.c2h.entry(qid).or_default();
                hw.cmpt_pidx = 0;
                hw.cmpt_cidx = 0;
                hw.color = wb.color;
            }
            ContextSelector::Coalesce => {
                let cc = CoalContext::decode(words);
                st.coal.insert(
                    qid as u16,
                    HwCoal {
                        pidx: cc.pidx as u32,
                        cidx: 0,
                        color: cc.color,
                    },
                );
            }
            _ => {}
        }
    }

    fn context_cleared(st: &mut EmuState, qid: u32, sel: ContextSelector) {
        match sel {
            ContextSelector::SwH2c => {
                st.rings.remove(&(qid, Direction::H2c));
                st.partial.remove(&qid);
            }
            ContextSelector::SwC2h => {
                st.rings.remove(&(qid, Direction::C2h));
            }
            ContextSelector::Writeback => {
                st.c2h.remove(&qid);
            }
            ContextSelector::Coalesce => {
                st.coal.remove(&(qid as u16));
            }
            _ => {}
        }
    }

    fn doorbell(&self, st: &mut EmuState, bell: Doorbell, value: u32) {
        match bell {
            Doorbell::H2cPidx(qid) => self.pidx_doorbell(st, qid, Direction::H2c, value),
            Doorbell::C2hPidx(qid) => {
                let is_mm = st.sw(qid, Direction::C2h).is_some_and(|sw| sw.is_mm);
                if is_mm {
                    self.pidx_doorbell(st, qid, Direction::C2h, value);
                } else {
                    let update = PidxUpdate::decode(value);
                    if let Some(hw) = st.c2h.get_mut(&qid) {
                        hw.fl_pidx = update.pidx as u32;
                    }
                    if !st.held {
                        self.drain_c2h(st, qid);
                    }
                }
            }
            Doorbell::CmptCidx(qid) => {
                if let Some(hw) = st.c2h.get_mut(&qid) {
                    hw.cmpt_cidx = value & 0xFFFF;
                }
                if !st.held {
                    self.drain_c2h(st, qid);
                }
            }
            Doorbell::IntrCidx(ring) => {
                if let Some(hw) = st.coal.get_mut(&(ring as u16)) {
                    hw.cidx = value & 0xFFFF;
                }
            }
        }
    }

    fn pidx_doorbell(&self, st: &mut EmuState, qid: u32, dir: Direction, value: u32) {
        let update = PidxUpdate::decode(value);
        let Some(sw) = st.sw(qid, dir) else {
            log::warn!("emu: {} doorbell on unprogrammed queue {:#x}", dir, qid);
            return;
        };
        let slots = st.table(CsrKind::RingSize, sw.ring_size_idx);
        if update.pidx as u32 >= slots {
            log::warn!(
                "emu: {} pidx {} beyond ring of {} slots on queue {:#x}",
                dir,
                update.pidx,
                slots,
                qid
            );
            st.flag_error(GlobalErrors::DSC);
            return;
        }
        let ring = st.rings.entry((qid, dir)).or_default();
        ring.pidx = update.pidx as u32;
        ring.irq_arm = update.irq_arm;
        if !st.held {
            self.process_ring(st, qid, dir);
        }
    }

    /// Consume every descriptor between the hardware consumer index and the
    /// posted producer index.
    fn process_ring(&self, st: &mut EmuState, qid: u32, dir: Direction) {
        let Some(sw) = st.sw(qid, dir) else {
            return;
        };
        let Some(ring) = st.rings.get(&(qid, dir)).copied() else {
            return;
        };
        if !sw.enable {
            return;
        }
        let slots = st.table(CsrKind::RingSize, sw.ring_size_idx);
        let desc_size = sw.desc_size.bytes();
        let mut cidx = ring.cidx;
        while cidx != ring.pidx {
            let addr = sw.base + cidx as u64 * desc_size as u64;
            let mut raw = vec![0u8; desc_size];
            if !self.dma.read(addr, &mut raw) {
                log::warn!("emu: descriptor fetch at {:#x} failed", addr);
                st.flag_error(GlobalErrors::DSC);
            } else if sw.is_mm {
                self.mm_transfer(st, dir, &MmDesc::decode(&raw));
            } else {
                self.h2c_fragment(st, qid, &H2cDesc::decode(&raw));
            }
            cidx = idx_incr(cidx, 1, slots);
        }
        if let Some(r) = st.rings.get_mut(&(qid, dir)) {
            r.cidx = cidx;
        }

        if sw.wbk_en {
            let reported = if st.corrupt.remove(&(qid, dir)) {
                slots + 1
            } else {
                cidx
            };
            let status = RingStatus::new(ring.pidx as u16, reported as u16);
            let at = sw.base + slots as u64 * desc_size as u64;
            self.dma.write(at, &status.to_bytes());
        }
        if sw.irq_en && ring.irq_arm {
            self.raise(st, qid, dir);
        }
    }

    fn mm_transfer(&self, st: &mut EmuState, dir: Direction, desc: &MmDesc) {
        let len = desc.len() as usize;
        let (host, card) = match dir {
            Direction::H2c => (desc.src_addr, desc.dst_addr),
            Direction::C2h => (desc.dst_addr, desc.src_addr),
        };
        let range = usize::try_from(card)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|r| r.end <= st.card.len());
        let Some(range) = range else {
            log::warn!("emu: card address {:#x}+{} out of range", card, len);
            st.flag_error(GlobalErrors::DSC);
            return;
        };
        let ok = match dir {
            Direction::H2c => self.dma.read(host, &mut st.card[range]),
            Direction::C2h => self.dma.write(host, &st.card[range]),
        };
        if !ok {
            log::warn!("emu: host address {:#x}+{} not mapped", host, len);
            st.flag_error(GlobalErrors::DSC);
        }
    }

    fn h2c_fragment(&self, st: &mut EmuState, qid: u32, desc: &H2cDesc) {
        let mut data = vec![0u8; desc.len as usize];
        if !self.dma.read(desc.src_addr, &mut data) {
            log::warn!("emu: host address {:#x} not mapped", desc.src_addr);
            st.flag_error(GlobalErrors::ST_H2C);
            return;
        }
        let flags = desc.h2c_flags();
        let packet = st.partial.entry(qid).or_default();
        if flags.contains(H2cFlags::SOP) {
            packet.clear();
        }
        packet.extend_from_slice(&data);
        if !flags.contains(H2cFlags::EOP) {
            return;
        }
        let data = st.partial.remove(&qid).unwrap_or_default();
        match self.stream {
            StreamRoute::Sink => st.h2c_packets.push(H2cPacket { qid, data }),
            StreamRoute::Loopback => {
                Self::enqueue_c2h(st, qid, &data, true);
                self.drain_c2h(st, qid);
            }
        }
    }

    fn enqueue_c2h(st: &mut EmuState, qid: u32, data: &[u8], eot: bool) {
        let hw = st.c2h.entry(qid).or_default();
        if data.is_empty() {
            hw.backlog.push_back(Packet {
                data: Vec::new(),
                eot,
                error: false,
            });
            return;
        }
        let pieces = data.len().div_ceil(CMPT_LEN_MAX);
        for (i, piece) in data.chunks(CMPT_LEN_MAX).enumerate() {
            hw.backlog.push_back(Packet {
                data: piece.to_vec(),
                eot: eot && i + 1 == pieces,
                error: false,
            });
        }
    }

    /// Move backlog packets into posted buffers while both the free list
    /// and the completion ring have room.
    fn drain_c2h(&self, st: &mut EmuState, qid: u32) {
        let Some(sw) = st.sw(qid, Direction::C2h).filter(|sw| !sw.is_mm && sw.enable) else {
            return;
        };
        let Some(wb) = st
            .words(qid, ContextSelector::Writeback)
            .map(|w| WritebackContext::decode(&w))
            .filter(|wb| wb.valid)
        else {
            return;
        };
        let pf = st
            .words(qid, ContextSelector::Prefetch)
            .map(|w| PrefetchContext::decode(&w))
            .unwrap_or_default();
        let fl_slots = st.table(CsrKind::RingSize, sw.ring_size_idx);
        let cmpt_slots = st.table(CsrKind::RingSize, wb.ring_size_idx);
        let buf_size = st.table(CsrKind::BufSize, pf.buf_size_idx) as usize;
        if fl_slots == 0 || cmpt_slots < 2 || buf_size == 0 {
            return;
        }

        let Some(hw) = st.c2h.get_mut(&qid) else {
            return;
        };
        let mut wrote = false;
        while let Some(pkt) = hw.backlog.front() {
            if idx_delta(hw.cmpt_pidx, hw.cmpt_cidx, cmpt_slots) >= cmpt_slots - 1 {
                break;
            }
            let entry = if pkt.error {
                CmptEntry::error(hw.color)
            } else {
                let ndesc = pkt.data.len().div_ceil(buf_size).max(1) as u32;
                if idx_delta(hw.fl_pidx, hw.fl_cidx, fl_slots) < ndesc {
                    break;
                }
                for (i, chunk) in pkt.data.chunks(buf_size).enumerate() {
                    let slot = idx_incr(hw.fl_cidx, i as u32, fl_slots);
                    let mut raw = [0u8; C2hDesc::SIZE];
                    let at = sw.base + slot as u64 * C2hDesc::SIZE as u64;
                    let desc = if self.dma.read(at, &mut raw) {
                        C2hDesc::decode(&raw)
                    } else {
                        C2hDesc::default()
                    };
                    if !self.dma.write(desc.dst_addr, chunk) {
                        log::warn!("emu: c2h buffer {:#x} not mapped", desc.dst_addr);
                    }
                }
                hw.fl_cidx = idx_incr(hw.fl_cidx, ndesc, fl_slots);
                CmptEntry::data(pkt.data.len() as u16, hw.color, pkt.eot)
            };
            let at = wb.base + hw.cmpt_pidx as u64 * CmptEntry::SIZE as u64;
            self.dma.write(at, &entry.to_bytes());
            hw.cmpt_pidx = idx_incr(hw.cmpt_pidx, 1, cmpt_slots);
            if hw.cmpt_pidx == 0 {
                hw.color = !hw.color;
            }
            hw.backlog.pop_front();
            wrote = true;
        }
        if !wrote {
            return;
        }
        if wb.stat_desc_en {
            let status = CmptStatus {
                pidx: hw.cmpt_pidx as u16,
                cidx: hw.cmpt_cidx as u16,
                color: hw.color,
            };
            let at = wb.base + cmpt_slots as u64 * CmptEntry::SIZE as u64;
            self.dma.write(at, &status.to_bytes());
        }
        if wb.irq_en && wb.trig_mode != TriggerMode::Disabled {
            self.raise(st, qid, Direction::C2h);
        }
    }

    /// Signal new progress on `(qid, dir)` through its vector map.
    fn raise(&self, st: &mut EmuState, qid: u32, dir: Direction) {
        let map = st
            .words(qid, ContextSelector::QidVec)
            .map(|w| QidVecMap::decode(&w))
            .unwrap_or_default();
        let (vec, coalesced) = map.get(dir);
        if !coalesced {
            st.fired.push(vec);
            return;
        }

        let Some(cc) = st
            .words(vec as u32, ContextSelector::Coalesce)
            .map(|w| CoalContext::decode(&w))
            .filter(|cc| cc.valid)
        else {
            log::warn!("emu: queue {:#x} mapped to unprogrammed coalescing ring {}", qid, vec);
            return;
        };
        let slots = CoalContext::slots_for(cc.ring_size_idx);
        let hw = st.coal.entry(vec).or_insert(HwCoal {
            pidx: 0,
            cidx: 0,
            color: cc.color,
        });
        let next = idx_incr(hw.pidx, 1, slots);
        if next == hw.cidx {
            log::warn!("emu: coalescing ring {} full, dropping entry for {:#x}", vec, qid);
        } else {
            let entry = IntrEntry {
                qid: qid as u16,
                c2h: dir.is_c2h(),
                color: hw.color,
            };
            let at = cc.base + hw.pidx as u64 * IntrEntry::SIZE as u64;
            self.dma.write(at, &entry.to_bytes());
            hw.pidx = next;
            if hw.pidx == 0 {
                hw.color = !hw.color;
            }
        }
        st.fired.push(cc.vec_id);
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl RegisterAccess for EmulatedDevice {
    fn read32(&self, offset: u32) -> u32 {
        let st = lock(&self.state);
        if offset == IND_CTXT_CMD && st.stall {
            return st.reg(offset) | ContextCommand::BUSY;
        }
        st.reg(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = lock(&self.state);
        if offset == IND_CTXT_CMD {
            st.regs.insert(offset, value & !ContextCommand::BUSY);
            if st.stall {
                return;
            }
            match ContextCommand::decode(value) {
                Some(cmd) => self.exec_context(&mut st, cmd),
                None => {
                    log::warn!("emu: bad context command {:#x}", value);
                    st.flag_error(GlobalErrors::TRQ);
                }
            }
        } else if offset == GLBL_ERR_STAT {
            let stat = st.reg(offset) & !value;
            st.regs.insert(offset, stat);
        } else if let Some(bell) = Doorbell::decode(offset) {
            self.doorbell(&mut st, bell, value);
        } else {
            st.regs.insert(offset, value);
        }
        self.finish(st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DescSize, QueueContext};
    use crate::dma::DmaBuffer;
    use crate::indirect::{ContextProgrammer, DirectProgrammer};
    use crate::policy::RetryPolicy;
    use crate::queue::QueueMode;
    use crate::regs::{c2h_pidx_reg, cmpt_cidx_reg, h2c_pidx_reg, FMAP_BASE};
    use crate::ring::DescRing;
    use std::sync::Arc;
    use std::time::Duration;

    fn programmer(emu: &Arc<EmulatedDevice>) -> DirectProgrammer {
        DirectProgrammer::new(
            emu.clone(),
            RetryPolicy::new(Duration::from_micros(1), Duration::from_millis(20)),
        )
    }

    /// Program an MM or ST-H2C ring of 16 usable slots (CSR index 14).
    fn program_ring(
        emu: &Arc<EmulatedDevice>,
        qid: u32,
        dir: Direction,
        is_mm: bool,
        vec: Option<(u16, bool)>,
    ) -> DescRing {
        let desc = if is_mm { DescSize::B32 } else { DescSize::B16 };
        let ring = DescRing::alloc(&emu.dma(), 17, desc.bytes(), 14, "ring").unwrap();
        let mut ctx = QueueContext::default();
        ctx.sw.enable = true;
        ctx.sw.is_mm = is_mm;
        ctx.sw.wbk_en = true;
        ctx.sw.ring_size_idx = 14;
        ctx.sw.desc_size = desc;
        ctx.sw.base = ring.bus_addr();
        if let Some((v, coal)) = vec {
            ctx.sw.irq_en = true;
            ctx.qid_vec.set(dir, v, coal);
        }
        programmer(emu).write(qid, dir, &ctx).unwrap();
        ring
    }

    struct StC2h {
        free: DescRing,
        bufs: Vec<DmaBuffer>,
        cmpt: DmaBuffer,
    }

    /// Program a streaming C2H queue: 16 buffers of 256 bytes, 33-slot
    /// completion ring.
    fn program_st_c2h(emu: &Arc<EmulatedDevice>, qid: u32, vec: Option<u16>) -> StC2h {
        let dma = emu.dma();
        let free = DescRing::alloc(&dma, 17, 8, 14, "free").unwrap();
        let bufs: Vec<DmaBuffer> = (0..17)
            .map(|i| {
                let b = dma.alloc(256, "buf").unwrap();
                free.write(i, &C2hDesc { dst_addr: b.bus_addr() });
                b
            })
            .collect();
        let cmpt = dma.alloc(33 * 8 + 8, "cmpt").unwrap();

        let mut ctx = QueueContext::default();
        ctx.sw.enable = true;
        ctx.sw.ring_size_idx = 14;
        ctx.sw.base = free.bus_addr();
        ctx.prefetch = Some(PrefetchContext {
            buf_size_idx: 1,
            valid: true,
            ..Default::default()
        });
        ctx.writeback = Some(WritebackContext {
            stat_desc_en: true,
            irq_en: vec.is_some(),
            trig_mode: TriggerMode::Every,
            color: true,
            ring_size_idx: 15,
            base: cmpt.bus_addr(),
            valid: true,
            ..Default::default()
        });
        if let Some(v) = vec {
            ctx.qid_vec.set(Direction::C2h, v, false);
        }
        programmer(emu).write(qid, Direction::C2h, &ctx).unwrap();
        emu.write32(c2h_pidx_reg(qid), PidxUpdate { pidx: 16, irq_arm: false }.encode());
        StC2h { free, bufs, cmpt }
    }

    #[test]
    fn test_csr_tables_preloaded() {
        let emu = EmulatedDevice::default();
        let csr = GlobalCsr::read_from(&emu);
        assert_eq!(csr, GlobalCsr::default());

        emu.write32(fmap_reg(3), FmapEntry { qbase: 64, qmax: 32 }.encode());
        assert_eq!(emu.fmap(3), FmapEntry { qbase: 64, qmax: 32 });
        assert_eq!(fmap_reg(3), FMAP_BASE + 12);
    }

    #[test]
    fn test_context_round_trip_and_stall() {
        let emu = Arc::new(EmulatedDevice::default());
        let prog = programmer(&emu);
        let mut ctx = QueueContext::default();
        ctx.sw.is_mm = true;
        ctx.sw.func_id = 2;
        ctx.qid_vec.set(Direction::H2c, 5, false);
        prog.write(7, Direction::H2c, &ctx).unwrap();

        let back = prog.read(7, Direction::H2c, QueueMode::MemoryMapped).unwrap();
        assert_eq!(back.sw, ctx.sw);
        assert_eq!(back.qid_vec.get(Direction::H2c), (5, false));
        assert!(back.hw.idle);

        emu.stall_context_busy(true);
        let err = prog.clear(7, Direction::H2c, QueueMode::MemoryMapped).unwrap_err();
        assert!(matches!(err, crate::error::QdmaError::ContextProgramTimeout { qid: 7, .. }));
        emu.stall_context_busy(false);
        prog.clear(7, Direction::H2c, QueueMode::MemoryMapped).unwrap();
        assert!(emu.context(7, ContextSelector::SwH2c).is_none());
    }

    #[test]
    fn test_mm_h2c_moves_data_and_writes_status() {
        let emu = Arc::new(EmulatedDevice::default());
        let mut ring = program_ring(&emu, 1, Direction::H2c, true, None);
        let src = emu.dma().alloc(300, "src").unwrap();
        src.write(0, &[0xAB; 300]);

        for (i, off) in [0u64, 200].iter().enumerate() {
            let idx = ring.produce();
            ring.write(idx, &MmDesc::new(src.bus_addr() + off, 0x1000 + off, [200, 100][i]));
        }
        emu.write32(h2c_pidx_reg(1), PidxUpdate { pidx: 2, irq_arm: false }.encode());

        assert_eq!(ring.status(), RingStatus::new(2, 2));
        assert_eq!(emu.card_read(0x1000, 300).unwrap(), vec![0xAB; 300]);
        assert_eq!(emu.card_read(0x1000 + 300, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_mm_c2h_reads_card_memory() {
        let emu = Arc::new(EmulatedDevice::default());
        assert!(emu.card_write(0x40, b"card data"));
        let mut ring = program_ring(&emu, 2, Direction::C2h, true, None);
        let dst = emu.dma().alloc(9, "dst").unwrap();
        let idx = ring.produce();
        ring.write(idx, &MmDesc::new(0x40, dst.bus_addr(), 9));
        emu.write32(c2h_pidx_reg(2), PidxUpdate { pidx: 1, irq_arm: false }.encode());
        assert_eq!(dst.to_vec(), b"card data");
        assert_eq!(ring.status().cidx, 1);
    }

    #[test]
    fn test_bad_card_address_flags_error() {
        let emu = Arc::new(EmulatedDevice::new(EmulatorConfig::default().with_card_memory(64)));
        let mut ring = program_ring(&emu, 0, Direction::H2c, true, None);
        let src = emu.dma().alloc(128, "src").unwrap();
        let idx = ring.produce();
        ring.write(idx, &MmDesc::new(src.bus_addr(), 0, 128));
        emu.write32(h2c_pidx_reg(0), PidxUpdate { pidx: 1, irq_arm: false }.encode());

        assert_eq!(emu.read32(GLBL_ERR_STAT), GlobalErrors::DSC.bits());
        emu.write32(GLBL_ERR_STAT, GlobalErrors::DSC.bits());
        assert_eq!(emu.read32(GLBL_ERR_STAT), 0);
        // The descriptor is consumed regardless.
        assert_eq!(ring.status().cidx, 1);
    }

    #[test]
    fn test_st_h2c_gathers_until_eop() {
        let emu = Arc::new(EmulatedDevice::default());
        let mut ring = program_ring(&emu, 4, Direction::H2c, false, None);
        let src = emu.dma().alloc(8, "src").unwrap();
        src.write(0, b"abcdefgh");

        let idx = ring.produce();
        ring.write(idx, &H2cDesc::new(src.bus_addr(), 5, H2cFlags::SOP));
        emu.write32(h2c_pidx_reg(4), PidxUpdate { pidx: 1, irq_arm: false }.encode());
        assert!(emu.take_h2c_packets().is_empty());

        let idx = ring.produce();
        ring.write(idx, &H2cDesc::new(src.bus_addr() + 5, 3, H2cFlags::EOP));
        emu.write32(h2c_pidx_reg(4), PidxUpdate { pidx: 2, irq_arm: false }.encode());
        assert_eq!(
            emu.take_h2c_packets(),
            vec![H2cPacket {
                qid: 4,
                data: b"abcdefgh".to_vec()
            }]
        );
    }

    #[test]
    fn test_st_c2h_fills_buffers_in_order() {
        let emu = Arc::new(EmulatedDevice::default());
        let q = program_st_c2h(&emu, 9, None);
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        emu.inject_c2h(9, &data, true);

        let entry = CmptEntry::decode(&q.cmpt.to_vec()[..8]);
        assert_eq!(entry, CmptEntry::data(600, true, true));
        let status = CmptStatus::decode(&q.cmpt.to_vec()[33 * 8..]);
        assert_eq!(status.pidx, 1);
        assert_eq!(q.bufs[0].to_vec(), data[..256].to_vec());
        assert_eq!(q.bufs[1].to_vec(), data[256..512].to_vec());
        assert_eq!(q.bufs[2].to_vec()[..88], data[512..]);
        assert!(q.free.bus_addr() > 0);
    }

    #[test]
    fn test_st_c2h_waits_for_posted_buffers() {
        let emu = Arc::new(EmulatedDevice::default());
        let q = program_st_c2h(&emu, 3, None);
        for _ in 0..16 {
            emu.inject_c2h(3, &[1u8; 256], false);
        }
        emu.inject_c2h(3, &[2u8; 10], true);
        assert_eq!(emu.c2h_backlog(3), 1);

        // Software consumed everything and posts one more buffer.
        emu.write32(cmpt_cidx_reg(3), 16);
        emu.write32(c2h_pidx_reg(3), PidxUpdate { pidx: 0, irq_arm: false }.encode());
        assert_eq!(emu.c2h_backlog(3), 0);
        assert_eq!(q.bufs[16].to_vec()[..10], [2u8; 10]);
    }

    #[test]
    fn test_loopback_route() {
        let emu = Arc::new(EmulatedDevice::new(
            EmulatorConfig::default().with_stream(StreamRoute::Loopback),
        ));
        let mut ring = program_ring(&emu, 5, Direction::H2c, false, None);
        let q = program_st_c2h(&emu, 5, None);
        let src = emu.dma().alloc(4, "src").unwrap();
        src.write(0, b"ping");
        let idx = ring.produce();
        ring.write(idx, &H2cDesc::new(src.bus_addr(), 4, H2cFlags::SOP | H2cFlags::EOP));
        emu.write32(h2c_pidx_reg(5), PidxUpdate { pidx: 1, irq_arm: false }.encode());

        assert!(emu.take_h2c_packets().is_empty());
        assert_eq!(&q.bufs[0].to_vec()[..4], b"ping");
        assert_eq!(CmptEntry::decode(&q.cmpt.to_vec()[..8]).len, 4);
    }

    #[test]
    fn test_direct_interrupt_needs_arm() {
        let emu = Arc::new(EmulatedDevice::default());
        let irq = emu.subscribe_irq(0, 8);
        let mut ring = program_ring(&emu, 0, Direction::H2c, true, Some((3, false)));
        let src = emu.dma().alloc(8, "src").unwrap();

        let idx = ring.produce();
        ring.write(idx, &MmDesc::new(src.bus_addr(), 0, 8));
        emu.write32(h2c_pidx_reg(0), PidxUpdate { pidx: 1, irq_arm: false }.encode());
        assert!(irq.try_recv().is_err());

        let idx = ring.produce();
        ring.write(idx, &MmDesc::new(src.bus_addr(), 0, 8));
        emu.write32(h2c_pidx_reg(0), PidxUpdate { pidx: 2, irq_arm: true }.encode());
        assert_eq!(irq.try_recv(), Ok(3));
    }

    #[test]
    fn test_coalesced_interrupt_writes_ring_entry() {
        let emu = Arc::new(EmulatedDevice::default());
        let irq = emu.subscribe_irq(0, 8);
        let coal = emu.dma().alloc(512 * 8, "coal").unwrap();
        programmer(&emu)
            .program_coalescing(
                2,
                &CoalContext {
                    valid: true,
                    vec_id: 2,
                    color: true,
                    ring_size_idx: 0,
                    base: coal.bus_addr(),
                    pidx: 0,
                },
            )
            .unwrap();
        let q = program_st_c2h(&emu, 6, None);
        // Re-point the vector map and enable completion interrupts.
        let prog = programmer(&emu);
        let mut full = prog.read(6, Direction::C2h, QueueMode::Streaming).unwrap();
        full.qid_vec.set(Direction::C2h, 2, true);
        if let Some(wb) = full.writeback.as_mut() {
            wb.irq_en = true;
        }
        prog.write(6, Direction::C2h, &full).unwrap();
        emu.write32(c2h_pidx_reg(6), PidxUpdate { pidx: 16, irq_arm: false }.encode());

        emu.inject_c2h(6, b"x", true);
        assert_eq!(irq.try_recv(), Ok(2));
        let entry = IntrEntry::decode(&coal.to_vec()[..8]);
        assert_eq!(
            entry,
            IntrEntry {
                qid: 6,
                c2h: true,
                color: true
            }
        );
        assert_eq!(q.bufs[0].to_vec()[0], b'x');
    }

    #[test]
    fn test_hold_and_release() {
        let emu = Arc::new(EmulatedDevice::default());
        let mut ring = program_ring(&emu, 0, Direction::H2c, true, None);
        let src = emu.dma().alloc(4, "src").unwrap();
        src.write(0, b"held");
        let idx = ring.produce();
        ring.write(idx, &MmDesc::new(src.bus_addr(), 0, 4));

        emu.hold();
        emu.write32(h2c_pidx_reg(0), PidxUpdate { pidx: 1, irq_arm: false }.encode());
        assert_eq!(ring.status().cidx, 0);
        assert_eq!(emu.card_read(0, 4).unwrap(), vec![0; 4]);

        emu.release();
        assert_eq!(ring.status().cidx, 1);
        assert_eq!(emu.card_read(0, 4).unwrap(), b"held");
    }

    #[test]
    fn test_corrupt_writeback_once() {
        let emu = Arc::new(EmulatedDevice::default());
        let mut ring = program_ring(&emu, 0, Direction::H2c, true, None);
        let src = emu.dma().alloc(4, "src").unwrap();
        emu.corrupt_writeback(0, Direction::H2c);
        for pidx in 1..=2u16 {
            let idx = ring.produce();
            ring.write(idx, &MmDesc::new(src.bus_addr(), 0, 4));
            emu.write32(h2c_pidx_reg(0), PidxUpdate { pidx, irq_arm: false }.encode());
            let expect = if pidx == 1 { 18 } else { 2 };
            assert_eq!(ring.status().cidx, expect);
        }
    }

    #[test]
    fn test_error_interrupt() {
        let emu = EmulatedDevice::default();
        let irq = emu.subscribe_irq(0, 2);
        emu.raise_error(GlobalErrors::RAM_DBE, 0);
        assert_eq!(irq.try_recv(), Ok(0));
        assert_eq!(
            GlobalErrors::from_bits_truncate(emu.read32(GLBL_ERR_STAT)),
            GlobalErrors::RAM_DBE
        );
    }
}
