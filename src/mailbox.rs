// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Mailbox between restricted functions and the privileged owner.
//!
//! Every message is a fixed 64-byte envelope:
//!
//! | Byte | Content |
//! |------|---------|
//! | 0 | opcode (bits 0-3), `wait` (bit 6), `ack` (bit 7) |
//! | 1 | source function |
//! | 2 | destination function |
//! | 3 | status ([`MboxStatus`], responses only) |
//! | 4 | sequence number, echoed in the response |
//! | 5..64 | opcode-specific payload, little endian |
//!
//! A restricted function runs a [`MailboxClient`]: one outstanding `wait`
//! request at a time, a background thread polling the channel, and a response
//! slot matched by opcode and sequence number. The owner runs a [`MailboxServer`] that answers
//! every request through a [`MailboxHandler`].

use crate::context::{
    CoalContext, CreditContext, HwContext, PrefetchContext, QidVecMap, QueueContext, SwContext,
    WritebackContext,
};
use crate::csr::{CsrKind, GlobalCsr, CSR_TABLE_LEN};
use crate::error::{QdmaError, QdmaResult};
use crate::indirect::ContextProgrammer;
use crate::lock;
use crate::opcode::{MboxOpcode, MboxStatus};
use crate::partition::RangeGrant;
use crate::policy::RetryPolicy;
use crate::queue::{Direction, QueueMode};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Envelope size in bytes.
pub const MBOX_MSG_LEN: usize = 64;

/// Header bytes before the payload.
const MBOX_HEADER_LEN: usize = 5;

/// Payload bytes after the header.
pub const MBOX_PAYLOAD_LEN: usize = MBOX_MSG_LEN - MBOX_HEADER_LEN;

const WAIT_BIT: u8 = 1 << 6;
const ACK_BIT: u8 = 1 << 7;

// ============================================================================
// Payload encoding
// ============================================================================

struct PayloadWriter {
    buf: [u8; MBOX_PAYLOAD_LEN],
    pos: usize,
}

impl PayloadWriter {
    fn new() -> Self {
        Self {
            buf: [0; MBOX_PAYLOAD_LEN],
            pos: 0,
        }
    }

    fn bytes(&mut self, data: &[u8]) -> &mut Self {
        let end = (self.pos + data.len()).min(MBOX_PAYLOAD_LEN);
        let n = end - self.pos;
        self.buf[self.pos..end].copy_from_slice(&data[..n]);
        self.pos = end;
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    fn words(&mut self, words: &[u32]) -> &mut Self {
        for &w in words {
            self.u32(w);
        }
        self
    }

    fn finish(&self) -> [u8; MBOX_PAYLOAD_LEN] {
        self.buf
    }
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.buf.get(self.pos..self.pos + N) {
            out.copy_from_slice(src);
        }
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn words<const N: usize>(&mut self) -> [u32; N] {
        let mut out = [0u32; N];
        for w in out.iter_mut() {
            *w = self.u32();
        }
        out
    }
}

fn dir_to_wire(dir: Direction) -> u8 {
    match dir {
        Direction::H2c => 0,
        Direction::C2h => 1,
    }
}

fn dir_from_wire(v: u8) -> QdmaResult<Direction> {
    match v {
        0 => Ok(Direction::H2c),
        1 => Ok(Direction::C2h),
        _ => Err(QdmaError::MalformedMessage(format!("bad direction {}", v))),
    }
}

fn mode_to_wire(mode: QueueMode) -> u8 {
    match mode {
        QueueMode::MemoryMapped => 0,
        QueueMode::Streaming => 1,
    }
}

fn mode_from_wire(v: u8) -> QdmaResult<QueueMode> {
    match v {
        0 => Ok(QueueMode::MemoryMapped),
        1 => Ok(QueueMode::Streaming),
        _ => Err(QdmaError::MalformedMessage(format!("bad queue mode {}", v))),
    }
}

const HAS_PREFETCH: u8 = 1 << 0;
const HAS_WRITEBACK: u8 = 1 << 1;

fn ctx_flags(ctx: &QueueContext) -> u8 {
    (if ctx.prefetch.is_some() { HAS_PREFETCH } else { 0 })
        | (if ctx.writeback.is_some() { HAS_WRITEBACK } else { 0 })
}

// ============================================================================
// Messages
// ============================================================================

/// Decoded mailbox payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MboxMsg {
    Hello,
    Bye,
    /// Ask for the current queue range.
    RangeQuery,
    /// Ask for a range of `qmax` queues.
    RangeAssign { qmax: u32 },
    /// Current range; the reply to `Hello` and both range requests.
    Range(RangeGrant),
    ContextWrite {
        qid: u32,
        dir: Direction,
        ctx: QueueContext,
    },
    ContextRead {
        qid: u32,
        dir: Direction,
        mode: QueueMode,
    },
    ContextData(QueueContext),
    ContextClear {
        qid: u32,
        dir: Direction,
        mode: QueueMode,
    },
    /// Program (`Some`) or clear (`None`) a coalescing ring context.
    VectorContext { ring: u16, ctx: Option<CoalContext> },
    /// Ask for one CSR table; a whole set does not fit one payload.
    CsrRead { kind: CsrKind },
    CsrTable {
        kind: CsrKind,
        values: [u32; CSR_TABLE_LEN],
        wb_acc: u32,
    },
    /// Empty acknowledgement.
    Done,
    /// Opcode this side does not understand.
    Unknown {
        op: u8,
        data: [u8; MBOX_PAYLOAD_LEN],
    },
}

impl MboxMsg {
    pub fn opcode(&self) -> Option<MboxOpcode> {
        let op = match self {
            Self::Hello => MboxOpcode::Hello,
            Self::Bye => MboxOpcode::Bye,
            Self::RangeQuery | Self::RangeAssign { .. } | Self::Range(_) => {
                MboxOpcode::QueueRangeMap
            }
            Self::ContextWrite { .. } => MboxOpcode::ContextWrite,
            Self::ContextRead { .. } | Self::ContextData(_) => MboxOpcode::ContextRead,
            Self::ContextClear { .. } => MboxOpcode::ContextClear,
            Self::VectorContext { .. } => MboxOpcode::VectorContext,
            Self::CsrRead { .. } | Self::CsrTable { .. } => MboxOpcode::Csr,
            Self::Done | Self::Unknown { .. } => return None,
        };
        Some(op)
    }

    /// Safe to resend when the response went missing.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Self::RangeQuery => true,
            Self::RangeAssign { .. } => false,
            other => other.opcode().is_some_and(MboxOpcode::is_idempotent),
        }
    }

    fn encode_payload(&self) -> [u8; MBOX_PAYLOAD_LEN] {
        let mut w = PayloadWriter::new();
        match self {
            Self::Hello | Self::Bye | Self::Done => {}
            Self::RangeQuery => {
                w.u8(0);
            }
            Self::RangeAssign { qmax } => {
                w.u8(1).u32(*qmax);
            }
            Self::Range(g) => {
                w.u32(g.qbase).u32(g.qmax).u16(g.vec_base).u16(g.vec_count);
            }
            Self::ContextWrite { qid, dir, ctx } => {
                w.u32(*qid)
                    .u8(dir_to_wire(*dir))
                    .u8(ctx_flags(ctx))
                    .words(&ctx.sw.encode())
                    .words(&ctx.qid_vec.encode())
                    .words(&ctx.prefetch.unwrap_or_default().encode())
                    .words(&ctx.writeback.unwrap_or_default().encode());
            }
            Self::ContextRead { qid, dir, mode } | Self::ContextClear { qid, dir, mode } => {
                w.u32(*qid).u8(dir_to_wire(*dir)).u8(mode_to_wire(*mode));
            }
            Self::ContextData(ctx) => {
                w.u8(ctx_flags(ctx))
                    .words(&ctx.sw.encode())
                    .words(&ctx.hw.encode())
                    .words(&ctx.credit.encode())
                    .words(&ctx.qid_vec.encode())
                    .words(&ctx.prefetch.unwrap_or_default().encode())
                    .words(&ctx.writeback.unwrap_or_default().encode());
            }
            Self::VectorContext { ring, ctx } => {
                w.u16(*ring)
                    .u8(ctx.is_some() as u8)
                    .words(&ctx.unwrap_or_default().encode());
            }
            Self::CsrRead { kind } => {
                w.u8(*kind as u8);
            }
            Self::CsrTable {
                kind,
                values,
                wb_acc,
            } => {
                w.u8(*kind as u8).u32(*wb_acc);
                for &v in values {
                    // Table entries are ring slots or buffer bytes, all below 64 Ki.
                    w.u16(u16::try_from(v).unwrap_or(u16::MAX));
                }
            }
            Self::Unknown { data, .. } => {
                w.bytes(data);
            }
        }
        w.finish()
    }

    fn decode(op: u8, ack: bool, payload: &[u8]) -> QdmaResult<Self> {
        let Some(opcode) = MboxOpcode::from_u8(op) else {
            let mut data = [0u8; MBOX_PAYLOAD_LEN];
            let n = payload.len().min(MBOX_PAYLOAD_LEN);
            data[..n].copy_from_slice(&payload[..n]);
            return Ok(Self::Unknown { op, data });
        };
        let mut r = PayloadReader::new(payload);
        let msg = match (opcode, ack) {
            (MboxOpcode::Hello, false) => Self::Hello,
            (MboxOpcode::Bye, false) => Self::Bye,
            (MboxOpcode::QueueRangeMap, false) => match r.u8() {
                0 => Self::RangeQuery,
                _ => Self::RangeAssign { qmax: r.u32() },
            },
            (MboxOpcode::Hello | MboxOpcode::QueueRangeMap, true) => Self::Range(RangeGrant {
                qbase: r.u32(),
                qmax: r.u32(),
                vec_base: r.u16(),
                vec_count: r.u16(),
            }),
            (MboxOpcode::ContextWrite, false) => {
                let qid = r.u32();
                let dir = dir_from_wire(r.u8())?;
                let flags = r.u8();
                let sw = SwContext::decode(&r.words::<4>());
                let qid_vec = QidVecMap::decode(&r.words::<1>());
                let pf = PrefetchContext::decode(&r.words::<2>());
                let wb = WritebackContext::decode(&r.words::<4>());
                Self::ContextWrite {
                    qid,
                    dir,
                    ctx: QueueContext {
                        sw,
                        qid_vec,
                        prefetch: (flags & HAS_PREFETCH != 0).then_some(pf),
                        writeback: (flags & HAS_WRITEBACK != 0).then_some(wb),
                        ..Default::default()
                    },
                }
            }
            (MboxOpcode::ContextRead, false) | (MboxOpcode::ContextClear, false) => {
                let qid = r.u32();
                let dir = dir_from_wire(r.u8())?;
                let mode = mode_from_wire(r.u8())?;
                if opcode == MboxOpcode::ContextRead {
                    Self::ContextRead { qid, dir, mode }
                } else {
                    Self::ContextClear { qid, dir, mode }
                }
            }
            (MboxOpcode::ContextRead, true) => {
                let flags = r.u8();
                let sw = SwContext::decode(&r.words::<4>());
                let hw = HwContext::decode(&r.words::<2>());
                let credit = CreditContext::decode(&r.words::<1>());
                let qid_vec = QidVecMap::decode(&r.words::<1>());
                let pf = PrefetchContext::decode(&r.words::<2>());
                let wb = WritebackContext::decode(&r.words::<4>());
                Self::ContextData(QueueContext {
                    sw,
                    hw,
                    credit,
                    qid_vec,
                    prefetch: (flags & HAS_PREFETCH != 0).then_some(pf),
                    writeback: (flags & HAS_WRITEBACK != 0).then_some(wb),
                })
            }
            (MboxOpcode::VectorContext, false) => {
                let ring = r.u16();
                let present = r.u8() != 0;
                let ctx = CoalContext::decode(&r.words::<4>());
                Self::VectorContext {
                    ring,
                    ctx: present.then_some(ctx),
                }
            }
            (MboxOpcode::Csr, false) => Self::CsrRead {
                kind: csr_kind(r.u8())?,
            },
            (MboxOpcode::Csr, true) => {
                let kind = csr_kind(r.u8())?;
                let wb_acc = r.u32();
                let mut values = [0u32; CSR_TABLE_LEN];
                for v in values.iter_mut() {
                    *v = r.u16() as u32;
                }
                Self::CsrTable {
                    kind,
                    values,
                    wb_acc,
                }
            }
            (
                MboxOpcode::Bye
                | MboxOpcode::ContextWrite
                | MboxOpcode::ContextClear
                | MboxOpcode::VectorContext,
                true,
            ) => Self::Done,
        };
        Ok(msg)
    }
}

fn csr_kind(v: u8) -> QdmaResult<CsrKind> {
    CsrKind::from_u8(v).ok_or_else(|| QdmaError::MalformedMessage(format!("bad CSR table {}", v)))
}

// ============================================================================
// Envelope
// ============================================================================

/// One mailbox message with its header fields broken out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Raw opcode; may be one this side does not know.
    pub op: u8,
    /// Sender blocks until the acknowledgement arrives.
    pub wait: bool,
    /// This is a response.
    pub ack: bool,
    pub src: u8,
    pub dst: u8,
    pub status: MboxStatus,
    /// Request number; a response carries its request's.
    pub seq: u8,
    pub payload: [u8; MBOX_PAYLOAD_LEN],
}

impl Envelope {
    /// Request carrying `msg` from `src` to `dst`.
    pub fn request(src: u8, dst: u8, msg: &MboxMsg, wait: bool) -> Self {
        let op = match msg {
            MboxMsg::Unknown { op, .. } => *op,
            other => other.opcode().map_or(0, MboxOpcode::as_u8),
        };
        Self {
            op,
            wait,
            ack: false,
            src,
            dst,
            status: MboxStatus::Ok,
            seq: 0,
            payload: msg.encode_payload(),
        }
    }

    pub fn with_seq(mut self, seq: u8) -> Self {
        self.seq = seq;
        self
    }

    /// Acknowledgement of `req` carrying `msg`.
    pub fn response(req: &Envelope, status: MboxStatus, msg: &MboxMsg) -> Self {
        Self {
            op: req.op,
            wait: false,
            ack: true,
            src: req.dst,
            dst: req.src,
            status,
            seq: req.seq,
            payload: msg.encode_payload(),
        }
    }

    pub fn opcode(&self) -> Option<MboxOpcode> {
        MboxOpcode::from_u8(self.op)
    }

    /// Decode the payload. Failed acknowledgements carry no payload and
    /// decode as [`MboxMsg::Done`].
    pub fn message(&self) -> QdmaResult<MboxMsg> {
        if self.ack && self.status != MboxStatus::Ok {
            return Ok(MboxMsg::Done);
        }
        MboxMsg::decode(self.op, self.ack, &self.payload)
    }

    pub fn encode(&self) -> [u8; MBOX_MSG_LEN] {
        let mut out = [0u8; MBOX_MSG_LEN];
        out[0] = (self.op & 0x0F)
            | if self.wait { WAIT_BIT } else { 0 }
            | if self.ack { ACK_BIT } else { 0 };
        out[1] = self.src;
        out[2] = self.dst;
        out[3] = self.status.as_u8();
        out[4] = self.seq;
        out[MBOX_HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// # Errors
    ///
    /// [`QdmaError::MalformedMessage`] unless `raw` is exactly one envelope.
    pub fn decode(raw: &[u8]) -> QdmaResult<Self> {
        if raw.len() != MBOX_MSG_LEN {
            return Err(QdmaError::MalformedMessage(format!(
                "envelope of {} bytes, expected {}",
                raw.len(),
                MBOX_MSG_LEN
            )));
        }
        let mut payload = [0u8; MBOX_PAYLOAD_LEN];
        payload.copy_from_slice(&raw[MBOX_HEADER_LEN..]);
        Ok(Self {
            op: raw[0] & 0x0F,
            wait: raw[0] & WAIT_BIT != 0,
            ack: raw[0] & ACK_BIT != 0,
            src: raw[1],
            dst: raw[2],
            status: MboxStatus::from_u8(raw[3]),
            seq: raw[4],
            payload,
        })
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Raw envelope channel between two functions.
pub trait MailboxTransport: Send + Sync {
    /// # Errors
    ///
    /// [`QdmaError::MailboxClosed`] once the peer is gone.
    fn send(&self, msg: &[u8; MBOX_MSG_LEN]) -> QdmaResult<()>;

    /// Next pending envelope, if any.
    ///
    /// # Errors
    ///
    /// [`QdmaError::MailboxClosed`] once the peer is gone and nothing is left.
    fn try_recv(&self) -> QdmaResult<Option<[u8; MBOX_MSG_LEN]>>;
}

/// In-process transport for functions emulated in the same process.
pub struct LocalTransport {
    tx: Sender<[u8; MBOX_MSG_LEN]>,
    rx: Receiver<[u8; MBOX_MSG_LEN]>,
}

impl LocalTransport {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (Self { tx: b_tx, rx: a_rx }, Self { tx: a_tx, rx: b_rx })
    }
}

impl MailboxTransport for LocalTransport {
    fn send(&self, msg: &[u8; MBOX_MSG_LEN]) -> QdmaResult<()> {
        self.tx.send(*msg).map_err(|_| QdmaError::MailboxClosed)
    }

    fn try_recv(&self) -> QdmaResult<Option<[u8; MBOX_MSG_LEN]>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QdmaError::MailboxClosed),
        }
    }
}

fn join_unless_current(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Client (restricted function)
// ============================================================================

#[derive(Default)]
struct ResponseSlot {
    /// Opcode and sequence number of the outstanding request.
    expect: Option<(u8, u8)>,
    response: Option<Envelope>,
    closed: bool,
}

/// Requesting side of the mailbox.
pub struct MailboxClient {
    transport: Arc<dyn MailboxTransport>,
    func_id: u8,
    owner_id: u8,
    policy: RetryPolicy,
    retries: u32,
    req_lock: Mutex<()>,
    next_seq: AtomicU8,
    slot: Mutex<ResponseSlot>,
    ready: Condvar,
    stop: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MailboxClient {
    /// Create the client and start its polling thread.
    ///
    /// # Arguments
    ///
    /// * `policy` - poll interval and per-attempt response timeout
    /// * `retries` - extra attempts for idempotent requests that time out
    pub fn start(
        transport: Arc<dyn MailboxTransport>,
        func_id: u8,
        owner_id: u8,
        policy: RetryPolicy,
        retries: u32,
    ) -> QdmaResult<Arc<Self>> {
        let client = Arc::new(Self {
            transport,
            func_id,
            owner_id,
            policy,
            retries,
            req_lock: Mutex::new(()),
            next_seq: AtomicU8::new(0),
            slot: Mutex::new(ResponseSlot::default()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
            poller: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        let interval = policy.interval;
        let handle = std::thread::Builder::new()
            .name(format!("qdma-mbox-vf{}", func_id))
            .spawn(move || Self::poll_loop(weak, interval))?;
        *lock(&client.poller) = Some(handle);
        Ok(client)
    }

    fn poll_loop(weak: Weak<Self>, interval: std::time::Duration) {
        loop {
            let Some(client) = weak.upgrade() else {
                break;
            };
            if client.stop.load(Ordering::Acquire) {
                break;
            }
            client.poll_once();
            drop(client);
            std::thread::sleep(interval);
        }
    }

    #[inline]
    pub fn func_id(&self) -> u8 {
        self.func_id
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slot).closed
    }

    /// Drain the channel once. Returns the number of envelopes seen.
    pub fn poll_once(&self) -> usize {
        let mut seen = 0;
        loop {
            let raw = match self.transport.try_recv() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(_) => {
                    self.mark_closed();
                    break;
                }
            };
            seen += 1;
            let env = match Envelope::decode(&raw) {
                Ok(env) => env,
                Err(e) => {
                    log::warn!("vf{}: dropping mailbox message: {}", self.func_id, e);
                    continue;
                }
            };
            if !env.ack {
                self.answer_owner(&env);
                continue;
            }

            let mut slot = lock(&self.slot);
            if slot.expect == Some((env.op, env.seq)) && slot.response.is_none() {
                slot.response = Some(env);
                self.ready.notify_all();
            } else {
                log::warn!(
                    "vf{}: discarding unexpected response to opcode {:#04x} seq {}",
                    self.func_id,
                    env.op,
                    env.seq
                );
            }
        }
        seen
    }

    /// The owner does not send requests to restricted functions; refuse them.
    fn answer_owner(&self, env: &Envelope) {
        log::warn!(
            "vf{}: unsolicited mailbox request {:#04x} from {}",
            self.func_id,
            env.op,
            env.src
        );
        let resp = Envelope::response(env, MboxStatus::Unsupported, &MboxMsg::Done);
        if let Err(e) = self.transport.send(&resp.encode()) {
            log::debug!("vf{}: cannot answer owner: {}", self.func_id, e);
        }
    }

    fn mark_closed(&self) {
        let mut slot = lock(&self.slot);
        if !slot.closed {
            log::warn!("vf{}: mailbox channel closed", self.func_id);
        }
        slot.closed = true;
        self.ready.notify_all();
    }

    /// Send `msg` and block for the acknowledgement.
    ///
    /// Idempotent requests are resent after a timeout, up to the configured
    /// retry count.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::MailboxTimeout`] if no response arrived in time
    /// - [`QdmaError::Remote`] if the owner answered with a failure status
    /// - [`QdmaError::MailboxClosed`] if the channel is gone
    pub fn request(&self, msg: MboxMsg) -> QdmaResult<MboxMsg> {
        let opcode = msg.opcode().ok_or_else(|| {
            QdmaError::MalformedMessage(format!("{:?} is not a request", msg))
        })?;
        let attempts = if msg.is_idempotent() {
            self.retries + 1
        } else {
            1
        };
        let _serial = lock(&self.req_lock);
        // Resends reuse the number; an answer to any attempt completes the request.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let raw = Envelope::request(self.func_id, self.owner_id, &msg, true)
            .with_seq(seq)
            .encode();

        let mut last = QdmaError::MailboxTimeout { opcode };
        for attempt in 0..attempts {
            {
                let mut slot = lock(&self.slot);
                if slot.closed {
                    return Err(QdmaError::MailboxClosed);
                }
                slot.expect = Some((opcode.as_u8(), seq));
                slot.response = None;
            }
            if attempt > 0 {
                log::warn!(
                    "vf{}: resending {} (attempt {}/{})",
                    self.func_id,
                    opcode,
                    attempt + 1,
                    attempts
                );
            }
            if let Err(e) = self.transport.send(&raw) {
                lock(&self.slot).expect = None;
                self.mark_closed();
                return Err(e);
            }
            match self.await_response(opcode) {
                Ok(resp) if resp.status != MboxStatus::Ok => {
                    return Err(QdmaError::Remote {
                        opcode,
                        status: resp.status,
                    });
                }
                Ok(resp) => return resp.message(),
                Err(e @ QdmaError::MailboxTimeout { .. }) => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn await_response(&self, opcode: MboxOpcode) -> QdmaResult<Envelope> {
        let deadline = self.policy.deadline();
        let mut slot = lock(&self.slot);
        loop {
            if let Some(resp) = slot.response.take() {
                slot.expect = None;
                return Ok(resp);
            }
            if slot.closed {
                slot.expect = None;
                return Err(QdmaError::MailboxClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                slot.expect = None;
                return Err(QdmaError::MailboxTimeout { opcode });
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Send `msg` without waiting for an acknowledgement.
    pub fn notify(&self, msg: MboxMsg) -> QdmaResult<()> {
        let raw = Envelope::request(self.func_id, self.owner_id, &msg, false).encode();
        self.transport.send(&raw)
    }

    /// Register with the owner.
    pub fn hello(&self) -> QdmaResult<RangeGrant> {
        expect_range(MboxOpcode::Hello, self.request(MboxMsg::Hello)?)
    }

    /// Unregister; the owner revokes the range and clears every context.
    pub fn bye(&self) -> QdmaResult<()> {
        self.request(MboxMsg::Bye).map(|_| ())
    }

    pub fn query_range(&self) -> QdmaResult<RangeGrant> {
        expect_range(
            MboxOpcode::QueueRangeMap,
            self.request(MboxMsg::RangeQuery)?,
        )
    }

    /// Ask for a range of `qmax` queues.
    pub fn assign_range(&self, qmax: u32) -> QdmaResult<RangeGrant> {
        expect_range(
            MboxOpcode::QueueRangeMap,
            self.request(MboxMsg::RangeAssign { qmax })?,
        )
    }

    /// Stop the polling thread.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        join_unless_current(lock(&self.poller).take());
    }
}

impl Drop for MailboxClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unexpected(opcode: MboxOpcode, msg: MboxMsg) -> QdmaError {
    QdmaError::MalformedMessage(format!("unexpected reply to {}: {:?}", opcode, msg))
}

fn expect_range(opcode: MboxOpcode, msg: MboxMsg) -> QdmaResult<RangeGrant> {
    match msg {
        MboxMsg::Range(grant) => Ok(grant),
        other => Err(unexpected(opcode, other)),
    }
}

// ============================================================================
// Server (privileged function)
// ============================================================================

/// Owner-side request processing.
pub trait MailboxHandler: Send + Sync {
    /// Answer one request from function `caller`.
    fn handle(&self, caller: u8, msg: MboxMsg) -> QdmaResult<MboxMsg>;

    /// `caller`'s channel went away without a `Bye`.
    fn disconnected(&self, caller: u8);
}

struct Channel {
    transport: Arc<dyn MailboxTransport>,
    caller: Option<u8>,
    open: bool,
}

/// Answering side of the mailbox; one channel per restricted function.
pub struct MailboxServer {
    owner_id: u8,
    handler: Arc<dyn MailboxHandler>,
    channels: Mutex<Vec<Channel>>,
    stop: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MailboxServer {
    /// Create the server and start its polling thread.
    pub fn start(
        owner_id: u8,
        handler: Arc<dyn MailboxHandler>,
        policy: RetryPolicy,
    ) -> QdmaResult<Arc<Self>> {
        let server = Arc::new(Self {
            owner_id,
            handler,
            channels: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            poller: Mutex::new(None),
        });

        let weak = Arc::downgrade(&server);
        let interval = policy.interval;
        let handle = std::thread::Builder::new()
            .name(format!("qdma-mbox-pf{}", owner_id))
            .spawn(move || loop {
                let Some(server) = weak.upgrade() else {
                    break;
                };
                if server.stop.load(Ordering::Acquire) {
                    break;
                }
                server.poll_once();
                drop(server);
                std::thread::sleep(interval);
            })?;
        *lock(&server.poller) = Some(handle);
        Ok(server)
    }

    /// Accept requests arriving on `transport`.
    pub fn attach(&self, transport: Arc<dyn MailboxTransport>) {
        lock(&self.channels).push(Channel {
            transport,
            caller: None,
            open: true,
        });
    }

    /// Channels still open.
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).iter().filter(|c| c.open).count()
    }

    /// Answer everything pending on every channel. Returns the number of
    /// requests answered.
    pub fn poll_once(&self) -> usize {
        let open: Vec<(usize, Arc<dyn MailboxTransport>)> = lock(&self.channels)
            .iter()
            .enumerate()
            .filter(|(_, c)| c.open)
            .map(|(i, c)| (i, Arc::clone(&c.transport)))
            .collect();

        let mut answered = 0;
        for (i, transport) in open {
            loop {
                let raw = match transport.try_recv() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(_) => {
                        self.close_channel(i);
                        break;
                    }
                };
                let env = match Envelope::decode(&raw) {
                    Ok(env) => env,
                    Err(e) => {
                        log::warn!("pf{}: dropping mailbox message: {}", self.owner_id, e);
                        continue;
                    }
                };
                if env.ack {
                    log::warn!(
                        "pf{}: discarding stray response from {}",
                        self.owner_id,
                        env.src
                    );
                    continue;
                }

                let (status, reply) = match self.bind_caller(i, env.src) {
                    true => self.dispatch(&env),
                    false => (MboxStatus::InvalidRequest, MboxMsg::Done),
                };
                let resp = Envelope::response(&env, status, &reply);
                if let Err(e) = transport.send(&resp.encode()) {
                    log::warn!("pf{}: cannot answer {}: {}", self.owner_id, env.src, e);
                }
                answered += 1;
            }
        }
        answered
    }

    /// A channel speaks for one function only.
    fn bind_caller(&self, index: usize, src: u8) -> bool {
        let mut channels = lock(&self.channels);
        let Some(ch) = channels.get_mut(index) else {
            return false;
        };
        match ch.caller {
            Some(bound) if bound != src => {
                log::warn!(
                    "pf{}: channel of function {} used by {}",
                    self.owner_id,
                    bound,
                    src
                );
                false
            }
            _ => {
                ch.caller = Some(src);
                true
            }
        }
    }

    fn dispatch(&self, env: &Envelope) -> (MboxStatus, MboxMsg) {
        if env.opcode().is_none() {
            log::warn!(
                "pf{}: unknown mailbox opcode {:#04x} from {}",
                self.owner_id,
                env.op,
                env.src
            );
            return (MboxStatus::Failed, MboxMsg::Done);
        }
        let msg = match env.message() {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("pf{}: {} from {}", self.owner_id, e, env.src);
                return (MboxStatus::InvalidRequest, MboxMsg::Done);
            }
        };
        match self.handler.handle(env.src, msg) {
            Ok(reply) => (MboxStatus::Ok, reply),
            Err(e) => {
                log::info!("pf{}: request from {} failed: {}", self.owner_id, env.src, e);
                (MboxStatus::from_error(&e), MboxMsg::Done)
            }
        }
    }

    fn close_channel(&self, index: usize) {
        let caller = {
            let mut channels = lock(&self.channels);
            channels.get_mut(index).and_then(|ch| {
                ch.open = false;
                ch.caller
            })
        };
        if let Some(caller) = caller {
            log::info!("pf{}: function {} disconnected", self.owner_id, caller);
            self.handler.disconnected(caller);
        }
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        join_unless_current(lock(&self.poller).take());
    }
}

impl Drop for MailboxServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Proxied context programming
// ============================================================================

/// [`ContextProgrammer`] for restricted functions: every operation becomes
/// a mailbox request the owner executes.
pub struct MailboxProgrammer {
    client: Arc<MailboxClient>,
}

impl MailboxProgrammer {
    pub fn new(client: Arc<MailboxClient>) -> Self {
        Self { client }
    }
}

impl ContextProgrammer for MailboxProgrammer {
    fn clear(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<()> {
        self.client
            .request(MboxMsg::ContextClear { qid, dir, mode })
            .map(|_| ())
    }

    fn read(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<QueueContext> {
        match self.client.request(MboxMsg::ContextRead { qid, dir, mode })? {
            MboxMsg::ContextData(ctx) => Ok(ctx),
            other => Err(unexpected(MboxOpcode::ContextRead, other)),
        }
    }

    fn write(&self, qid: u32, dir: Direction, ctx: &QueueContext) -> QdmaResult<()> {
        self.client
            .request(MboxMsg::ContextWrite { qid, dir, ctx: *ctx })
            .map(|_| ())
    }

    fn program_coalescing(&self, ring: u16, ctx: &CoalContext) -> QdmaResult<()> {
        self.client
            .request(MboxMsg::VectorContext {
                ring,
                ctx: Some(*ctx),
            })
            .map(|_| ())
    }

    fn clear_coalescing(&self, ring: u16) -> QdmaResult<()> {
        self.client
            .request(MboxMsg::VectorContext { ring, ctx: None })
            .map(|_| ())
    }

    fn read_csr(&self) -> QdmaResult<GlobalCsr> {
        let mut csr = GlobalCsr::default();
        for kind in CsrKind::ALL {
            match self.client.request(MboxMsg::CsrRead { kind })? {
                MboxMsg::CsrTable {
                    kind: got,
                    values,
                    wb_acc,
                } if got == kind => {
                    *csr.table_mut(kind) = values;
                    csr.wb_acc = wb_acc;
                }
                other => return Err(unexpected(MboxOpcode::Csr, other)),
            }
        }
        Ok(csr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DescSize, TriggerMode};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(60))
    }

    /// Handler granting a fixed range and recording disconnects.
    #[derive(Default)]
    struct FixedHandler {
        disconnects: Mutex<Vec<u8>>,
        handled: AtomicUsize,
    }

    impl MailboxHandler for FixedHandler {
        fn handle(&self, _caller: u8, msg: MboxMsg) -> QdmaResult<MboxMsg> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            match msg {
                MboxMsg::Hello | MboxMsg::RangeQuery => Ok(MboxMsg::Range(RangeGrant {
                    qbase: 64,
                    qmax: 16,
                    vec_base: 8,
                    vec_count: 4,
                })),
                MboxMsg::RangeAssign { .. } => {
                    Err(QdmaError::ResourceExhausted("queue range".into()))
                }
                MboxMsg::CsrRead { kind } => Ok(MboxMsg::CsrTable {
                    kind,
                    values: *GlobalCsr::default().table(kind),
                    wb_acc: 5,
                }),
                _ => Ok(MboxMsg::Done),
            }
        }

        fn disconnected(&self, caller: u8) {
            self.disconnects.lock().unwrap().push(caller);
        }
    }

    fn connected(handler: Arc<FixedHandler>) -> (Arc<MailboxServer>, Arc<MailboxClient>) {
        let (vf_end, pf_end) = LocalTransport::pair();
        let server = MailboxServer::start(0, handler, fast()).unwrap();
        server.attach(Arc::new(pf_end));
        let client = MailboxClient::start(Arc::new(vf_end), 3, 0, fast(), 2).unwrap();
        (server, client)
    }

    #[test]
    fn test_envelope_header() {
        let env = Envelope::request(3, 0, &MboxMsg::RangeAssign { qmax: 32 }, true);
        let raw = env.encode();
        assert_eq!(raw[0], 0x03 | WAIT_BIT);
        assert_eq!((raw[1], raw[2], raw[3]), (3, 0, 0));
        assert_eq!(raw[4], 0);
        assert_eq!(raw[5], 1);
        assert_eq!(&raw[6..10], &32u32.to_le_bytes());

        let env = env.with_seq(0x9C);
        let back = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.message().unwrap(), MboxMsg::RangeAssign { qmax: 32 });

        let ack = Envelope::response(&back, MboxStatus::ResourceExhausted, &MboxMsg::Done);
        let raw = ack.encode();
        assert_eq!(raw[0], 0x03 | ACK_BIT);
        assert_eq!((raw[1], raw[2], raw[4]), (0, 3, 0x9C));
        assert_eq!(Envelope::decode(&raw).unwrap().message().unwrap(), MboxMsg::Done);
    }

    #[test]
    fn test_short_envelope_rejected() {
        assert!(matches!(
            Envelope::decode(&[0u8; 12]),
            Err(QdmaError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_context_write_fits_payload() {
        let mut ctx = QueueContext::default();
        ctx.sw = SwContext {
            enable: true,
            ring_size_idx: 14,
            desc_size: DescSize::B8,
            base: 0x1_2345_6000,
            irq_en: true,
            ..Default::default()
        };
        ctx.qid_vec.set(Direction::C2h, 9, true);
        ctx.prefetch = Some(PrefetchContext {
            buf_size_idx: 1,
            valid: true,
            ..Default::default()
        });
        ctx.writeback = Some(WritebackContext {
            trig_mode: TriggerMode::UserCount,
            color: true,
            base: 0xFFFF_0000,
            valid: true,
            ..Default::default()
        });
        let msg = MboxMsg::ContextWrite {
            qid: 77,
            dir: Direction::C2h,
            ctx,
        };
        let env = Envelope::request(1, 0, &msg, true);
        assert_eq!(Envelope::decode(&env.encode()).unwrap().message().unwrap(), msg);

        let mut mm = ctx;
        mm.prefetch = None;
        mm.writeback = None;
        let data = MboxMsg::ContextData(mm);
        let req = Envelope::request(1, 0, &MboxMsg::ContextRead {
            qid: 77,
            dir: Direction::H2c,
            mode: QueueMode::MemoryMapped,
        }, true);
        let ack = Envelope::response(&req, MboxStatus::Ok, &data);
        assert_eq!(ack.message().unwrap(), data);
    }

    #[test]
    fn test_idempotent_set() {
        assert!(MboxMsg::Hello.is_idempotent());
        assert!(MboxMsg::RangeQuery.is_idempotent());
        assert!(!MboxMsg::RangeAssign { qmax: 1 }.is_idempotent());
        assert!(!MboxMsg::Bye.is_idempotent());
        assert!(MboxMsg::CsrRead {
            kind: CsrKind::BufSize
        }
        .is_idempotent());
    }

    #[test]
    fn test_hello_and_csr_over_local_transport() {
        let handler = Arc::new(FixedHandler::default());
        let (_server, client) = connected(handler.clone());

        let grant = client.hello().unwrap();
        assert_eq!((grant.qbase, grant.qmax), (64, 16));

        let csr = MailboxProgrammer::new(client.clone()).read_csr().unwrap();
        assert_eq!(csr.ring_sizes, GlobalCsr::default().ring_sizes);
        assert_eq!(csr.buf_sizes[1], 256);
        assert_eq!(csr.wb_acc, 5);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_owner_failure_status() {
        let (_server, client) = connected(Arc::new(FixedHandler::default()));
        let err = client.assign_range(1024).unwrap_err();
        assert!(matches!(
            err,
            QdmaError::Remote {
                opcode: MboxOpcode::QueueRangeMap,
                status: MboxStatus::ResourceExhausted
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_timeout_retries_only_idempotent() {
        let (vf_end, pf_end) = LocalTransport::pair();
        let client = MailboxClient::start(Arc::new(vf_end), 3, 0, fast(), 2).unwrap();

        let err = client.hello().unwrap_err();
        assert!(matches!(
            err,
            QdmaError::MailboxTimeout {
                opcode: MboxOpcode::Hello
            }
        ));
        let mut sent = 0;
        while pf_end.try_recv().unwrap().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 3);

        let err = client.assign_range(8).unwrap_err();
        assert!(matches!(err, QdmaError::MailboxTimeout { .. }));
        let mut sent = 0;
        while pf_end.try_recv().unwrap().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 1);
    }

    #[test]
    fn test_stray_ack_discarded() {
        let (vf_end, pf_end) = LocalTransport::pair();
        let client = MailboxClient::start(Arc::new(vf_end), 3, 0, fast(), 0).unwrap();

        // A Csr response nobody asked for.
        let req = Envelope::request(3, 0, &MboxMsg::CsrRead { kind: CsrKind::RingSize }, true);
        let stray = Envelope::response(&req, MboxStatus::Ok, &MboxMsg::Done);
        pf_end.send(&stray.encode()).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let server = MailboxServer::start(0, Arc::new(FixedHandler::default()), fast()).unwrap();
        server.attach(Arc::new(pf_end));
        assert_eq!(client.query_range().unwrap().qmax, 16);
    }

    #[test]
    fn test_late_ack_of_timed_out_request_ignored() {
        let (vf_end, pf_end) = LocalTransport::pair();
        let client = MailboxClient::start(Arc::new(vf_end), 3, 0, fast(), 0).unwrap();

        assert!(matches!(
            client.query_range(),
            Err(QdmaError::MailboxTimeout { .. })
        ));
        let first = Envelope::decode(&pf_end.try_recv().unwrap().unwrap()).unwrap();

        let pending = Arc::clone(&client);
        let handle = std::thread::spawn(move || pending.query_range());
        let raw = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(1))
            .poll(|| pf_end.try_recv().unwrap())
            .unwrap();
        let second = Envelope::decode(&raw).unwrap();
        assert_eq!(first.op, second.op);
        assert_ne!(first.seq, second.seq);

        let grant = |qmax| {
            MboxMsg::Range(RangeGrant {
                qbase: 0,
                qmax,
                vec_base: 0,
                vec_count: 0,
            })
        };
        let late = Envelope::response(&first, MboxStatus::Ok, &grant(99));
        let fresh = Envelope::response(&second, MboxStatus::Ok, &grant(16));
        pf_end.send(&late.encode()).unwrap();
        pf_end.send(&fresh.encode()).unwrap();

        assert_eq!(handle.join().unwrap().unwrap().qmax, 16);
    }

    #[test]
    fn test_unknown_opcode_gets_failed_ack() {
        let (vf_end, pf_end) = LocalTransport::pair();
        let server = MailboxServer::start(0, Arc::new(FixedHandler::default()), fast()).unwrap();
        server.attach(Arc::new(pf_end));

        let msg = MboxMsg::Unknown {
            op: 0x0E,
            data: [0xAA; MBOX_PAYLOAD_LEN],
        };
        vf_end
            .send(&Envelope::request(5, 0, &msg, true).encode())
            .unwrap();

        let raw = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(1))
            .poll(|| vf_end.try_recv().unwrap())
            .unwrap();
        let resp = Envelope::decode(&raw).unwrap();
        assert!(resp.ack);
        assert_eq!(resp.op, 0x0E);
        assert_eq!(resp.status, MboxStatus::Failed);
        assert_eq!(resp.dst, 5);
    }

    #[test]
    fn test_disconnect_reported_once() {
        let handler = Arc::new(FixedHandler::default());
        let (server, client) = connected(handler.clone());
        client.hello().unwrap();
        client.shutdown();
        drop(client);

        let gone = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(1))
            .poll(|| (server.channel_count() == 0).then_some(()));
        assert!(gone.is_some());
        assert_eq!(*handler.disconnects.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_closed_channel_fails_fast() {
        let (vf_end, pf_end) = LocalTransport::pair();
        drop(pf_end);
        let client = MailboxClient::start(Arc::new(vf_end), 1, 0, fast(), 3).unwrap();
        assert!(matches!(client.hello(), Err(QdmaError::MailboxClosed)));
    }
}
