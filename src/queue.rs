// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Queue identity, configuration and per-queue state.
//!
//! A queue is one direction (H2C or C2H) of one hardware queue id. The two
//! directions at the same index are independent queues that share only the
//! vector-map context and must agree on transfer mode.
//!
//! # Lifecycle
//!
//! ```text
//!   add ──► Enabled ──start──► Initialized ──► Online ──stop──► Stopped
//!              ▲                    │                              │
//!              └──── remove ◄───────┴── (start failed) ◄──start────┘
//! ```
//!
//! A hardware error sets the halted flag on an online queue. A halted queue
//! rejects submissions until it is stopped and removed.

use crate::c2h::C2hRings;
use crate::context::{ContextState, DescSize, TriggerMode};
use crate::csr::GlobalCsr;
use crate::descriptor::MM_DESC_LEN_MAX;
use crate::error::{QdmaError, QdmaResult};
use crate::intr::VectorBinding;
use crate::lock;
use crate::regs::RegisterAccess;
use crate::request::{fire_all, CompletionToken, Finished, Pending, Request, TokenShared};
use crate::ring::DescRing;
use crate::stats::QueueStats;
use crate::wq::Kicker;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Default usable descriptors per ring.
pub const DEFAULT_RING_SIZE: u32 = 64;

/// Default streaming C2H buffer size in bytes.
pub const DEFAULT_C2H_BUF_SIZE: u32 = 4096;

/// Largest fragment one streaming H2C descriptor carries.
pub const H2C_FRAGMENT_MAX: u32 = u16::MAX as u32;

/// Largest streaming H2C request; the packet length field is 16 bits.
pub const H2C_PACKET_MAX: usize = u16::MAX as usize;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Host to card.
    H2c,
    /// Card to host.
    C2h,
}

impl Direction {
    /// The opposite direction at the same queue index.
    pub const fn peer(self) -> Self {
        match self {
            Self::H2c => Self::C2h,
            Self::C2h => Self::H2c,
        }
    }

    pub const fn is_c2h(self) -> bool {
        matches!(self, Self::C2h)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H2c => "H2C",
            Self::C2h => "C2H",
        })
    }
}

/// Transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// Host memory to card memory at explicit card addresses.
    MemoryMapped,
    /// Packet streams with no card address.
    Streaming,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MemoryMapped => "MM",
            Self::Streaming => "ST",
        })
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// Added, no hardware resources.
    Enabled,
    /// Being started.
    Initialized,
    /// Programmed and accepting requests.
    Online,
    /// Stopped; may be started again or removed.
    Stopped,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enabled => "enabled",
            Self::Initialized => "initialized",
            Self::Online => "online",
            Self::Stopped => "stopped",
        })
    }
}

/// Identifies a queue within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle {
    /// Index relative to the function's queue base.
    pub index: u16,
    pub direction: Direction,
}

impl QueueHandle {
    pub const fn new(index: u16, direction: Direction) -> Self {
        Self { index, direction }
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.direction, self.index)
    }
}

/// Configuration for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Explicit index, or `None` for the lowest free slot.
    pub index: Option<u16>,
    pub direction: Direction,
    pub mode: QueueMode,
    /// Usable descriptors; must match a ring-size table entry minus one.
    pub ring_size: u32,
    /// Usable completion entries for streaming C2H, `None` to size it from
    /// the free list.
    pub cmpt_ring_size: Option<u32>,
    /// Streaming C2H buffer size; must match a buffer-size table entry.
    pub c2h_buf_size: u32,
    /// Largest length put in one descriptor.
    pub max_segment: u32,
    pub trig_mode: TriggerMode,
    pub timer_idx: u8,
    pub counter_idx: u8,
    /// Enable C2H prefetch.
    pub prefetch: bool,
    /// Descriptor bypass to user logic.
    pub bypass: bool,
    pub fetch_credit: bool,
}

impl QueueConfig {
    pub fn new(direction: Direction, mode: QueueMode) -> Self {
        Self {
            index: None,
            direction,
            mode,
            ring_size: DEFAULT_RING_SIZE,
            cmpt_ring_size: None,
            c2h_buf_size: DEFAULT_C2H_BUF_SIZE,
            max_segment: MM_DESC_LEN_MAX,
            trig_mode: TriggerMode::Every,
            timer_idx: 0,
            counter_idx: 0,
            prefetch: false,
            bypass: false,
            fetch_credit: false,
        }
    }

    /// Memory-mapped queue.
    pub fn mm(direction: Direction) -> Self {
        Self::new(direction, QueueMode::MemoryMapped)
    }

    /// Streaming queue.
    pub fn st(direction: Direction) -> Self {
        Self::new(direction, QueueMode::Streaming)
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_ring_size(mut self, usable: u32) -> Self {
        self.ring_size = usable;
        self
    }

    pub fn with_cmpt_ring_size(mut self, usable: u32) -> Self {
        self.cmpt_ring_size = Some(usable);
        self
    }

    pub fn with_buf_size(mut self, bytes: u32) -> Self {
        self.c2h_buf_size = bytes;
        self
    }

    pub fn with_max_segment(mut self, bytes: u32) -> Self {
        self.max_segment = bytes;
        self
    }

    pub fn with_trigger(mut self, mode: TriggerMode, timer_idx: u8, counter_idx: u8) -> Self {
        self.trig_mode = mode;
        self.timer_idx = timer_idx;
        self.counter_idx = counter_idx;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Streaming C2H: free list plus completion ring.
    #[inline]
    pub fn is_st_c2h(&self) -> bool {
        self.mode == QueueMode::Streaming && self.direction == Direction::C2h
    }

    /// Descriptor size for this queue's ring.
    pub fn desc_size(&self) -> DescSize {
        match (self.mode, self.direction) {
            (QueueMode::MemoryMapped, _) => DescSize::B32,
            (QueueMode::Streaming, Direction::H2c) => DescSize::B16,
            (QueueMode::Streaming, Direction::C2h) => DescSize::B8,
        }
    }

    /// Check against the CSR tables and compute ring geometry.
    ///
    /// # Errors
    ///
    /// [`QdmaError::InvalidConfig`] when a size has no table entry or the
    /// segment limit is zero or wider than a descriptor length field.
    pub fn resolve(&self, csr: &GlobalCsr) -> QdmaResult<RingGeometry> {
        if self.max_segment == 0 {
            return Err(QdmaError::InvalidConfig("max_segment is zero".into()));
        }
        if self.max_segment > MM_DESC_LEN_MAX {
            return Err(QdmaError::InvalidConfig(format!(
                "max_segment {:#x} exceeds descriptor length limit {:#x}",
                self.max_segment, MM_DESC_LEN_MAX
            )));
        }
        let ring_idx = csr.ring_size_index(self.ring_size).ok_or_else(|| {
            QdmaError::InvalidConfig(format!(
                "ring size {} has no ring-size table entry",
                self.ring_size
            ))
        })?;
        let ring_slots = csr.ring_slots(ring_idx);

        let mut geo = RingGeometry {
            ring_idx,
            ring_slots,
            desc_size: self.desc_size().bytes(),
            buf_idx: 0,
            buf_size: 0,
            cmpt_idx: 0,
            cmpt_slots: 0,
        };
        if !self.is_st_c2h() {
            return Ok(geo);
        }

        geo.buf_idx = csr.buf_size_index(self.c2h_buf_size).ok_or_else(|| {
            QdmaError::InvalidConfig(format!(
                "buffer size {} has no buffer-size table entry",
                self.c2h_buf_size
            ))
        })?;
        geo.buf_size = csr.buf_size(geo.buf_idx) as usize;

        geo.cmpt_idx = match self.cmpt_ring_size {
            Some(usable) => {
                let idx = csr.ring_size_index(usable).ok_or_else(|| {
                    QdmaError::InvalidConfig(format!(
                        "completion ring size {} has no ring-size table entry",
                        usable
                    ))
                })?;
                if csr.ring_slots(idx) <= ring_slots {
                    return Err(QdmaError::InvalidConfig(format!(
                        "completion ring ({} slots) must be larger than the free list ({} slots)",
                        csr.ring_slots(idx),
                        ring_slots
                    )));
                }
                idx
            }
            None => csr.cmpt_ring_index(ring_slots).ok_or_else(|| {
                QdmaError::InvalidConfig(format!(
                    "no ring-size entry larger than {} for the completion ring",
                    ring_slots
                ))
            })?,
        };
        geo.cmpt_slots = csr.ring_slots(geo.cmpt_idx);
        Ok(geo)
    }
}

/// Ring sizes resolved against the CSR tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingGeometry {
    pub ring_idx: u8,
    /// Hardware slots in the descriptor ring (usable + 1).
    pub ring_slots: u32,
    pub desc_size: usize,
    pub buf_idx: u8,
    pub buf_size: usize,
    pub cmpt_idx: u8,
    pub cmpt_slots: u32,
}

/// Device-level settings a queue needs after it is created.
#[derive(Clone)]
pub(crate) struct QueueEnv {
    pub(crate) regs: Arc<dyn RegisterAccess>,
    pub(crate) index_batch: u32,
}

/// Mutable queue state, guarded by [`Queue::inner`].
pub(crate) struct QueueInner {
    pub(crate) state: QueueState,
    pub(crate) ctx_state: ContextState,
    pub(crate) halted: bool,
    /// Descriptor ring (MM and streaming H2C).
    pub(crate) ring: Option<DescRing>,
    /// Free list and completion ring (streaming C2H).
    pub(crate) c2h: Option<C2hRings>,
    pub(crate) vector: Option<VectorBinding>,
    /// Requests with descriptors still to write, oldest first.
    pub(crate) work: VecDeque<Pending>,
    /// Requests fully described (send) or waiting for data (receive).
    pub(crate) pend: VecDeque<Pending>,
    /// Writeback credit not yet applied to a request.
    pub(crate) credit: u32,
    pub(crate) stats: QueueStats,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            state: QueueState::Enabled,
            ctx_state: ContextState::Unprogrammed,
            halted: false,
            ring: None,
            c2h: None,
            vector: None,
            work: VecDeque::new(),
            pend: VecDeque::new(),
            credit: 0,
            stats: QueueStats::default(),
        }
    }

    /// Raise an interrupt on doorbell writes.
    #[inline]
    pub(crate) fn irq_arm(&self) -> bool {
        self.vector.is_some()
    }

    /// Take every outstanding request, oldest first.
    pub(crate) fn drain_requests(&mut self) -> Vec<Pending> {
        let mut all: Vec<Pending> = self.pend.drain(..).collect();
        all.extend(self.work.drain(..));
        all
    }
}

/// Worker-pool bindings, kept apart from the queue lock.
#[derive(Default)]
pub(crate) struct Affinity {
    pub(crate) submit: Option<Kicker>,
    pub(crate) completion: Option<Kicker>,
}

/// One queue direction.
pub struct Queue {
    handle: QueueHandle,
    qid: u32,
    name: String,
    config: QueueConfig,
    geometry: RingGeometry,
    pub(crate) env: QueueEnv,
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) affinity: Mutex<Affinity>,
}

impl Queue {
    pub(crate) fn new(
        dev_name: &str,
        handle: QueueHandle,
        qid: u32,
        config: QueueConfig,
        geometry: RingGeometry,
        env: QueueEnv,
    ) -> Self {
        let name = format!(
            "{}-{}-{}-{}",
            dev_name, config.mode, handle.direction, handle.index
        );
        Self {
            handle,
            qid,
            name,
            config,
            geometry,
            env,
            inner: Mutex::new(QueueInner::new()),
            affinity: Mutex::new(Affinity::default()),
        }
    }

    #[inline]
    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    /// Hardware queue id (function base + index).
    #[inline]
    pub fn qid(&self) -> u32 {
        self.qid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[inline]
    pub fn geometry(&self) -> &RingGeometry {
        &self.geometry
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.handle.direction
    }

    #[inline]
    pub fn mode(&self) -> QueueMode {
        self.config.mode
    }

    pub fn state(&self) -> QueueState {
        lock(&self.inner).state
    }

    pub fn is_halted(&self) -> bool {
        lock(&self.inner).halted
    }

    pub fn stats(&self) -> QueueStats {
        lock(&self.inner).stats
    }

    pub fn clear_stats(&self) {
        lock(&self.inner).stats.clear();
    }

    /// No descriptor in flight and nothing waiting for ring space.
    pub(crate) fn hw_idle(&self) -> bool {
        let inner = lock(&self.inner);
        inner.work.is_empty() && inner.ring.as_ref().is_none_or(|r| r.in_flight() == 0)
    }

    /// Accept a request. Never blocks on hardware.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::DirectionMismatch`] for a request built for the other
    ///   direction
    /// - [`QdmaError::RequestTooLarge`] for a streaming H2C request longer
    ///   than [`H2C_PACKET_MAX`]
    /// - [`QdmaError::QueueHalted`] after a hardware error
    /// - [`QdmaError::QueueNotOnline`] unless the queue is started
    pub fn submit(&self, req: Request) -> QdmaResult<CompletionToken> {
        if let Some(requested) = req.direction {
            if requested != self.handle.direction {
                return Err(QdmaError::DirectionMismatch {
                    name: self.name.clone(),
                    queue: self.handle.direction,
                    requested,
                });
            }
        }
        if self.config.mode == QueueMode::Streaming
            && self.handle.direction == Direction::H2c
            && req.len() > H2C_PACKET_MAX
        {
            return Err(QdmaError::RequestTooLarge {
                len: req.len(),
                max: H2C_PACKET_MAX,
            });
        }

        let shared = TokenShared::new();
        let token = CompletionToken::new(Arc::clone(&shared));
        let pending = Pending::new(req, shared);

        let (done, kick) = {
            let mut inner = lock(&self.inner);
            if inner.halted {
                return Err(QdmaError::QueueHalted {
                    name: self.name.clone(),
                });
            }
            if inner.state != QueueState::Online {
                return Err(QdmaError::QueueNotOnline {
                    name: self.name.clone(),
                });
            }

            if pending.total() == 0 {
                inner.stats.record_success(0, false, pending.submitted_at.elapsed());
                (vec![Finished::ok(pending, 0, false)], false)
            } else if self.config.is_st_c2h() {
                inner.pend.push_back(pending);
                (self.deliver_c2h(&mut inner), false)
            } else {
                inner.work.push_back(pending);
                (Vec::new(), true)
            }
        };

        fire_all(done);
        if kick {
            self.kick_submit();
        }
        Ok(token)
    }

    /// Mark the queue halted and fail everything outstanding. The oldest
    /// request receives `cause`; the rest receive [`QdmaError::QueueHalted`].
    pub(crate) fn halt(&self, inner: &mut QueueInner, cause: QdmaError) -> Vec<Finished> {
        log::error!("queue {}: halted: {}", self.name, cause);
        inner.halted = true;
        let mut cause = Some(cause);
        let mut done = Vec::new();
        for p in inner.drain_requests() {
            inner.stats.record_error();
            let err = cause.take().unwrap_or_else(|| QdmaError::QueueHalted {
                name: self.name.clone(),
            });
            done.push(Finished::err(p, err));
        }
        done
    }

    /// Wake this queue's submission worker.
    pub(crate) fn kick_submit(&self) {
        if let Some(k) = &lock(&self.affinity).submit {
            k.kick();
        }
    }

    /// Wake this queue's completion worker.
    pub(crate) fn kick_completion(&self) {
        if let Some(k) = &lock(&self.affinity).completion {
            k.kick();
        }
    }

    /// Process hardware progress: writeback credit or completion entries.
    pub(crate) fn service_completion(&self) {
        let done = {
            let mut inner = lock(&self.inner);
            if inner.state != QueueState::Online || inner.halted {
                return;
            }
            if self.config.is_st_c2h() {
                self.process_c2h(&mut inner)
            } else {
                self.process_writeback(&mut inner)
            }
        };
        fire_all(done);
    }

    /// Push queued requests into free descriptor slots.
    pub(crate) fn service_submit(&self) {
        let (done, outstanding) = {
            let mut inner = lock(&self.inner);
            if inner.state != QueueState::Online || inner.halted {
                return;
            }
            let done = self.process_work(&mut inner);
            (done, !inner.pend.is_empty())
        };
        fire_all(done);
        // Writeback may already be visible if the doorbell did not interrupt.
        if outstanding {
            self.kick_completion();
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("qid", &self.qid)
            .field("handle", &self.handle)
            .finish()
    }
}
