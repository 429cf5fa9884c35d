// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Streaming C2H: free list and completion ring.
//!
//! Every free-list slot owns one buffer. Hardware fills buffers in ring
//! order and then writes a completion entry carrying the packet length. The
//! engine copies buffered data into pending requests and hands each drained
//! buffer straight back, in place, by advancing the C2H producer index.
//!
//! Indices:
//!
//! - `hw_fill`: next free-list slot hardware fills, learned from completions
//! - `read`: next slot software drains
//! - posted producer index is `read - 1`, so `slots - 1` buffers are posted
//!   when nothing is pending
//!
//! Completion entries are valid while their color bit equals the expected
//! color, which starts at 1 and flips each time the consumer index wraps.
//! The completion-ring consumer index is always published before the C2H
//! producer index.

use crate::context::TriggerMode;
use crate::descriptor::{C2hDesc, CmptEntry, CmptStatus, WireFormat};
use crate::dma::{DmaBuffer, DmaSpace};
use crate::error::{QdmaError, QdmaResult};
use crate::queue::{Queue, QueueInner, RingGeometry};
use crate::regs::{c2h_pidx_reg, cmpt_cidx_reg, CmptCidxUpdate, PidxUpdate};
use crate::request::{Finished, Pending};
use crate::ring::{idx_decr, idx_delta, idx_incr, DescRing};
use crate::stats::QueueStats;
use std::collections::VecDeque;

/// One free-list buffer and how much of it is waiting to be delivered.
pub(crate) struct FreeBuf {
    pub(crate) buf: DmaBuffer,
    /// Bytes hardware wrote.
    len: usize,
    /// Bytes already delivered.
    consumed: usize,
    /// Last buffer of a packet.
    eot: bool,
}

impl FreeBuf {
    fn recycle(&mut self) {
        self.len = 0;
        self.consumed = 0;
        self.eot = false;
    }
}

/// Snapshot of receive-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeekInfo {
    /// Filled buffers not yet drained.
    pub pending_descriptors: u32,
    /// Bytes received and not yet delivered.
    pub pending_bytes: usize,
    /// Complete packets received and not yet delivered.
    pub pending_packets: u32,
    /// Empty buffers available to hardware.
    pub posted_buffers: u32,
}

/// Free list plus completion ring of one streaming C2H queue.
pub(crate) struct C2hRings {
    pub(crate) free: DescRing,
    pub(crate) bufs: Vec<FreeBuf>,
    buf_size: usize,
    hw_fill: u32,
    read: u32,
    pending_bytes: usize,
    pending_pkts: u32,
    cmpt: DmaBuffer,
    cmpt_slots: u32,
    cmpt_size_idx: u8,
    /// Next completion entry software reads.
    cmpt_cidx: u32,
    /// Completion consumer index last published.
    cmpt_published: u32,
    /// Producer index last published.
    pidx_published: u32,
    color: bool,
    since_update: u32,
}

impl C2hRings {
    /// Allocate the free list (one buffer per slot, descriptors written) and
    /// the completion ring.
    pub(crate) fn alloc(dma: &DmaSpace, geo: &RingGeometry) -> QdmaResult<Self> {
        let free = DescRing::alloc(dma, geo.ring_slots, C2hDesc::SIZE, geo.ring_idx, "c2h free list")?;
        let mut bufs = Vec::with_capacity(geo.ring_slots as usize);
        for i in 0..geo.ring_slots {
            let buf = dma.alloc(geo.buf_size, "c2h buffer")?;
            free.write(
                i,
                &C2hDesc {
                    dst_addr: buf.bus_addr(),
                },
            );
            bufs.push(FreeBuf {
                buf,
                len: 0,
                consumed: 0,
                eot: false,
            });
        }
        let cmpt = dma.alloc(
            geo.cmpt_slots as usize * CmptEntry::SIZE + CmptStatus::SIZE,
            "completion ring",
        )?;
        let slots = geo.ring_slots;
        Ok(Self {
            free,
            bufs,
            buf_size: geo.buf_size,
            hw_fill: 0,
            read: 0,
            pending_bytes: 0,
            pending_pkts: 0,
            cmpt,
            cmpt_slots: geo.cmpt_slots,
            cmpt_size_idx: geo.cmpt_idx,
            cmpt_cidx: 0,
            cmpt_published: 0,
            pidx_published: idx_decr(0, 1, slots),
            color: true,
            since_update: 0,
        })
    }

    #[inline]
    fn slots(&self) -> u32 {
        self.free.slots()
    }

    /// Filled buffers not yet drained.
    #[inline]
    pub(crate) fn pending_descs(&self) -> u32 {
        idx_delta(self.hw_fill, self.read, self.slots())
    }

    /// Producer index that posts every drained buffer.
    #[inline]
    pub(crate) fn post_pidx(&self) -> u32 {
        idx_decr(self.read, 1, self.slots())
    }

    pub(crate) fn peek(&self) -> PeekInfo {
        PeekInfo {
            pending_descriptors: self.pending_descs(),
            pending_bytes: self.pending_bytes,
            pending_packets: self.pending_pkts,
            posted_buffers: self.slots() - 1 - self.pending_descs(),
        }
    }

    pub(crate) fn cmpt_bus_addr(&self) -> u64 {
        self.cmpt.bus_addr()
    }

    pub(crate) fn cmpt_size_idx(&self) -> u8 {
        self.cmpt_size_idx
    }

    fn cmpt_status(&self) -> CmptStatus {
        let mut raw = [0u8; CmptStatus::SIZE];
        self.cmpt
            .read(self.cmpt_slots as usize * CmptEntry::SIZE, &mut raw);
        CmptStatus::decode(&raw)
    }

    fn cmpt_entry(&self, idx: u32) -> CmptEntry {
        let mut raw = [0u8; CmptEntry::SIZE];
        self.cmpt.read(idx as usize * CmptEntry::SIZE, &mut raw);
        CmptEntry::decode(&raw)
    }

    /// Account one data completion against the free list.
    fn absorb(&mut self, entry: &CmptEntry) -> Result<(), String> {
        let len = entry.len as usize;
        let ndesc = len.div_ceil(self.buf_size).max(1) as u32;
        let room = self.slots() - 1 - self.pending_descs();
        if ndesc > room {
            return Err(format!(
                "completion of {} bytes needs {} buffers, {} posted",
                len, ndesc, room
            ));
        }
        let mut left = len;
        for i in 0..ndesc {
            let idx = idx_incr(self.hw_fill, i, self.slots()) as usize;
            let fb = &mut self.bufs[idx];
            fb.len = left.min(self.buf_size);
            fb.consumed = 0;
            fb.eot = i + 1 == ndesc && entry.is_eot();
            left -= fb.len;
        }
        self.hw_fill = idx_incr(self.hw_fill, ndesc, self.slots());
        self.pending_bytes += len;
        if entry.is_eot() {
            self.pending_pkts += 1;
        }
        Ok(())
    }

    fn advance_cmpt(&mut self) {
        self.cmpt_cidx = idx_incr(self.cmpt_cidx, 1, self.cmpt_slots);
        if self.cmpt_cidx == 0 {
            self.color = !self.color;
        }
        self.since_update += 1;
    }
}

/// Complete canceled requests at the head of `pend` that have not received
/// any data yet.
fn skip_canceled(pend: &mut VecDeque<Pending>, stats: &mut QueueStats, done: &mut Vec<Finished>) {
    while pend
        .front()
        .is_some_and(|p| !p.draining && p.unstarted() && p.shared.is_canceled())
    {
        if let Some(p) = pend.pop_front() {
            stats.record_error();
            done.push(Finished::err(p, QdmaError::Canceled));
        }
    }
}

/// Hand buffered data to pending requests, oldest first.
///
/// A request completes at end of packet, or once full when it does not use
/// end-of-packet semantics. An end-of-packet request that fills before its
/// packet ends discards the rest of that packet and fails with
/// [`QdmaError::Incomplete`]. Canceled requests that have not received data
/// are skipped. Drained buffers are recycled immediately.
fn deliver(
    rings: &mut C2hRings,
    pend: &mut VecDeque<Pending>,
    stats: &mut QueueStats,
    done: &mut Vec<Finished>,
) {
    skip_canceled(pend, stats, done);
    while rings.pending_descs() > 0 {
        skip_canceled(pend, stats, done);
        let Some(p) = pend.front_mut() else {
            break;
        };
        let slot = rings.read as usize;
        let fb = &mut rings.bufs[slot];
        let avail = fb.len - fb.consumed;

        if p.draining {
            p.dropped += avail;
            fb.consumed = fb.len;
            rings.pending_bytes -= avail;
        } else {
            let n = p.fill_from(&fb.buf, fb.consumed, avail.min(p.remaining()));
            fb.consumed += n;
            rings.pending_bytes -= n;
        }

        let buf_done = fb.consumed == fb.len;
        let eot = buf_done && fb.eot;
        if buf_done {
            fb.recycle();
            rings.read = idx_incr(rings.read, 1, rings.slots());
            stats.refills += 1;
            if eot {
                rings.pending_pkts -= 1;
            }
        }

        if eot {
            let Some(p) = pend.pop_front() else { break };
            if p.draining {
                stats.record_error();
                let err = QdmaError::Incomplete {
                    expected: p.total(),
                    received: p.offset + p.dropped,
                };
                done.push(Finished::err(p, err));
            } else {
                stats.record_success(p.offset, true, p.submitted_at.elapsed());
                let bytes = p.offset;
                done.push(Finished::ok(p, bytes, true));
            }
            continue;
        }

        if !p.draining && p.remaining() == 0 {
            if p.req.eot {
                p.draining = true;
            } else {
                let Some(p) = pend.pop_front() else { break };
                stats.record_success(p.offset, false, p.submitted_at.elapsed());
                let bytes = p.offset;
                done.push(Finished::ok(p, bytes, false));
            }
        }
    }
}

impl Queue {
    /// Consume new completion entries, deliver data and publish indices.
    ///
    /// An entry with the error flag, or one the engine cannot interpret,
    /// halts the queue with [`QdmaError::CompletionError`].
    pub(crate) fn process_c2h(&self, inner: &mut QueueInner) -> Vec<Finished> {
        let mut done = Vec::new();
        let batch = self.env.index_batch.max(1);
        let mut fault: Option<QdmaError> = None;
        {
            let QueueInner {
                c2h, pend, stats, ..
            } = &mut *inner;
            let Some(rings) = c2h.as_mut() else {
                return done;
            };

            let hw_pidx = rings.cmpt_status().pidx as u32;
            if hw_pidx >= rings.cmpt_slots {
                fault = Some(QdmaError::RingCorrupt {
                    qid: self.qid(),
                    detail: format!(
                        "completion pidx {} beyond ring of {} slots",
                        hw_pidx, rings.cmpt_slots
                    ),
                });
            }

            let mut budget = idx_delta(hw_pidx, rings.cmpt_cidx, rings.cmpt_slots);
            while fault.is_none() && budget > 0 {
                let index = rings.cmpt_cidx;
                let entry = rings.cmpt_entry(index);
                if entry.color() != rings.color {
                    break;
                }
                if entry.is_error() || !entry.is_well_formed() {
                    log::error!(
                        "queue {}: completion entry {} flags {:?}",
                        self.name(),
                        index,
                        entry.flags
                    );
                    fault = Some(QdmaError::CompletionError {
                        qid: self.qid(),
                        index,
                    });
                    break;
                }
                if let Err(detail) = rings.absorb(&entry) {
                    fault = Some(QdmaError::RingCorrupt {
                        qid: self.qid(),
                        detail,
                    });
                    break;
                }
                rings.advance_cmpt();
                budget -= 1;

                deliver(rings, pend, stats, &mut done);
                if rings.since_update >= batch {
                    self.publish_indices(rings);
                }
            }
            if fault.is_none() {
                deliver(rings, pend, stats, &mut done);
                self.publish_indices(rings);
            }
        }

        if let Some(cause) = fault {
            done.extend(self.halt(inner, cause));
        }
        done
    }

    /// Deliver already-buffered data after a new request arrives.
    pub(crate) fn deliver_c2h(&self, inner: &mut QueueInner) -> Vec<Finished> {
        let mut done = Vec::new();
        let QueueInner {
            c2h, pend, stats, ..
        } = &mut *inner;
        if let Some(rings) = c2h.as_mut() {
            deliver(rings, pend, stats, &mut done);
            self.publish_indices(rings);
        }
        done
    }

    /// Receive-side counters; `None` unless the queue is streaming C2H and
    /// started.
    pub(crate) fn peek_c2h(&self, inner: &QueueInner) -> Option<PeekInfo> {
        inner.c2h.as_ref().map(C2hRings::peek)
    }

    /// Write the completion consumer index, then the free-list producer
    /// index, each only when it moved.
    fn publish_indices(&self, rings: &mut C2hRings) {
        let cfg = self.config();
        if rings.cmpt_cidx != rings.cmpt_published {
            let update = CmptCidxUpdate {
                cidx: rings.cmpt_cidx as u16,
                counter_idx: cfg.counter_idx,
                timer_idx: cfg.timer_idx,
                trig_mode: cfg.trig_mode,
                stat_desc_en: true,
                irq_en: cfg.trig_mode != TriggerMode::Disabled,
            };
            self.env
                .regs
                .write32(cmpt_cidx_reg(self.qid()), update.encode());
            rings.cmpt_published = rings.cmpt_cidx;
        }
        rings.since_update = 0;

        let pidx = rings.post_pidx();
        if pidx != rings.pidx_published {
            self.env.regs.write32(
                c2h_pidx_reg(self.qid()),
                PidxUpdate {
                    pidx: pidx as u16,
                    irq_arm: false,
                }
                .encode(),
            );
            rings.pidx_published = pidx;
        }
    }

    /// Initial index writes after the contexts are programmed: completion
    /// consumer at 0, then every buffer but one posted.
    pub(crate) fn arm_c2h(&self, rings: &C2hRings, irq: bool) {
        let cfg = self.config();
        let update = CmptCidxUpdate {
            cidx: 0,
            counter_idx: cfg.counter_idx,
            timer_idx: cfg.timer_idx,
            trig_mode: cfg.trig_mode,
            stat_desc_en: true,
            irq_en: irq && cfg.trig_mode != TriggerMode::Disabled,
        };
        self.env
            .regs
            .write32(cmpt_cidx_reg(self.qid()), update.encode());
        self.env.regs.write32(
            c2h_pidx_reg(self.qid()),
            PidxUpdate {
                pidx: rings.post_pidx() as u16,
                irq_arm: irq,
            }
            .encode(),
        );
    }
}
