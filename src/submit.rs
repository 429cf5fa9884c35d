// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Descriptor submission for memory-mapped and streaming H2C rings.
//!
//! Requests are split into descriptors of at most `max_segment` bytes and
//! written at the software producer index. When the ring fills mid-request
//! the request stays at the head of the work list and resumes from the saved
//! offset on the next pass. One producer-index doorbell covers every
//! descriptor written in a pass.
//!
//! Completion is driven by the writeback status block: the hardware consumer
//! index advances, the consumed slots become credit, and credit retires
//! fully described requests strictly in submission order.

use crate::descriptor::{H2cDesc, H2cFlags, MmDesc, MmFlags, MM_DESC_LEN_MAX};
use crate::error::QdmaError;
use crate::queue::{Direction, Queue, QueueInner, QueueMode, H2C_FRAGMENT_MAX};
use crate::regs::{c2h_pidx_reg, h2c_pidx_reg, PidxUpdate};
use crate::request::{Finished, Pending};
use crate::ring::DescRing;

/// Write memory-mapped descriptors for `p` until it is fully described or
/// the ring is full. Returns `true` when fully described.
fn fill_mm(ring: &mut DescRing, p: &mut Pending, max_segment: usize, dir: Direction) -> bool {
    let total = p.total();
    let cap = max_segment.min(MM_DESC_LEN_MAX as usize);
    while ring.avail > 0 && p.offset < total {
        let Some((host, len)) = p.next_chunk(cap) else {
            break;
        };
        let ep = p.req.ep_addr + p.offset as u64;
        let (src, dst) = match dir {
            Direction::H2c => (host, ep),
            Direction::C2h => (ep, host),
        };
        let mut desc = MmDesc::new(src, dst, len as u32);
        if p.offset == 0 {
            desc.add_flags(MmFlags::SOP);
        }
        p.offset += len;
        if p.offset == total {
            desc.add_flags(MmFlags::EOP);
        }
        let idx = ring.produce();
        ring.write(idx, &desc);
        p.desc_nr += 1;
    }
    p.offset == total
}

/// Write streaming H2C descriptors for `p`. End-of-packet goes on the last
/// fragment only when the request asks for it.
fn fill_h2c(ring: &mut DescRing, p: &mut Pending, max_segment: usize) -> bool {
    let total = p.total();
    let cap = max_segment.min(H2C_FRAGMENT_MAX as usize);
    while ring.avail > 0 && p.offset < total {
        let Some((host, len)) = p.next_chunk(cap) else {
            break;
        };
        let mut flags = H2cFlags::empty();
        if p.offset == 0 {
            flags |= H2cFlags::SOP;
        }
        p.offset += len;
        if p.offset == total && p.req.eot {
            flags |= H2cFlags::EOP;
        }
        let mut desc = H2cDesc::new(host, len as u16, flags);
        if flags.contains(H2cFlags::SOP) {
            desc.pld_len = u16::try_from(total).unwrap_or(u16::MAX);
        }
        let idx = ring.produce();
        ring.write(idx, &desc);
        p.desc_nr += 1;
    }
    p.offset == total
}

impl Queue {
    /// Move work-list requests into the ring and ring the doorbell once.
    ///
    /// Canceled requests that have not started are completed with
    /// [`QdmaError::Canceled`] without touching the ring.
    pub(crate) fn process_work(&self, inner: &mut QueueInner) -> Vec<Finished> {
        let mut done = Vec::new();
        let max_segment = self.config().max_segment as usize;
        let mode = self.mode();
        let dir = self.direction();
        let mut written = 0u32;

        loop {
            let Some(front) = inner.work.front_mut() else {
                break;
            };
            if front.unstarted() && front.shared.is_canceled() {
                if let Some(p) = inner.work.pop_front() {
                    inner.stats.record_error();
                    done.push(Finished::err(p, QdmaError::Canceled));
                }
                continue;
            }
            let Some(ring) = inner.ring.as_mut() else {
                break;
            };
            if ring.avail == 0 {
                break;
            }

            let before = front.desc_nr;
            let complete = match mode {
                QueueMode::MemoryMapped => fill_mm(ring, front, max_segment, dir),
                QueueMode::Streaming => fill_h2c(ring, front, max_segment),
            };
            written += front.desc_nr - before;

            if !complete {
                break;
            }
            if let Some(p) = inner.work.pop_front() {
                inner.pend.push_back(p);
            }
        }

        if written > 0 {
            inner.stats.descriptors += written as u64;
            self.ring_doorbell(inner);
        }
        done
    }

    /// Publish the software producer index.
    fn ring_doorbell(&self, inner: &QueueInner) {
        let Some(ring) = inner.ring.as_ref() else {
            return;
        };
        let update = PidxUpdate {
            pidx: ring.pidx() as u16,
            irq_arm: inner.irq_arm(),
        };
        let reg = match self.direction() {
            Direction::H2c => h2c_pidx_reg(self.qid()),
            Direction::C2h => c2h_pidx_reg(self.qid()),
        };
        log::trace!("queue {}: pidx {}", self.name(), update.pidx);
        self.env.regs.write32(reg, update.encode());
    }

    /// Convert consumed descriptors into completions.
    ///
    /// A consumer index that is out of range or claims more descriptors than
    /// are in flight halts the queue with [`QdmaError::RingCorrupt`].
    pub(crate) fn process_writeback(&self, inner: &mut QueueInner) -> Vec<Finished> {
        let Some(ring) = inner.ring.as_mut() else {
            return Vec::new();
        };
        let hw_cidx = ring.status().cidx as u32;
        if hw_cidx == ring.cidx() {
            return Vec::new();
        }

        let credit = match ring.reclaim(hw_cidx) {
            Ok(credit) => credit,
            Err(detail) => {
                let cause = QdmaError::RingCorrupt {
                    qid: self.qid(),
                    detail,
                };
                return self.halt(inner, cause);
            }
        };
        inner.credit += credit;

        let mut done = Vec::new();
        let packets = self.mode() == QueueMode::Streaming;
        while inner.credit > 0 {
            let Some(front) = inner.pend.front_mut() else {
                break;
            };
            if front.desc_nr > inner.credit {
                front.desc_nr -= inner.credit;
                inner.credit = 0;
                break;
            }
            inner.credit -= front.desc_nr;
            if let Some(p) = inner.pend.pop_front() {
                let bytes = p.offset;
                let eot = p.req.eot;
                inner
                    .stats
                    .record_success(bytes, packets && eot, p.submitted_at.elapsed());
                done.push(Finished::ok(p, bytes, eot));
            }
        }

        // Freed slots go straight to waiting work.
        if !inner.work.is_empty() {
            done.extend(self.process_work(inner));
        }
        done
    }
}
