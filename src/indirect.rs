// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Indirect context programming.
//!
//! Context memory is reached through one command register, a block of data
//! registers and a block of mask registers. A write loads data and mask,
//! then the command register receives `(qid, op, selector)` and is polled
//! until hardware drops the busy bit.
//!
//! The register block is a single shared resource, so every command sequence
//! runs inside a [`ContextSession`] holding the programming lock. Queue locks
//! are never involved.
//!
//! [`ContextProgrammer`] is the seam between queue lifecycle code and the two
//! ways of reaching context memory: [`DirectProgrammer`] on the privileged
//! function, and the mailbox-proxied programmer in [`crate::mailbox`] on
//! restricted functions.

use crate::context::{
    CoalContext, ContextOp, ContextSelector, CreditContext, HwContext, PrefetchContext,
    QidVecMap, QueueContext, SwContext, WritebackContext,
};
use crate::csr::GlobalCsr;
use crate::error::{QdmaError, QdmaResult};
use crate::lock;
use crate::policy::RetryPolicy;
use crate::queue::{Direction, QueueMode};
use crate::regs::{
    RegisterAccess, IND_CTXT_CMD, IND_CTXT_DATA_BASE, IND_CTXT_MASK_BASE, IND_CTXT_REG_COUNT,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Decoded indirect command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCommand {
    pub qid: u32,
    pub op: ContextOp,
    pub sel: ContextSelector,
    pub busy: bool,
}

impl ContextCommand {
    /// Busy bit, set while hardware executes the command.
    pub const BUSY: u32 = 1 << 0;

    pub fn encode(&self) -> u32 {
        (self.busy as u32)
            | ((self.sel as u32 & 0xF) << 1)
            | ((self.op as u32 & 0x3) << 5)
            | ((self.qid & 0xFFF) << 7)
    }

    /// `None` if the selector field holds no known selector.
    pub fn decode(value: u32) -> Option<Self> {
        Some(Self {
            qid: (value >> 7) & 0xFFF,
            op: ContextOp::from_u8(((value >> 5) & 0x3) as u8),
            sel: ContextSelector::from_u8(((value >> 1) & 0xF) as u8)?,
            busy: value & Self::BUSY != 0,
        })
    }
}

/// Owner of the indirect register block.
pub struct IndirectContext {
    regs: Arc<dyn RegisterAccess>,
    lock: Mutex<()>,
    policy: RetryPolicy,
}

impl IndirectContext {
    pub fn new(regs: Arc<dyn RegisterAccess>, policy: RetryPolicy) -> Self {
        Self {
            regs,
            lock: Mutex::new(()),
            policy,
        }
    }

    /// Take the programming lock for a sequence of commands.
    pub fn session(&self) -> ContextSession<'_> {
        ContextSession {
            regs: &*self.regs,
            policy: self.policy,
            _guard: lock(&self.lock),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// A locked run of indirect commands.
pub struct ContextSession<'a> {
    regs: &'a dyn RegisterAccess,
    policy: RetryPolicy,
    _guard: MutexGuard<'a, ()>,
}

impl ContextSession<'_> {
    /// Zero one context.
    pub fn clear(&self, qid: u32, sel: ContextSelector) -> QdmaResult<()> {
        self.issue(qid, ContextOp::Clear, sel)
    }

    /// Mark one context invalid without zeroing it.
    pub fn invalidate(&self, qid: u32, sel: ContextSelector) -> QdmaResult<()> {
        self.issue(qid, ContextOp::Invalidate, sel)
    }

    /// Read one context's data words.
    pub fn read(&self, qid: u32, sel: ContextSelector) -> QdmaResult<[u32; IND_CTXT_REG_COUNT]> {
        self.issue(qid, ContextOp::Read, sel)?;
        let mut out = [0u32; IND_CTXT_REG_COUNT];
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.regs.read32(IND_CTXT_DATA_BASE + (i as u32) * 4);
        }
        Ok(out)
    }

    /// Write one context; with `verify`, read it back and compare.
    pub fn write(
        &self,
        qid: u32,
        sel: ContextSelector,
        data: &[u32],
        verify: bool,
    ) -> QdmaResult<()> {
        self.load_masks();
        for i in 0..IND_CTXT_REG_COUNT {
            let w = data.get(i).copied().unwrap_or(0);
            self.regs.write32(IND_CTXT_DATA_BASE + (i as u32) * 4, w);
        }
        self.issue(qid, ContextOp::Write, sel)?;

        if verify {
            let back = self.read(qid, sel)?;
            for (i, &expected) in data.iter().enumerate().take(sel.words()) {
                if back[i] != expected {
                    return Err(QdmaError::ContextMismatch {
                        qid,
                        sel,
                        expected,
                        actual: back[i],
                    });
                }
            }
        }
        Ok(())
    }

    fn load_masks(&self) {
        for i in 0..IND_CTXT_REG_COUNT {
            self.regs
                .write32(IND_CTXT_MASK_BASE + (i as u32) * 4, 0xFFFF_FFFF);
        }
    }

    fn issue(&self, qid: u32, op: ContextOp, sel: ContextSelector) -> QdmaResult<()> {
        let cmd = ContextCommand {
            qid,
            op,
            sel,
            busy: false,
        };
        self.regs.write32(IND_CTXT_CMD, cmd.encode());

        let regs = self.regs;
        self.policy
            .poll(|| (regs.read32(IND_CTXT_CMD) & ContextCommand::BUSY == 0).then_some(()))
            .ok_or(QdmaError::ContextProgramTimeout { qid, op, sel })
    }
}

/// Context operations as queue lifecycle code needs them.
pub trait ContextProgrammer: Send + Sync {
    /// Remove every context of one queue direction.
    fn clear(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<()>;

    /// Read back everything hardware holds for one queue direction.
    fn read(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<QueueContext>;

    /// Clear, then program software context, vector map and, when present,
    /// prefetch and writeback contexts. Only `dir`'s half of the vector map
    /// is changed.
    fn write(&self, qid: u32, dir: Direction, ctx: &QueueContext) -> QdmaResult<()>;

    /// Program the context of coalescing ring `ring`.
    fn program_coalescing(&self, ring: u16, ctx: &CoalContext) -> QdmaResult<()>;

    /// Clear the context of coalescing ring `ring`.
    fn clear_coalescing(&self, ring: u16) -> QdmaResult<()>;

    /// Fetch the global CSR tables.
    fn read_csr(&self) -> QdmaResult<GlobalCsr>;
}

/// Register-level programmer for the privileged function.
pub struct DirectProgrammer {
    ind: IndirectContext,
    regs: Arc<dyn RegisterAccess>,
    verify: bool,
}

impl DirectProgrammer {
    pub fn new(regs: Arc<dyn RegisterAccess>, policy: RetryPolicy) -> Self {
        Self {
            ind: IndirectContext::new(Arc::clone(&regs), policy),
            regs,
            verify: false,
        }
    }

    /// Read back and compare every context write.
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    fn clear_locked(
        session: &ContextSession<'_>,
        qid: u32,
        dir: Direction,
        mode: QueueMode,
    ) -> QdmaResult<()> {
        session.clear(qid, ContextSelector::sw(dir))?;
        session.clear(qid, ContextSelector::hw(dir))?;
        session.clear(qid, ContextSelector::credit(dir))?;
        if mode == QueueMode::Streaming && dir == Direction::C2h {
            session.clear(qid, ContextSelector::Prefetch)?;
            session.clear(qid, ContextSelector::Writeback)?;
        }
        Ok(())
    }
}

impl ContextProgrammer for DirectProgrammer {
    fn clear(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<()> {
        let session = self.ind.session();
        Self::clear_locked(&session, qid, dir, mode)
    }

    fn read(&self, qid: u32, dir: Direction, mode: QueueMode) -> QdmaResult<QueueContext> {
        let session = self.ind.session();
        let mut ctx = QueueContext {
            sw: SwContext::decode(&session.read(qid, ContextSelector::sw(dir))?),
            hw: HwContext::decode(&session.read(qid, ContextSelector::hw(dir))?),
            credit: CreditContext::decode(&session.read(qid, ContextSelector::credit(dir))?),
            qid_vec: QidVecMap::decode(&session.read(qid, ContextSelector::QidVec)?),
            prefetch: None,
            writeback: None,
        };
        if mode == QueueMode::Streaming && dir == Direction::C2h {
            ctx.prefetch = Some(PrefetchContext::decode(
                &session.read(qid, ContextSelector::Prefetch)?,
            ));
            ctx.writeback = Some(WritebackContext::decode(
                &session.read(qid, ContextSelector::Writeback)?,
            ));
        }
        Ok(ctx)
    }

    fn write(&self, qid: u32, dir: Direction, ctx: &QueueContext) -> QdmaResult<()> {
        let mode = if ctx.sw.is_mm {
            QueueMode::MemoryMapped
        } else {
            QueueMode::Streaming
        };
        let session = self.ind.session();
        Self::clear_locked(&session, qid, dir, mode)?;

        session.write(qid, ContextSelector::sw(dir), &ctx.sw.encode(), self.verify)?;

        let mut map = QidVecMap::decode(&session.read(qid, ContextSelector::QidVec)?);
        let (vec, coal) = ctx.qid_vec.get(dir);
        map.set(dir, vec, coal);
        session.write(qid, ContextSelector::QidVec, &map.encode(), self.verify)?;

        if let Some(pf) = &ctx.prefetch {
            session.write(qid, ContextSelector::Prefetch, &pf.encode(), self.verify)?;
        }
        if let Some(wb) = &ctx.writeback {
            session.write(qid, ContextSelector::Writeback, &wb.encode(), self.verify)?;
        }
        log::debug!("programmed {} context for queue {:#x}", dir, qid);
        Ok(())
    }

    fn program_coalescing(&self, ring: u16, ctx: &CoalContext) -> QdmaResult<()> {
        let session = self.ind.session();
        session.clear(ring as u32, ContextSelector::Coalesce)?;
        session.write(
            ring as u32,
            ContextSelector::Coalesce,
            &ctx.encode(),
            self.verify,
        )
    }

    fn clear_coalescing(&self, ring: u16) -> QdmaResult<()> {
        self.ind
            .session()
            .clear(ring as u32, ContextSelector::Coalesce)
    }

    fn read_csr(&self) -> QdmaResult<GlobalCsr> {
        Ok(GlobalCsr::read_from(&*self.regs))
    }
}
