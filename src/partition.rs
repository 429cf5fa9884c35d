// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Queue and vector partitioning across functions.
//!
//! The privileged function owns `[0, owner_qmax)` of the device's queue id
//! space. Everything above is a pool handed out to restricted functions in
//! contiguous ranges. Interrupt vectors are split statically: each caller
//! table slot owns a fixed block after the owner's vectors.
//!
//! [`Partitioner`] is the bookkeeping; [`OwnerHandler`] puts it behind the
//! mailbox and applies its decisions to hardware (function map registers,
//! context clears on revoke, proxied context programming).

use crate::context::CoalContext;
use crate::error::{QdmaError, QdmaResult};
use crate::indirect::ContextProgrammer;
use crate::lock;
use crate::mailbox::{MailboxHandler, MboxMsg};
use crate::queue::{Direction, QueueMode};
use crate::regs::{fmap_reg, FmapEntry, RegisterAccess};
use std::sync::{Arc, Mutex};

/// Queue and vector range held by one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeGrant {
    pub qbase: u32,
    pub qmax: u32,
    pub vec_base: u16,
    pub vec_count: u16,
}

/// Sizing of the shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Queue ids on the device.
    pub total_queues: u32,
    /// Restricted functions that may register at once.
    pub max_callers: u32,
    /// Vectors each restricted function receives.
    pub vectors_per_caller: u16,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            total_queues: 2048,
            max_callers: 8,
            vectors_per_caller: 4,
        }
    }
}

/// One registered restricted function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub func_id: u8,
    pub qbase: u32,
    pub qmax: u32,
    pub vec_base: u16,
    pub vec_count: u16,
    pub online: bool,
    slot: u32,
}

impl PartitionEntry {
    pub fn grant(&self) -> RangeGrant {
        RangeGrant {
            qbase: self.qbase,
            qmax: self.qmax,
            vec_base: self.vec_base,
            vec_count: self.vec_count,
        }
    }
}

/// Queue range bookkeeping for the owner.
#[derive(Debug, Clone)]
pub struct Partitioner {
    config: PartitionConfig,
    owner_qmax: u32,
    owner_vectors: u16,
    entries: Vec<PartitionEntry>,
}

impl Partitioner {
    /// # Errors
    ///
    /// [`QdmaError::InvalidConfig`] if the owner's range exceeds the device.
    pub fn new(config: PartitionConfig, owner_qmax: u32, owner_vectors: u16) -> QdmaResult<Self> {
        if owner_qmax > config.total_queues {
            return Err(QdmaError::InvalidConfig(format!(
                "owner range of {} queues exceeds the device's {}",
                owner_qmax, config.total_queues
            )));
        }
        Ok(Self {
            config,
            owner_qmax,
            owner_vectors,
            entries: Vec::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Queues in the shared pool.
    pub fn pool(&self) -> u32 {
        self.config.total_queues - self.owner_qmax
    }

    /// Range size a function gets on registration.
    pub fn default_share(&self) -> u32 {
        match self.config.max_callers {
            0 => 0,
            n => self.pool() / n,
        }
    }

    /// Registered functions.
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn entry(&self, func_id: u8) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.func_id == func_id)
    }

    /// Queues held by everyone, the owner included.
    pub fn assigned(&self) -> u32 {
        self.owner_qmax + self.entries.iter().map(|e| e.qmax).sum::<u32>()
    }

    /// Lowest base where `qmax` queues fit, ignoring `exclude`'s own range.
    fn first_fit(&self, qmax: u32, exclude: Option<u8>) -> Option<u32> {
        if qmax == 0 {
            return Some(self.owner_qmax);
        }
        let mut taken: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| Some(e.func_id) != exclude && e.qmax > 0)
            .map(|e| (e.qbase, e.qbase + e.qmax))
            .collect();
        taken.sort_unstable();

        let mut base = self.owner_qmax;
        for (start, end) in taken {
            if start >= base + qmax {
                break;
            }
            base = base.max(end);
        }
        (base + qmax <= self.config.total_queues).then_some(base)
    }

    fn free_slot(&self) -> Option<u32> {
        (0..self.config.max_callers).find(|s| self.entries.iter().all(|e| e.slot != *s))
    }

    /// Register `func_id` with the default share, or a zero-size range when
    /// the pool cannot fit it. Registering twice returns the current range.
    ///
    /// # Errors
    ///
    /// [`QdmaError::ResourceExhausted`] when the caller table is full.
    pub fn hello(&mut self, func_id: u8) -> QdmaResult<RangeGrant> {
        if let Some(e) = self.entries.iter_mut().find(|e| e.func_id == func_id) {
            e.online = true;
            return Ok(e.grant());
        }
        let slot = self
            .free_slot()
            .ok_or_else(|| QdmaError::ResourceExhausted("function table full".into()))?;

        let share = self.default_share();
        let (qbase, qmax) = match self.first_fit(share, None) {
            Some(base) => (base, share),
            None => {
                log::warn!(
                    "no room for {} queues for function {}, granting none",
                    share,
                    func_id
                );
                (self.owner_qmax, 0)
            }
        };
        let vec_count = self.config.vectors_per_caller;
        let entry = PartitionEntry {
            func_id,
            qbase,
            qmax,
            vec_base: self.owner_vectors + (slot as u16) * vec_count,
            vec_count,
            online: true,
            slot,
        };
        log::info!(
            "function {} registered: queues [{}, {}), vectors [{}, {})",
            func_id,
            qbase,
            qbase + qmax,
            entry.vec_base,
            entry.vec_base + vec_count
        );
        self.entries.push(entry);
        Ok(entry.grant())
    }

    /// Move `func_id` to a range of `qmax` queues.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] if `func_id` is not registered
    /// - [`QdmaError::ResourceExhausted`] if no contiguous range fits; the
    ///   current assignment is left untouched
    pub fn assign(&mut self, func_id: u8, qmax: u32) -> QdmaResult<RangeGrant> {
        self.entry(func_id).ok_or_else(|| unknown_caller(func_id))?;
        let base = self.first_fit(qmax, Some(func_id)).ok_or_else(|| {
            QdmaError::ResourceExhausted(format!(
                "no contiguous range of {} queues for function {}",
                qmax, func_id
            ))
        })?;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.func_id == func_id)
            .ok_or_else(|| unknown_caller(func_id))?;
        entry.qbase = base;
        entry.qmax = qmax;
        log::info!(
            "function {} reassigned queues [{}, {})",
            func_id,
            base,
            base + qmax
        );
        Ok(entry.grant())
    }

    /// Current range of `func_id`.
    pub fn query(&self, func_id: u8) -> QdmaResult<RangeGrant> {
        self.entry(func_id)
            .map(PartitionEntry::grant)
            .ok_or_else(|| unknown_caller(func_id))
    }

    /// Forget `func_id`, returning what it held.
    pub fn bye(&mut self, func_id: u8) -> Option<PartitionEntry> {
        let pos = self.entries.iter().position(|e| e.func_id == func_id)?;
        let entry = self.entries.remove(pos);
        log::info!("function {} unregistered", func_id);
        Some(entry)
    }

    /// True if `qid` lies in `func_id`'s range.
    pub fn owns_queue(&self, func_id: u8, qid: u32) -> bool {
        self.entry(func_id)
            .is_some_and(|e| qid >= e.qbase && qid < e.qbase + e.qmax)
    }

    /// True if coalescing ring `ring` lies in `func_id`'s vector block.
    pub fn owns_vector(&self, func_id: u8, ring: u16) -> bool {
        self.entry(func_id)
            .is_some_and(|e| ring >= e.vec_base && ring < e.vec_base + e.vec_count)
    }
}

fn unknown_caller(func_id: u8) -> QdmaError {
    QdmaError::InvalidConfig(format!("function {} is not registered", func_id))
}

// ============================================================================
// Mailbox handler
// ============================================================================

/// Owner-side mailbox handler backed by a [`Partitioner`].
pub struct OwnerHandler {
    partitioner: Mutex<Partitioner>,
    programmer: Arc<dyn ContextProgrammer>,
    regs: Arc<dyn RegisterAccess>,
}

impl OwnerHandler {
    pub fn new(
        partitioner: Partitioner,
        programmer: Arc<dyn ContextProgrammer>,
        regs: Arc<dyn RegisterAccess>,
    ) -> Self {
        Self {
            partitioner: Mutex::new(partitioner),
            programmer,
            regs,
        }
    }

    /// Snapshot of every registered function.
    pub fn table(&self) -> Vec<PartitionEntry> {
        lock(&self.partitioner).entries().to_vec()
    }

    fn write_fmap(&self, func_id: u8, qbase: u32, qmax: u32) {
        self.regs
            .write32(fmap_reg(func_id), FmapEntry { qbase, qmax }.encode());
    }

    /// Clear every context in a revoked range and zero the function map.
    fn revoke(&self, entry: &PartitionEntry) {
        for qid in entry.qbase..entry.qbase + entry.qmax {
            for dir in [Direction::H2c, Direction::C2h] {
                if let Err(e) = self.programmer.clear(qid, dir, QueueMode::Streaming) {
                    log::warn!("clearing queue {:#x} of function {}: {}", qid, entry.func_id, e);
                }
            }
        }
        for ring in entry.vec_base..entry.vec_base + entry.vec_count {
            if let Err(e) = self.programmer.clear_coalescing(ring) {
                log::warn!("clearing ring {} of function {}: {}", ring, entry.func_id, e);
            }
        }
        self.write_fmap(entry.func_id, 0, 0);
    }

    fn check_queue(&self, caller: u8, qid: u32) -> QdmaResult<()> {
        let p = lock(&self.partitioner);
        if p.owns_queue(caller, qid) {
            return Ok(());
        }
        let grant = p.query(caller)?;
        Err(QdmaError::OutOfRange {
            qid,
            base: grant.qbase,
            count: grant.qmax,
        })
    }

    fn check_vector(&self, caller: u8, ring: u16) -> QdmaResult<()> {
        if lock(&self.partitioner).owns_vector(caller, ring) {
            Ok(())
        } else {
            Err(QdmaError::QuotaExceeded {
                requested: ring as u32,
                available: 0,
            })
        }
    }

    fn program_vector(&self, ring: u16, ctx: Option<CoalContext>) -> QdmaResult<()> {
        match ctx {
            Some(ctx) => self.programmer.program_coalescing(ring, &ctx),
            None => self.programmer.clear_coalescing(ring),
        }
    }
}

impl MailboxHandler for OwnerHandler {
    fn handle(&self, caller: u8, msg: MboxMsg) -> QdmaResult<MboxMsg> {
        match msg {
            MboxMsg::Hello => {
                let grant = lock(&self.partitioner).hello(caller)?;
                self.write_fmap(caller, grant.qbase, grant.qmax);
                Ok(MboxMsg::Range(grant))
            }
            MboxMsg::Bye => {
                let entry = lock(&self.partitioner).bye(caller);
                if let Some(entry) = entry {
                    self.revoke(&entry);
                }
                Ok(MboxMsg::Done)
            }
            MboxMsg::RangeQuery => Ok(MboxMsg::Range(lock(&self.partitioner).query(caller)?)),
            MboxMsg::RangeAssign { qmax } => {
                let grant = lock(&self.partitioner).assign(caller, qmax)?;
                self.write_fmap(caller, grant.qbase, grant.qmax);
                Ok(MboxMsg::Range(grant))
            }
            MboxMsg::ContextWrite { qid, dir, ctx } => {
                self.check_queue(caller, qid)?;
                self.programmer.write(qid, dir, &ctx)?;
                Ok(MboxMsg::Done)
            }
            MboxMsg::ContextRead { qid, dir, mode } => {
                self.check_queue(caller, qid)?;
                Ok(MboxMsg::ContextData(self.programmer.read(qid, dir, mode)?))
            }
            MboxMsg::ContextClear { qid, dir, mode } => {
                self.check_queue(caller, qid)?;
                self.programmer.clear(qid, dir, mode)?;
                Ok(MboxMsg::Done)
            }
            MboxMsg::VectorContext { ring, ctx } => {
                self.check_vector(caller, ring)?;
                self.program_vector(ring, ctx)?;
                Ok(MboxMsg::Done)
            }
            MboxMsg::CsrRead { kind } => {
                let csr = self.programmer.read_csr()?;
                Ok(MboxMsg::CsrTable {
                    kind,
                    values: *csr.table(kind),
                    wb_acc: csr.wb_acc,
                })
            }
            MboxMsg::Range(_)
            | MboxMsg::ContextData(_)
            | MboxMsg::CsrTable { .. }
            | MboxMsg::Done
            | MboxMsg::Unknown { .. } => Err(QdmaError::InvalidConfig(format!(
                "function {} sent a response as a request",
                caller
            ))),
        }
    }

    fn disconnected(&self, caller: u8) {
        let entry = lock(&self.partitioner).bye(caller);
        if let Some(entry) = entry {
            log::warn!("function {} vanished, revoking its range", caller);
            self.revoke(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueueContext;
    use crate::csr::{CsrKind, GlobalCsr};
    use std::collections::HashMap;

    fn cfg(total: u32, callers: u32) -> PartitionConfig {
        PartitionConfig {
            total_queues: total,
            max_callers: callers,
            vectors_per_caller: 2,
        }
    }

    fn conserved(p: &Partitioner) -> bool {
        p.assigned() <= p.config().total_queues
    }

    #[test]
    fn test_hello_default_share() {
        let mut p = Partitioner::new(cfg(128, 4), 64, 8).unwrap();
        assert_eq!(p.default_share(), 16);

        let a = p.hello(1).unwrap();
        let b = p.hello(2).unwrap();
        assert_eq!((a.qbase, a.qmax, a.vec_base), (64, 16, 8));
        assert_eq!((b.qbase, b.qmax, b.vec_base), (80, 16, 10));
        assert_eq!(p.hello(1).unwrap(), a);
        assert!(conserved(&p));
    }

    #[test]
    fn test_caller_table_full() {
        let mut p = Partitioner::new(cfg(64, 2), 32, 2).unwrap();
        p.hello(1).unwrap();
        p.hello(2).unwrap();
        assert!(matches!(p.hello(3), Err(QdmaError::ResourceExhausted(_))));
        p.bye(1);
        assert_eq!(p.hello(3).unwrap().vec_base, 2);
    }

    #[test]
    fn test_exhausted_assign_leaves_other_untouched() {
        let mut p = Partitioner::new(cfg(96, 2), 32, 2).unwrap();
        p.hello(1).unwrap();
        p.hello(2).unwrap();

        let first = p.assign(1, 32).unwrap();
        assert_eq!((first.qbase, first.qmax), (32, 32));
        let err = p.assign(2, 48).unwrap_err();
        assert!(matches!(err, QdmaError::ResourceExhausted(_)));
        assert_eq!(p.query(1).unwrap(), first);
        assert_eq!(p.query(2).unwrap().qmax, 32);
        assert!(conserved(&p));
    }

    #[test]
    fn test_assign_reuses_own_range() {
        let mut p = Partitioner::new(cfg(64, 2), 0, 0).unwrap();
        p.hello(1).unwrap();
        p.hello(2).unwrap();
        p.bye(2);
        // Growing in place is allowed because the old range is ignored.
        let grant = p.assign(1, 64).unwrap();
        assert_eq!((grant.qbase, grant.qmax), (0, 64));
        assert!(p.assign(9, 1).is_err());
    }

    #[test]
    fn test_zero_range_when_pool_full() {
        let mut p = Partitioner::new(cfg(64, 2), 32, 2).unwrap();
        p.hello(1).unwrap();
        p.assign(1, 32).unwrap();
        let grant = p.hello(2).unwrap();
        assert_eq!(grant.qmax, 0);
        assert!(conserved(&p));
    }

    /// Programmer that records clears and stores contexts.
    #[derive(Default)]
    struct RecordingProgrammer {
        cleared: Mutex<Vec<(u32, Direction)>>,
        written: Mutex<HashMap<(u32, Direction), QueueContext>>,
        coal_cleared: Mutex<Vec<u16>>,
    }

    impl ContextProgrammer for RecordingProgrammer {
        fn clear(&self, qid: u32, dir: Direction, _mode: QueueMode) -> QdmaResult<()> {
            self.cleared.lock().unwrap().push((qid, dir));
            Ok(())
        }
        fn read(&self, qid: u32, dir: Direction, _mode: QueueMode) -> QdmaResult<QueueContext> {
            Ok(self
                .written
                .lock()
                .unwrap()
                .get(&(qid, dir))
                .copied()
                .unwrap_or_default())
        }
        fn write(&self, qid: u32, dir: Direction, ctx: &QueueContext) -> QdmaResult<()> {
            self.written.lock().unwrap().insert((qid, dir), *ctx);
            Ok(())
        }
        fn program_coalescing(&self, _ring: u16, _ctx: &CoalContext) -> QdmaResult<()> {
            Ok(())
        }
        fn clear_coalescing(&self, ring: u16) -> QdmaResult<()> {
            self.coal_cleared.lock().unwrap().push(ring);
            Ok(())
        }
        fn read_csr(&self) -> QdmaResult<GlobalCsr> {
            Ok(GlobalCsr::default())
        }
    }

    #[derive(Default)]
    struct MapRegs(Mutex<HashMap<u32, u32>>);

    impl RegisterAccess for MapRegs {
        fn read32(&self, offset: u32) -> u32 {
            *self.0.lock().unwrap().get(&offset).unwrap_or(&0)
        }
        fn write32(&self, offset: u32, value: u32) {
            self.0.lock().unwrap().insert(offset, value);
        }
    }

    fn owner() -> (OwnerHandler, Arc<RecordingProgrammer>, Arc<MapRegs>) {
        let prog = Arc::new(RecordingProgrammer::default());
        let regs = Arc::new(MapRegs::default());
        let p = Partitioner::new(cfg(16, 2), 8, 2).unwrap();
        (OwnerHandler::new(p, prog.clone(), regs.clone()), prog, regs)
    }

    #[test]
    fn test_hello_writes_fmap_and_bye_revokes() {
        let (h, prog, regs) = owner();
        let MboxMsg::Range(grant) = h.handle(4, MboxMsg::Hello).unwrap() else {
            panic!("expected range");
        };
        assert_eq!((grant.qbase, grant.qmax), (8, 4));
        assert_eq!(
            FmapEntry::decode(regs.read32(fmap_reg(4))),
            FmapEntry { qbase: 8, qmax: 4 }
        );

        h.disconnected(4);
        assert_eq!(prog.cleared.lock().unwrap().len(), 8);
        assert_eq!(*prog.coal_cleared.lock().unwrap(), vec![2, 3]);
        assert_eq!(regs.read32(fmap_reg(4)), 0);
        assert!(h.table().is_empty());
    }

    #[test]
    fn test_context_ops_limited_to_own_range() {
        let (h, prog, _regs) = owner();
        h.handle(4, MboxMsg::Hello).unwrap();

        let ctx = QueueContext::default();
        h.handle(4, MboxMsg::ContextWrite { qid: 9, dir: Direction::H2c, ctx }).unwrap();
        assert!(prog.written.lock().unwrap().contains_key(&(9, Direction::H2c)));

        let err = h
            .handle(4, MboxMsg::ContextWrite { qid: 3, dir: Direction::H2c, ctx })
            .unwrap_err();
        assert!(matches!(err, QdmaError::OutOfRange { qid: 3, base: 8, count: 4 }));

        let err = h
            .handle(4, MboxMsg::VectorContext { ring: 0, ctx: None })
            .unwrap_err();
        assert!(matches!(err, QdmaError::QuotaExceeded { .. }));
        h.handle(4, MboxMsg::VectorContext { ring: 3, ctx: None }).unwrap();

        // Unregistered callers own nothing.
        assert!(h
            .handle(7, MboxMsg::ContextClear { qid: 9, dir: Direction::C2h, mode: QueueMode::Streaming })
            .is_err());
    }

    #[test]
    fn test_csr_table_reply() {
        let (h, _prog, _regs) = owner();
        let reply = h
            .handle(4, MboxMsg::CsrRead { kind: CsrKind::TimerCount })
            .unwrap();
        assert_eq!(
            reply,
            MboxMsg::CsrTable {
                kind: CsrKind::TimerCount,
                values: GlobalCsr::default().timer_counts,
                wb_acc: 0,
            }
        );
    }
}
