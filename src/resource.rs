// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Queue slot accounting for one function.
//!
//! The function owns hardware queue ids `[qbase, qbase + qmax)`. Each index
//! in that range has an H2C and a C2H slot; both slots at an index must use
//! the same transfer mode.

use crate::error::{QdmaError, QdmaResult};
use crate::queue::{Direction, Queue, QueueConfig, QueueHandle};
use std::sync::Arc;

/// Enabled queues of one function, indexed by direction and queue index.
pub struct QueueTable {
    qbase: u32,
    qmax: u32,
    h2c: Vec<Option<Arc<Queue>>>,
    c2h: Vec<Option<Arc<Queue>>>,
}

impl QueueTable {
    pub fn new(qbase: u32, qmax: u32) -> Self {
        Self {
            qbase,
            qmax,
            h2c: vec![None; qmax as usize],
            c2h: vec![None; qmax as usize],
        }
    }

    #[inline]
    pub fn qbase(&self) -> u32 {
        self.qbase
    }

    #[inline]
    pub fn qmax(&self) -> u32 {
        self.qmax
    }

    /// Move the owned range. Only allowed while no queue is enabled.
    pub fn remap(&mut self, qbase: u32, qmax: u32) -> QdmaResult<()> {
        if !self.is_empty() {
            return Err(QdmaError::InvalidConfig(
                "queue range can only change while no queue is enabled".into(),
            ));
        }
        *self = Self::new(qbase, qmax);
        Ok(())
    }

    fn slots(&self, dir: Direction) -> &[Option<Arc<Queue>>] {
        match dir {
            Direction::H2c => &self.h2c,
            Direction::C2h => &self.c2h,
        }
    }

    fn slots_mut(&mut self, dir: Direction) -> &mut Vec<Option<Arc<Queue>>> {
        match dir {
            Direction::H2c => &mut self.h2c,
            Direction::C2h => &mut self.c2h,
        }
    }

    /// Pick the slot `cfg` would occupy, without taking it.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::QuotaExceeded`] for an explicit index beyond `qmax`
    /// - [`QdmaError::NoFreeSlot`] when the slot (or every slot) is in use
    /// - [`QdmaError::ModeConflict`] when the paired queue uses another mode
    pub fn reserve(&self, cfg: &QueueConfig) -> QdmaResult<QueueHandle> {
        let dir = cfg.direction;
        let index = match cfg.index {
            Some(index) => {
                if index as u32 >= self.qmax {
                    return Err(QdmaError::QuotaExceeded {
                        requested: index as u32 + 1,
                        available: self.qmax,
                    });
                }
                if self.slots(dir)[index as usize].is_some() {
                    return Err(QdmaError::NoFreeSlot { direction: dir });
                }
                index
            }
            None => self
                .slots(dir)
                .iter()
                .enumerate()
                .position(|(i, slot)| slot.is_none() && self.peer_mode_ok(i, cfg))
                .map(|i| i as u16)
                .ok_or(QdmaError::NoFreeSlot { direction: dir })?,
        };

        if let Some(peer) = &self.slots(dir.peer())[index as usize] {
            if peer.mode() != cfg.mode {
                return Err(QdmaError::ModeConflict {
                    index,
                    existing: peer.mode(),
                    requested: cfg.mode,
                });
            }
        }
        Ok(QueueHandle::new(index, dir))
    }

    fn peer_mode_ok(&self, index: usize, cfg: &QueueConfig) -> bool {
        self.slots(cfg.direction.peer())[index]
            .as_ref()
            .is_none_or(|peer| peer.mode() == cfg.mode)
    }

    /// Store a queue at its handle's slot.
    pub fn insert(&mut self, queue: Arc<Queue>) {
        let h = queue.handle();
        if let Some(slot) = self.slots_mut(h.direction).get_mut(h.index as usize) {
            *slot = Some(queue);
        }
    }

    pub fn get(&self, handle: QueueHandle) -> Option<&Arc<Queue>> {
        self.slots(handle.direction)
            .get(handle.index as usize)
            .and_then(Option::as_ref)
    }

    pub fn remove(&mut self, handle: QueueHandle) -> Option<Arc<Queue>> {
        self.slots_mut(handle.direction)
            .get_mut(handle.index as usize)
            .and_then(Option::take)
    }

    /// Handle for hardware queue id `qid`.
    ///
    /// # Errors
    ///
    /// [`QdmaError::OutOfRange`] when `qid` is outside the owned range.
    pub fn lookup(&self, qid: u32, dir: Direction) -> QdmaResult<QueueHandle> {
        if qid < self.qbase || qid >= self.qbase + self.qmax {
            return Err(QdmaError::OutOfRange {
                qid,
                base: self.qbase,
                count: self.qmax,
            });
        }
        Ok(QueueHandle::new((qid - self.qbase) as u16, dir))
    }

    /// Hardware queue id of `index`.
    #[inline]
    pub fn hw_qid(&self, index: u16) -> u32 {
        self.qbase + index as u32
    }

    /// Enabled queues in one direction.
    pub fn enabled(&self, dir: Direction) -> u32 {
        self.slots(dir).iter().filter(|s| s.is_some()).count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.enabled(Direction::H2c) == 0 && self.enabled(Direction::C2h) == 0
    }

    /// Every enabled queue, H2C first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Queue>> {
        self.h2c.iter().chain(self.c2h.iter()).flatten()
    }
}
