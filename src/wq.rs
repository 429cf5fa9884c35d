// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Submission and completion worker pools.
//!
//! A pool is a fixed set of threads, each fed by its own channel. A queue is
//! attached to exactly one worker per pool, the one with the fewest queues
//! at attach time, and stays there until it is detached. Work reaches a
//! worker two ways:
//!
//! - a [`Kicker`] held by the queue sends a kick for that queue
//! - a polling pool also services every attached queue once per interval
//!
//! Detach is synchronous: it returns only after the worker has dropped the
//! queue, so ring memory can be released safely afterwards.

use crate::error::{QdmaError, QdmaResult};
use crate::queue::{Queue, QueueHandle};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What a pool's workers do for their queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    /// Move queued requests into descriptor rings.
    Submit,
    /// Reap writeback credit and completion entries.
    Completion,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Submit => "submit",
            Self::Completion => "cmpl",
        })
    }
}

enum Job {
    Attach(Arc<Queue>),
    Detach(QueueHandle, Sender<()>),
    Kick(QueueHandle),
    Shutdown,
}

/// A queue's binding to one worker.
pub(crate) struct Kicker {
    tx: Sender<Job>,
    handle: QueueHandle,
    worker: usize,
}

impl Kicker {
    /// Ask the worker to service the queue.
    pub(crate) fn kick(&self) {
        let _ = self.tx.send(Job::Kick(self.handle));
    }
}

struct Worker {
    tx: Sender<Job>,
    load: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed set of worker threads sharing one role.
pub struct WorkerPool {
    role: PoolRole,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `count` workers named `<prefix>-<role><n>`.
    ///
    /// # Arguments
    ///
    /// * `prefix` - Thread name prefix, usually the device name
    /// * `role` - What the workers do
    /// * `count` - Number of threads
    /// * `poll` - Service every attached queue at this interval, or only on
    ///   kicks when `None`
    ///
    /// # Errors
    ///
    /// [`QdmaError::InvalidConfig`] for zero workers, [`QdmaError::Io`] if a
    /// thread cannot be spawned.
    pub fn new(
        prefix: &str,
        role: PoolRole,
        count: usize,
        poll: Option<Duration>,
    ) -> QdmaResult<Self> {
        if count == 0 {
            return Err(QdmaError::InvalidConfig(format!(
                "{} pool needs at least one worker",
                role
            )));
        }
        let mut pool = Self {
            role,
            workers: Vec::with_capacity(count),
        };
        for i in 0..count {
            let (tx, rx) = unbounded();
            let load = Arc::new(AtomicUsize::new(0));
            // On error, dropping `pool` stops the workers already running.
            let thread = std::thread::Builder::new()
                .name(format!("{}-{}{}", prefix, role, i))
                .spawn(move || run(rx, role, poll))?;
            pool.workers.push(Worker {
                tx,
                load,
                thread: Some(thread),
            });
        }
        log::debug!("{}: started {} {} workers", prefix, count, role);
        Ok(pool)
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// Attached queues per worker.
    pub fn loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::Acquire))
            .collect()
    }

    /// Bind `queue` to the least-loaded worker.
    ///
    /// # Errors
    ///
    /// [`QdmaError::ResourceExhausted`] after [`shutdown`](Self::shutdown).
    pub(crate) fn attach(&self, queue: &Arc<Queue>) -> QdmaResult<Kicker> {
        let (worker, w) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.thread.is_some())
            .min_by_key(|(_, w)| w.load.load(Ordering::Acquire))
            .ok_or_else(|| QdmaError::ResourceExhausted(format!("no {} worker", self.role)))?;
        w.load.fetch_add(1, Ordering::AcqRel);
        let _ = w.tx.send(Job::Attach(Arc::clone(queue)));
        Ok(Kicker {
            tx: w.tx.clone(),
            handle: queue.handle(),
            worker,
        })
    }

    /// Unbind a queue and wait until its worker has let go of it.
    pub(crate) fn detach(&self, kicker: Kicker) {
        let Some(w) = self.workers.get(kicker.worker) else {
            return;
        };
        let (ack_tx, ack_rx) = unbounded();
        if w.tx.send(Job::Detach(kicker.handle, ack_tx)).is_ok() {
            // A worker that already exited drops the ack sender.
            let _ = ack_rx.recv();
        }
        w.load.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stop and join every worker.
    pub fn shutdown(&mut self) {
        for w in &self.workers {
            let _ = w.tx.send(Job::Shutdown);
        }
        for w in &mut self.workers {
            if let Some(thread) = w.thread.take() {
                if thread.join().is_err() {
                    log::error!("{} worker panicked", self.role);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service(role: PoolRole, queue: &Queue) {
    match role {
        PoolRole::Submit => queue.service_submit(),
        PoolRole::Completion => queue.service_completion(),
    }
}

fn run(rx: Receiver<Job>, role: PoolRole, poll: Option<Duration>) {
    let mut queues: Vec<Arc<Queue>> = Vec::new();
    let mut last_poll = Instant::now();
    loop {
        let job = match poll {
            Some(interval) => match rx.recv_timeout(interval.saturating_sub(last_poll.elapsed()))
            {
                Ok(job) => Some(job),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(job) => Some(job),
                Err(_) => break,
            },
        };

        match job {
            Some(Job::Attach(queue)) => queues.push(queue),
            Some(Job::Detach(handle, ack)) => {
                queues.retain(|q| q.handle() != handle);
                let _ = ack.send(());
            }
            Some(Job::Kick(handle)) => {
                if let Some(q) = queues.iter().find(|q| q.handle() == handle) {
                    service(role, q);
                }
            }
            Some(Job::Shutdown) => break,
            None => {}
        }

        if let Some(interval) = poll {
            if last_poll.elapsed() >= interval {
                for q in &queues {
                    service(role, q);
                }
                last_poll = Instant::now();
            }
        }
    }
}
