// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device context: one opened QDMA function.
//!
//! A [`Device`] ties together everything a function needs to move data:
//!
//! | Piece | Privileged function | Restricted function |
//! |-------|---------------------|---------------------|
//! | queue range | from [`DeviceConfig`] | granted by the owner on `Hello` |
//! | context programming | indirect registers | proxied over the mailbox |
//! | CSR tables | read from registers | fetched with the `Csr` opcode |
//! | mailbox | server, when partitioning | client |
//!
//! Queue lifecycle operations take the device table lock only for slot and
//! vector bookkeeping; context programming and draining run without it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use qdma_rust::{Backend, Device, DeviceConfig, Direction, QueueConfig, Request, SgEntry};
//! use qdma_rust::emu::{EmulatedDevice, EmulatorConfig};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), qdma_rust::QdmaError> {
//!     let emu = Arc::new(EmulatedDevice::new(EmulatorConfig::default()));
//!     let device = Device::open(DeviceConfig::default(), Backend::new(emu.clone(), emu.dma()))?;
//!
//!     let h2c = device.add_queue(QueueConfig::mm(Direction::H2c))?;
//!     device.start_queue(h2c)?;
//!
//!     let buf = device.dma().alloc(4096, "payload")?;
//!     let token = device.submit(h2c, Request::write(vec![SgEntry::whole(buf)]).with_ep_addr(0))?;
//!     token.wait()?;
//!     device.close()
//! }
//! ```

use crate::c2h::{C2hRings, PeekInfo};
use crate::context::{
    ContextState, DescSize, PrefetchContext, QueueContext, SwContext, WritebackContext,
};
use crate::csr::GlobalCsr;
use crate::dma::DmaSpace;
use crate::error::{QdmaError, QdmaResult};
use crate::indirect::{ContextProgrammer, DirectProgrammer};
use crate::intr::{CoalRing, IrqMode, VectorBinding, VectorRole, VectorTable, DEFAULT_COAL_RING_IDX};
use crate::lock;
use crate::mailbox::{MailboxClient, MailboxProgrammer, MailboxServer, MailboxTransport};
use crate::partition::{OwnerHandler, PartitionConfig, PartitionEntry, Partitioner, RangeGrant};
use crate::policy::{RetryPolicy, DEFAULT_INDEX_UPDATE_BATCH};
use crate::queue::{
    Direction, Queue, QueueConfig, QueueEnv, QueueHandle, QueueMode, QueueState,
};
use crate::regs::{fmap_reg, FmapEntry, GlobalErrors, RegisterAccess, GLBL_ERR_STAT};
use crate::resource::QueueTable;
use crate::request::{fire_all, CompletionToken, Finished, Request};
use crate::ring::DescRing;
use crate::stats::QueueStats;
use crate::wq::{PoolRole, WorkerPool};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default queues owned by a privileged function.
pub const DEFAULT_QUEUE_MAX: u32 = 64;

/// Default interrupt vectors of a privileged function.
pub const DEFAULT_NUM_VECTORS: u16 = 8;

/// Default completion polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Default extra attempts for idempotent mailbox requests.
pub const DEFAULT_MAILBOX_RETRIES: u32 = 2;

/// Register access level of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionRole {
    /// Owns the device registers and the queue id space.
    #[default]
    Privileged,
    /// Works through the owner's mailbox.
    Restricted,
}

// ============================================================================
// Configuration
// ============================================================================

/// Device-wide settings.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Prefix for queue and thread names.
    pub name: String,
    pub func_id: u8,
    pub role: FunctionRole,
    /// Function id of the owner, for restricted functions.
    pub owner_id: u8,
    /// First hardware queue id. Ignored for restricted functions.
    pub qbase: u32,
    /// Queues owned. A restricted function asks for this many when it
    /// differs from the owner's default share; zero takes the share.
    pub qmax: u32,
    /// Interrupt vectors, reserved ones included. Restricted functions use
    /// the owner's grant instead.
    pub num_vectors: u16,
    pub irq_mode: IrqMode,
    /// Coalescing ring size class.
    pub coal_ring_idx: u8,
    pub submit_workers: usize,
    /// Completion pollers, used in [`IrqMode::Poll`] only.
    pub completion_workers: usize,
    pub poll_interval: Duration,
    /// Completion entries consumed between index updates.
    pub index_batch: u32,
    pub context_policy: RetryPolicy,
    pub mailbox_policy: RetryPolicy,
    /// Bound on waiting for in-flight descriptors when stopping a queue.
    pub drain_policy: RetryPolicy,
    pub mailbox_retries: u32,
    /// Read back every context write.
    pub verify: bool,
    /// Share the queue space with restricted functions (privileged only).
    pub partition: Option<PartitionConfig>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "qdma0".into(),
            func_id: 0,
            role: FunctionRole::Privileged,
            owner_id: 0,
            qbase: 0,
            qmax: DEFAULT_QUEUE_MAX,
            num_vectors: DEFAULT_NUM_VECTORS,
            irq_mode: IrqMode::Poll,
            coal_ring_idx: DEFAULT_COAL_RING_IDX,
            submit_workers: default_workers(),
            completion_workers: default_workers(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            index_batch: DEFAULT_INDEX_UPDATE_BATCH,
            context_policy: RetryPolicy::context(),
            mailbox_policy: RetryPolicy::mailbox(),
            drain_policy: RetryPolicy::drain(),
            mailbox_retries: DEFAULT_MAILBOX_RETRIES,
            verify: false,
            partition: None,
        }
    }
}

impl DeviceConfig {
    /// Privileged function 0 named `name`.
    pub fn privileged(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Restricted function `func_id` that takes the owner's default share.
    pub fn restricted(name: &str, func_id: u8) -> Self {
        Self {
            name: name.into(),
            func_id,
            role: FunctionRole::Restricted,
            qmax: 0,
            num_vectors: 0,
            ..Self::default()
        }
    }

    pub fn with_func_id(mut self, func_id: u8) -> Self {
        self.func_id = func_id;
        self
    }

    pub fn with_queues(mut self, qbase: u32, qmax: u32) -> Self {
        self.qbase = qbase;
        self.qmax = qmax;
        self
    }

    pub fn with_vectors(mut self, num_vectors: u16) -> Self {
        self.num_vectors = num_vectors;
        self
    }

    pub fn with_irq_mode(mut self, mode: IrqMode) -> Self {
        self.irq_mode = mode;
        self
    }

    pub fn with_coal_ring_idx(mut self, idx: u8) -> Self {
        self.coal_ring_idx = idx;
        self
    }

    /// Worker thread counts for submission and completion polling.
    pub fn with_workers(mut self, submit: usize, completion: usize) -> Self {
        self.submit_workers = submit;
        self.completion_workers = completion;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_index_batch(mut self, batch: u32) -> Self {
        self.index_batch = batch;
        self
    }

    pub fn with_context_policy(mut self, policy: RetryPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn with_mailbox_policy(mut self, policy: RetryPolicy, retries: u32) -> Self {
        self.mailbox_policy = policy;
        self.mailbox_retries = retries;
        self
    }

    pub fn with_drain_policy(mut self, policy: RetryPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = Some(partition);
        self
    }

    fn validate(&self) -> QdmaResult<()> {
        if self.index_batch == 0 {
            return Err(QdmaError::InvalidConfig("index_batch is zero".into()));
        }
        match self.role {
            FunctionRole::Privileged => {
                if self.qmax == 0 {
                    return Err(QdmaError::InvalidConfig(
                        "privileged function owns no queues".into(),
                    ));
                }
                if self.partition.is_some() && self.qbase != 0 {
                    return Err(QdmaError::InvalidConfig(format!(
                        "partitioning owner must start at queue 0, not {}",
                        self.qbase
                    )));
                }
            }
            FunctionRole::Restricted => {
                if self.partition.is_some() {
                    return Err(QdmaError::NotPrivileged("partitioning"));
                }
            }
        }
        Ok(())
    }
}

/// Hardware the device runs on.
pub struct Backend {
    pub regs: Arc<dyn RegisterAccess>,
    pub dma: DmaSpace,
    /// Fired vector numbers; polling only when absent.
    pub irq: Option<Receiver<u16>>,
    /// Channel to the owner (restricted) or a first restricted function
    /// (privileged).
    pub mailbox: Option<Arc<dyn MailboxTransport>>,
}

impl Backend {
    pub fn new(regs: Arc<dyn RegisterAccess>, dma: DmaSpace) -> Self {
        Self {
            regs,
            dma,
            irq: None,
            mailbox: None,
        }
    }

    pub fn with_irq(mut self, irq: Receiver<u16>) -> Self {
        self.irq = Some(irq);
        self
    }

    pub fn with_mailbox(mut self, transport: Arc<dyn MailboxTransport>) -> Self {
        self.mailbox = Some(transport);
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

enum MailboxRole {
    None,
    Owner {
        server: Arc<MailboxServer>,
        handler: Arc<OwnerHandler>,
    },
    Client(Arc<MailboxClient>),
}

/// Guarded by the device lock.
struct DeviceTables {
    queues: QueueTable,
    vectors: VectorTable,
    coal: Vec<CoalRing>,
}

/// State reachable from the interrupt thread.
struct DeviceShared {
    name: String,
    func_id: u8,
    privileged: bool,
    regs: Arc<dyn RegisterAccess>,
    dma: DmaSpace,
    csr: GlobalCsr,
    programmer: Arc<dyn ContextProgrammer>,
    mailbox: MailboxRole,
    env: QueueEnv,
    drain_policy: RetryPolicy,
    tables: Mutex<DeviceTables>,
}

impl DeviceShared {
    fn queue(&self, handle: QueueHandle) -> QdmaResult<Arc<Queue>> {
        lock(&self.tables)
            .queues
            .get(handle)
            .cloned()
            .ok_or_else(|| QdmaError::InvalidConfig(format!("no queue {} on {}", handle, self.name)))
    }

    /// Handle one fired vector.
    fn dispatch(&self, vector: u16) {
        let role = lock(&self.tables).vectors.role(vector, self.privileged);
        match role {
            Some(VectorRole::Error) => self.service_errors(),
            Some(VectorRole::Mailbox) => match &self.mailbox {
                MailboxRole::Owner { server, .. } => {
                    server.poll_once();
                }
                MailboxRole::Client(client) => {
                    client.poll_once();
                }
                MailboxRole::None => {}
            },
            Some(VectorRole::Data) => {
                for queue in self.queues_for(vector) {
                    queue.service_completion();
                }
            }
            None => log::debug!("{}: ignoring foreign vector {}", self.name, vector),
        }
    }

    /// Queues to service for a data vector: the coalescing ring's entries,
    /// or every queue bound to the vector.
    fn queues_for(&self, vector: u16) -> Vec<Arc<Queue>> {
        let mut tables = lock(&self.tables);
        let DeviceTables {
            queues,
            vectors,
            coal,
        } = &mut *tables;
        let handles = match vectors.mode() {
            IrqMode::Coalesced => match coal.iter_mut().find(|r| r.vector() == vector) {
                Some(ring) => ring.drain(&*self.regs, queues.qbase(), queues.qmax()),
                None => Vec::new(),
            },
            _ => vectors.queues_on(vector).to_vec(),
        };
        handles
            .into_iter()
            .filter_map(|h| queues.get(h).cloned())
            .collect()
    }

    fn service_errors(&self) {
        let bits = self.regs.read32(GLBL_ERR_STAT);
        if bits == 0 {
            return;
        }
        log::error!(
            "{}: global error status {:?}",
            self.name,
            GlobalErrors::from_bits_retain(bits)
        );
        self.regs.write32(GLBL_ERR_STAT, bits);
    }

    /// Contexts for a queue about to go online.
    fn build_context(
        &self,
        queue: &Queue,
        binding: Option<VectorBinding>,
        ring_base: u64,
        c2h: Option<&C2hRings>,
    ) -> QueueContext {
        let cfg = queue.config();
        let geo = queue.geometry();
        let st_c2h = cfg.is_st_c2h();
        let mut ctx = QueueContext {
            sw: SwContext {
                irq_arm: binding.is_some(),
                enable: true,
                fetch_credit: cfg.fetch_credit,
                wbi_check: !st_c2h,
                func_id: self.func_id,
                ring_size_idx: geo.ring_idx,
                desc_size: cfg.desc_size(),
                bypass: cfg.bypass,
                wbk_en: !st_c2h,
                irq_en: binding.is_some() && !st_c2h,
                is_mm: cfg.mode == QueueMode::MemoryMapped,
                base: ring_base,
                ..SwContext::default()
            },
            ..QueueContext::default()
        };
        if let Some(b) = binding {
            ctx.qid_vec.set(queue.direction(), b.vector, b.coalesced);
        }
        if let Some(rings) = c2h {
            ctx.prefetch = Some(PrefetchContext {
                bypass: cfg.bypass,
                buf_size_idx: geo.buf_idx,
                port_id: 0,
                enable: cfg.prefetch,
                valid: true,
            });
            ctx.writeback = Some(WritebackContext {
                stat_desc_en: true,
                irq_en: binding.is_some(),
                trig_mode: cfg.trig_mode,
                func_id: self.func_id,
                timer_idx: cfg.timer_idx,
                counter_idx: cfg.counter_idx,
                color: true,
                ring_size_idx: rings.cmpt_size_idx(),
                entry_size: DescSize::B8,
                base: rings.cmpt_bus_addr(),
                valid: true,
            });
        }
        ctx
    }
}

// ============================================================================
// Interrupt thread
// ============================================================================

struct IrqThread {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl IrqThread {
    fn start(shared: Arc<DeviceShared>, irq: Receiver<u16>) -> QdmaResult<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name(format!("{}-irq", shared.name))
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(irq) -> msg => match msg {
                        Ok(vector) => shared.dispatch(vector),
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("interrupt thread panicked");
            }
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// Resources to give back when a start fails part way.
#[derive(Default)]
struct StartUndo {
    binding: Option<VectorBinding>,
    programmed: bool,
}

/// An opened QDMA function.
pub struct Device {
    shared: Arc<DeviceShared>,
    submit: WorkerPool,
    completion: Option<WorkerPool>,
    irq: Option<IrqThread>,
    closed: bool,
}

impl Device {
    /// Bring up a function.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] for inconsistent settings
    /// - mailbox errors while registering a restricted function
    /// - [`QdmaError::ContextProgramTimeout`] programming coalescing rings
    /// - [`QdmaError::Io`] if a worker thread cannot be spawned
    pub fn open(config: DeviceConfig, backend: Backend) -> QdmaResult<Self> {
        config.validate()?;
        let Backend {
            regs,
            dma,
            irq,
            mailbox,
        } = backend;
        let privileged = config.role == FunctionRole::Privileged;

        let (programmer, mailbox, grant): (Arc<dyn ContextProgrammer>, MailboxRole, RangeGrant) =
            if privileged {
                let mut direct = DirectProgrammer::new(Arc::clone(&regs), config.context_policy);
                direct.set_verify(config.verify);
                let programmer: Arc<dyn ContextProgrammer> = Arc::new(direct);
                regs.write32(
                    fmap_reg(config.func_id),
                    FmapEntry {
                        qbase: config.qbase,
                        qmax: config.qmax,
                    }
                    .encode(),
                );
                let role = match config.partition {
                    Some(part) => {
                        let partitioner = Partitioner::new(part, config.qmax, config.num_vectors)?;
                        let handler = Arc::new(OwnerHandler::new(
                            partitioner,
                            Arc::clone(&programmer),
                            Arc::clone(&regs),
                        ));
                        let server =
                            MailboxServer::start(config.func_id, handler.clone(), config.mailbox_policy)?;
                        if let Some(transport) = mailbox {
                            server.attach(transport);
                        }
                        MailboxRole::Owner { server, handler }
                    }
                    None => {
                        if mailbox.is_some() {
                            return Err(QdmaError::InvalidConfig(
                                "mailbox channels need a partition config".into(),
                            ));
                        }
                        MailboxRole::None
                    }
                };
                let grant = RangeGrant {
                    qbase: config.qbase,
                    qmax: config.qmax,
                    vec_base: 0,
                    vec_count: config.num_vectors,
                };
                (programmer, role, grant)
            } else {
                let transport = mailbox.ok_or_else(|| {
                    QdmaError::InvalidConfig("restricted function needs a mailbox".into())
                })?;
                let client = MailboxClient::start(
                    transport,
                    config.func_id,
                    config.owner_id,
                    config.mailbox_policy,
                    config.mailbox_retries,
                )?;
                let mut grant = client.hello()?;
                if config.qmax != 0 && config.qmax != grant.qmax {
                    grant = match client.assign_range(config.qmax) {
                        Ok(grant) => grant,
                        Err(e) => {
                            let _ = client.bye();
                            return Err(e);
                        }
                    };
                }
                if grant.qmax == 0 {
                    log::warn!("{}: owner granted no queues", config.name);
                }
                let programmer: Arc<dyn ContextProgrammer> =
                    Arc::new(MailboxProgrammer::new(Arc::clone(&client)));
                (programmer, MailboxRole::Client(client), grant)
            };

        // Give a restricted function's range back if anything below fails.
        let registered = scopeguard::guard(&mailbox, |role| {
            if let MailboxRole::Client(client) = role {
                let _ = client.bye();
            }
        });

        let csr = programmer.read_csr()?;

        let reserved = VectorTable::new(grant.vec_base, grant.vec_count, privileged, IrqMode::Poll);
        let mut mode = config
            .irq_mode
            .resolve(reserved.data_vectors(), grant.qmax);
        if irq.is_none() && mode != IrqMode::Poll {
            log::warn!("{}: no interrupt source, falling back to polling", config.name);
            mode = IrqMode::Poll;
        }
        let vectors = VectorTable::new(grant.vec_base, grant.vec_count, privileged, mode);

        let mut coal = Vec::new();
        if mode == IrqMode::Coalesced {
            for vector in vectors.data_vector_ids() {
                let ring = CoalRing::alloc(&dma, vector, config.coal_ring_idx)?;
                programmer.program_coalescing(vector, &ring.context())?;
                coal.push(ring);
            }
        }

        let submit = WorkerPool::new(&config.name, PoolRole::Submit, config.submit_workers, None)?;
        let completion = match mode {
            IrqMode::Poll => Some(WorkerPool::new(
                &config.name,
                PoolRole::Completion,
                config.completion_workers,
                Some(config.poll_interval),
            )?),
            _ => None,
        };

        scopeguard::ScopeGuard::into_inner(registered);
        let shared = Arc::new(DeviceShared {
            name: config.name.clone(),
            func_id: config.func_id,
            privileged,
            env: QueueEnv {
                regs: Arc::clone(&regs),
                index_batch: config.index_batch,
            },
            regs,
            dma,
            csr,
            programmer,
            mailbox,
            drain_policy: config.drain_policy,
            tables: Mutex::new(DeviceTables {
                queues: QueueTable::new(grant.qbase, grant.qmax),
                vectors,
                coal,
            }),
        });

        let irq = match irq {
            Some(rx) => Some(IrqThread::start(Arc::clone(&shared), rx)?),
            None => None,
        };

        log::info!(
            "{}: opened function {} ({:?}), queues [{}, {}), irq {}",
            config.name,
            config.func_id,
            config.role,
            grant.qbase,
            grant.qbase + grant.qmax,
            mode
        );
        Ok(Self {
            shared,
            submit,
            completion,
            irq,
            closed: false,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn func_id(&self) -> u8 {
        self.shared.func_id
    }

    pub fn is_privileged(&self) -> bool {
        self.shared.privileged
    }

    /// Host DMA address space for request buffers.
    pub fn dma(&self) -> &DmaSpace {
        &self.shared.dma
    }

    pub fn csr(&self) -> &GlobalCsr {
        &self.shared.csr
    }

    /// Owned queue range as `(qbase, qmax)`.
    pub fn queue_range(&self) -> (u32, u32) {
        let tables = lock(&self.shared.tables);
        (tables.queues.qbase(), tables.queues.qmax())
    }

    /// Resolved interrupt mode.
    pub fn irq_mode(&self) -> IrqMode {
        lock(&self.shared.tables).vectors.mode()
    }

    /// Enabled queues in one direction.
    pub fn enabled_count(&self, dir: Direction) -> u32 {
        lock(&self.shared.tables).queues.enabled(dir)
    }

    /// Queues attached to each submission worker.
    pub fn submit_loads(&self) -> Vec<usize> {
        self.submit.loads()
    }

    // ========================================================================
    // Queue lifecycle
    // ========================================================================

    /// Add a queue in the `Enabled` state.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] for sizes missing from the CSR tables
    /// - [`QdmaError::NoFreeSlot`], [`QdmaError::ModeConflict`] or
    ///   [`QdmaError::QuotaExceeded`] from slot reservation
    pub fn add_queue(&self, config: QueueConfig) -> QdmaResult<QueueHandle> {
        let shared = &self.shared;
        let geometry = config.resolve(&shared.csr)?;
        let mut tables = lock(&shared.tables);
        let handle = tables.queues.reserve(&config)?;
        let qid = tables.queues.hw_qid(handle.index);
        let queue = Arc::new(Queue::new(
            &shared.name,
            handle,
            qid,
            config,
            geometry,
            shared.env.clone(),
        ));
        log::info!("{}: added queue {} (qid {:#x})", shared.name, queue.name(), qid);
        tables.queues.insert(queue);
        Ok(handle)
    }

    /// Allocate rings, bind a vector, program contexts and go online.
    ///
    /// Everything acquired is released again when a step fails.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::QueueHalted`] for a queue that hit a hardware error
    /// - [`QdmaError::InvalidState`] unless the queue is enabled or stopped
    /// - [`QdmaError::AllocFailed`] when ring or buffer memory runs out
    /// - context programming errors
    pub fn start_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        let shared = &self.shared;
        let queue = shared.queue(handle)?;
        {
            let mut inner = lock(&queue.inner);
            if inner.halted {
                return Err(QdmaError::QueueHalted {
                    name: queue.name().to_string(),
                });
            }
            match inner.state {
                QueueState::Enabled | QueueState::Stopped => {}
                state => {
                    return Err(QdmaError::InvalidState {
                        name: queue.name().to_string(),
                        state,
                        op: "start",
                    })
                }
            }
            inner.state = QueueState::Initialized;
        }

        let mut undo = scopeguard::guard(StartUndo::default(), |undo| {
            self.rollback_start(&queue, undo);
        });

        let binding = lock(&shared.tables).vectors.assign(handle)?;
        undo.binding = binding;

        let geo = *queue.geometry();
        let (ring, c2h) = if queue.config().is_st_c2h() {
            (None, Some(C2hRings::alloc(&shared.dma, &geo)?))
        } else {
            let ring = DescRing::alloc(
                &shared.dma,
                geo.ring_slots,
                geo.desc_size,
                geo.ring_idx,
                "descriptor ring",
            )?;
            (Some(ring), None)
        };
        let ring_base = match (&ring, &c2h) {
            (Some(r), _) => r.bus_addr(),
            (None, Some(rings)) => rings.free.bus_addr(),
            (None, None) => 0,
        };

        let ctx = shared.build_context(&queue, binding, ring_base, c2h.as_ref());
        undo.programmed = true;
        shared.programmer.write(queue.qid(), handle.direction, &ctx)?;

        let submit = self.submit.attach(&queue)?;
        lock(&queue.affinity).submit = Some(submit);
        if let Some(pool) = &self.completion {
            let completion = pool.attach(&queue)?;
            lock(&queue.affinity).completion = Some(completion);
        }

        scopeguard::ScopeGuard::into_inner(undo);
        {
            let mut inner = lock(&queue.inner);
            inner.ring = ring;
            inner.c2h = c2h;
            inner.vector = binding;
            inner.credit = 0;
            inner.ctx_state = ContextState::Programmed;
            inner.state = QueueState::Online;
            if let Some(rings) = inner.c2h.as_ref() {
                queue.arm_c2h(rings, binding.is_some());
            }
        }
        log::info!(
            "{}: queue {} online{}",
            shared.name,
            queue.name(),
            match binding {
                Some(b) if b.coalesced => format!(", coalescing ring {}", b.vector),
                Some(b) => format!(", vector {}", b.vector),
                None => String::new(),
            }
        );
        queue.kick_completion();
        Ok(())
    }

    fn rollback_start(&self, queue: &Arc<Queue>, undo: StartUndo) {
        let shared = &self.shared;
        let handle = queue.handle();
        let affinity = std::mem::take(&mut *lock(&queue.affinity));
        if let Some(k) = affinity.submit {
            self.submit.detach(k);
        }
        if let (Some(k), Some(pool)) = (affinity.completion, &self.completion) {
            pool.detach(k);
        }
        if undo.programmed {
            if let Err(e) = shared.programmer.clear(queue.qid(), handle.direction, queue.mode()) {
                log::warn!("{}: clearing contexts of {}: {}", shared.name, queue.name(), e);
            }
        }
        if let Some(b) = undo.binding {
            lock(&shared.tables).vectors.release(handle, b);
        }
        let mut inner = lock(&queue.inner);
        inner.state = QueueState::Enabled;
        inner.ctx_state = if undo.programmed {
            ContextState::Cleared
        } else {
            inner.ctx_state
        };
        log::warn!("{}: start of {} rolled back", shared.name, queue.name());
    }

    /// Take a queue offline.
    ///
    /// Waits, bounded by the drain policy, for hardware to consume every
    /// descriptor already submitted, then cancels whatever is still
    /// outstanding with [`QdmaError::Canceled`], clears the contexts and
    /// releases ring memory and the vector.
    ///
    /// # Errors
    ///
    /// [`QdmaError::InvalidState`] unless the queue is online; context
    /// programming errors from the clear (the queue is stopped regardless).
    pub fn stop_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        let shared = &self.shared;
        let queue = shared.queue(handle)?;
        let halted = {
            let inner = lock(&queue.inner);
            if inner.state != QueueState::Online {
                return Err(QdmaError::InvalidState {
                    name: queue.name().to_string(),
                    state: inner.state,
                    op: "stop",
                });
            }
            inner.halted
        };

        let affinity = std::mem::take(&mut *lock(&queue.affinity));
        if let Some(k) = affinity.submit {
            self.submit.detach(k);
        }
        if let (Some(k), Some(pool)) = (affinity.completion, &self.completion) {
            pool.detach(k);
        }

        if !halted {
            let drained = shared.drain_policy.poll(|| {
                queue.service_submit();
                queue.service_completion();
                queue.hw_idle().then_some(())
            });
            if drained.is_none() {
                log::warn!(
                    "{}: queue {} still busy after {:?}, canceling",
                    shared.name,
                    queue.name(),
                    shared.drain_policy.timeout
                );
            }
        }

        let (done, binding, ring, c2h) = {
            let mut inner = lock(&queue.inner);
            inner.state = QueueState::Stopped;
            let pending = inner.drain_requests();
            let mut done = Vec::with_capacity(pending.len());
            for p in pending {
                inner.stats.record_error();
                done.push(Finished::err(p, QdmaError::Canceled));
            }
            inner.credit = 0;
            (done, inner.vector.take(), inner.ring.take(), inner.c2h.take())
        };

        // Ring memory stays alive until hardware no longer references it.
        let cleared = shared
            .programmer
            .clear(queue.qid(), handle.direction, queue.mode());
        lock(&queue.inner).ctx_state = ContextState::Cleared;
        drop(ring);
        drop(c2h);
        if let Some(b) = binding {
            lock(&shared.tables).vectors.release(handle, b);
        }
        fire_all(done);
        log::info!("{}: queue {} stopped", shared.name, queue.name());
        cleared
    }

    /// Remove a queue that is enabled or stopped.
    ///
    /// # Errors
    ///
    /// [`QdmaError::InvalidState`] for a queue that is online or starting.
    pub fn remove_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        let shared = &self.shared;
        let mut tables = lock(&shared.tables);
        let queue = tables.queues.get(handle).cloned().ok_or_else(|| {
            QdmaError::InvalidConfig(format!("no queue {} on {}", handle, shared.name))
        })?;
        let state = queue.state();
        if !matches!(state, QueueState::Enabled | QueueState::Stopped) {
            return Err(QdmaError::InvalidState {
                name: queue.name().to_string(),
                state,
                op: "remove",
            });
        }
        tables.queues.remove(handle);
        log::info!("{}: removed queue {}", shared.name, queue.name());
        Ok(())
    }

    // ========================================================================
    // Data path and introspection
    // ========================================================================

    /// The queue behind `handle`.
    pub fn queue(&self, handle: QueueHandle) -> QdmaResult<Arc<Queue>> {
        self.shared.queue(handle)
    }

    /// Handle of hardware queue `qid`.
    pub fn lookup(&self, qid: u32, dir: Direction) -> QdmaResult<QueueHandle> {
        lock(&self.shared.tables).queues.lookup(qid, dir)
    }

    /// Queue a request; see [`Queue::submit`].
    pub fn submit(&self, handle: QueueHandle, req: Request) -> QdmaResult<CompletionToken> {
        self.shared.queue(handle)?.submit(req)
    }

    /// Receive-side state of a streaming C2H queue; all zero while stopped.
    ///
    /// # Errors
    ///
    /// [`QdmaError::InvalidConfig`] for any other kind of queue.
    pub fn peek(&self, handle: QueueHandle) -> QdmaResult<PeekInfo> {
        let queue = self.shared.queue(handle)?;
        if !queue.config().is_st_c2h() {
            return Err(QdmaError::InvalidConfig(format!(
                "peek needs a streaming C2H queue, {} is not",
                queue.name()
            )));
        }
        let inner = lock(&queue.inner);
        Ok(queue.peek_c2h(&inner).unwrap_or_default())
    }

    pub fn stats(&self, handle: QueueHandle) -> QdmaResult<QueueStats> {
        Ok(self.shared.queue(handle)?.stats())
    }

    pub fn clear_stats(&self, handle: QueueHandle) -> QdmaResult<()> {
        self.shared.queue(handle)?.clear_stats();
        Ok(())
    }

    pub fn queue_state(&self, handle: QueueHandle) -> QdmaResult<QueueState> {
        Ok(self.shared.queue(handle)?.state())
    }

    pub fn queue_config(&self, handle: QueueHandle) -> QdmaResult<QueueConfig> {
        Ok(self.shared.queue(handle)?.config().clone())
    }

    /// Vector assignment of an online queue.
    pub fn queue_vector(&self, handle: QueueHandle) -> QdmaResult<Option<VectorBinding>> {
        Ok(lock(&self.shared.queue(handle)?.inner).vector)
    }

    /// Read a queue's contexts back from hardware.
    pub fn read_context(&self, handle: QueueHandle) -> QdmaResult<QueueContext> {
        let queue = self.shared.queue(handle)?;
        self.shared
            .programmer
            .read(queue.qid(), handle.direction, queue.mode())
    }

    // ========================================================================
    // Partitioning
    // ========================================================================

    /// Serve another restricted function on `transport`.
    ///
    /// # Errors
    ///
    /// [`QdmaError::NotPrivileged`] unless this function owns a partition.
    pub fn attach_mailbox(&self, transport: Arc<dyn MailboxTransport>) -> QdmaResult<()> {
        match &self.shared.mailbox {
            MailboxRole::Owner { server, .. } => {
                server.attach(transport);
                Ok(())
            }
            _ => Err(QdmaError::NotPrivileged("serving mailbox channels")),
        }
    }

    /// Snapshot of every registered restricted function.
    ///
    /// # Errors
    ///
    /// [`QdmaError::NotPrivileged`] unless this function owns a partition.
    pub fn partition_table(&self) -> QdmaResult<Vec<PartitionEntry>> {
        match &self.shared.mailbox {
            MailboxRole::Owner { handler, .. } => Ok(handler.table()),
            _ => Err(QdmaError::NotPrivileged("the partition table")),
        }
    }

    /// Ask the owner for a range of `qmax` queues. Only while no queue is
    /// enabled.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] while queues exist or on the owner
    /// - [`QdmaError::Remote`] when the owner cannot fit the range
    pub fn request_queue_range(&self, qmax: u32) -> QdmaResult<RangeGrant> {
        let MailboxRole::Client(client) = &self.shared.mailbox else {
            return Err(QdmaError::InvalidConfig(
                "only a restricted function requests a queue range".into(),
            ));
        };
        let mut tables = lock(&self.shared.tables);
        if !tables.queues.is_empty() {
            return Err(QdmaError::InvalidConfig(
                "queue range can only change while no queue is enabled".into(),
            ));
        }
        let grant = client.assign_range(qmax)?;
        tables.queues.remap(grant.qbase, grant.qmax)?;
        log::info!(
            "{}: queue range now [{}, {})",
            self.shared.name,
            grant.qbase,
            grant.qbase + grant.qmax
        );
        Ok(grant)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop and remove every queue, then release the function.
    ///
    /// # Errors
    ///
    /// The first error hit while stopping a queue; teardown continues past
    /// it.
    pub fn close(mut self) -> QdmaResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> QdmaResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let shared = Arc::clone(&self.shared);

        let queues: Vec<Arc<Queue>> = lock(&shared.tables).queues.iter().cloned().collect();
        let mut first_err = None;
        for queue in queues {
            let handle = queue.handle();
            if queue.state() == QueueState::Online {
                if let Err(e) = self.stop_queue(handle) {
                    log::warn!("{}: stopping {}: {}", shared.name, queue.name(), e);
                    first_err.get_or_insert(e);
                }
            }
            lock(&shared.tables).queues.remove(handle);
        }

        if let Some(irq) = self.irq.as_mut() {
            irq.stop();
        }
        let rings = std::mem::take(&mut lock(&shared.tables).coal);
        for ring in rings {
            if let Err(e) = shared.programmer.clear_coalescing(ring.vector()) {
                log::warn!("{}: clearing coalescing ring {}: {}", shared.name, ring.vector(), e);
            }
        }

        self.submit.shutdown();
        if let Some(pool) = self.completion.as_mut() {
            pool.shutdown();
        }

        match &shared.mailbox {
            MailboxRole::Client(client) => {
                if let Err(e) = client.bye() {
                    log::warn!("{}: bye: {}", shared.name, e);
                }
                client.shutdown();
            }
            MailboxRole::Owner { server, .. } => server.shutdown(),
            MailboxRole::None => {}
        }
        if shared.privileged {
            shared
                .regs
                .write32(fmap_reg(shared.func_id), FmapEntry::default().encode());
        }
        log::info!("{}: closed", shared.name);
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("{}: close failed: {}", self.shared.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSelector;
    use crate::emu::{EmulatedDevice, EmulatorConfig, StreamRoute};
    use crate::mailbox::LocalTransport;
    use crate::error::ErrorKind;
    use crate::queue::H2C_PACKET_MAX;
    use crate::request::SgEntry;
    use std::time::Instant;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn config() -> DeviceConfig {
        DeviceConfig::privileged("t")
            .with_workers(2, 1)
            .with_drain_policy(RetryPolicy::new(
                Duration::from_micros(100),
                Duration::from_millis(20),
            ))
    }

    fn emulated(cfg: EmulatorConfig) -> Arc<EmulatedDevice> {
        Arc::new(EmulatedDevice::new(cfg))
    }

    fn open(emu: &Arc<EmulatedDevice>, cfg: DeviceConfig) -> Device {
        Device::open(cfg, Backend::new(emu.clone(), emu.dma())).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_mm_write_then_read_back() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        let c2h = dev.add_queue(QueueConfig::mm(Direction::C2h)).unwrap();
        dev.start_queue(h2c).unwrap();
        dev.start_queue(c2h).unwrap();
        assert_eq!(dev.queue_state(h2c).unwrap(), QueueState::Online);

        let data = pattern(10_000, 7);
        let src = dev.dma().alloc(data.len(), "src").unwrap();
        src.write(0, &data);
        let done = dev
            .submit(h2c, Request::write(vec![SgEntry::whole(src)]).with_ep_addr(0x1000))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(done.bytes, data.len());
        assert_eq!(emu.card_read(0x1000, data.len()).unwrap(), data);

        let dst = dev.dma().alloc(data.len(), "dst").unwrap();
        dev.submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]).with_ep_addr(0x1000))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(dst.to_vec(), data);

        let stats = dev.stats(h2c).unwrap();
        assert_eq!(stats.bytes, data.len() as u64);
        dev.clear_stats(h2c).unwrap();
        assert_eq!(dev.stats(h2c).unwrap().bytes, 0);
        dev.close().unwrap();
        assert_eq!(emu.fmap(0), FmapEntry::default());
    }

    #[test]
    fn test_seventy_requests_on_sixty_four_slots() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        dev.start_queue(h2c).unwrap();
        let queue = dev.queue(h2c).unwrap();

        emu.hold();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tokens = Vec::new();
        for i in 0..70usize {
            let buf = dev.dma().alloc(64, "src").unwrap();
            let order = Arc::clone(&order);
            let req = Request::write(vec![SgEntry::whole(buf)])
                .with_ep_addr(i as u64 * 64)
                .with_callback(move |_| lock(&order).push(i));
            tokens.push(dev.submit(h2c, req).unwrap());
        }
        assert!(wait_until(|| {
            let inner = lock(&queue.inner);
            inner.ring.as_ref().is_some_and(|r| r.in_flight() == 64) && inner.work.len() == 6
        }));
        assert!(lock(&queue.inner).ring.as_ref().unwrap().invariant_holds());

        emu.release();
        for token in tokens {
            token.wait().unwrap();
        }
        assert_eq!(*lock(&order), (0..70).collect::<Vec<_>>());
        assert!(queue.hw_idle());
    }

    #[test]
    fn test_st_c2h_burst_fills_request() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let c2h = dev
            .add_queue(QueueConfig::st(Direction::C2h).with_ring_size(16).with_buf_size(256))
            .unwrap();
        dev.start_queue(c2h).unwrap();
        assert_eq!(dev.peek(c2h).unwrap().posted_buffers, 16);
        let qid = dev.queue(c2h).unwrap().qid();

        let dst = dev.dma().alloc(4096, "dst").unwrap();
        let token = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]))
            .unwrap();
        let data = pattern(4096, 3);
        for (i, chunk) in data.chunks(256).enumerate() {
            emu.inject_c2h(qid, chunk, i == 15);
        }
        let done = token.wait().unwrap();
        assert_eq!(done.bytes, 4096);
        assert!(done.eot);
        assert_eq!(dst.to_vec(), data);

        let peek = dev.peek(c2h).unwrap();
        assert_eq!(peek.pending_bytes, 0);
        assert_eq!(peek.posted_buffers, 16);
        assert!(dev.peek(dev.add_queue(QueueConfig::st(Direction::H2c)).unwrap()).is_err());
    }

    #[test]
    fn test_canceled_st_read_passes_packet_on() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let c2h = dev
            .add_queue(QueueConfig::st(Direction::C2h).with_ring_size(16).with_buf_size(256))
            .unwrap();
        dev.start_queue(c2h).unwrap();
        let qid = dev.queue(c2h).unwrap().qid();

        let a = dev.dma().alloc(1024, "a").unwrap();
        let b = dev.dma().alloc(1024, "b").unwrap();
        let token_a = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(a.clone())]))
            .unwrap();
        token_a.cancel();
        let token_b = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(b.clone())]))
            .unwrap();

        let data = pattern(256, 11);
        emu.inject_c2h(qid, &data, true);

        assert!(matches!(token_a.wait(), Err(QdmaError::Canceled)));
        let done = token_b.wait().unwrap();
        assert_eq!(done.bytes, 256);
        assert!(done.eot);
        assert_eq!(&b.to_vec()[..256], &data[..]);
        assert_eq!(a.to_vec(), vec![0u8; 1024]);

        let stats = dev.stats(c2h).unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_st_c2h_packets_across_completion_ring_wrap() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let c2h = dev
            .add_queue(QueueConfig::st(Direction::C2h).with_ring_size(16).with_buf_size(256))
            .unwrap();
        dev.start_queue(c2h).unwrap();
        let qid = dev.queue(c2h).unwrap().qid();

        // Three times around a 33-slot completion ring.
        const PACKETS: usize = 100;
        for i in 0..PACKETS {
            let dst = dev.dma().alloc(512, "dst").unwrap();
            let token = dev
                .submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]))
                .unwrap();
            let data = pattern(100, i as u8);
            emu.inject_c2h(qid, &data, true);
            let done = token.wait().unwrap();
            assert_eq!(done.bytes, 100, "packet {}", i);
            assert!(done.eot);
            assert_eq!(&dst.to_vec()[..100], &data[..], "packet {}", i);
        }

        let stats = dev.stats(c2h).unwrap();
        assert_eq!(stats.packets, PACKETS as u64);
        assert_eq!(stats.bytes, (PACKETS * 100) as u64);
        assert_eq!(stats.errors, 0);
        let peek = dev.peek(c2h).unwrap();
        assert_eq!(peek.pending_bytes, 0);
        assert_eq!(peek.posted_buffers, 16);
        assert_eq!(dev.queue_state(c2h).unwrap(), QueueState::Online);
    }

    #[test]
    fn test_error_completion_halts_until_readded() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let cfg = QueueConfig::st(Direction::C2h).with_ring_size(16).with_buf_size(256);
        let c2h = dev.add_queue(cfg.clone()).unwrap();
        dev.start_queue(c2h).unwrap();
        let qid = dev.queue(c2h).unwrap().qid();

        let dst = dev.dma().alloc(256, "dst").unwrap();
        let token = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]))
            .unwrap();
        emu.inject_c2h_error(qid);
        let err = token.wait().unwrap_err();
        assert!(matches!(err, QdmaError::CompletionError { .. }));

        let err = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]))
            .unwrap_err();
        assert!(matches!(err, QdmaError::QueueHalted { .. }));
        assert!(matches!(
            dev.remove_queue(c2h),
            Err(QdmaError::InvalidState { .. })
        ));

        dev.stop_queue(c2h).unwrap();
        assert!(matches!(dev.start_queue(c2h), Err(QdmaError::QueueHalted { .. })));
        dev.remove_queue(c2h).unwrap();
        assert_eq!(dev.enabled_count(Direction::C2h), 0);

        let c2h = dev.add_queue(cfg).unwrap();
        dev.start_queue(c2h).unwrap();
        let qid = dev.queue(c2h).unwrap().qid();
        let token = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst)]))
            .unwrap();
        emu.inject_c2h(qid, &[5u8; 256], true);
        assert_eq!(token.wait().unwrap().bytes, 256);
    }

    #[test]
    fn test_start_rolls_back_on_alloc_failure() {
        init_logger();
        let emu = emulated(EmulatorConfig::default().with_dma_limit(64 * 1024));
        let dev = open(
            &emu,
            config()
                .with_vectors(4)
                .with_irq_mode(IrqMode::Direct)
                .with_poll_interval(Duration::from_millis(1)),
        );
        // No interrupt source: the device polls.
        assert_eq!(dev.irq_mode(), IrqMode::Poll);

        let c2h = dev.add_queue(QueueConfig::st(Direction::C2h)).unwrap();
        let before = dev.dma().allocated();
        let err = dev.start_queue(c2h).unwrap_err();
        assert!(matches!(err, QdmaError::AllocFailed { .. }));
        assert_eq!(dev.queue_state(c2h).unwrap(), QueueState::Enabled);
        assert_eq!(dev.dma().allocated(), before);
        assert_eq!(dev.submit_loads().iter().sum::<usize>(), 0);
        let qid = dev.queue(c2h).unwrap().qid();
        assert!(emu.context(qid, ContextSelector::sw(Direction::C2h)).is_none());
        dev.remove_queue(c2h).unwrap();
    }

    #[test]
    fn test_start_rolls_back_on_context_timeout() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(
            &emu,
            config().with_context_policy(RetryPolicy::new(
                Duration::from_micros(10),
                Duration::from_millis(5),
            )),
        );
        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        let before = dev.dma().allocated();
        emu.stall_context_busy(true);
        let err = dev.start_queue(h2c).unwrap_err();
        assert!(matches!(err, QdmaError::ContextProgramTimeout { .. }));
        emu.stall_context_busy(false);
        assert_eq!(dev.queue_state(h2c).unwrap(), QueueState::Enabled);
        assert_eq!(dev.dma().allocated(), before);

        dev.start_queue(h2c).unwrap();
        assert_eq!(dev.submit_loads().iter().sum::<usize>(), 1);
    }

    #[test]
    fn test_stop_cancels_outstanding_requests() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        dev.start_queue(h2c).unwrap();
        assert!(matches!(
            dev.remove_queue(h2c),
            Err(QdmaError::InvalidState { state: QueueState::Online, .. })
        ));

        emu.hold();
        let buf = dev.dma().alloc(512, "src").unwrap();
        let token = dev
            .submit(h2c, Request::write(vec![SgEntry::whole(buf.clone())]))
            .unwrap();
        dev.stop_queue(h2c).unwrap();
        assert!(matches!(token.wait(), Err(QdmaError::Canceled)));
        assert_eq!(dev.queue_state(h2c).unwrap(), QueueState::Stopped);
        assert!(matches!(
            dev.submit(h2c, Request::write(vec![SgEntry::whole(buf)])),
            Err(QdmaError::QueueNotOnline { .. })
        ));
        emu.release();

        // A stopped queue starts again on fresh rings.
        dev.start_queue(h2c).unwrap();
        let buf = dev.dma().alloc(512, "src").unwrap();
        dev.submit(h2c, Request::write(vec![SgEntry::whole(buf)]))
            .unwrap()
            .wait()
            .unwrap();
        dev.stop_queue(h2c).unwrap();
        dev.remove_queue(h2c).unwrap();
    }

    #[test]
    fn test_corrupt_writeback_halts_queue() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        dev.start_queue(h2c).unwrap();
        let qid = dev.queue(h2c).unwrap().qid();

        emu.corrupt_writeback(qid, Direction::H2c);
        let buf = dev.dma().alloc(64, "src").unwrap();
        let err = dev
            .submit(h2c, Request::write(vec![SgEntry::whole(buf)]))
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, QdmaError::RingCorrupt { .. }));
        assert!(dev.queue(h2c).unwrap().is_halted());
    }

    #[test]
    fn test_direct_interrupts_complete_requests() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let backend = Backend::new(emu.clone(), emu.dma()).with_irq(emu.subscribe_irq(0, 8));
        let dev = Device::open(
            config().with_vectors(8).with_irq_mode(IrqMode::Direct),
            backend,
        )
        .unwrap();
        assert_eq!(dev.irq_mode(), IrqMode::Direct);

        let a = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        let b = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        dev.start_queue(a).unwrap();
        dev.start_queue(b).unwrap();
        let va = dev.queue_vector(a).unwrap().unwrap();
        let vb = dev.queue_vector(b).unwrap().unwrap();
        assert!(!va.coalesced);
        assert_eq!((va.vector, vb.vector), (2, 3));
        let ctx = dev.read_context(a).unwrap();
        assert_eq!(ctx.qid_vec.get(Direction::H2c), (2, false));
        assert!(ctx.sw.irq_en);

        for h in [a, b] {
            let buf = dev.dma().alloc(256, "src").unwrap();
            dev.submit(h, Request::write(vec![SgEntry::whole(buf)]))
                .unwrap()
                .wait_timeout(Duration::from_secs(5))
                .unwrap();
        }

        emu.raise_error(GlobalErrors::DSC, 0);
        assert!(wait_until(|| emu.read32(GLBL_ERR_STAT) == 0));
    }

    #[test]
    fn test_coalesced_interrupts_complete_requests() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let backend = Backend::new(emu.clone(), emu.dma()).with_irq(emu.subscribe_irq(0, 4));
        let dev = Device::open(
            config()
                .with_queues(0, 8)
                .with_vectors(4)
                .with_irq_mode(IrqMode::Auto),
            backend,
        )
        .unwrap();
        // Two data vectors for eight queues.
        assert_eq!(dev.irq_mode(), IrqMode::Coalesced);
        assert!(emu.context(2, ContextSelector::Coalesce).is_some());

        let h2c = dev.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        let c2h = dev
            .add_queue(QueueConfig::st(Direction::C2h).with_ring_size(16).with_buf_size(256))
            .unwrap();
        dev.start_queue(h2c).unwrap();
        dev.start_queue(c2h).unwrap();
        assert!(dev.queue_vector(h2c).unwrap().unwrap().coalesced);

        let buf = dev.dma().alloc(1024, "src").unwrap();
        dev.submit(h2c, Request::write(vec![SgEntry::whole(buf)]))
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();

        let qid = dev.queue(c2h).unwrap().qid();
        let dst = dev.dma().alloc(300, "dst").unwrap();
        let token = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst)]))
            .unwrap();
        emu.inject_c2h(qid, &[9u8; 300], true);
        assert_eq!(token.wait_timeout(Duration::from_secs(5)).unwrap().bytes, 300);

        dev.close().unwrap();
        assert!(emu.context(2, ContextSelector::Coalesce).is_none());
    }

    #[test]
    fn test_st_loopback() {
        init_logger();
        let emu = emulated(EmulatorConfig::default().with_stream(StreamRoute::Loopback));
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::st(Direction::H2c).with_index(0)).unwrap();
        let c2h = dev.add_queue(QueueConfig::st(Direction::C2h).with_index(0)).unwrap();
        dev.start_queue(h2c).unwrap();
        dev.start_queue(c2h).unwrap();

        let data = pattern(6000, 11);
        let dst = dev.dma().alloc(8192, "dst").unwrap();
        let rx = dev
            .submit(c2h, Request::read(vec![SgEntry::whole(dst.clone())]))
            .unwrap();
        let src = dev.dma().alloc(data.len(), "src").unwrap();
        src.write(0, &data);
        dev.submit(h2c, Request::write(vec![SgEntry::whole(src)]))
            .unwrap()
            .wait()
            .unwrap();
        let done = rx.wait().unwrap();
        assert_eq!(done.bytes, data.len());
        let mut got = vec![0u8; data.len()];
        dst.read(0, &mut got);
        assert_eq!(got, data);
    }

    #[test]
    fn test_st_h2c_rejects_oversized_packet() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let dev = open(&emu, config());
        let h2c = dev.add_queue(QueueConfig::st(Direction::H2c)).unwrap();
        dev.start_queue(h2c).unwrap();

        let big = dev.dma().alloc(H2C_PACKET_MAX + 1, "src").unwrap();
        let err = dev
            .submit(h2c, Request::write(vec![SgEntry::whole(big)]))
            .unwrap_err();
        assert!(matches!(
            err,
            QdmaError::RequestTooLarge {
                len,
                max: H2C_PACKET_MAX
            } if len == H2C_PACKET_MAX + 1
        ));
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(dev.stats(h2c).unwrap().descriptors, 0);

        let max = dev.dma().alloc(H2C_PACKET_MAX, "src").unwrap();
        let done = dev
            .submit(h2c, Request::write(vec![SgEntry::whole(max)]))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(done.bytes, H2C_PACKET_MAX);
    }

    #[test]
    fn test_restricted_function_over_mailbox() {
        init_logger();
        let emu = emulated(EmulatorConfig::default());
        let part = PartitionConfig {
            total_queues: 64,
            max_callers: 2,
            vectors_per_caller: 4,
        };
        let pf = open(&emu, config().with_queues(0, 32).with_partition(part));

        let (owner_end, vf_end) = LocalTransport::pair();
        pf.attach_mailbox(Arc::new(owner_end)).unwrap();
        let vf_cfg = DeviceConfig::restricted("vf1", 1)
            .with_workers(1, 1)
            .with_mailbox_policy(
                RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(2)),
                1,
            );
        let vf = Device::open(
            vf_cfg,
            Backend::new(emu.clone(), emu.dma()).with_mailbox(Arc::new(vf_end)),
        )
        .unwrap();
        assert!(!vf.is_privileged());
        assert_eq!(vf.queue_range(), (32, 16));
        assert_eq!(emu.fmap(1), FmapEntry { qbase: 32, qmax: 16 });
        assert_eq!(vf.csr(), pf.csr());
        let table = pf.partition_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].func_id, 1);
        assert!(vf.partition_table().is_err());

        let h2c = vf.add_queue(QueueConfig::mm(Direction::H2c)).unwrap();
        vf.start_queue(h2c).unwrap();
        assert_eq!(vf.queue(h2c).unwrap().qid(), 32);
        let data = pattern(2048, 1);
        let src = vf.dma().alloc(data.len(), "src").unwrap();
        src.write(0, &data);
        vf.submit(h2c, Request::write(vec![SgEntry::whole(src)]).with_ep_addr(0x8000))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(emu.card_read(0x8000, data.len()).unwrap(), data);
        assert!(vf.read_context(h2c).unwrap().sw.enable);

        // The range is fixed while a queue exists.
        assert!(vf.request_queue_range(8).is_err());
        vf.stop_queue(h2c).unwrap();
        vf.remove_queue(h2c).unwrap();
        let grant = vf.request_queue_range(8).unwrap();
        assert_eq!(grant.qmax, 8);
        assert_eq!(vf.queue_range(), (grant.qbase, 8));

        vf.close().unwrap();
        assert!(pf.partition_table().unwrap().is_empty());
        assert_eq!(emu.fmap(1), FmapEntry::default());
    }

    #[test]
    fn test_config_validation() {
        let emu = emulated(EmulatorConfig::default());
        let err = Device::open(
            config().with_queues(0, 0),
            Backend::new(emu.clone(), emu.dma()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, QdmaError::InvalidConfig(_)));

        let err = Device::open(
            config().with_queues(4, 8).with_partition(PartitionConfig::default()),
            Backend::new(emu.clone(), emu.dma()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, QdmaError::InvalidConfig(_)));

        let err = Device::open(
            DeviceConfig::restricted("vf", 1),
            Backend::new(emu.clone(), emu.dma()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, QdmaError::InvalidConfig(_)));
    }
}
