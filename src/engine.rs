// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level QDMA engine API.

use crate::device::{Backend, Device, DeviceConfig};
use crate::dma::{DmaBuffer, DmaSpace};
use crate::emu::{EmulatedDevice, EmulatorConfig};
use crate::error::{QdmaError, QdmaResult};
use crate::queue::{Direction, QueueConfig, QueueHandle, QueueMode};
use crate::request::{CompletionToken, Request, SgEntry};
use std::sync::Arc;

/// High-level QDMA engine providing blocking transfers on top of a
/// [`Device`].
///
/// `QdmaEngine` owns an opened function and, when brought up on the
/// emulator, the emulated hardware behind it. Queue lifecycle calls are
/// forwarded to the device; [`write`](Self::write) and
/// [`read`](Self::read) stage data through DMA buffers and wait for
/// completion.
///
/// # Example
///
/// ```rust,no_run
/// use qdma_rust::{DeviceConfig, Direction, QdmaEngine, QdmaError, QueueConfig};
/// use qdma_rust::emu::EmulatorConfig;
///
/// fn main() -> Result<(), QdmaError> {
///     let engine = QdmaEngine::open_emulated(DeviceConfig::default(), EmulatorConfig::default())?;
///
///     let h2c = engine.add_and_start(QueueConfig::mm(Direction::H2c))?;
///     let c2h = engine.add_and_start(QueueConfig::mm(Direction::C2h))?;
///
///     engine.write(h2c, 0x1000, b"Hello, QDMA!")?;
///     let back = engine.read(c2h, 0x1000, 12)?;
///     assert_eq!(back, b"Hello, QDMA!");
///
///     engine.close()
/// }
/// ```
pub struct QdmaEngine {
    device: Device,
    emulator: Option<Arc<EmulatedDevice>>,
}

impl QdmaEngine {
    /// Open a function on the given hardware backend.
    ///
    /// # Errors
    ///
    /// Any error of [`Device::open`].
    pub fn open(config: DeviceConfig, backend: Backend) -> QdmaResult<Self> {
        Ok(Self {
            device: Device::open(config, backend)?,
            emulator: None,
        })
    }

    /// Open a function on a fresh emulated device.
    ///
    /// The device's interrupt thread is subscribed to the first
    /// `config.num_vectors` vectors, so every [`IrqMode`](crate::IrqMode)
    /// works as on hardware.
    ///
    /// # Errors
    ///
    /// Any error of [`Device::open`].
    pub fn open_emulated(config: DeviceConfig, emu: EmulatorConfig) -> QdmaResult<Self> {
        let emulator = Arc::new(EmulatedDevice::new(emu));
        let backend = Backend::new(emulator.clone(), emulator.dma())
            .with_irq(emulator.subscribe_irq(0, config.num_vectors));
        log::debug!(
            "{}: emulated function with {} vectors",
            config.name,
            emulator.vectors()
        );
        Ok(Self {
            device: Device::open(config, backend)?,
            emulator: Some(emulator),
        })
    }

    /// Get a reference to the underlying device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The emulated hardware, if the engine runs on it.
    pub fn emulator(&self) -> Option<&Arc<EmulatedDevice>> {
        self.emulator.as_ref()
    }

    pub fn dma(&self) -> &DmaSpace {
        self.device.dma()
    }

    /// Allocate a zeroed DMA buffer for use in requests.
    ///
    /// # Errors
    ///
    /// [`QdmaError::AllocFailed`] for a zero length or an exhausted space.
    pub fn alloc(&self, len: usize) -> QdmaResult<DmaBuffer> {
        self.device.dma().alloc(len, "request buffer")
    }

    // ========================================================================
    // Queue lifecycle
    // ========================================================================

    /// See [`Device::add_queue`].
    pub fn add_queue(&self, config: QueueConfig) -> QdmaResult<QueueHandle> {
        self.device.add_queue(config)
    }

    /// See [`Device::start_queue`].
    pub fn start_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        self.device.start_queue(handle)
    }

    /// See [`Device::stop_queue`].
    pub fn stop_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        self.device.stop_queue(handle)
    }

    /// See [`Device::remove_queue`].
    pub fn remove_queue(&self, handle: QueueHandle) -> QdmaResult<()> {
        self.device.remove_queue(handle)
    }

    /// Add a queue and bring it online. A queue that fails to start is
    /// removed again.
    ///
    /// # Errors
    ///
    /// Any error of [`Device::add_queue`] or [`Device::start_queue`].
    pub fn add_and_start(&self, config: QueueConfig) -> QdmaResult<QueueHandle> {
        let handle = self.device.add_queue(config)?;
        if let Err(e) = self.device.start_queue(handle) {
            let _ = self.device.remove_queue(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// See [`Device::submit`].
    pub fn submit(&self, handle: QueueHandle, req: Request) -> QdmaResult<CompletionToken> {
        self.device.submit(handle, req)
    }

    // ========================================================================
    // Blocking transfers
    // ========================================================================

    /// Copy `data` to card memory at `ep_addr` through MM H2C queue `handle`.
    ///
    /// # Arguments
    ///
    /// * `handle` - Online memory-mapped H2C queue
    /// * `ep_addr` - Card address of the first byte
    /// * `data` - Bytes to transfer
    ///
    /// # Returns
    ///
    /// The number of bytes transferred.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] for a streaming queue
    /// - [`QdmaError::DirectionMismatch`] for a C2H queue
    /// - any submission or completion error of the queue
    pub fn write(&self, handle: QueueHandle, ep_addr: u64, data: &[u8]) -> QdmaResult<usize> {
        self.require_mm(handle, Direction::H2c)?;
        if data.is_empty() {
            return Ok(0);
        }
        let buf = self.device.dma().alloc(data.len(), "write staging")?;
        buf.write(0, data);
        let done = self
            .device
            .submit(
                handle,
                Request::write(vec![SgEntry::whole(buf)]).with_ep_addr(ep_addr),
            )?
            .wait()?;
        Ok(done.bytes)
    }

    /// Read `len` bytes of card memory at `ep_addr` through MM C2H queue
    /// `handle`.
    ///
    /// # Errors
    ///
    /// - [`QdmaError::InvalidConfig`] for a streaming queue
    /// - [`QdmaError::DirectionMismatch`] for an H2C queue
    /// - any submission or completion error of the queue
    pub fn read(&self, handle: QueueHandle, ep_addr: u64, len: usize) -> QdmaResult<Vec<u8>> {
        self.require_mm(handle, Direction::C2h)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let buf = self.device.dma().alloc(len, "read staging")?;
        let done = self
            .device
            .submit(
                handle,
                Request::read(vec![SgEntry::whole(buf.clone())]).with_ep_addr(ep_addr),
            )?
            .wait()?;
        let mut out = vec![0u8; done.bytes];
        buf.read(0, &mut out);
        Ok(out)
    }

    fn require_mm(&self, handle: QueueHandle, dir: Direction) -> QdmaResult<()> {
        let queue = self.device.queue(handle)?;
        if queue.mode() != QueueMode::MemoryMapped {
            return Err(QdmaError::InvalidConfig(format!(
                "{} is not a memory-mapped queue",
                queue.name()
            )));
        }
        if queue.direction() != dir {
            return Err(QdmaError::DirectionMismatch {
                name: queue.name().to_string(),
                queue: queue.direction(),
                requested: dir,
            });
        }
        Ok(())
    }

    /// Stop every queue and release the function.
    ///
    /// # Errors
    ///
    /// See [`Device::close`].
    pub fn close(self) -> QdmaResult<()> {
        self.device.close()
    }
}
