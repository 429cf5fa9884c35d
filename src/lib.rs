// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # QDMA (Queue DMA) Engine Rust Bindings
//!
//! This crate drives a queue-based DMA engine that moves data between host
//! memory and a PCIe-attached accelerator card. Thousands of logical queues
//! share a small number of descriptor rings and interrupt vectors, and a
//! privileged function can hand out queue ranges to restricted functions
//! over a mailbox.
//!
//! ## Supported Operations
//!
//! - Memory-mapped transfers to and from card memory
//! - Streaming host-to-card packets
//! - Streaming card-to-host receive with a free-buffer ring and completion
//!   ring
//! - Polled, direct and coalesced interrupt completion
//! - Queue range partitioning between privileged and restricted functions
//!
//! ## Backends
//!
//! | Backend | Registers | DMA memory |
//! |---------|-----------|------------|
//! | Linux MMIO | `MmioRegisters` over a BAR resource file | caller supplied [`DmaSpace`] |
//! | Emulator | [`emu::EmulatedDevice`] | emulator's [`DmaSpace`] |
//!
//! The emulator implements the same register, context, ring, completion
//! and interrupt behaviour as the hardware and supports fault injection,
//! so everything above the register layer runs unchanged on it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use qdma_rust::{DeviceConfig, Direction, QdmaEngine, QdmaError, QueueConfig};
//! use qdma_rust::emu::EmulatorConfig;
//!
//! fn main() -> Result<(), QdmaError> {
//!     // Bring up a privileged function on the emulator
//!     let engine = QdmaEngine::open_emulated(DeviceConfig::default(), EmulatorConfig::default())?;
//!
//!     // One memory-mapped queue pair
//!     let h2c = engine.add_and_start(QueueConfig::mm(Direction::H2c))?;
//!     let c2h = engine.add_and_start(QueueConfig::mm(Direction::C2h))?;
//!
//!     engine.write(h2c, 0x0, b"Hello, QDMA!")?;
//!     let data = engine.read(c2h, 0x0, 12)?;
//!     println!("{}", String::from_utf8_lossy(&data));
//!     engine.close()
//! }
//! ```
//!
//! ## Requirements
//!
//! ### Hardware
//! - A QDMA-capable PCIe card with its config BAR exposed to userspace
//!
//! ### Software
//! - Linux for the MMIO backend
//! - Any platform for the emulator

use std::sync::{Mutex, MutexGuard, PoisonError};

// Module declarations
pub mod c2h;
pub mod context;
pub mod csr;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod emu;
pub mod engine;
pub mod error;
pub mod indirect;
pub mod intr;
pub mod mailbox;
pub mod opcode;
pub mod partition;
pub mod policy;
pub mod queue;
pub mod regs;
pub mod request;
pub mod resource;
pub mod ring;
pub mod stats;
pub mod submit;
pub mod wq;

// Re-exports for convenient access
pub use c2h::PeekInfo;
pub use context::{ContextSelector, QueueContext};
pub use csr::GlobalCsr;
pub use device::{Backend, Device, DeviceConfig, FunctionRole};
pub use dma::{DmaBuffer, DmaSpace};
pub use engine::QdmaEngine;
pub use error::{ErrorKind, QdmaError, QdmaResult};
pub use intr::{IrqMode, VectorBinding};
pub use mailbox::{LocalTransport, MailboxTransport};
pub use opcode::{MboxOpcode, MboxStatus};
pub use partition::{PartitionConfig, PartitionEntry, RangeGrant};
pub use policy::RetryPolicy;
pub use queue::{Direction, Queue, QueueConfig, QueueHandle, QueueMode, QueueState};
pub use regs::RegisterAccess;
#[cfg(target_os = "linux")]
pub use regs::MmioRegisters;
pub use request::{Completion, CompletionToken, Request, SgEntry};
pub use stats::QueueStats;

/// Lock `m`, recovering the data of a poisoned mutex.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
