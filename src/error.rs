// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for QDMA operations.

use crate::context::{ContextOp, ContextSelector};
use crate::opcode::{MboxOpcode, MboxStatus};
use crate::queue::{Direction, QueueMode, QueueState};
use thiserror::Error;

/// Coarse classification of a [`QdmaError`].
///
/// Collaborator layers (CLI, reporting) key their diagnostics off the kind,
/// and the mailbox carries it across the privilege boundary as a status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid queue configuration or quota.
    Config,
    /// No free queue slot, ring/buffer allocation failure.
    ResourceExhausted,
    /// Context-programming busy-bit or mailbox response timeout.
    ProtocolTimeout,
    /// Completion entry error, context readback mismatch, corrupt ring.
    Hardware,
    /// Operation attempted in the wrong lifecycle state.
    State,
    /// Operating-system failure of a register backend.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "ConfigError",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::ProtocolTimeout => "ProtocolTimeout",
            Self::Hardware => "HardwareError",
            Self::State => "StateError",
            Self::Io => "IoError",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during QDMA operations.
#[derive(Debug, Error)]
pub enum QdmaError {
    /// Invalid device or queue configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The paired queue at this index uses another transfer mode.
    #[error("queue {index}: paired queue is {existing}, requested {requested}")]
    ModeConflict {
        index: u16,
        existing: QueueMode,
        requested: QueueMode,
    },

    /// A request exceeds the caller's queue or vector quota.
    #[error("quota exceeded: requested {requested}, available {available}")]
    QuotaExceeded { requested: u32, available: u32 },

    /// Every slot in the direction's queue array is enabled.
    #[error("no free {direction} queue slot")]
    NoFreeSlot { direction: Direction },

    /// DMA memory for a ring or buffer could not be allocated.
    #[error("allocation of {len} bytes for {what} failed")]
    AllocFailed { what: &'static str, len: usize },

    /// A shared pool (queue range, vectors, callers) has no room left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A hardware queue id outside the function's owned range.
    #[error("hardware queue {qid} outside owned range [{base}, {base}+{count})")]
    OutOfRange { qid: u32, base: u32, count: u32 },

    /// The indirect context command never cleared its busy bit.
    #[error("context {op} of {sel} on queue {qid:#x} timed out")]
    ContextProgramTimeout {
        qid: u32,
        op: ContextOp,
        sel: ContextSelector,
    },

    /// No acknowledged response arrived for a mailbox request.
    #[error("mailbox {opcode} timed out")]
    MailboxTimeout { opcode: MboxOpcode },

    /// A completion entry reported an error.
    #[error("completion error on queue {qid:#x} at entry {index}")]
    CompletionError { qid: u32, index: u32 },

    /// The writeback status disagrees with what software submitted.
    #[error("descriptor ring on queue {qid:#x} corrupt: {detail}")]
    RingCorrupt { qid: u32, detail: String },

    /// A verified context write read back different contents.
    #[error("context {sel} on queue {qid:#x} read back {actual:#010x}, wrote {expected:#010x}")]
    ContextMismatch {
        qid: u32,
        sel: ContextSelector,
        expected: u32,
        actual: u32,
    },

    /// Lifecycle operation attempted in the wrong state.
    #[error("queue {name}: cannot {op} while {state}")]
    InvalidState {
        name: String,
        state: QueueState,
        op: &'static str,
    },

    /// Submission against a queue that is not online.
    #[error("queue {name} is not online")]
    QueueNotOnline { name: String },

    /// The queue hit a hardware error and must be removed.
    #[error("queue {name} halted")]
    QueueHalted { name: String },

    /// Submission direction does not match the queue.
    #[error("queue {name} is {queue}, request targets {requested}")]
    DirectionMismatch {
        name: String,
        queue: Direction,
        requested: Direction,
    },

    /// A streaming H2C request longer than one packet can describe.
    #[error("request of {len} bytes exceeds the {max}-byte packet limit")]
    RequestTooLarge { len: usize, max: usize },

    /// The received packet and the request length disagreed.
    #[error("transfer incomplete: expected {expected} bytes, received {received}")]
    Incomplete { expected: usize, received: usize },

    /// The request was canceled or its queue stopped before it ran.
    #[error("request canceled")]
    Canceled,

    /// A completion token wait ran out of time.
    #[error("timed out waiting for request completion")]
    WaitTimeout,

    /// The owner answered a mailbox request with a failure status.
    #[error("mailbox {opcode} rejected by owner: {status}")]
    Remote {
        opcode: MboxOpcode,
        status: MboxStatus,
    },

    /// The mailbox peer went away.
    #[error("mailbox channel closed")]
    MailboxClosed,

    /// A mailbox envelope failed to decode.
    #[error("malformed mailbox message: {0}")]
    MalformedMessage(String),

    /// Operation needs register access this function does not have.
    #[error("{0} requires the privileged function")]
    NotPrivileged(&'static str),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),
}

impl QdmaError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_)
            | Self::ModeConflict { .. }
            | Self::QuotaExceeded { .. }
            | Self::OutOfRange { .. }
            | Self::DirectionMismatch { .. }
            | Self::RequestTooLarge { .. }
            | Self::MalformedMessage(_)
            | Self::NotPrivileged(_) => ErrorKind::Config,
            Self::NoFreeSlot { .. } | Self::AllocFailed { .. } | Self::ResourceExhausted(_) => {
                ErrorKind::ResourceExhausted
            }
            Self::ContextProgramTimeout { .. }
            | Self::MailboxTimeout { .. }
            | Self::WaitTimeout
            | Self::MailboxClosed => ErrorKind::ProtocolTimeout,
            Self::CompletionError { .. }
            | Self::RingCorrupt { .. }
            | Self::ContextMismatch { .. }
            | Self::Incomplete { .. } => ErrorKind::Hardware,
            Self::InvalidState { .. }
            | Self::QueueNotOnline { .. }
            | Self::QueueHalted { .. }
            | Self::Canceled => ErrorKind::State,
            Self::Remote { status, .. } => status.kind(),
            Self::Io(_) | Self::MmapFailed(_) => ErrorKind::Io,
        }
    }

    /// True for the terminal halted-queue error.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::QueueHalted { .. })
    }
}

/// Result type alias for QDMA operations.
pub type QdmaResult<T> = Result<T, QdmaError>;
