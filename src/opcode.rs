// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Mailbox operation and status codes.
//!
//! The opcode sits in the low four bits of the first envelope byte; the
//! status byte carries the owner's verdict on acknowledged responses.

use crate::error::{ErrorKind, QdmaError};

/// Mailbox operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MboxOpcode {
    /// Register with the owner and receive a default queue range.
    Hello = 0x01,

    /// Unregister; the owner revokes everything held.
    Bye = 0x02,

    /// Query or change the caller's queue range.
    QueueRangeMap = 0x03,

    /// Program a queue's contexts.
    ContextWrite = 0x04,

    /// Read a queue's contexts back.
    ContextRead = 0x05,

    /// Clear a queue's contexts.
    ContextClear = 0x06,

    /// Program or clear a coalescing ring context.
    VectorContext = 0x07,

    /// Fetch the global CSR tables.
    Csr = 0x08,
}

impl MboxOpcode {
    /// Returns the opcode as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the low four bits of an envelope's first byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Bye),
            0x03 => Some(Self::QueueRangeMap),
            0x04 => Some(Self::ContextWrite),
            0x05 => Some(Self::ContextRead),
            0x06 => Some(Self::ContextClear),
            0x07 => Some(Self::VectorContext),
            0x08 => Some(Self::Csr),
            _ => None,
        }
    }

    /// Returns a human-readable name for the opcode.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Bye => "BYE",
            Self::QueueRangeMap => "QUEUE_RANGE_MAP",
            Self::ContextWrite => "CONTEXT_WRITE",
            Self::ContextRead => "CONTEXT_READ",
            Self::ContextClear => "CONTEXT_CLEAR",
            Self::VectorContext => "VECTOR_CONTEXT",
            Self::Csr => "CSR",
        }
    }

    /// Safe to resend after a lost response.
    pub const fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::Hello | Self::ContextRead | Self::ContextClear | Self::Csr
        )
    }
}

impl std::fmt::Display for MboxOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

/// Status carried by a mailbox response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MboxStatus {
    Ok = 0x00,
    InvalidRequest = 0x01,
    ResourceExhausted = 0x02,
    Timeout = 0x03,
    HardwareError = 0x04,
    InvalidState = 0x05,
    Unsupported = 0x06,
    Failed = 0x7F,
}

impl MboxStatus {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unknown codes decode as [`MboxStatus::Failed`].
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::InvalidRequest,
            0x02 => Self::ResourceExhausted,
            0x03 => Self::Timeout,
            0x04 => Self::HardwareError,
            0x05 => Self::InvalidState,
            0x06 => Self::Unsupported,
            _ => Self::Failed,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::HardwareError => "HARDWARE_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Unsupported => "UNSUPPORTED",
            Self::Failed => "FAILED",
        }
    }

    /// Error class the caller sees for this status.
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::Ok | Self::InvalidRequest | Self::Unsupported | Self::Failed => ErrorKind::Config,
            Self::ResourceExhausted => ErrorKind::ResourceExhausted,
            Self::Timeout => ErrorKind::ProtocolTimeout,
            Self::HardwareError => ErrorKind::Hardware,
            Self::InvalidState => ErrorKind::State,
        }
    }

    /// Status the owner reports for a failed request.
    pub fn from_error(err: &QdmaError) -> Self {
        match err.kind() {
            ErrorKind::Config => Self::InvalidRequest,
            ErrorKind::ResourceExhausted => Self::ResourceExhausted,
            ErrorKind::ProtocolTimeout => Self::Timeout,
            ErrorKind::Hardware => Self::HardwareError,
            ErrorKind::State => Self::InvalidState,
            ErrorKind::Io => Self::Failed,
        }
    }
}

impl std::fmt::Display for MboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(MboxOpcode::Hello.as_u8(), 0x01);
        assert_eq!(MboxOpcode::Bye.as_u8(), 0x02);
        assert_eq!(MboxOpcode::QueueRangeMap.as_u8(), 0x03);
        assert_eq!(MboxOpcode::ContextWrite.as_u8(), 0x04);
        assert_eq!(MboxOpcode::Csr.as_u8(), 0x08);
        assert_eq!(MboxOpcode::from_u8(0x85), Some(MboxOpcode::ContextRead));
        assert_eq!(MboxOpcode::from_u8(0x0F), None);
    }

    #[test]
    fn test_opcode_display() {
        assert_eq!(
            format!("{}", MboxOpcode::QueueRangeMap),
            "QUEUE_RANGE_MAP (0x03)"
        );
        assert_eq!(format!("{}", MboxStatus::Failed), "FAILED (0x7f)");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(MboxStatus::from_u8(0x42), MboxStatus::Failed);
        let err = QdmaError::ResourceExhausted("queues".into());
        assert_eq!(MboxStatus::from_error(&err), MboxStatus::ResourceExhausted);
        assert_eq!(
            MboxStatus::from_error(&err).kind(),
            ErrorKind::ResourceExhausted
        );
        assert!(MboxOpcode::Csr.is_idempotent());
        assert!(!MboxOpcode::ContextWrite.is_idempotent());
    }
}
