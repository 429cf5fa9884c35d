// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-queue transfer counters.

use std::time::Duration;

/// Read-only snapshot of one queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Requests completed successfully.
    pub requests: u64,
    /// Requests completed with an error or canceled.
    pub errors: u64,
    /// Packets seen (EOT-terminated receives, EOP-terminated sends).
    pub packets: u64,
    pub bytes: u64,
    pub descriptors: u64,
    /// Free-list buffers handed back to hardware.
    pub refills: u64,
    pub latency_min: Option<Duration>,
    pub latency_max: Option<Duration>,
    pub latency_total: Duration,
}

impl QueueStats {
    pub(crate) fn record_success(&mut self, bytes: usize, packet: bool, latency: Duration) {
        self.requests += 1;
        self.bytes += bytes as u64;
        if packet {
            self.packets += 1;
        }
        self.latency_min = Some(self.latency_min.map_or(latency, |m| m.min(latency)));
        self.latency_max = Some(self.latency_max.map_or(latency, |m| m.max(latency)));
        self.latency_total += latency;
    }

    pub(crate) fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Mean latency of successful requests.
    pub fn latency_avg(&self) -> Option<Duration> {
        if self.requests == 0 {
            return None;
        }
        let n = u32::try_from(self.requests).unwrap_or(u32::MAX);
        Some(self.latency_total / n)
    }

    /// Reset every counter.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
