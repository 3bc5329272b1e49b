// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the message router.
#[derive(Debug)]
pub struct RouterStats {
    /// Messages handed to a stub successfully.
    pub messages_routed: AtomicU64,

    /// Payload bytes handed to stubs.
    pub bytes_routed: AtomicU64,

    /// Messages parked until their destination registers.
    pub messages_queued: AtomicU64,

    /// Messages dropped (expired, no receivers).
    pub messages_dropped: AtomicU64,

    /// Stub transmissions that failed.
    pub transmit_errors: AtomicU64,

    /// Router creation time.
    pub created: Instant,
}

impl RouterStats {
    pub fn new() -> Self {
        Self {
            messages_routed: AtomicU64::new(0),
            bytes_routed: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            transmit_errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn record_routed(&self, bytes: usize) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.bytes_routed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.transmit_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            bytes_routed: self.bytes_routed.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            transmit_errors: self.transmit_errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of router statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub messages_routed: u64,
    pub bytes_routed: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub transmit_errors: u64,
    pub uptime_secs: u64,
}

impl RouterStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_routed as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}
