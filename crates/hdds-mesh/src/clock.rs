// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wall-clock source used for message and subscription expiry dates.
//!
//! Expiry dates travel between processes as milliseconds since the Unix
//! epoch. [`RuntimeClock`] anchors that epoch value to a tokio
//! [`Instant`](tokio::time::Instant) once at construction and derives every
//! later reading from the monotonic clock, so paused-time tests see expiry
//! dates move together with tokio timers.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Clock anchored to the tokio monotonic clock.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    anchor_instant: Instant,
    anchor_epoch_ms: u64,
}

impl RuntimeClock {
    pub fn new() -> Self {
        let anchor_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::anchored_at(anchor_epoch_ms)
    }

    /// Clock that reads `epoch_ms` right now.
    pub fn anchored_at(epoch_ms: u64) -> Self {
        Self {
            anchor_instant: Instant::now(),
            anchor_epoch_ms: epoch_ms,
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now_ms(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_epoch_ms
            .saturating_add(elapsed.as_millis() as u64)
    }
}
