// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue of messages whose destination is not yet known.
//!
//! Entries are kept in enqueue order. The aggregate payload size is bounded:
//! a `put` that would exceed the cap evicts the oldest entries first, and a
//! message larger than the whole cap is rejected. Expired entries are removed
//! by a periodic reaper and skipped at drain time. Every entry may carry a
//! completion channel; eviction, expiry and shutdown complete it with the
//! matching error.

use crate::clock::Clock;
use crate::context::RuntimeContext;
use crate::error::{MeshError, Result};
use crate::types::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Channel resolving the routing outcome of a queued message.
pub type Completion = oneshot::Sender<Result<()>>;

/// A message waiting for its destination.
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: Message,
    enqueued_at: Instant,
    completion: Option<Completion>,
}

impl QueuedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            enqueued_at: Instant::now(),
            completion: None,
        }
    }

    pub fn with_completion(message: Message, completion: Completion) -> Self {
        Self {
            message,
            enqueued_at: Instant::now(),
            completion: Some(completion),
        }
    }

    /// Resolve the waiting caller, if any.
    pub fn complete(self, result: Result<()>) {
        if let Some(tx) = self.completion {
            let _ = tx.send(result);
        }
    }

    /// Time spent in the queue so far.
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn into_parts(self) -> (Message, Option<Completion>) {
        (self.message, self.completion)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueuedMessage>,
    size_bytes: usize,
}

/// Byte-bounded message queue.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    max_size_bytes: usize,
    clock: Arc<dyn Clock>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MessageQueue {
    pub fn new(max_size_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_size_bytes,
            clock,
            reaper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Store `entry` until its destination registers.
    pub fn put(&self, entry: QueuedMessage) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            entry.complete(Err(MeshError::Shutdown("message queue")));
            return Err(MeshError::Shutdown("message queue"));
        }

        let size = entry.message.size_bytes();
        if size > self.max_size_bytes {
            let err = MeshError::MessageTooLarge {
                msg_id: entry.message.id.clone(),
                size,
                capacity: self.max_size_bytes,
            };
            warn!("{}", err);
            entry.complete(Err(err.clone()));
            return Err(err);
        }

        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.size_bytes + size > self.max_size_bytes {
                let Some(oldest) = state.entries.pop_front() else {
                    break;
                };
                state.size_bytes -= oldest.message.size_bytes();
                evicted.push(oldest);
            }
            state.size_bytes += size;
            state.entries.push_back(entry);
        }

        for oldest in evicted {
            warn!(
                "Message queue full, dropping message {} for {} (queued {:?})",
                oldest.message.id,
                oldest.message.recipient,
                oldest.queued_for()
            );
            let msg_id = oldest.message.id.clone();
            oldest.complete(Err(MeshError::QueueOverflow { msg_id }));
        }
        Ok(())
    }

    /// Remove and return every live message for `participant_id`, in FIFO order.
    pub fn drain_for(&self, participant_id: &str) -> Vec<QueuedMessage> {
        let now = self.clock.now_ms();
        let mut drained = Vec::new();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.entries.len());
            let mut size_bytes = 0;
            for entry in state.entries.drain(..) {
                if entry.message.recipient != participant_id {
                    size_bytes += entry.message.size_bytes();
                    kept.push_back(entry);
                } else if entry.message.is_expired(now) {
                    expired.push(entry);
                } else {
                    drained.push(entry);
                }
            }
            state.entries = kept;
            state.size_bytes = size_bytes;
        }

        complete_expired(expired, now);
        drained
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<QueuedMessage> = {
            let mut state = self.state.lock();
            let (live, expired): (VecDeque<_>, VecDeque<_>) = state
                .entries
                .drain(..)
                .partition(|entry| !entry.message.is_expired(now));
            state.size_bytes = live.iter().map(|e| e.message.size_bytes()).sum();
            state.entries = live;
            Vec::from(expired)
        };

        let count = expired.len();
        complete_expired(expired, now);
        count
    }

    /// Distinct recipients with queued messages, oldest first.
    pub fn pending_recipients(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut recipients: Vec<String> = Vec::new();
        for entry in &state.entries {
            if !recipients.contains(&entry.message.recipient) {
                recipients.push(entry.message.recipient.clone());
            }
        }
        recipients
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    /// Run [`MessageQueue::reap_expired`] every `period` until shutdown.
    pub fn start_reaper(self: &Arc<Self>, ctx: &RuntimeContext, period: Duration) {
        let queue = Arc::downgrade(self);
        let handle = ctx.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                let reaped = queue.reap_expired();
                if reaped > 0 {
                    debug!("Reaped {} expired queued messages", reaped);
                }
            }
        });
        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the reaper and reject every queued message. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let entries: Vec<QueuedMessage> = {
            let mut state = self.state.lock();
            state.size_bytes = 0;
            state.entries.drain(..).collect()
        };
        for entry in entries {
            entry.complete(Err(MeshError::Shutdown("message queue")));
        }
    }
}

fn complete_expired(expired: Vec<QueuedMessage>, now_ms: u64) {
    for entry in expired {
        warn!(
            "Dropping expired queued message {} for {} (queued {:?})",
            entry.message.id,
            entry.message.recipient,
            entry.queued_for()
        );
        let err = MeshError::ExpiredMessage {
            msg_id: entry.message.id.clone(),
            expiry_date_ms: entry.message.expiry_date_ms,
            now_ms,
        };
        entry.complete(Err(err));
    }
}
