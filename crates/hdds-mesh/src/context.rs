// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime context handed to every component at construction.

use crate::clock::{Clock, RuntimeClock};
use crate::error::{MeshError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Shared services of one mesh runtime instance.
///
/// Every timer and continuation is spawned through [`RuntimeContext::spawn`]
/// onto the captured tokio handle, so public entry points can be called from
/// threads that are not part of the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    instance_id: Arc<str>,
    clock: Arc<dyn Clock>,
    handle: Handle,
}

impl RuntimeContext {
    pub fn new(instance_id: impl Into<String>, clock: Arc<dyn Clock>, handle: Handle) -> Self {
        Self {
            instance_id: Arc::from(instance_id.into()),
            clock,
            handle,
        }
    }

    /// Context bound to the tokio runtime of the calling task.
    pub fn current(instance_id: impl Into<String>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| MeshError::Transport(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(instance_id, Arc::new(RuntimeClock::new()), handle))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}
