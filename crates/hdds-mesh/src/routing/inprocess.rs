// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport: stubs call the destination's listener directly.

use crate::error::{MeshError, Result};
use crate::routing::stub::{MessageListener, MessagingSkeleton, MessagingStub, MessagingStubFactory};
use crate::types::{Address, Message};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Receiving end of an in-process address.
#[derive(Default)]
pub struct InProcessSkeleton {
    listener: RwLock<Option<MessageListener>>,
}

impl InProcessSkeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to the registered listener.
    pub fn receive(&self, message: Message) -> Result<()> {
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => {
                listener(message);
                Ok(())
            }
            None => Err(MeshError::Transport(format!(
                "no listener registered for in-process message {}",
                message.id
            ))),
        }
    }
}

impl MessagingSkeleton for InProcessSkeleton {
    fn register_listener(&self, listener: MessageListener) {
        *self.listener.write() = Some(listener);
    }
}

/// In-process skeletons by address id.
#[derive(Clone, Default)]
pub struct InProcessRegistry {
    skeletons: Arc<RwLock<HashMap<String, Arc<InProcessSkeleton>>>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the skeleton for `id` and its address.
    pub fn register(&self, id: impl Into<String>) -> (Address, Arc<InProcessSkeleton>) {
        let id = id.into();
        let skeleton = self
            .skeletons
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(InProcessSkeleton::new()))
            .clone();
        (Address::in_process(id), skeleton)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.skeletons.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<InProcessSkeleton>> {
        self.skeletons.read().get(id).cloned()
    }
}

/// Stub delivering to the skeleton registered for one id.
///
/// The skeleton is looked up on every transmit, so a stub outlives
/// re-registrations of its id.
pub struct InProcessStub {
    id: String,
    registry: InProcessRegistry,
}

#[async_trait]
impl MessagingStub for InProcessStub {
    async fn transmit(&self, message: Message) -> Result<()> {
        let skeleton = self
            .registry
            .get(&self.id)
            .ok_or_else(|| MeshError::Unresolved(format!("in-process address {}", self.id)))?;
        skeleton.receive(message)
    }
}

/// Factory for [`InProcessStub`].
#[derive(Clone, Default)]
pub struct InProcessStubFactory {
    registry: InProcessRegistry,
}

impl InProcessStubFactory {
    pub fn new(registry: InProcessRegistry) -> Self {
        Self { registry }
    }
}

impl MessagingStubFactory for InProcessStubFactory {
    fn create_stub(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        match address {
            Address::InProcess { id } => Ok(Arc::new(InProcessStub {
                id: id.clone(),
                registry: self.registry.clone(),
            })),
            other => Err(MeshError::UnknownAddressType(
                other.address_type().to_string(),
            )),
        }
    }
}
