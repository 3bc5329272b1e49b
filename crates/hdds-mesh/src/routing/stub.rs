// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stub and skeleton factories keyed by address type.
//!
//! A stub sends messages to one address; a skeleton receives messages for
//! one transport kind. Both registries are filled once at startup and are
//! read-only afterwards.

use crate::error::{MeshError, Result};
use crate::types::{Address, AddressType, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Outbound sender for one address.
#[async_trait]
pub trait MessagingStub: Send + Sync {
    /// Hand `message` to the transport.
    async fn transmit(&self, message: Message) -> Result<()>;
}

/// Builds stubs for addresses of one transport kind.
pub trait MessagingStubFactory: Send + Sync {
    fn create_stub(&self, address: &Address) -> Result<Arc<dyn MessagingStub>>;
}

impl<F> MessagingStubFactory for F
where
    F: Fn(&Address) -> Result<Arc<dyn MessagingStub>> + Send + Sync,
{
    fn create_stub(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        self(address)
    }
}

/// Callback receiving inbound messages from a skeleton.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// Inbound receiver of one transport kind.
pub trait MessagingSkeleton: Send + Sync {
    fn register_listener(&self, listener: MessageListener);

    /// First local receiver subscribed to `multicast_id`.
    fn register_multicast_subscription(&self, _multicast_id: &str) {}

    /// Last local receiver of `multicast_id` went away.
    fn unregister_multicast_subscription(&self, _multicast_id: &str) {}
}

/// Stub factories by address type.
#[derive(Clone, Default)]
pub struct StubFactoryRegistry {
    factories: HashMap<AddressType, Arc<dyn MessagingStubFactory>>,
}

impl StubFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(
        mut self,
        address_type: AddressType,
        factory: Arc<dyn MessagingStubFactory>,
    ) -> Self {
        self.factories.insert(address_type, factory);
        self
    }

    pub fn contains(&self, address_type: AddressType) -> bool {
        self.factories.contains_key(&address_type)
    }

    /// Build a stub for `address`.
    pub fn create_stub(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        let address_type = address.address_type();
        self.factories
            .get(&address_type)
            .ok_or_else(|| MeshError::UnknownAddressType(address_type.to_string()))?
            .create_stub(address)
    }
}

/// Skeletons by address type.
#[derive(Clone, Default)]
pub struct SkeletonRegistry {
    skeletons: HashMap<AddressType, Arc<dyn MessagingSkeleton>>,
}

impl SkeletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skeleton(
        mut self,
        address_type: AddressType,
        skeleton: Arc<dyn MessagingSkeleton>,
    ) -> Self {
        self.skeletons.insert(address_type, skeleton);
        self
    }

    pub fn get_skeleton(&self, address: &Address) -> Result<Arc<dyn MessagingSkeleton>> {
        let address_type = address.address_type();
        self.skeletons
            .get(&address_type)
            .cloned()
            .ok_or_else(|| MeshError::UnknownAddressType(address_type.to_string()))
    }

    /// Install `listener` on every registered skeleton.
    pub fn register_listener(&self, listener: MessageListener) {
        for skeleton in self.skeletons.values() {
            skeleton.register_listener(listener.clone());
        }
    }
}
