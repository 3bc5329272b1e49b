// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value types exchanged between mesh components.

pub mod address;
pub mod discovery;
pub mod message;
pub mod rpc;
pub mod subscription;

pub use address::{Address, AddressType, WebSocketProtocol};
pub use discovery::{CustomParameter, DiscoveryEntry, ProviderQos, ProviderScope, Version};
pub use message::{Message, MessageType};
pub use rpc::{OneWayRequest, Reply, Request};
pub use subscription::{
    BroadcastFilterParameters, BroadcastSubscriptionRequest, MulticastPublication,
    MulticastSubscriptionRequest, SubscriptionException, SubscriptionPublication,
    SubscriptionQos, SubscriptionReply, SubscriptionRequest, SubscriptionStop,
    DEFAULT_PUBLICATION_TTL_MS, NO_EXPIRY_DATE,
};
