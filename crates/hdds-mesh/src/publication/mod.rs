// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider-side publication: provider capabilities and the subscription manager.

pub mod manager;
pub mod provider;

pub use manager::PublicationManager;
pub use provider::{
    AttributeGetter, AttributeObserver, BroadcastFilter, EventFiring, EventObserver,
    NotifyAttribute, ObserverId, Provider, ProviderAttribute, ProviderEvent,
};
