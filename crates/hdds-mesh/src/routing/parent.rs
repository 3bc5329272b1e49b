// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy to the parent router of a child runtime.

use crate::error::Result;
use crate::routing::multicast::MulticastReceiver;
use crate::types::Address;
use async_trait::async_trait;

/// Routing operations exposed by a parent router.
#[async_trait]
pub trait RoutingProxy: Send + Sync {
    /// Participant id of the proxy itself, registered with the parent on attach.
    fn proxy_participant_id(&self) -> &str;

    /// Tell the parent that `participant_id` is reachable at `address`.
    async fn add_next_hop(
        &self,
        participant_id: &str,
        address: &Address,
        is_globally_visible: bool,
    ) -> Result<()>;

    async fn remove_next_hop(&self, participant_id: &str) -> Result<()>;

    /// Whether the parent knows a next hop for `participant_id`.
    async fn resolve_next_hop(&self, participant_id: &str) -> Result<bool>;

    async fn add_multicast_receiver(&self, receiver: &MulticastReceiver) -> Result<()>;

    async fn remove_multicast_receiver(&self, receiver: &MulticastReceiver) -> Result<()>;
}
