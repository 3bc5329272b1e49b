// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Manager interfaces the dispatcher forwards inbound traffic to.

use crate::error::Result;
use crate::types::{
    BroadcastSubscriptionRequest, MulticastPublication, MulticastSubscriptionRequest,
    OneWayRequest, Reply, Request, SubscriptionPublication, SubscriptionReply,
    SubscriptionRequest, SubscriptionStop,
};
use async_trait::async_trait;

/// Delivers a subscription reply back to the subscriber.
pub type SubscriptionReplyCallback = Box<dyn FnOnce(SubscriptionReply) + Send>;

/// Provider-side RPC handling and consumer-side reply correlation.
#[async_trait]
pub trait RequestReplyHandler: Send + Sync {
    /// Invoke `request` on the provider registered as `provider_participant_id`.
    async fn handle_request(&self, provider_participant_id: &str, request: Request) -> Reply;

    fn handle_reply(&self, reply: Reply);

    fn handle_one_way_request(&self, provider_participant_id: &str, request: OneWayRequest);
}

/// Consumer side of subscriptions.
pub trait SubscriptionHandler: Send + Sync {
    fn handle_subscription_reply(&self, reply: SubscriptionReply);

    fn handle_publication(&self, publication: SubscriptionPublication);

    fn handle_multicast_publication(&self, publication: MulticastPublication);
}

/// Provider side of subscriptions.
///
/// Validation failures are answered through `reply`; an `Err` only
/// signals that the handler cannot take requests at all.
pub trait PublicationHandler: Send + Sync {
    fn handle_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: SubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()>;

    fn handle_broadcast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: BroadcastSubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()>;

    fn handle_multicast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: MulticastSubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()>;

    fn handle_subscription_stop(&self, stop: SubscriptionStop) -> Result<()>;
}

/// Outbound publication path used by the publication manager.
///
/// Called with the manager's state locked: implementations must not block
/// or call back into the manager.
pub trait PublicationSender: Send + Sync {
    fn send_publication(
        &self,
        from: &str,
        to: &str,
        expiry_date_ms: u64,
        publication: SubscriptionPublication,
    );

    fn send_multicast_publication(
        &self,
        from: &str,
        expiry_date_ms: u64,
        publication: MulticastPublication,
    );
}
