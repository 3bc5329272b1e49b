// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single inbound/outbound funnel between the managers and the router.
//!
//! Outbound messages get their expiry from the messaging QoS plus the
//! configured TTL uplift and are signed when a signer is set. Inbound
//! messages are classified by type and handed to exactly one manager.
//!
//! Publications and subscription replies are sent without a caller to
//! await them. They go through one lane per recipient: an unbounded
//! channel drained by a single task, so messages to the same participant
//! reach the router in the order they were handed over.

use crate::config::MessagingConfig;
use crate::context::RuntimeContext;
use crate::dispatch::handler::{
    PublicationHandler, PublicationSender, RequestReplyHandler, SubscriptionHandler,
    SubscriptionReplyCallback,
};
use crate::error::Result;
use crate::routing::{MessageRouter, MulticastReceiver};
use crate::types::{
    BroadcastSubscriptionRequest, DiscoveryEntry, Message, MessageType, MulticastPublication,
    MulticastSubscriptionRequest, OneWayRequest, Reply, Request, SubscriptionPublication,
    SubscriptionQos, SubscriptionReply, SubscriptionRequest, SubscriptionStop,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default time-to-live of outbound messages.
pub const DEFAULT_TTL_MS: u64 = 60_000;

/// Largest expiry date a peer can represent (signed 64-bit milliseconds).
pub const MAX_EXPIRY_DATE_MS: u64 = i64::MAX as u64;

/// Computes a signature over an outbound message.
pub type MessageSigner = Arc<dyn Fn(&Message) -> Vec<u8> + Send + Sync>;

/// Per-call messaging options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingQos {
    pub ttl_ms: u64,
    pub custom_headers: BTreeMap<String, String>,
}

impl MessagingQos {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            custom_headers: BTreeMap::new(),
        }
    }

    pub fn with_custom_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }
}

impl Default for MessagingQos {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_MS)
    }
}

fn uplift_expiry(expiry_date_ms: u64, uplift_ms: u64) -> u64 {
    expiry_date_ms
        .saturating_add(uplift_ms)
        .min(MAX_EXPIRY_DATE_MS)
}

#[derive(Default)]
struct Handlers {
    request_reply: Option<Arc<dyn RequestReplyHandler>>,
    subscription: Option<Arc<dyn SubscriptionHandler>>,
    publication: Option<Arc<dyn PublicationHandler>>,
}

struct DispatcherInner {
    ctx: RuntimeContext,
    router: MessageRouter,
    ttl_uplift_ms: u64,
    default_ttl_ms: u64,
    signer: RwLock<Option<MessageSigner>>,
    handlers: RwLock<Handlers>,
    /// Ordered outbound lanes, by recipient
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

/// Route the messages of one lane one after another.
async fn drain_lane(dispatcher: Weak<DispatcherInner>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = dispatcher.upgrade() else {
            break;
        };
        let msg_id = message.id.clone();
        if let Err(e) = (Dispatcher { inner }).send(message).await {
            warn!("Sending message {} failed: {}", msg_id, e);
        }
    }
}

/// Message dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(ctx: RuntimeContext, router: MessageRouter, config: &MessagingConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                ctx,
                router,
                ttl_uplift_ms: config.ttl_uplift_ms,
                default_ttl_ms: config.default_ttl_ms,
                signer: RwLock::new(None),
                handlers: RwLock::new(Handlers::default()),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Messaging QoS with the configured default TTL.
    pub fn default_messaging_qos(&self) -> MessagingQos {
        MessagingQos::new(self.inner.default_ttl_ms)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn set_signer(&self, signer: MessageSigner) {
        *self.inner.signer.write() = Some(signer);
    }

    pub fn register_request_reply_handler(&self, handler: Arc<dyn RequestReplyHandler>) {
        self.inner.handlers.write().request_reply = Some(handler);
    }

    pub fn register_subscription_handler(&self, handler: Arc<dyn SubscriptionHandler>) {
        self.inner.handlers.write().subscription = Some(handler);
    }

    pub fn register_publication_handler(&self, handler: Arc<dyn PublicationHandler>) {
        self.inner.handlers.write().publication = Some(handler);
    }

    fn uplift(&self, expiry_date_ms: u64) -> u64 {
        uplift_expiry(expiry_date_ms, self.inner.ttl_uplift_ms)
    }

    fn outbound<T: Serialize>(
        &self,
        msg_type: MessageType,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        payload: &T,
    ) -> Result<Message> {
        let now = self.inner.ctx.now_ms();
        let mut message = Message::new(
            msg_type,
            from,
            to.participant_id.as_str(),
            serde_json::to_string(payload)?,
        )
        .with_expiry_date(self.uplift(now.saturating_add(qos.ttl_ms)));
        message.custom_headers = qos.custom_headers.clone();
        message.is_local_message = to.is_local;
        Ok(message)
    }

    async fn send(&self, mut message: Message) -> Result<()> {
        if let Some(signer) = self.inner.signer.read().clone() {
            message.signature = Some(signer(&message));
        }
        debug!(
            "Sending {} message {} from {} to {}",
            message.msg_type, message.id, message.sender, message.recipient
        );
        self.inner.router.route(message).await
    }

    /// Route `message` in the background behind earlier messages to the
    /// same recipient, logging a failure.
    fn send_detached(&self, message: Message) {
        let mut lanes = self.inner.lanes.lock();
        let message = match lanes.get(&message.recipient) {
            Some(lane) => match lane.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let recipient = message.recipient.clone();
        if tx.send(message).is_err() {
            return;
        }
        lanes.insert(recipient, tx);
        self.inner
            .ctx
            .spawn(drain_lane(Arc::downgrade(&self.inner), rx));
    }

    pub async fn send_request(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        request: &Request,
    ) -> Result<()> {
        info!(
            "Calling {} on {} (request {})",
            request.method_name, to.participant_id, request.request_reply_id
        );
        let message = self.outbound(MessageType::Request, from, to, qos, request)?;
        self.send(message).await
    }

    pub async fn send_one_way_request(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        request: &OneWayRequest,
    ) -> Result<()> {
        info!("Calling {} on {} (one way)", request.method_name, to.participant_id);
        let message = self.outbound(MessageType::OneWay, from, to, qos, request)?;
        self.send(message).await
    }

    pub async fn send_subscription_request(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        request: &SubscriptionRequest,
    ) -> Result<()> {
        info!(
            "Subscribing to {} on {} (subscription {})",
            request.subscribed_to_name, to.participant_id, request.subscription_id
        );
        let message = self.outbound(MessageType::SubscriptionRequest, from, to, qos, request)?;
        self.send(message).await
    }

    pub async fn send_broadcast_subscription_request(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        request: &BroadcastSubscriptionRequest,
    ) -> Result<()> {
        info!(
            "Subscribing to broadcast {} on {} (subscription {})",
            request.subscribed_to_name, to.participant_id, request.subscription_id
        );
        let message = self.outbound(
            MessageType::BroadcastSubscriptionRequest,
            from,
            to,
            qos,
            request,
        )?;
        self.send(message).await
    }

    /// Register `from` as receiver of the multicast, then send the request.
    pub async fn send_multicast_subscription_request(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        request: &MulticastSubscriptionRequest,
    ) -> Result<()> {
        info!(
            "Subscribing to multicast {} (subscription {})",
            request.multicast_id, request.subscription_id
        );
        self.inner
            .router
            .add_multicast_receiver(MulticastReceiver::new(
                request.multicast_id.as_str(),
                from,
                to.participant_id.as_str(),
            ))
            .await?;
        let message = self.outbound(
            MessageType::MulticastSubscriptionRequest,
            from,
            to,
            qos,
            request,
        )?;
        self.send(message).await
    }

    pub async fn send_subscription_stop(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        stop: &SubscriptionStop,
    ) -> Result<()> {
        info!(
            "Stopping subscription {} on {}",
            stop.subscription_id, to.participant_id
        );
        let message = self.outbound(MessageType::SubscriptionStop, from, to, qos, stop)?;
        self.send(message).await
    }

    /// Send the stop and remove `from` as receiver of `multicast_id`.
    pub async fn send_multicast_subscription_stop(
        &self,
        from: &str,
        to: &DiscoveryEntry,
        qos: &MessagingQos,
        multicast_id: &str,
        stop: &SubscriptionStop,
    ) -> Result<()> {
        let sent = self.send_subscription_stop(from, to, qos, stop).await;
        let removed = self
            .inner
            .router
            .remove_multicast_receiver(MulticastReceiver::new(
                multicast_id,
                from,
                to.participant_id.as_str(),
            ))
            .await;
        sent.and(removed)
    }

    fn reply_to(&self, inbound: &Message, msg_type: MessageType, payload: String) -> Message {
        let mut message = Message::new(
            msg_type,
            inbound.recipient.as_str(),
            inbound.sender.as_str(),
            payload,
        )
        .with_expiry_date(inbound.expiry_date_ms);
        message.custom_headers = inbound.custom_headers.clone();
        message
    }

    fn subscription_reply_callback(&self, inbound: &Message) -> SubscriptionReplyCallback {
        let dispatcher = self.clone();
        let template = self.reply_to(inbound, MessageType::SubscriptionReply, String::new());
        Box::new(move |reply: SubscriptionReply| {
            info!(
                "Replying to subscription {} of {}",
                reply.subscription_id, template.recipient
            );
            match serde_json::to_string(&reply) {
                Ok(payload) => {
                    let mut message = template;
                    message.payload = payload;
                    dispatcher.send_detached(message);
                }
                Err(e) => error!("Cannot serialize subscription reply: {}", e),
            }
        })
    }

    fn parse<T: DeserializeOwned>(message: &Message) -> Option<T> {
        match serde_json::from_str(&message.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    "Dropping {} message {}: invalid payload: {}",
                    message.msg_type, message.id, e
                );
                None
            }
        }
    }

    fn uplift_subscription_expiry(&self, qos: &mut SubscriptionQos) {
        if qos.has_expiry() {
            qos.set_expiry_date_ms(self.uplift(qos.expiry_date_ms()));
        }
    }

    /// Hand an inbound message to the manager responsible for its type.
    pub fn receive(&self, message: Message) {
        debug!(
            "Received {} message {} from {}",
            message.msg_type, message.id, message.sender
        );
        let (request_reply, subscription, publication) = {
            let handlers = self.inner.handlers.read();
            (
                handlers.request_reply.clone(),
                handlers.subscription.clone(),
                handlers.publication.clone(),
            )
        };

        match message.msg_type.clone() {
            MessageType::Request => {
                let (Some(handler), Some(request)) =
                    (request_reply, Self::parse::<Request>(&message))
                else {
                    return Self::unhandled(&message);
                };
                info!("Received request {} for {}", request.method_name, message.recipient);
                let dispatcher = self.clone();
                self.inner.ctx.spawn(async move {
                    let reply = handler.handle_request(&message.recipient, request).await;
                    match serde_json::to_string(&reply) {
                        Ok(payload) => {
                            let reply = dispatcher.reply_to(&message, MessageType::Reply, payload);
                            if let Err(e) = dispatcher.send(reply).await {
                                warn!("Reply to {} failed: {}", message.sender, e);
                            }
                        }
                        Err(e) => error!("Cannot serialize reply: {}", e),
                    }
                });
            }
            MessageType::Reply => {
                let (Some(handler), Some(reply)) = (request_reply, Self::parse::<Reply>(&message))
                else {
                    return Self::unhandled(&message);
                };
                handler.handle_reply(reply);
            }
            MessageType::OneWay => {
                let (Some(handler), Some(request)) =
                    (request_reply, Self::parse::<OneWayRequest>(&message))
                else {
                    return Self::unhandled(&message);
                };
                info!(
                    "Received one way request {} for {}",
                    request.method_name, message.recipient
                );
                handler.handle_one_way_request(&message.recipient, request);
            }
            MessageType::SubscriptionRequest => {
                let (Some(handler), Some(mut request)) =
                    (publication, Self::parse::<SubscriptionRequest>(&message))
                else {
                    return Self::unhandled(&message);
                };
                self.uplift_subscription_expiry(&mut request.qos);
                info!("Received subscription to {}", request.subscribed_to_name);
                let reply = self.subscription_reply_callback(&message);
                if let Err(e) = handler.handle_subscription_request(
                    &message.sender,
                    &message.recipient,
                    request,
                    reply,
                ) {
                    warn!("Subscription request {} not handled: {}", message.id, e);
                }
            }
            MessageType::BroadcastSubscriptionRequest => {
                let (Some(handler), Some(mut request)) = (
                    publication,
                    Self::parse::<BroadcastSubscriptionRequest>(&message),
                ) else {
                    return Self::unhandled(&message);
                };
                self.uplift_subscription_expiry(&mut request.qos);
                info!("Received broadcast subscription to {}", request.subscribed_to_name);
                let reply = self.subscription_reply_callback(&message);
                if let Err(e) = handler.handle_broadcast_subscription_request(
                    &message.sender,
                    &message.recipient,
                    request,
                    reply,
                ) {
                    warn!("Broadcast subscription request {} not handled: {}", message.id, e);
                }
            }
            MessageType::MulticastSubscriptionRequest => {
                let (Some(handler), Some(mut request)) = (
                    publication,
                    Self::parse::<MulticastSubscriptionRequest>(&message),
                ) else {
                    return Self::unhandled(&message);
                };
                self.uplift_subscription_expiry(&mut request.qos);
                info!("Received multicast subscription to {}", request.subscribed_to_name);
                let reply = self.subscription_reply_callback(&message);
                if let Err(e) = handler.handle_multicast_subscription_request(
                    &message.sender,
                    &message.recipient,
                    request,
                    reply,
                ) {
                    warn!("Multicast subscription request {} not handled: {}", message.id, e);
                }
            }
            MessageType::SubscriptionStop => {
                let (Some(handler), Some(stop)) =
                    (publication, Self::parse::<SubscriptionStop>(&message))
                else {
                    return Self::unhandled(&message);
                };
                info!("Received subscription stop {}", stop.subscription_id);
                if let Err(e) = handler.handle_subscription_stop(stop) {
                    warn!("Subscription stop {} not handled: {}", message.id, e);
                }
            }
            MessageType::SubscriptionReply => {
                let (Some(handler), Some(reply)) =
                    (subscription, Self::parse::<SubscriptionReply>(&message))
                else {
                    return Self::unhandled(&message);
                };
                handler.handle_subscription_reply(reply);
            }
            MessageType::Publication => {
                let (Some(handler), Some(publication)) =
                    (subscription, Self::parse::<SubscriptionPublication>(&message))
                else {
                    return Self::unhandled(&message);
                };
                handler.handle_publication(publication);
            }
            MessageType::Multicast => {
                let (Some(handler), Some(publication)) =
                    (subscription, Self::parse::<MulticastPublication>(&message))
                else {
                    return Self::unhandled(&message);
                };
                handler.handle_multicast_publication(publication);
            }
            MessageType::Unknown(tag) => {
                error!("Unknown message type '{}', discarding message {}", tag, message.id);
            }
        }
    }

    fn unhandled(message: &Message) {
        debug!(
            "No handler took {} message {}, dropping",
            message.msg_type, message.id
        );
    }

    /// Detach all registered managers and close the outbound lanes.
    pub fn shutdown(&self) {
        *self.inner.handlers.write() = Handlers::default();
        self.inner.lanes.lock().clear();
        debug!("Dispatcher shut down");
    }
}

impl PublicationSender for Dispatcher {
    fn send_publication(
        &self,
        from: &str,
        to: &str,
        expiry_date_ms: u64,
        publication: SubscriptionPublication,
    ) {
        debug!(
            "Publication for subscription {} to {}",
            publication.subscription_id, to
        );
        match serde_json::to_string(&publication) {
            Ok(payload) => {
                let message = Message::new(MessageType::Publication, from, to, payload)
                    .with_expiry_date(self.uplift(expiry_date_ms));
                self.send_detached(message);
            }
            Err(e) => error!("Cannot serialize publication: {}", e),
        }
    }

    fn send_multicast_publication(
        &self,
        from: &str,
        expiry_date_ms: u64,
        publication: MulticastPublication,
    ) {
        debug!("Multicast publication {}", publication.multicast_id);
        match serde_json::to_string(&publication) {
            Ok(payload) => {
                let message = Message::new(
                    MessageType::Multicast,
                    from,
                    publication.multicast_id.as_str(),
                    payload,
                )
                .with_expiry_date(self.uplift(expiry_date_ms));
                self.send_detached(message);
            }
            Err(e) => error!("Cannot serialize multicast publication: {}", e),
        }
    }
}
