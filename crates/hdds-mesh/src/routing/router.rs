// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message router.
//!
//! Every message goes through **Resolve -> {Deliver | Queue | Fanout}**:
//!
//! - expired messages fail fast with [`MeshError::ExpiredMessage`]
//! - a resolvable destination gets the message through a (cached) stub
//! - an unknown destination parks the message in the [`MessageQueue`]
//!   until [`MessageRouter::participant_registered`] drains it
//! - multicasts go to every matching local receiver plus, unless the
//!   message came from the global transport, to the global fan-out address
//!
//! A child router forwards hop and multicast registrations to its parent.
//! Calls made before the parent proxy is attached are deferred and replayed
//! in their original order by [`MessageRouter::set_routing_proxy`].

use crate::context::RuntimeContext;
use crate::error::{MeshError, Result};
use crate::persistence::NoopStore;
use crate::routing::directory::AddressDirectory;
use crate::routing::multicast::{
    LocalMulticastAddressCalculator, MulticastAddressCalculator, MulticastPattern,
    MulticastReceiver,
};
use crate::routing::parent::RoutingProxy;
use crate::routing::queue::{MessageQueue, QueuedMessage};
use crate::routing::stats::{RouterStats, RouterStatsSnapshot};
use crate::routing::stub::{
    MessageListener, MessagingSkeleton, MessagingStub, SkeletonRegistry, StubFactoryRegistry,
};
use crate::types::{Address, Message, MessageType};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Default queue cap when none is supplied (10 000 KiB).
pub const DEFAULT_MAX_QUEUE_SIZE_BYTES: usize = 10_000 * 1024;

const COMPONENT: &str = "message router";

/// Registration forwarded to the parent router.
#[derive(Debug, Clone)]
enum ParentCall {
    AddNextHop {
        participant_id: String,
        is_globally_visible: bool,
    },
    RemoveNextHop {
        participant_id: String,
    },
    AddMulticastReceiver(MulticastReceiver),
    RemoveMulticastReceiver(MulticastReceiver),
}

impl ParentCall {
    async fn execute(&self, proxy: &dyn RoutingProxy, incoming: &Address) -> Result<()> {
        match self {
            ParentCall::AddNextHop {
                participant_id,
                is_globally_visible,
            } => {
                proxy
                    .add_next_hop(participant_id, incoming, *is_globally_visible)
                    .await
            }
            ParentCall::RemoveNextHop { participant_id } => {
                proxy.remove_next_hop(participant_id).await
            }
            ParentCall::AddMulticastReceiver(receiver) => {
                proxy.add_multicast_receiver(receiver).await
            }
            ParentCall::RemoveMulticastReceiver(receiver) => {
                proxy.remove_multicast_receiver(receiver).await
            }
        }
    }
}

struct DeferredCall {
    call: ParentCall,
    reply: oneshot::Sender<Result<()>>,
}

enum ParentState {
    /// No parent router: registrations stay local.
    Root,
    /// Parent configured, proxy not attached yet.
    Pending {
        incoming: Address,
        deferred: Vec<DeferredCall>,
    },
    Attached {
        incoming: Address,
        proxy: Arc<dyn RoutingProxy>,
    },
    Closed,
}

enum ReplyToMode {
    /// Messages are sent without a reply-to address.
    Disabled,
    /// Request-like messages wait until the address is set.
    Awaiting,
    Known(Address),
}

struct ReplyToState {
    mode: ReplyToMode,
    parked: Vec<(Message, oneshot::Sender<Result<()>>)>,
}

enum Stamped {
    Ready(Message),
    Parked(oneshot::Receiver<Result<()>>),
}

struct MulticastReceivers {
    pattern: MulticastPattern,
    subscribers: Vec<String>,
}

struct RouterInner {
    ctx: RuntimeContext,
    directory: Arc<AddressDirectory>,
    queue: Arc<MessageQueue>,
    stub_factories: StubFactoryRegistry,
    skeletons: SkeletonRegistry,
    multicast_calculator: Arc<dyn MulticastAddressCalculator>,
    parent_address: Option<Address>,
    stubs: Mutex<HashMap<Address, Arc<dyn MessagingStub>>>,
    multicast_receivers: Mutex<HashMap<String, MulticastReceivers>>,
    parent: Mutex<ParentState>,
    reply_to: Mutex<ReplyToState>,
    stats: RouterStats,
    running: AtomicBool,
}

/// Builder for [`MessageRouter`].
pub struct MessageRouterBuilder {
    ctx: RuntimeContext,
    directory: Option<Arc<AddressDirectory>>,
    queue: Option<Arc<MessageQueue>>,
    stub_factories: StubFactoryRegistry,
    skeletons: SkeletonRegistry,
    multicast_calculator: Arc<dyn MulticastAddressCalculator>,
    parent: Option<(Address, Address)>,
    reply_to: ReplyToMode,
}

impl MessageRouterBuilder {
    pub fn directory(mut self, directory: Arc<AddressDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn queue(mut self, queue: Arc<MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn stub_factories(mut self, factories: StubFactoryRegistry) -> Self {
        self.stub_factories = factories;
        self
    }

    pub fn skeletons(mut self, skeletons: SkeletonRegistry) -> Self {
        self.skeletons = skeletons;
        self
    }

    pub fn multicast_calculator(mut self, calculator: Arc<dyn MulticastAddressCalculator>) -> Self {
        self.multicast_calculator = calculator;
        self
    }

    /// Make this a child router of `parent_address`, reachable by the parent at `incoming_address`.
    pub fn parent(mut self, parent_address: Address, incoming_address: Address) -> Self {
        self.parent = Some((parent_address, incoming_address));
        self
    }

    /// Stamp `address` as reply-to on outgoing request-like messages.
    pub fn reply_to_address(mut self, address: Address) -> Self {
        self.reply_to = ReplyToMode::Known(address);
        self
    }

    /// Hold outgoing request-like messages until [`MessageRouter::set_reply_to_address`].
    pub fn await_reply_to_address(mut self) -> Self {
        self.reply_to = ReplyToMode::Awaiting;
        self
    }

    pub fn build(self) -> MessageRouter {
        let directory = self.directory.unwrap_or_else(|| {
            Arc::new(AddressDirectory::new(
                self.ctx.instance_id(),
                Arc::new(NoopStore),
            ))
        });
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(MessageQueue::new(
                DEFAULT_MAX_QUEUE_SIZE_BYTES,
                self.ctx.clock().clone(),
            ))
        });
        let (parent_address, parent_state) = match self.parent {
            Some((parent_address, incoming)) => (
                Some(parent_address),
                ParentState::Pending {
                    incoming,
                    deferred: Vec::new(),
                },
            ),
            None => (None, ParentState::Root),
        };

        MessageRouter {
            inner: Arc::new(RouterInner {
                ctx: self.ctx,
                directory,
                queue,
                stub_factories: self.stub_factories,
                skeletons: self.skeletons,
                multicast_calculator: self.multicast_calculator,
                parent_address,
                stubs: Mutex::new(HashMap::new()),
                multicast_receivers: Mutex::new(HashMap::new()),
                parent: Mutex::new(parent_state),
                reply_to: Mutex::new(ReplyToState {
                    mode: self.reply_to,
                    parked: Vec::new(),
                }),
                stats: RouterStats::new(),
                running: AtomicBool::new(true),
            }),
        }
    }
}

/// Handle to the message router. Cheap to clone.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn builder(ctx: RuntimeContext) -> MessageRouterBuilder {
        MessageRouterBuilder {
            ctx,
            directory: None,
            queue: None,
            stub_factories: StubFactoryRegistry::new(),
            skeletons: SkeletonRegistry::new(),
            multicast_calculator: Arc::new(LocalMulticastAddressCalculator),
            parent: None,
            reply_to: ReplyToMode::Disabled,
        }
    }

    pub fn directory(&self) -> &Arc<AddressDirectory> {
        &self.inner.directory
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.inner.queue
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MeshError::Shutdown(COMPONENT))
        }
    }

    /// Listener for skeletons: routes every inbound message on the runtime.
    pub fn inbound_listener(&self) -> MessageListener {
        let router = self.clone();
        Arc::new(move |message: Message| {
            let router_task = router.clone();
            router.inner.ctx.spawn(async move {
                let msg_id = message.id.clone();
                if let Err(e) = router_task.route(message).await {
                    debug!("Inbound message {} not routed: {}", msg_id, e);
                }
            });
        })
    }

    /// Route `message` to its recipient.
    ///
    /// Resolves once the message was handed to a stub. For an unknown
    /// recipient that happens after the participant registers; the result
    /// is an error if the message expires, is evicted or the router shuts
    /// down first.
    pub async fn route(&self, message: Message) -> Result<()> {
        self.ensure_running()?;

        let now = self.inner.ctx.now_ms();
        if message.is_expired(now) {
            warn!(
                "Dropping expired message {} to {} (expiry {}, now {})",
                message.id, message.recipient, message.expiry_date_ms, now
            );
            self.inner.stats.record_dropped();
            return Err(MeshError::ExpiredMessage {
                msg_id: message.id,
                expiry_date_ms: message.expiry_date_ms,
                now_ms: now,
            });
        }

        self.register_global_routing_entry_if_required(&message);

        if message.msg_type == MessageType::Multicast {
            return self.route_multicast(message).await;
        }

        match self.inner.directory.resolve(&message.recipient).await {
            Some(address) => self.transmit(&address, message).await,
            None => self.enqueue(message).await,
        }
    }

    async fn enqueue(&self, message: Message) -> Result<()> {
        debug!(
            "No next hop for {}, queueing message {}",
            message.recipient, message.id
        );
        let recipient = message.recipient.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .queue
            .put(QueuedMessage::with_completion(message, tx))?;
        self.inner.stats.record_queued();

        // The participant may have registered while we were resolving.
        if self.inner.directory.contains(&recipient) {
            self.participant_registered(&recipient);
        }

        rx.await
            .unwrap_or_else(|_| Err(MeshError::Shutdown(COMPONENT)))
    }

    fn register_global_routing_entry_if_required(&self, message: &Message) {
        if !message.is_received_from_global || !message.msg_type.is_request_like() {
            return;
        }
        let Some(reply_to) = message.reply_to.clone() else {
            return;
        };

        let forward = self.register_hop(&message.sender, reply_to, true);
        let sender = message.sender.clone();
        self.inner.ctx.spawn(async move {
            if let Err(e) = forward.await {
                debug!("Forwarding reverse route of {} failed: {}", sender, e);
            }
        });
    }

    fn needs_reply_to(&self, message: &Message) -> bool {
        !message.is_local_message && message.msg_type.is_request_like() && message.reply_to.is_none()
    }

    fn stamp_reply_to(&self, mut message: Message) -> Stamped {
        let mut state = self.inner.reply_to.lock();
        match &state.mode {
            ReplyToMode::Disabled => Stamped::Ready(message),
            ReplyToMode::Known(address) => {
                message.reply_to = Some(address.clone());
                Stamped::Ready(message)
            }
            ReplyToMode::Awaiting => {
                warn!(
                    "Reply-to address not known yet, holding message {}",
                    message.id
                );
                let (tx, rx) = oneshot::channel();
                state.parked.push((message, tx));
                Stamped::Parked(rx)
            }
        }
    }

    /// Set the global reply-to address and release held messages.
    pub fn set_reply_to_address(&self, address: Address) {
        let parked = {
            let mut state = self.inner.reply_to.lock();
            state.mode = ReplyToMode::Known(address);
            std::mem::take(&mut state.parked)
        };
        if parked.is_empty() {
            return;
        }

        let router = self.clone();
        self.inner.ctx.spawn(async move {
            for (message, reply) in parked {
                let result = router.route(message).await;
                let _ = reply.send(result);
            }
        });
    }

    fn stub_for(&self, address: &Address) -> Result<Arc<dyn MessagingStub>> {
        if let Some(stub) = self.inner.stubs.lock().get(address) {
            return Ok(stub.clone());
        }
        let stub = self
            .inner
            .stub_factories
            .create_stub(address)
            .inspect_err(|e| error!("Cannot create stub for {}: {}", address, e))?;
        self.inner
            .stubs
            .lock()
            .insert(address.clone(), stub.clone());
        Ok(stub)
    }

    async fn transmit(&self, address: &Address, message: Message) -> Result<()> {
        let message = if self.needs_reply_to(&message) {
            match self.stamp_reply_to(message) {
                Stamped::Ready(message) => message,
                Stamped::Parked(rx) => {
                    return rx
                        .await
                        .unwrap_or_else(|_| Err(MeshError::Shutdown(COMPONENT)))
                }
            }
        } else {
            message
        };

        let stub = self.stub_for(address)?;
        let msg_id = message.id.clone();
        let size = message.payload.len();
        match stub.transmit(message).await {
            Ok(()) => {
                debug!("Message {} sent to {}", msg_id, address);
                self.inner.stats.record_routed(size);
                Ok(())
            }
            Err(e) => {
                warn!("Transmitting message {} to {} failed: {}", msg_id, address, e);
                self.inner.stats.record_error();
                Err(e)
            }
        }
    }

    async fn route_multicast(&self, message: Message) -> Result<()> {
        let mut addresses: Vec<Address> = Vec::new();
        if !message.is_received_from_global {
            if let Some(address) = self.inner.multicast_calculator.calculate(&message) {
                addresses.push(address);
            }
        }

        let subscribers: Vec<String> = {
            let receivers = self.inner.multicast_receivers.lock();
            receivers
                .values()
                .filter(|r| r.pattern.is_match(&message.recipient))
                .flat_map(|r| r.subscribers.iter().cloned())
                .collect()
        };
        for subscriber in subscribers {
            match self.inner.directory.lookup(&subscriber) {
                Some(hop) => {
                    if !addresses.contains(&hop.address) {
                        addresses.push(hop.address);
                    }
                }
                None => debug!("Multicast receiver {} has no next hop", subscriber),
            }
        }

        if addresses.is_empty() {
            debug!("No receivers for multicast {}", message.recipient);
            self.inner.stats.record_dropped();
            return Ok(());
        }

        let deliveries = addresses
            .iter()
            .map(|address| self.transmit(address, message.clone()));
        future::join_all(deliveries).await.into_iter().collect()
    }

    fn forward_to_parent(&self, call: ParentCall) -> BoxFuture<'static, Result<()>> {
        let mut parent = self.inner.parent.lock();
        match &mut *parent {
            ParentState::Root => future::ready(Ok(())).boxed(),
            ParentState::Closed => future::ready(Err(MeshError::Shutdown(COMPONENT))).boxed(),
            ParentState::Pending { deferred, .. } => {
                debug!("Deferring {:?} until the parent router is attached", call);
                let (reply, rx) = oneshot::channel();
                deferred.push(DeferredCall { call, reply });
                async move {
                    rx.await
                        .unwrap_or_else(|_| Err(MeshError::Shutdown(COMPONENT)))
                }
                .boxed()
            }
            ParentState::Attached { incoming, proxy } => {
                let proxy = proxy.clone();
                let incoming = incoming.clone();
                async move { call.execute(proxy.as_ref(), &incoming).await }.boxed()
            }
        }
    }

    fn register_hop(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
    ) -> BoxFuture<'static, Result<()>> {
        self.inner
            .directory
            .add(participant_id, address, is_globally_visible);
        let forward = self.forward_to_parent(ParentCall::AddNextHop {
            participant_id: participant_id.to_string(),
            is_globally_visible,
        });
        self.participant_registered(participant_id);
        forward
    }

    /// Register the next hop of `participant_id` and flush its queued messages.
    pub async fn add_next_hop(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        self.register_hop(participant_id, address, is_globally_visible)
            .await
    }

    pub async fn remove_next_hop(&self, participant_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.directory.remove(participant_id);
        self.forward_to_parent(ParentCall::RemoveNextHop {
            participant_id: participant_id.to_string(),
        })
        .await
    }

    pub async fn resolve_next_hop(&self, participant_id: &str) -> Result<Option<Address>> {
        self.ensure_running()?;
        Ok(self.inner.directory.resolve(participant_id).await)
    }

    /// Route `participant_id` through the parent if it has no hop yet.
    pub fn set_to_known(&self, participant_id: &str) {
        if !self.is_running() {
            debug!("set_to_known({}) ignored, router is shut down", participant_id);
            return;
        }
        if let Some(parent_address) = &self.inner.parent_address {
            if self.inner.directory.lookup(participant_id).is_none() {
                self.inner
                    .directory
                    .cache(participant_id, parent_address.clone(), false);
            }
        }
    }

    /// Drain the queue for `participant_id` and deliver each message in order.
    pub fn participant_registered(&self, participant_id: &str) {
        let drained = self.inner.queue.drain_for(participant_id);
        if drained.is_empty() {
            return;
        }

        debug!(
            "Delivering {} queued messages to {}",
            drained.len(),
            participant_id
        );
        let router = self.clone();
        self.inner.ctx.spawn(async move {
            for entry in drained {
                router.deliver_queued(entry).await;
            }
        });
    }

    async fn deliver_queued(&self, entry: QueuedMessage) {
        let now = self.inner.ctx.now_ms();
        if entry.message.is_expired(now) {
            debug!("Queued message {} expired, dropping", entry.message.id);
            self.inner.stats.record_dropped();
            let err = MeshError::ExpiredMessage {
                msg_id: entry.message.id.clone(),
                expiry_date_ms: entry.message.expiry_date_ms,
                now_ms: now,
            };
            entry.complete(Err(err));
            return;
        }

        match self.inner.directory.lookup(&entry.message.recipient) {
            Some(hop) => {
                let (message, completion) = entry.into_parts();
                let result = self.transmit(&hop.address, message).await;
                match completion {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!("Queued message delivery failed: {}", e);
                        }
                    }
                }
            }
            None => {
                let _ = self.inner.queue.put(entry);
            }
        }
    }

    fn with_skeleton(&self, address: &Address, f: impl FnOnce(&dyn MessagingSkeleton)) {
        match self.inner.skeletons.get_skeleton(address) {
            Ok(skeleton) => f(skeleton.as_ref()),
            Err(e) => debug!("No multicast skeleton for {}: {}", address, e),
        }
    }

    /// Deliver multicasts matching `receiver.multicast_id` to the subscriber.
    pub async fn add_multicast_receiver(&self, receiver: MulticastReceiver) -> Result<()> {
        self.ensure_running()?;
        let pattern = MulticastPattern::new(&receiver.multicast_id)?;
        let provider_address = self
            .inner
            .directory
            .lookup(&receiver.provider_participant_id)
            .map(|hop| hop.address);

        let first = {
            let mut receivers = self.inner.multicast_receivers.lock();
            let entry = receivers
                .entry(receiver.multicast_id.clone())
                .or_insert_with(|| MulticastReceivers {
                    pattern,
                    subscribers: Vec::new(),
                });
            entry
                .subscribers
                .push(receiver.subscriber_participant_id.clone());
            entry.subscribers.len() == 1
        };

        if first {
            if let Some(address) = &provider_address {
                self.with_skeleton(address, |s| {
                    s.register_multicast_subscription(&receiver.multicast_id)
                });
            }
        }

        match provider_address {
            Some(address) if !address.is_in_process() => {
                self.forward_to_parent(ParentCall::AddMulticastReceiver(receiver))
                    .await
            }
            _ => Ok(()),
        }
    }

    pub async fn remove_multicast_receiver(&self, receiver: MulticastReceiver) -> Result<()> {
        self.ensure_running()?;
        let provider_address = self
            .inner
            .directory
            .lookup(&receiver.provider_participant_id)
            .map(|hop| hop.address);

        let last = {
            let mut receivers = self.inner.multicast_receivers.lock();
            match receivers.get_mut(&receiver.multicast_id) {
                Some(entry) => {
                    if let Some(pos) = entry
                        .subscribers
                        .iter()
                        .position(|s| *s == receiver.subscriber_participant_id)
                    {
                        entry.subscribers.remove(pos);
                    }
                    if entry.subscribers.is_empty() {
                        receivers.remove(&receiver.multicast_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            if let Some(address) = &provider_address {
                self.with_skeleton(address, |s| {
                    s.unregister_multicast_subscription(&receiver.multicast_id)
                });
            }
        }

        match provider_address {
            Some(address) if !address.is_in_process() => {
                self.forward_to_parent(ParentCall::RemoveMulticastReceiver(receiver))
                    .await
            }
            _ => Ok(()),
        }
    }

    pub fn has_multicast_receivers(&self) -> bool {
        !self.inner.multicast_receivers.lock().is_empty()
    }

    /// Attach the parent router proxy.
    ///
    /// Registers the proxy's own participant id with the parent, then
    /// replays every deferred call in order. Calls arriving during the
    /// replay are appended to it, so ordering is preserved.
    pub async fn set_routing_proxy(&self, proxy: Arc<dyn RoutingProxy>) -> Result<()> {
        self.ensure_running()?;
        let incoming = match &*self.inner.parent.lock() {
            ParentState::Pending { incoming, .. } | ParentState::Attached { incoming, .. } => {
                incoming.clone()
            }
            ParentState::Root => {
                return Err(MeshError::Transport(
                    "no parent router address configured".into(),
                ))
            }
            ParentState::Closed => return Err(MeshError::Shutdown(COMPONENT)),
        };

        let own_id = proxy.proxy_participant_id().to_string();
        if let Err(e) = proxy.add_next_hop(&own_id, &incoming, false).await {
            if !self.is_running() {
                debug!("Registering routing proxy failed during shutdown: {}", e);
                return Ok(());
            }
            return Err(e);
        }

        if let Some(parent_address) = &self.inner.parent_address {
            self.inner
                .directory
                .attach_parent(proxy.clone(), parent_address.clone());
        }

        loop {
            let batch = {
                let mut parent = self.inner.parent.lock();
                match &mut *parent {
                    ParentState::Pending { deferred, .. } if !deferred.is_empty() => {
                        std::mem::take(deferred)
                    }
                    ParentState::Pending { .. } | ParentState::Attached { .. } => {
                        *parent = ParentState::Attached {
                            incoming: incoming.clone(),
                            proxy: proxy.clone(),
                        };
                        break;
                    }
                    ParentState::Root | ParentState::Closed => break,
                }
            };

            for DeferredCall { call, reply } in batch {
                let result = match &call {
                    ParentCall::AddNextHop { participant_id, .. } if *participant_id == own_id => {
                        Ok(())
                    }
                    _ => call.execute(proxy.as_ref(), &incoming).await,
                };
                let _ = reply.send(result);
            }
        }
        info!("Parent routing proxy {} attached", own_id);

        let router = self.clone();
        self.inner.ctx.spawn(async move {
            for recipient in router.inner.queue.pending_recipients() {
                if router.inner.directory.resolve(&recipient).await.is_some() {
                    router.participant_registered(&recipient);
                }
            }
        });
        Ok(())
    }

    /// Reject deferred and queued work and stop routing. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let deferred = {
            let mut parent = self.inner.parent.lock();
            match std::mem::replace(&mut *parent, ParentState::Closed) {
                ParentState::Pending { deferred, .. } => deferred,
                _ => Vec::new(),
            }
        };
        for call in deferred {
            let _ = call.reply.send(Err(MeshError::Shutdown(COMPONENT)));
        }

        let parked = std::mem::take(&mut self.inner.reply_to.lock().parked);
        for (_, reply) in parked {
            let _ = reply.send(Err(MeshError::Shutdown(COMPONENT)));
        }

        self.inner.queue.shutdown();
        info!("Message router shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RuntimeClock;
    use crate::persistence::MemoryStore;
    use crate::routing::multicast::FixedMulticastAddressCalculator;
    use crate::types::AddressType;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    const NOW: u64 = 1_000_000;

    #[derive(Default)]
    struct Transport {
        sent: Mutex<Vec<(Address, Message)>>,
        failing: Mutex<HashSet<Address>>,
    }

    impl Transport {
        fn sent_to(&self, address: &Address) -> usize {
            self.sent.lock().iter().filter(|(a, _)| a == address).count()
        }

        fn total(&self) -> usize {
            self.sent.lock().len()
        }
    }

    struct RecordingStub {
        address: Address,
        transport: Arc<Transport>,
    }

    #[async_trait]
    impl MessagingStub for RecordingStub {
        async fn transmit(&self, message: Message) -> Result<()> {
            if self.transport.failing.lock().contains(&self.address) {
                return Err(MeshError::Transport("link down".into()));
            }
            self.transport
                .sent
                .lock()
                .push((self.address.clone(), message));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSkeleton {
        events: Mutex<Vec<String>>,
    }

    impl MessagingSkeleton for RecordingSkeleton {
        fn register_listener(&self, _listener: MessageListener) {}

        fn register_multicast_subscription(&self, multicast_id: &str) {
            self.events.lock().push(format!("+{}", multicast_id));
        }

        fn unregister_multicast_subscription(&self, multicast_id: &str) {
            self.events.lock().push(format!("-{}", multicast_id));
        }
    }

    #[derive(Default)]
    struct RecordingParent {
        calls: Mutex<Vec<String>>,
        known: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl RoutingProxy for RecordingParent {
        fn proxy_participant_id(&self) -> &str {
            "routing-proxy"
        }

        async fn add_next_hop(&self, participant_id: &str, _: &Address, _: bool) -> Result<()> {
            self.calls.lock().push(format!("add:{}", participant_id));
            Ok(())
        }

        async fn remove_next_hop(&self, participant_id: &str) -> Result<()> {
            self.calls.lock().push(format!("remove:{}", participant_id));
            Ok(())
        }

        async fn resolve_next_hop(&self, participant_id: &str) -> Result<bool> {
            Ok(self.known.lock().contains(participant_id))
        }

        async fn add_multicast_receiver(&self, receiver: &MulticastReceiver) -> Result<()> {
            self.calls
                .lock()
                .push(format!("add-mc:{}", receiver.multicast_id));
            Ok(())
        }

        async fn remove_multicast_receiver(&self, receiver: &MulticastReceiver) -> Result<()> {
            self.calls
                .lock()
                .push(format!("remove-mc:{}", receiver.multicast_id));
            Ok(())
        }
    }

    fn uds(path: &str) -> Address {
        Address::Uds { path: path.into() }
    }

    fn ctx() -> RuntimeContext {
        RuntimeContext::new(
            "test",
            Arc::new(RuntimeClock::anchored_at(NOW)),
            tokio::runtime::Handle::current(),
        )
    }

    fn builder(transport: &Arc<Transport>) -> MessageRouterBuilder {
        let transport = transport.clone();
        let factory = move |address: &Address| -> Result<Arc<dyn MessagingStub>> {
            Ok(Arc::new(RecordingStub {
                address: address.clone(),
                transport: transport.clone(),
            }))
        };
        let factory: Arc<dyn crate::routing::stub::MessagingStubFactory> = Arc::new(factory);
        MessageRouter::builder(ctx())
            .directory(Arc::new(AddressDirectory::new(
                "test",
                Arc::new(MemoryStore::new()),
            )))
            .stub_factories(
                StubFactoryRegistry::new()
                    .with_factory(AddressType::Uds, factory.clone())
                    .with_factory(AddressType::InProcess, factory),
            )
    }

    fn request(to: &str, ttl_ms: u64) -> Message {
        Message::new(MessageType::Request, "proxy", to, "{}").with_expiry_date(NOW + ttl_ms)
    }

    fn multicast(id: &str, from_global: bool) -> Message {
        Message::new(MessageType::Multicast, "provider", id, "{}")
            .with_expiry_date(NOW + 60_000)
            .received_from_global(from_global)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_fails_fast() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();
        let mut msg = request("p1", 0);
        msg.expiry_date_ms = NOW - 1;

        let result = router.route(msg).await;
        assert!(matches!(result, Err(MeshError::ExpiredMessage { .. })));
        assert_eq!(transport.total(), 0);
        assert!(router.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_participant_delivered() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();
        router
            .add_next_hop("p1", uds("/p1"), false)
            .await
            .expect("add hop");

        router.route(request("p1", 1_000)).await.expect("routed");
        assert_eq!(transport.sent_to(&uds("/p1")), 1);
        assert_eq!(router.stats().messages_routed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_participant_queued_until_registered() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.route(request("p1", 5_000)).await }
        });
        settle().await;
        assert_eq!(router.queue().len(), 1);
        assert_eq!(transport.total(), 0);

        router
            .add_next_hop("p1", uds("/p1"), false)
            .await
            .expect("add hop");
        pending.await.expect("join").expect("delivered");

        assert_eq!(transport.sent_to(&uds("/p1")), 1);
        assert!(router.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_keep_fifo_order() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();

        let mut ids = Vec::new();
        let mut pending = Vec::new();
        for _ in 0..3 {
            let msg = request("p1", 5_000);
            ids.push(msg.id.clone());
            let router = router.clone();
            pending.push(tokio::spawn(async move { router.route(msg).await }));
            settle().await;
        }

        router
            .add_next_hop("p1", uds("/p1"), false)
            .await
            .expect("add hop");
        for handle in pending {
            handle.await.expect("join").expect("delivered");
        }

        let sent: Vec<String> = transport.sent.lock().iter().map(|(_, m)| m.id.clone()).collect();
        assert_eq!(sent, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_expiring_in_queue_is_dropped() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.route(request("p1", 100)).await }
        });
        settle().await;
        tokio::time::advance(Duration::from_millis(200)).await;

        router
            .add_next_hop("p1", uds("/p1"), false)
            .await
            .expect("add hop");
        let result = pending.await.expect("join");
        assert!(matches!(result, Err(MeshError::ExpiredMessage { .. })));
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_reaches_caller() {
        let transport = Arc::new(Transport::default());
        transport.failing.lock().insert(uds("/p1"));
        let router = builder(&transport).build();
        router
            .add_next_hop("p1", uds("/p1"), false)
            .await
            .expect("add hop");

        let result = router.route(request("p1", 1_000)).await;
        assert!(matches!(result, Err(MeshError::Transport(_))));
        assert_eq!(router.stats().transmit_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_address_type() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();
        router
            .add_next_hop(
                "p1",
                Address::Browser {
                    window_id: "w1".into(),
                },
                false,
            )
            .await
            .expect("add hop");

        let result = router.route(request("p1", 1_000)).await;
        assert!(matches!(result, Err(MeshError::UnknownAddressType(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_request_registers_reverse_route() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).build();
        router
            .add_next_hop("provider", uds("/provider"), false)
            .await
            .expect("add hop");

        let msg = request("provider", 1_000)
            .with_reply_to(uds("/remote-proxy"))
            .received_from_global(true);
        router.route(msg).await.expect("routed");

        let hop = router.directory().lookup("proxy").expect("reverse route");
        assert_eq!(hop.address, uds("/remote-proxy"));
        assert!(hop.is_globally_visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_multicast_without_receivers_not_sent() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .multicast_calculator(Arc::new(FixedMulticastAddressCalculator::new(uds(
                "/global",
            ))))
            .build();

        router
            .route(multicast("provider/tick", true))
            .await
            .expect("routed");
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_multicast_reaches_local_receivers_only() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .multicast_calculator(Arc::new(FixedMulticastAddressCalculator::new(uds(
                "/global",
            ))))
            .build();
        router.add_next_hop("s1", uds("/s1"), false).await.expect("hop");
        router.add_next_hop("s2", uds("/s2"), false).await.expect("hop");
        for s in ["s1", "s2"] {
            router
                .add_multicast_receiver(MulticastReceiver::new("provider/tick", s, "provider"))
                .await
                .expect("receiver");
        }

        router
            .route(multicast("provider/tick", true))
            .await
            .expect("routed");
        assert_eq!(transport.total(), 2);
        assert_eq!(transport.sent_to(&uds("/global")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_multicast_adds_global_fanout() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .multicast_calculator(Arc::new(FixedMulticastAddressCalculator::new(uds(
                "/global",
            ))))
            .build();
        router.add_next_hop("s1", uds("/s1"), false).await.expect("hop");
        router.add_next_hop("s2", uds("/s2"), false).await.expect("hop");
        router.add_next_hop("s3", uds("/s2"), false).await.expect("hop");
        for s in ["s1", "s2", "s3"] {
            router
                .add_multicast_receiver(MulticastReceiver::new("provider/tick/+", s, "provider"))
                .await
                .expect("receiver");
        }

        router
            .route(multicast("provider/tick/eu", false))
            .await
            .expect("routed");
        assert_eq!(transport.total(), 3);
        assert_eq!(transport.sent_to(&uds("/global")), 1);
        assert_eq!(transport.sent_to(&uds("/s2")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_skeleton_registered_once() {
        let transport = Arc::new(Transport::default());
        let skeleton = Arc::new(RecordingSkeleton::default());
        let router = builder(&transport)
            .skeletons(SkeletonRegistry::new().with_skeleton(AddressType::Uds, skeleton.clone()))
            .build();
        router
            .add_next_hop("provider", uds("/provider"), false)
            .await
            .expect("hop");

        let a = MulticastReceiver::new("provider/tick", "s1", "provider");
        let b = MulticastReceiver::new("provider/tick", "s2", "provider");
        router.add_multicast_receiver(a.clone()).await.expect("add");
        router.add_multicast_receiver(b.clone()).await.expect("add");
        assert!(router.has_multicast_receivers());
        router.remove_multicast_receiver(a).await.expect("remove");
        router.remove_multicast_receiver(b).await.expect("remove");

        assert!(!router.has_multicast_receivers());
        assert_eq!(
            skeleton.events.lock().as_slice(),
            &["+provider/tick".to_string(), "-provider/tick".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_defers_calls_until_proxy_attached() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .parent(uds("/parent"), uds("/child"))
            .build();

        let add = tokio::spawn({
            let router = router.clone();
            async move { router.add_next_hop("p1", uds("/p1"), true).await }
        });
        settle().await;
        let remove = tokio::spawn({
            let router = router.clone();
            async move { router.remove_next_hop("p2").await }
        });
        settle().await;
        assert!(!add.is_finished());

        let parent = Arc::new(RecordingParent::default());
        router
            .set_routing_proxy(parent.clone())
            .await
            .expect("attach");
        add.await.expect("join").expect("replayed");
        remove.await.expect("join").expect("replayed");

        router
            .add_next_hop("p3", uds("/p3"), false)
            .await
            .expect("direct");
        assert_eq!(
            parent.calls.lock().as_slice(),
            &[
                "add:routing-proxy".to_string(),
                "add:p1".to_string(),
                "remove:p2".to_string(),
                "add:p3".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_receiver_forwarded_for_remote_provider() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .parent(uds("/parent"), uds("/child"))
            .build();
        let parent = Arc::new(RecordingParent::default());
        router.set_routing_proxy(parent.clone()).await.expect("attach");

        router
            .add_next_hop("remote", uds("/remote"), false)
            .await
            .expect("hop");
        router
            .add_next_hop("local", Address::in_process("local"), false)
            .await
            .expect("hop");
        router
            .add_multicast_receiver(MulticastReceiver::new("remote/tick", "s1", "remote"))
            .await
            .expect("add");
        router
            .add_multicast_receiver(MulticastReceiver::new("local/tick", "s1", "local"))
            .await
            .expect("add");

        let calls = parent.calls.lock().clone();
        assert!(calls.contains(&"add-mc:remote/tick".to_string()));
        assert!(!calls.contains(&"add-mc:local/tick".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_resolves_unknown_participant() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .parent(uds("/parent"), uds("/child"))
            .build();

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.route(request("remote", 5_000)).await }
        });
        settle().await;
        assert_eq!(router.queue().len(), 1);

        let parent = Arc::new(RecordingParent::default());
        parent.known.lock().insert("remote".into());
        router.set_routing_proxy(parent).await.expect("attach");

        pending.await.expect("join").expect("delivered");
        assert_eq!(transport.sent_to(&uds("/parent")), 1);

        router.route(request("remote", 5_000)).await.expect("routed");
        assert_eq!(transport.sent_to(&uds("/parent")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_held_until_known() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport).await_reply_to_address().build();
        router.add_next_hop("p1", uds("/p1"), false).await.expect("hop");

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.route(request("p1", 5_000)).await }
        });
        settle().await;
        assert_eq!(transport.total(), 0);

        router.set_reply_to_address(uds("/me"));
        pending.await.expect("join").expect("delivered");

        let sent = transport.sent.lock();
        assert_eq!(sent[0].1.reply_to, Some(uds("/me")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_to_known_uses_parent() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .parent(uds("/parent"), uds("/child"))
            .build();
        router.set_to_known("remote");
        router
            .add_next_hop("local", uds("/local"), false)
            .await
            .expect("hop");
        router.set_to_known("local");

        assert_eq!(
            router.directory().lookup("remote").map(|h| h.address),
            Some(uds("/parent"))
        );
        assert_eq!(
            router.directory().lookup("local").map(|h| h.address),
            Some(uds("/local"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_pending_work() {
        let transport = Arc::new(Transport::default());
        let router = builder(&transport)
            .parent(uds("/parent"), uds("/child"))
            .build();

        let deferred = tokio::spawn({
            let router = router.clone();
            async move { router.add_next_hop("p1", uds("/p1"), false).await }
        });
        let queued = tokio::spawn({
            let router = router.clone();
            async move { router.route(request("nobody", 5_000)).await }
        });
        settle().await;

        router.shutdown();
        router.shutdown();

        assert!(matches!(
            deferred.await.expect("join"),
            Err(MeshError::Shutdown(_))
        ));
        assert!(matches!(
            queued.await.expect("join"),
            Err(MeshError::Shutdown(_))
        ));
        assert!(matches!(
            router.route(request("p1", 1_000)).await,
            Err(MeshError::Shutdown(_))
        ));
    }
}
