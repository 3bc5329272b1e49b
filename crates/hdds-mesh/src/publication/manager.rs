// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider-side subscription lifecycles and publication timing.
//!
//! The manager owns one publication state per subscription, keyed by
//! subscription id, plus indexes by (provider, attribute/event name) and by
//! multicast id. Each state owns its timers:
//!
//! - **interval**: periodic period or keep-alive max interval, re-armed after
//!   every publication
//! - **debounce**: armed when a change arrives inside `min_interval_ms`
//! - **expiry**: removes the subscription at its QoS expiry date
//!
//! Timers are tokio tasks holding a weak reference to the manager. Each one
//! carries a sequence number so a timer replaced while already firing is
//! ignored.
//!
//! Requests for providers that are not registered yet are queued, reply
//! callback included, until [`PublicationManager::add_publication_provider`].
//! Active and queued subscriptions are written to the key/value store and
//! come back with [`PublicationManager::restore`].

use crate::config::PublicationConfig;
use crate::context::RuntimeContext;
use crate::dispatch::{PublicationHandler, PublicationSender, SubscriptionReplyCallback};
use crate::error::{MeshError, Result};
use crate::persistence::KeyValueStore;
use crate::publication::provider::{EventFiring, ObserverId, Provider};
use crate::routing::multicast_id;
use crate::types::{
    BroadcastSubscriptionRequest, MulticastPublication, MulticastSubscriptionRequest,
    SubscriptionException, SubscriptionPublication, SubscriptionQos, SubscriptionReply,
    SubscriptionRequest, SubscriptionStop,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subscription request as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum StoredRequest {
    Attribute(SubscriptionRequest),
    Broadcast(BroadcastSubscriptionRequest),
    Multicast(MulticastSubscriptionRequest),
}

impl StoredRequest {
    fn subscription_id(&self) -> &str {
        match self {
            StoredRequest::Attribute(r) => &r.subscription_id,
            StoredRequest::Broadcast(r) => &r.subscription_id,
            StoredRequest::Multicast(r) => &r.subscription_id,
        }
    }

    fn subscribed_to_name(&self) -> &str {
        match self {
            StoredRequest::Attribute(r) => &r.subscribed_to_name,
            StoredRequest::Broadcast(r) => &r.subscribed_to_name,
            StoredRequest::Multicast(r) => &r.subscribed_to_name,
        }
    }

    fn qos(&self) -> &SubscriptionQos {
        match self {
            StoredRequest::Attribute(r) => &r.qos,
            StoredRequest::Broadcast(r) => &r.qos,
            StoredRequest::Multicast(r) => &r.qos,
        }
    }

    fn is_attribute(&self) -> bool {
        matches!(self, StoredRequest::Attribute(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRecord {
    proxy_participant_id: String,
    provider_participant_id: String,
    request: StoredRequest,
}

impl SubscriptionRecord {
    fn subscription_id(&self) -> &str {
        self.request.subscription_id()
    }

    fn index_key(&self) -> (String, String) {
        (
            self.provider_participant_id.clone(),
            self.request.subscribed_to_name().to_string(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Interval,
    Debounce,
    Expiry,
}

struct Timer {
    seq: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

struct PublicationState {
    record: SubscriptionRecord,
    last_publication_ms: Option<u64>,
    pending_value: Option<Value>,
    interval: Option<Timer>,
    debounce: Option<Timer>,
    expiry: Option<Timer>,
}

impl PublicationState {
    fn new(record: SubscriptionRecord) -> Self {
        Self {
            record,
            last_publication_ms: None,
            pending_value: None,
            interval: None,
            debounce: None,
            expiry: None,
        }
    }

    fn timer_mut(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Interval => &mut self.interval,
            TimerKind::Debounce => &mut self.debounce,
            TimerKind::Expiry => &mut self.expiry,
        }
    }

    fn cancel_timers(&mut self) {
        for timer in [self.interval.take(), self.debounce.take(), self.expiry.take()]
            .into_iter()
            .flatten()
        {
            timer.cancel();
        }
        self.pending_value = None;
    }

    fn elapsed_since_publication(&self, now_ms: u64) -> Option<u64> {
        self.last_publication_ms
            .map(|last| now_ms.saturating_sub(last))
    }
}

struct ProviderEntry {
    provider: Arc<Provider>,
    attribute_observers: Vec<(String, ObserverId)>,
    event_observers: Vec<(String, ObserverId)>,
}

impl ProviderEntry {
    fn detach(&self) {
        for (name, id) in &self.attribute_observers {
            if let Some(attribute) = self.provider.attribute(name) {
                attribute.unregister_observer(*id);
            }
        }
        for (name, id) in &self.event_observers {
            if let Some(event) = self.provider.event(name) {
                event.unregister_observer(*id);
            }
        }
    }
}

struct QueuedSubscription {
    record: SubscriptionRecord,
    reply: Option<SubscriptionReplyCallback>,
    expiry: Option<Timer>,
}

impl QueuedSubscription {
    fn cancel_expiry(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.cancel();
        }
    }
}

#[derive(Default)]
struct State {
    running: bool,
    providers: HashMap<String, ProviderEntry>,
    subscriptions: HashMap<String, PublicationState>,
    by_attribute: HashMap<(String, String), BTreeSet<String>>,
    by_event: HashMap<(String, String), BTreeSet<String>>,
    by_multicast_id: HashMap<String, BTreeSet<String>>,
    queued: HashMap<String, QueuedSubscription>,
    persisted: BTreeSet<String>,
}

impl State {
    fn ids_for(index: &HashMap<(String, String), BTreeSet<String>>, key: &(String, String)) -> Vec<String> {
        index
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn index_insert<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<String>>,
    key: K,
    subscription_id: &str,
) {
    index
        .entry(key)
        .or_default()
        .insert(subscription_id.to_string());
}

fn index_remove<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<String>>,
    key: &K,
    subscription_id: &str,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(subscription_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

enum Validation {
    Admit,
    Queue,
    Reject(String),
}

enum Outgoing {
    Publication {
        from: String,
        to: String,
        expiry_date_ms: u64,
        publication: SubscriptionPublication,
    },
    Multicast {
        from: String,
        expiry_date_ms: u64,
        publication: MulticastPublication,
    },
}

fn respond(
    reply: Option<SubscriptionReplyCallback>,
    subscription_id: &str,
    outcome: std::result::Result<(), SubscriptionException>,
) {
    if let Some(reply) = reply {
        reply(match outcome {
            Ok(()) => SubscriptionReply::ok(subscription_id),
            Err(e) => SubscriptionReply::failed(e),
        });
    }
}

struct PublicationManagerInner {
    ctx: RuntimeContext,
    sender: Arc<dyn PublicationSender>,
    store: Arc<dyn KeyValueStore>,
    min_period_ms: u64,
    multicast_publication_ttl_ms: u64,
    next_timer_seq: AtomicU64,
    state: Mutex<State>,
}

/// Provider-side subscription manager.
#[derive(Clone)]
pub struct PublicationManager {
    inner: Arc<PublicationManagerInner>,
}

impl PublicationManager {
    pub fn new(
        ctx: RuntimeContext,
        sender: Arc<dyn PublicationSender>,
        store: Arc<dyn KeyValueStore>,
        config: &PublicationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PublicationManagerInner {
                ctx,
                sender,
                store,
                min_period_ms: config.min_period_ms,
                multicast_publication_ttl_ms: config.default_publication_ttl_ms,
                next_timer_seq: AtomicU64::new(0),
                state: Mutex::new(State {
                    running: true,
                    ..State::default()
                }),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Store key holding the list of persisted subscription ids.
    pub fn storage_key(&self) -> String {
        format!("subscriptions_{}", self.inner.ctx.instance_id())
    }

    /// Register `provider` and process the subscriptions queued for it.
    pub fn add_publication_provider(
        &self,
        provider_participant_id: &str,
        provider: Arc<Provider>,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(MeshError::Shutdown("publication manager"));
        }

        let mut attribute_observers = Vec::new();
        for (name, attribute) in provider.attributes() {
            if !attribute.is_notifiable() {
                continue;
            }
            let weak = Arc::downgrade(&self.inner);
            let participant_id = provider_participant_id.to_string();
            let attribute_name = name.clone();
            let id = attribute.register_observer(Arc::new(move |value: Value| {
                if let Some(inner) = weak.upgrade() {
                    PublicationManager { inner }.attribute_value_changed(
                        &participant_id,
                        &attribute_name,
                        value,
                    );
                }
            }));
            attribute_observers.push((name.clone(), id));
        }

        let mut event_observers = Vec::new();
        for event in provider.events() {
            let weak = Arc::downgrade(&self.inner);
            let participant_id = provider_participant_id.to_string();
            let event_name = event.name().to_string();
            let id = event.register_observer(Arc::new(move |firing: &EventFiring| {
                if let Some(inner) = weak.upgrade() {
                    PublicationManager { inner }.event_fired(&participant_id, &event_name, firing);
                }
            }));
            event_observers.push((event.name().to_string(), id));
        }

        let entry = ProviderEntry {
            provider,
            attribute_observers,
            event_observers,
        };

        let (replaced, queued) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                drop(state);
                entry.detach();
                return Err(MeshError::Shutdown("publication manager"));
            }
            let replaced = state
                .providers
                .insert(provider_participant_id.to_string(), entry);
            let ids: Vec<String> = state
                .queued
                .iter()
                .filter(|(_, q)| q.record.provider_participant_id == provider_participant_id)
                .map(|(id, _)| id.clone())
                .collect();
            let queued: Vec<QueuedSubscription> = ids
                .iter()
                .filter_map(|id| state.queued.remove(id))
                .map(|mut queued| {
                    queued.cancel_expiry();
                    queued
                })
                .collect();
            (replaced, queued)
        };
        if let Some(replaced) = replaced {
            replaced.detach();
        }

        info!(
            "Publication provider {} registered ({} queued subscriptions)",
            provider_participant_id,
            queued.len()
        );
        for queued in queued {
            self.subscribe(queued.record, queued.reply)?;
        }
        Ok(())
    }

    /// Unregister a provider and stop every subscription it owns.
    pub fn remove_publication_provider(&self, provider_participant_id: &str) -> Result<()> {
        let entry = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return Err(MeshError::Shutdown("publication manager"));
            }
            let entry = state.providers.remove(provider_participant_id);
            let ids: Vec<String> = state
                .subscriptions
                .values()
                .filter(|s| s.record.provider_participant_id == provider_participant_id)
                .map(|s| s.record.subscription_id().to_string())
                .collect();
            for id in &ids {
                self.remove_locked(&mut state, id);
            }
            info!(
                "Publication provider {} removed, {} subscriptions stopped",
                provider_participant_id,
                ids.len()
            );
            entry
        };
        if let Some(entry) = entry {
            entry.detach();
        }
        Ok(())
    }

    /// Re-handle the subscriptions persisted by a previous run.
    ///
    /// Returns the number of records read. Subscriptions whose provider is
    /// not registered yet are queued; expired ones are dropped.
    pub fn restore(&self) -> Result<usize> {
        if !self.is_running() {
            return Err(MeshError::Shutdown("publication manager"));
        }
        let Some(index) = self.inner.store.get_item(&self.storage_key())? else {
            return Ok(0);
        };
        let ids: Vec<String> = serde_json::from_str(&index)?;

        let mut records = Vec::new();
        for id in ids {
            if self.is_known(&id) {
                continue;
            }
            match self.inner.store.get_item(&id) {
                Ok(Some(json)) => match serde_json::from_str::<SubscriptionRecord>(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Discarding unreadable subscription {}: {}", id, e),
                },
                Ok(None) => warn!("Persisted subscription {} has no record", id),
                Err(e) => warn!("Cannot read subscription {}: {}", id, e),
            }
            if let Err(e) = self.inner.store.remove_item(&id) {
                warn!("Cannot remove persisted subscription {}: {}", id, e);
            }
        }
        {
            let state = self.inner.state.lock();
            self.write_index(&state);
        }

        let count = records.len();
        for record in records {
            self.subscribe(record, None)?;
        }
        info!("Restored {} persisted subscriptions", count);
        Ok(count)
    }

    /// Cancel every timer, detach from providers and fail queued requests.
    ///
    /// Persisted subscriptions stay in the store for [`restore`](Self::restore).
    pub fn shutdown(&self) {
        let (providers, queued) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            for (_, mut subscription) in state.subscriptions.drain() {
                subscription.cancel_timers();
            }
            state.by_attribute.clear();
            state.by_event.clear();
            state.by_multicast_id.clear();
            let providers: Vec<ProviderEntry> =
                state.providers.drain().map(|(_, entry)| entry).collect();
            let queued: Vec<QueuedSubscription> = state
                .queued
                .drain()
                .map(|(_, mut queued)| {
                    queued.cancel_expiry();
                    queued
                })
                .collect();
            (providers, queued)
        };

        for entry in &providers {
            entry.detach();
        }
        for queued in queued {
            let id = queued.record.subscription_id().to_string();
            respond(
                queued.reply,
                &id,
                Err(SubscriptionException::new(
                    id.as_str(),
                    "publication manager is shut down",
                )),
            );
        }
        info!("Publication manager shut down");
    }

    /// True if any subscription is active or queued.
    pub fn has_subscriptions(&self) -> bool {
        let state = self.inner.state.lock();
        !state.subscriptions.is_empty() || !state.queued.is_empty()
    }

    pub fn has_multicast_subscriptions(&self) -> bool {
        !self.inner.state.lock().by_multicast_id.is_empty()
    }

    pub fn has_subscriptions_for_provider_attribute(
        &self,
        provider_participant_id: &str,
        attribute_name: &str,
    ) -> bool {
        self.inner
            .state
            .lock()
            .by_attribute
            .contains_key(&(provider_participant_id.to_string(), attribute_name.to_string()))
    }

    pub fn has_subscriptions_for_provider_event(
        &self,
        provider_participant_id: &str,
        event_name: &str,
    ) -> bool {
        self.inner
            .state
            .lock()
            .by_event
            .contains_key(&(provider_participant_id.to_string(), event_name.to_string()))
    }

    fn is_known(&self, subscription_id: &str) -> bool {
        let state = self.inner.state.lock();
        state.subscriptions.contains_key(subscription_id) || state.queued.contains_key(subscription_id)
    }

    fn subscribe(
        &self,
        record: SubscriptionRecord,
        reply: Option<SubscriptionReplyCallback>,
    ) -> Result<()> {
        let subscription_id = record.subscription_id().to_string();
        let is_attribute = record.request.is_attribute();

        let outcome = {
            let mut state = self.inner.state.lock();
            if !state.running {
                drop(state);
                respond(
                    reply,
                    &subscription_id,
                    Err(SubscriptionException::new(
                        subscription_id.as_str(),
                        "publication manager is shut down",
                    )),
                );
                return Err(MeshError::Shutdown("publication manager"));
            }

            // A request reusing an id replaces the previous subscription.
            self.remove_locked(&mut state, &subscription_id);

            match self.validate(&state, &record) {
                Validation::Queue => {
                    info!(
                        "Provider {} not registered, queueing subscription {}",
                        record.provider_participant_id, subscription_id
                    );
                    self.persist(&mut state, &record);
                    let qos = record.request.qos();
                    let expiry = qos.has_expiry().then(|| {
                        let delay = qos.expiry_date_ms().saturating_sub(self.inner.ctx.now_ms());
                        self.arm_timer(&subscription_id, TimerKind::Expiry, delay)
                    });
                    state.queued.insert(
                        subscription_id,
                        QueuedSubscription {
                            record,
                            reply,
                            expiry,
                        },
                    );
                    return Ok(());
                }
                Validation::Reject(reason) => {
                    warn!("Subscription {} rejected: {}", subscription_id, reason);
                    Err(SubscriptionException::new(subscription_id.as_str(), reason))
                }
                Validation::Admit => {
                    self.activate(&mut state, record);
                    debug!("Subscription {} active", subscription_id);
                    Ok(())
                }
            }
        };

        let admitted = outcome.is_ok();
        respond(reply, &subscription_id, outcome);
        if admitted && is_attribute {
            self.trigger_publication(&subscription_id);
        }
        Ok(())
    }

    fn validate(&self, state: &State, record: &SubscriptionRecord) -> Validation {
        let qos = record.request.qos();
        let now = self.inner.ctx.now_ms();
        if qos.has_expiry() && qos.expiry_date_ms() < now {
            return Validation::Reject(format!(
                "expiry date {} ms lies in the past (now {} ms)",
                qos.expiry_date_ms(),
                now
            ));
        }

        let Some(entry) = state.providers.get(&record.provider_participant_id) else {
            return Validation::Queue;
        };
        let provider = &entry.provider;
        let name = record.request.subscribed_to_name();

        match &record.request {
            StoredRequest::Attribute(request) => {
                let Some(attribute) = provider.attribute(name) else {
                    return Validation::Reject(format!(
                        "provider {} has no attribute {}",
                        record.provider_participant_id, name
                    ));
                };
                if !attribute.is_notifiable() {
                    return Validation::Reject(format!("attribute {} is not notifiable", name));
                }
                if let Some(period_ms) = request.qos.period_ms() {
                    if period_ms < self.inner.min_period_ms {
                        return Validation::Reject(format!(
                            "period {} ms is below the minimum of {} ms",
                            period_ms, self.inner.min_period_ms
                        ));
                    }
                }
                Validation::Admit
            }
            StoredRequest::Broadcast(request) => {
                let Some(event) = provider.event(name) else {
                    return Validation::Reject(format!(
                        "provider {} has no event {}",
                        record.provider_participant_id, name
                    ));
                };
                if !event.is_selective() {
                    return Validation::Reject(format!(
                        "event {} is not selective, use a multicast subscription",
                        name
                    ));
                }
                match event.check_filter_parameters(request.filter_parameters.as_ref()) {
                    Ok(()) => Validation::Admit,
                    Err(mismatched) => Validation::Reject(format!(
                        "filter parameters of event {} do not match: {:?}",
                        name, mismatched
                    )),
                }
            }
            StoredRequest::Multicast(_) => match provider.event(name) {
                None => Validation::Reject(format!(
                    "provider {} has no event {}",
                    record.provider_participant_id, name
                )),
                Some(event) if event.is_selective() => Validation::Reject(format!(
                    "event {} is selective, use a broadcast subscription",
                    name
                )),
                Some(_) => Validation::Admit,
            },
        }
    }

    fn activate(&self, state: &mut State, record: SubscriptionRecord) {
        let subscription_id = record.subscription_id().to_string();
        let qos = record.request.qos().clone();
        let key = record.index_key();

        match &record.request {
            StoredRequest::Attribute(_) => index_insert(&mut state.by_attribute, key, &subscription_id),
            StoredRequest::Broadcast(_) => index_insert(&mut state.by_event, key, &subscription_id),
            StoredRequest::Multicast(request) => {
                index_insert(&mut state.by_event, key, &subscription_id);
                index_insert(
                    &mut state.by_multicast_id,
                    request.multicast_id.clone(),
                    &subscription_id,
                );
            }
        }
        self.persist(state, &record);

        let is_attribute = record.request.is_attribute();
        let mut subscription = PublicationState::new(record);
        if qos.has_expiry() {
            let delay = qos.expiry_date_ms().saturating_sub(self.inner.ctx.now_ms());
            subscription.expiry = Some(self.arm_timer(&subscription_id, TimerKind::Expiry, delay));
        }
        if is_attribute {
            if let Some(period_ms) = qos.period_ms() {
                subscription.interval =
                    Some(self.arm_timer(&subscription_id, TimerKind::Interval, period_ms));
            }
        }
        state.subscriptions.insert(subscription_id, subscription);
    }

    fn remove_locked(&self, state: &mut State, subscription_id: &str) -> bool {
        let removed = match state.subscriptions.remove(subscription_id) {
            Some(mut subscription) => {
                subscription.cancel_timers();
                let key = subscription.record.index_key();
                match &subscription.record.request {
                    StoredRequest::Attribute(_) => {
                        index_remove(&mut state.by_attribute, &key, subscription_id)
                    }
                    StoredRequest::Broadcast(_) => {
                        index_remove(&mut state.by_event, &key, subscription_id)
                    }
                    StoredRequest::Multicast(request) => {
                        index_remove(&mut state.by_event, &key, subscription_id);
                        index_remove(
                            &mut state.by_multicast_id,
                            &request.multicast_id,
                            subscription_id,
                        );
                    }
                }
                true
            }
            None => state
                .queued
                .remove(subscription_id)
                .map(|mut queued| queued.cancel_expiry())
                .is_some(),
        };
        if removed {
            self.unpersist(state, subscription_id);
        }
        removed
    }

    fn arm_timer(&self, subscription_id: &str, kind: TimerKind, delay_ms: u64) -> Timer {
        let seq = self.inner.next_timer_seq.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let subscription_id = subscription_id.to_string();
        let handle = self.inner.ctx.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(inner) = weak.upgrade() {
                PublicationManager { inner }.timer_fired(&subscription_id, kind, seq);
            }
        });
        Timer { seq, handle }
    }

    fn timer_fired(&self, subscription_id: &str, kind: TimerKind, seq: u64) {
        let mut outgoing = Vec::new();
        let mut trigger = false;
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            let queued_expired = state.queued.get(subscription_id).map(|queued| {
                kind == TimerKind::Expiry && queued.expiry.as_ref().map(|t| t.seq) == Some(seq)
            });
            if let Some(expired) = queued_expired {
                if expired {
                    self.expire_queued(state, subscription_id);
                }
                return;
            }
            let Some(subscription) = state.subscriptions.get_mut(subscription_id) else {
                return;
            };
            let slot = subscription.timer_mut(kind);
            if slot.as_ref().map(|t| t.seq) != Some(seq) {
                return;
            }
            *slot = None;

            match kind {
                TimerKind::Interval => trigger = true,
                TimerKind::Debounce => {
                    if let Some(value) = subscription.pending_value.take() {
                        self.prepare_attribute_publication(subscription, value, &mut outgoing);
                    }
                }
                TimerKind::Expiry => {
                    debug!("Subscription {} expired", subscription_id);
                    self.remove_locked(&mut state, subscription_id);
                }
            }
            self.flush(outgoing);
        }
        if trigger {
            self.trigger_publication(subscription_id);
        }
    }

    /// Drop a queued request whose provider never registered before expiry.
    fn expire_queued(&self, mut state: MutexGuard<'_, State>, subscription_id: &str) {
        let Some(mut queued) = state.queued.remove(subscription_id) else {
            return;
        };
        queued.expiry = None;
        self.unpersist(&mut state, subscription_id);
        drop(state);

        info!(
            "Queued subscription {} expired before provider {} registered",
            subscription_id, queued.record.provider_participant_id
        );
        respond(
            queued.reply,
            subscription_id,
            Err(SubscriptionException::new(
                subscription_id,
                "subscription expired before the provider registered",
            )),
        );
    }

    /// Read the attribute and publish the result.
    fn trigger_publication(&self, subscription_id: &str) {
        let attribute = {
            let state = self.inner.state.lock();
            let Some(subscription) = state.subscriptions.get(subscription_id) else {
                return;
            };
            let record = &subscription.record;
            state
                .providers
                .get(&record.provider_participant_id)
                .and_then(|entry| entry.provider.attribute(record.request.subscribed_to_name()))
                .cloned()
        };
        let Some(attribute) = attribute else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let subscription_id = subscription_id.to_string();
        self.inner.ctx.spawn(async move {
            let value = attribute.get().await;
            if let Some(inner) = weak.upgrade() {
                PublicationManager { inner }.attribute_read(&subscription_id, value);
            }
        });
    }

    fn attribute_read(&self, subscription_id: &str, value: Result<Value>) {
        let mut outgoing = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            let Some(subscription) = state.subscriptions.get_mut(subscription_id) else {
                return;
            };
            match value {
                Ok(value) => self.prepare_attribute_publication(subscription, value, &mut outgoing),
                Err(e) => {
                    warn!("Getter of subscription {} failed: {}", subscription_id, e);
                    outgoing.push(self.publication(subscription, Err(e.to_string())));
                    self.rearm_interval(subscription);
                }
            }
            self.flush(outgoing);
        }
    }

    fn attribute_value_changed(&self, provider_participant_id: &str, attribute_name: &str, value: Value) {
        let mut outgoing = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                debug!("Ignoring change of {} after shutdown", attribute_name);
                return;
            }
            let key = (provider_participant_id.to_string(), attribute_name.to_string());
            for id in State::ids_for(&state.by_attribute, &key) {
                let Some(subscription) = state.subscriptions.get_mut(&id) else {
                    continue;
                };
                // Periodic subscriptions publish on their timer only.
                if matches!(subscription.record.request.qos(), SubscriptionQos::Periodic { .. }) {
                    continue;
                }
                self.prepare_attribute_publication(subscription, value.clone(), &mut outgoing);
            }
            self.flush(outgoing);
        }
    }

    fn prepare_attribute_publication(
        &self,
        subscription: &mut PublicationState,
        value: Value,
        outgoing: &mut Vec<Outgoing>,
    ) {
        let now = self.inner.ctx.now_ms();
        let min_interval = subscription.record.request.qos().min_interval_ms();
        match (min_interval, subscription.elapsed_since_publication(now)) {
            (Some(min_interval), Some(elapsed)) if elapsed < min_interval => {
                subscription.pending_value = Some(value);
                if subscription.debounce.is_none() {
                    subscription.debounce = Some(self.arm_timer(
                        subscription.record.subscription_id(),
                        TimerKind::Debounce,
                        min_interval - elapsed,
                    ));
                }
            }
            _ => {
                if let Some(debounce) = subscription.debounce.take() {
                    debounce.cancel();
                }
                subscription.pending_value = None;
                outgoing.push(self.publication(subscription, Ok(vec![value])));
                self.rearm_interval(subscription);
            }
        }
    }

    fn rearm_interval(&self, subscription: &mut PublicationState) {
        let Some(period_ms) = subscription.record.request.qos().period_ms() else {
            return;
        };
        if let Some(interval) = subscription.interval.take() {
            interval.cancel();
        }
        subscription.interval = Some(self.arm_timer(
            subscription.record.subscription_id(),
            TimerKind::Interval,
            period_ms,
        ));
    }

    fn publication(
        &self,
        subscription: &mut PublicationState,
        response: std::result::Result<Vec<Value>, String>,
    ) -> Outgoing {
        let now = self.inner.ctx.now_ms();
        subscription.last_publication_ms = Some(now);
        let record = &subscription.record;
        let (response, error) = match response {
            Ok(values) => (Some(values), None),
            Err(e) => (None, Some(e)),
        };
        Outgoing::Publication {
            from: record.provider_participant_id.clone(),
            to: record.proxy_participant_id.clone(),
            expiry_date_ms: now.saturating_add(record.request.qos().publication_ttl_ms()),
            publication: SubscriptionPublication {
                subscription_id: record.subscription_id().to_string(),
                response,
                error,
            },
        }
    }

    fn event_fired(&self, provider_participant_id: &str, event_name: &str, firing: &EventFiring) {
        let mut outgoing = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            let Some(event) = state
                .providers
                .get(provider_participant_id)
                .and_then(|entry| entry.provider.event(event_name))
                .cloned()
            else {
                return;
            };
            let now = self.inner.ctx.now_ms();

            if !event.is_selective() {
                outgoing.push(Outgoing::Multicast {
                    from: provider_participant_id.to_string(),
                    expiry_date_ms: now.saturating_add(self.inner.multicast_publication_ttl_ms),
                    publication: MulticastPublication {
                        multicast_id: multicast_id(
                            provider_participant_id,
                            event_name,
                            &firing.partitions,
                        ),
                        response: Some(firing.output.clone()),
                        error: None,
                    },
                });
            } else {
                let key = (provider_participant_id.to_string(), event_name.to_string());
                for id in State::ids_for(&state.by_event, &key) {
                    let Some(subscription) = state.subscriptions.get_mut(&id) else {
                        continue;
                    };
                    let StoredRequest::Broadcast(request) = &subscription.record.request else {
                        continue;
                    };
                    let passes = match &request.filter_parameters {
                        Some(parameters) => event
                            .filters()
                            .iter()
                            .all(|filter| filter.filter(&firing.output, parameters)),
                        None => true,
                    };
                    if !passes {
                        continue;
                    }
                    let min_interval = request.qos.min_interval_ms();
                    if let (Some(min_interval), Some(elapsed)) =
                        (min_interval, subscription.elapsed_since_publication(now))
                    {
                        if elapsed < min_interval {
                            debug!(
                                "Broadcast {} for subscription {} dropped inside min interval",
                                event_name, id
                            );
                            continue;
                        }
                    }
                    outgoing.push(self.publication(subscription, Ok(firing.output.clone())));
                }
            }
            self.flush(outgoing);
        }
    }

    /// Hand publications to the sender. Called with the state lock held so
    /// the sender sees them in state order.
    fn flush(&self, outgoing: Vec<Outgoing>) {
        for item in outgoing {
            match item {
                Outgoing::Publication {
                    from,
                    to,
                    expiry_date_ms,
                    publication,
                } => self
                    .inner
                    .sender
                    .send_publication(&from, &to, expiry_date_ms, publication),
                Outgoing::Multicast {
                    from,
                    expiry_date_ms,
                    publication,
                } => self
                    .inner
                    .sender
                    .send_multicast_publication(&from, expiry_date_ms, publication),
            }
        }
    }

    fn persist(&self, state: &mut State, record: &SubscriptionRecord) {
        let id = record.subscription_id();
        let stored = serde_json::to_string(record)
            .map_err(MeshError::from)
            .and_then(|json| self.inner.store.set_item(id, &json));
        if let Err(e) = stored {
            warn!("Cannot persist subscription {}: {}", id, e);
            return;
        }
        if state.persisted.insert(id.to_string()) {
            self.write_index(state);
        }
    }

    fn unpersist(&self, state: &mut State, subscription_id: &str) {
        if !state.persisted.remove(subscription_id) {
            return;
        }
        if let Err(e) = self.inner.store.remove_item(subscription_id) {
            warn!("Cannot remove persisted subscription {}: {}", subscription_id, e);
        }
        self.write_index(state);
    }

    fn write_index(&self, state: &State) {
        let ids: Vec<&String> = state.persisted.iter().collect();
        let written = serde_json::to_string(&ids)
            .map_err(MeshError::from)
            .and_then(|json| self.inner.store.set_item(&self.storage_key(), &json));
        if let Err(e) = written {
            warn!("Cannot persist subscription list: {}", e);
        }
    }
}

impl PublicationHandler for PublicationManager {
    fn handle_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: SubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()> {
        self.subscribe(
            SubscriptionRecord {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request: StoredRequest::Attribute(request),
            },
            Some(reply),
        )
    }

    fn handle_broadcast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: BroadcastSubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()> {
        self.subscribe(
            SubscriptionRecord {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request: StoredRequest::Broadcast(request),
            },
            Some(reply),
        )
    }

    fn handle_multicast_subscription_request(
        &self,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: MulticastSubscriptionRequest,
        reply: SubscriptionReplyCallback,
    ) -> Result<()> {
        self.subscribe(
            SubscriptionRecord {
                proxy_participant_id: proxy_participant_id.to_string(),
                provider_participant_id: provider_participant_id.to_string(),
                request: StoredRequest::Multicast(request),
            },
            Some(reply),
        )
    }

    fn handle_subscription_stop(&self, stop: SubscriptionStop) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.running {
            return Err(MeshError::Shutdown("publication manager"));
        }
        if self.remove_locked(&mut state, &stop.subscription_id) {
            debug!("Subscription {} stopped", stop.subscription_id);
        }
        Ok(())
    }
}
