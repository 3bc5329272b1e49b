// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address directory: participant id to next-hop address.
//!
//! Entries are persisted through the injected [`KeyValueStore`] under
//! `"{instance_id}_{participant_id}"`, except in-process addresses which are
//! only valid for the lifetime of this process. A local miss falls back to
//! the store and then, on a child runtime, to the parent router. Concurrent
//! escalations for the same participant share one in-flight request.

use crate::error::Result;
use crate::persistence::KeyValueStore;
use crate::routing::parent::RoutingProxy;
use crate::types::Address;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Next hop of one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub participant_id: String,
    pub address: Address,
    pub is_globally_visible: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedHop {
    address: Address,
    is_globally_visible: bool,
}

struct ParentLink {
    proxy: Arc<dyn RoutingProxy>,
    address: Address,
}

type SharedResolve = Shared<BoxFuture<'static, Result<bool>>>;

struct InFlight {
    generation: u64,
    future: SharedResolve,
}

/// Routing table shared by the router and its callers.
pub struct AddressDirectory {
    instance_id: String,
    entries: RwLock<HashMap<String, RoutingEntry>>,
    store: Arc<dyn KeyValueStore>,
    parent: RwLock<Option<ParentLink>>,
    inflight: Mutex<HashMap<String, InFlight>>,
    generation: AtomicU64,
}

impl AddressDirectory {
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            instance_id: instance_id.into(),
            entries: RwLock::new(HashMap::new()),
            store,
            parent: RwLock::new(None),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn storage_key(&self, participant_id: &str) -> String {
        format!("{}_{}", self.instance_id, participant_id)
    }

    /// Add or replace the hop of `participant_id`. Last write wins.
    pub fn add(&self, participant_id: &str, address: Address, is_globally_visible: bool) {
        if !address.is_in_process() {
            self.persist(participant_id, &address, is_globally_visible);
        }
        self.cache(participant_id, address, is_globally_visible);
    }

    /// Add a hop without persisting it.
    pub fn cache(&self, participant_id: &str, address: Address, is_globally_visible: bool) {
        debug!("Next hop {} -> {}", participant_id, address);
        self.entries.write().insert(
            participant_id.to_string(),
            RoutingEntry {
                participant_id: participant_id.to_string(),
                address,
                is_globally_visible,
            },
        );
    }

    fn persist(&self, participant_id: &str, address: &Address, is_globally_visible: bool) {
        let hop = PersistedHop {
            address: address.clone(),
            is_globally_visible,
        };
        let result = serde_json::to_string(&hop)
            .map_err(Into::into)
            .and_then(|value| self.store.set_item(&self.storage_key(participant_id), &value));
        if let Err(e) = result {
            warn!("Failed to persist next hop of {}: {}", participant_id, e);
        }
    }

    /// Remove the hop of `participant_id`. Removing an unknown id is a no-op.
    pub fn remove(&self, participant_id: &str) -> Option<RoutingEntry> {
        let removed = self.entries.write().remove(participant_id);
        if let Err(e) = self.store.remove_item(&self.storage_key(participant_id)) {
            warn!("Failed to remove persisted hop of {}: {}", participant_id, e);
        }
        removed
    }

    /// Local lookup: routing table, then the persisted entry.
    pub fn lookup(&self, participant_id: &str) -> Option<RoutingEntry> {
        if let Some(entry) = self.entries.read().get(participant_id) {
            return Some(entry.clone());
        }
        self.load_persisted(participant_id)
    }

    fn load_persisted(&self, participant_id: &str) -> Option<RoutingEntry> {
        let key = self.storage_key(participant_id);
        let value = match self.store.get_item(&key) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read persisted hop of {}: {}", participant_id, e);
                return None;
            }
        };

        if value.trim().is_empty() || value.trim() == "{}" {
            let _ = self.store.remove_item(&key);
            return None;
        }

        match serde_json::from_str::<PersistedHop>(&value) {
            Ok(hop) => {
                debug!("Restored next hop of {} from storage", participant_id);
                self.cache(participant_id, hop.address.clone(), hop.is_globally_visible);
                Some(RoutingEntry {
                    participant_id: participant_id.to_string(),
                    address: hop.address,
                    is_globally_visible: hop.is_globally_visible,
                })
            }
            Err(e) => {
                warn!("Discarding unreadable hop of {}: {}", participant_id, e);
                let _ = self.store.remove_item(&key);
                None
            }
        }
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.read().contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Escalate future misses to `proxy`; hops it resolves route via `parent_address`.
    pub fn attach_parent(&self, proxy: Arc<dyn RoutingProxy>, parent_address: Address) {
        *self.parent.write() = Some(ParentLink {
            proxy,
            address: parent_address,
        });
    }

    pub fn has_parent(&self) -> bool {
        self.parent.read().is_some()
    }

    /// Resolve `participant_id`, escalating to the parent on a local miss.
    pub async fn resolve(&self, participant_id: &str) -> Option<Address> {
        if let Some(entry) = self.lookup(participant_id) {
            return Some(entry.address);
        }

        let (parent_address, generation, future) = {
            let parent = self.parent.read();
            let link = parent.as_ref()?;
            let mut inflight = self.inflight.lock();
            let flight = inflight.entry(participant_id.to_string()).or_insert_with(|| {
                let proxy = link.proxy.clone();
                let id = participant_id.to_string();
                InFlight {
                    generation: self.generation.fetch_add(1, Ordering::Relaxed),
                    future: async move { proxy.resolve_next_hop(&id).await }
                        .boxed()
                        .shared(),
                }
            });
            (link.address.clone(), flight.generation, flight.future.clone())
        };

        let outcome = future.await;

        {
            let mut inflight = self.inflight.lock();
            if inflight
                .get(participant_id)
                .is_some_and(|f| f.generation == generation)
            {
                inflight.remove(participant_id);
            }
        }

        match outcome {
            Ok(true) => {
                if !self.contains(participant_id) {
                    self.cache(participant_id, parent_address.clone(), false);
                }
                self.lookup(participant_id).map(|e| e.address)
            }
            Ok(false) => {
                debug!("Parent router cannot reach {}", participant_id);
                None
            }
            Err(e) => {
                warn!("Parent resolution of {} failed: {}", participant_id, e);
                None
            }
        }
    }
}
