// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory capabilities directory for providers of this runtime.

use crate::arbitration::discovery::{DiscoveryProxy, DiscoveryScope, LookupQos};
use crate::clock::Clock;
use crate::error::{MeshError, Result};
use crate::types::DiscoveryEntry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of local provider entries, indexed by participant id.
///
/// Global scopes are answered from the same registry: there is no
/// global directory behind it.
pub struct LocalCapabilitiesDirectory {
    clock: Arc<dyn Clock>,
    /// Entries indexed by participant id
    entries: RwLock<HashMap<String, DiscoveryEntry>>,
}

impl LocalCapabilitiesDirectory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(&self, mut entry: DiscoveryEntry) {
        entry.is_local = true;
        entry.last_seen_date_ms = self.clock.now_ms();
        debug!(
            "Capability {} of {} registered",
            entry.participant_id, entry.interface_name
        );
        self.entries
            .write()
            .insert(entry.participant_id.clone(), entry);
    }
}

#[async_trait]
impl DiscoveryProxy for LocalCapabilitiesDirectory {
    async fn lookup(
        &self,
        domains: &[String],
        interface_name: &str,
        qos: &LookupQos,
        _gbids: &[String],
    ) -> Result<Vec<DiscoveryEntry>> {
        let entries = self.entries.read();
        let mut found: Vec<DiscoveryEntry> = entries
            .values()
            .filter(|e| e.interface_name == interface_name && domains.contains(&e.domain))
            .filter(|e| qos.discovery_scope != DiscoveryScope::GlobalOnly || !e.is_local)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        Ok(found)
    }

    async fn lookup_by_participant_id(
        &self,
        participant_id: &str,
        _qos: &LookupQos,
        _gbids: &[String],
    ) -> Result<DiscoveryEntry> {
        self.entries
            .read()
            .get(participant_id)
            .cloned()
            .ok_or_else(|| MeshError::Discovery(format!("no provider {}", participant_id)))
    }

    async fn add(&self, entry: DiscoveryEntry, _await_global_registration: bool) -> Result<()> {
        self.insert(entry);
        Ok(())
    }

    async fn add_to_all(
        &self,
        entry: DiscoveryEntry,
        _await_global_registration: bool,
    ) -> Result<()> {
        self.insert(entry);
        Ok(())
    }

    async fn remove(&self, participant_id: &str) -> Result<()> {
        if self.entries.write().remove(participant_id).is_some() {
            debug!("Capability {} removed", participant_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RuntimeClock;
    use crate::types::Version;

    fn qos(scope: DiscoveryScope) -> LookupQos {
        LookupQos {
            cache_max_age_ms: 0,
            discovery_timeout_ms: 1000,
            discovery_scope: scope,
            provider_must_support_on_change: false,
        }
    }

    #[tokio::test]
    async fn test_lookup_by_domain_and_interface() {
        let directory = LocalCapabilitiesDirectory::new(Arc::new(RuntimeClock::anchored_at(9_000)));
        for (domain, iface, id) in [
            ("car", "vehicle/Radio", "p2"),
            ("car", "vehicle/Radio", "p1"),
            ("car", "vehicle/Gps", "p3"),
            ("truck", "vehicle/Radio", "p4"),
        ] {
            directory
                .add(DiscoveryEntry::new(domain, iface, id, Version::new(1, 0)), false)
                .await
                .expect("add");
        }

        let found = directory
            .lookup(&["car".into()], "vehicle/Radio", &qos(DiscoveryScope::LocalOnly), &[])
            .await
            .expect("lookup");
        let ids: Vec<&str> = found.iter().map(|e| e.participant_id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2"]);
        assert!(found.iter().all(|e| e.is_local && e.last_seen_date_ms == 9_000));

        let global = directory
            .lookup(&["car".into()], "vehicle/Radio", &qos(DiscoveryScope::GlobalOnly), &[])
            .await
            .expect("lookup");
        assert!(global.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_lookup_by_participant() {
        let directory = LocalCapabilitiesDirectory::new(Arc::new(RuntimeClock::new()));
        directory
            .add_to_all(DiscoveryEntry::new("car", "vehicle/Radio", "p1", Version::new(1, 0)), true)
            .await
            .expect("add");
        let entry = directory
            .lookup_by_participant_id("p1", &qos(DiscoveryScope::LocalOnly), &[])
            .await
            .expect("found");
        assert_eq!(entry.interface_name, "vehicle/Radio");

        directory.remove("p1").await.expect("remove");
        assert!(directory.is_empty());
        assert!(directory
            .lookup_by_participant_id("p1", &qos(DiscoveryScope::LocalOnly), &[])
            .await
            .is_err());
    }
}
