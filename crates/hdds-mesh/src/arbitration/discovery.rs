// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery service interface and lookup options.

use crate::error::Result;
use crate::types::DiscoveryEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where a lookup searches for providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryScope {
    LocalOnly,
    LocalThenGlobal,
    #[default]
    LocalAndGlobal,
    GlobalOnly,
}

/// Options forwarded to the discovery service with every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupQos {
    pub cache_max_age_ms: u64,
    pub discovery_timeout_ms: u64,
    pub discovery_scope: DiscoveryScope,
    pub provider_must_support_on_change: bool,
}

/// Client of the capabilities directory.
#[async_trait]
pub trait DiscoveryProxy: Send + Sync {
    async fn lookup(
        &self,
        domains: &[String],
        interface_name: &str,
        qos: &LookupQos,
        gbids: &[String],
    ) -> Result<Vec<DiscoveryEntry>>;

    async fn lookup_by_participant_id(
        &self,
        participant_id: &str,
        qos: &LookupQos,
        gbids: &[String],
    ) -> Result<DiscoveryEntry>;

    async fn add(&self, entry: DiscoveryEntry, await_global_registration: bool) -> Result<()>;

    async fn add_to_all(&self, entry: DiscoveryEntry, await_global_registration: bool)
        -> Result<()>;

    async fn remove(&self, participant_id: &str) -> Result<()>;
}
