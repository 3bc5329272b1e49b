// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery entries describing registered providers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface version of a provider or proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub major_version: i32,
    pub minor_version: i32,
}

impl Version {
    pub const fn new(major_version: i32, minor_version: i32) -> Self {
        Self {
            major_version,
            minor_version,
        }
    }

    /// A provider of version `self` can serve a proxy built against `requested`.
    pub fn is_compatible_with(&self, requested: &Version) -> bool {
        self.major_version == requested.major_version
            && self.minor_version >= requested.minor_version
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major_version, self.minor_version)
    }
}

/// Visibility of a registered provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderScope {
    Local,
    #[default]
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomParameter {
    pub name: String,
    pub value: String,
}

impl CustomParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Provider quality of service as published to discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQos {
    #[serde(default)]
    pub custom_parameters: Vec<CustomParameter>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub scope: ProviderScope,
    #[serde(default)]
    pub supports_on_change_subscriptions: bool,
}

impl ProviderQos {
    pub fn custom_parameter(&self, name: &str) -> Option<&str> {
        self.custom_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// One discovery lookup result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEntry {
    pub provider_version: Version,
    pub domain: String,
    pub interface_name: String,
    pub participant_id: String,
    pub qos: ProviderQos,
    pub last_seen_date_ms: u64,
    #[serde(default)]
    pub expiry_date_ms: u64,
    #[serde(default)]
    pub public_key_id: String,
    /// Provider registered in this runtime's own process.
    #[serde(default)]
    pub is_local: bool,
}

impl DiscoveryEntry {
    pub fn new(
        domain: impl Into<String>,
        interface_name: impl Into<String>,
        participant_id: impl Into<String>,
        provider_version: Version,
    ) -> Self {
        Self {
            provider_version,
            domain: domain.into(),
            interface_name: interface_name.into(),
            participant_id: participant_id.into(),
            qos: ProviderQos::default(),
            last_seen_date_ms: 0,
            expiry_date_ms: 0,
            public_key_id: String::new(),
            is_local: false,
        }
    }

    pub fn with_qos(mut self, qos: ProviderQos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_last_seen(mut self, last_seen_date_ms: u64) -> Self {
        self.last_seen_date_ms = last_seen_date_ms;
        self
    }
}
