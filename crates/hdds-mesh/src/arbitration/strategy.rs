// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Arbitration strategies and discovery QoS.

use crate::arbitration::discovery::{DiscoveryScope, LookupQos};
use crate::config::DiscoveryConfig;
use crate::types::DiscoveryEntry;
use std::fmt;
use std::sync::Arc;

/// Custom parameter matched by [`ArbitrationStrategy::Keyword`].
pub const KEYWORD_PARAMETER: &str = "keyword";

/// Default time budget of one arbitration.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Default pause between two lookups.
pub const DEFAULT_DISCOVERY_RETRY_DELAY_MS: u64 = 10_000;

pub type ArbitrationFn = Arc<dyn Fn(&[DiscoveryEntry]) -> Vec<DiscoveryEntry> + Send + Sync>;

/// Selects and orders the compatible providers of one lookup.
#[derive(Clone, Default)]
pub enum ArbitrationStrategy {
    /// Keep the lookup order.
    Nothing,
    /// Highest `qos.priority` first.
    HighestPriority,
    /// Most recently seen first.
    #[default]
    LastSeen,
    /// Providers whose `keyword` custom parameter equals the value.
    Keyword(String),
    /// Exactly this participant.
    FixedParticipant(String),
    Custom(ArbitrationFn),
}

impl ArbitrationStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[DiscoveryEntry]) -> Vec<DiscoveryEntry> + Send + Sync + 'static,
    {
        ArbitrationStrategy::Custom(Arc::new(f))
    }

    pub fn apply(&self, mut entries: Vec<DiscoveryEntry>) -> Vec<DiscoveryEntry> {
        match self {
            ArbitrationStrategy::Nothing => entries,
            ArbitrationStrategy::HighestPriority => {
                entries.sort_by(|a, b| b.qos.priority.cmp(&a.qos.priority));
                entries
            }
            ArbitrationStrategy::LastSeen => {
                entries.sort_by(|a, b| b.last_seen_date_ms.cmp(&a.last_seen_date_ms));
                entries
            }
            ArbitrationStrategy::Keyword(keyword) => entries
                .into_iter()
                .filter(|e| e.qos.custom_parameter(KEYWORD_PARAMETER) == Some(keyword.as_str()))
                .collect(),
            ArbitrationStrategy::FixedParticipant(participant_id) => entries
                .into_iter()
                .filter(|e| e.participant_id == *participant_id)
                .collect(),
            ArbitrationStrategy::Custom(f) => f(&entries),
        }
    }
}

impl fmt::Debug for ArbitrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbitrationStrategy::Nothing => write!(f, "Nothing"),
            ArbitrationStrategy::HighestPriority => write!(f, "HighestPriority"),
            ArbitrationStrategy::LastSeen => write!(f, "LastSeen"),
            ArbitrationStrategy::Keyword(k) => write!(f, "Keyword({})", k),
            ArbitrationStrategy::FixedParticipant(p) => write!(f, "FixedParticipant({})", p),
            ArbitrationStrategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Application-level discovery options.
#[derive(Debug, Clone)]
pub struct DiscoveryQos {
    pub discovery_timeout_ms: u64,
    pub discovery_retry_delay_ms: u64,
    pub cache_max_age_ms: u64,
    pub discovery_scope: DiscoveryScope,
    pub provider_must_support_on_change: bool,
    pub arbitration_strategy: ArbitrationStrategy,
}

impl Default for DiscoveryQos {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            discovery_retry_delay_ms: DEFAULT_DISCOVERY_RETRY_DELAY_MS,
            cache_max_age_ms: 0,
            discovery_scope: DiscoveryScope::default(),
            provider_must_support_on_change: false,
            arbitration_strategy: ArbitrationStrategy::default(),
        }
    }
}

impl DiscoveryQos {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            discovery_timeout_ms: config.discovery_timeout_ms,
            discovery_retry_delay_ms: config.discovery_retry_delay_ms,
            cache_max_age_ms: config.cache_max_age_ms,
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.discovery_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.discovery_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_strategy(mut self, strategy: ArbitrationStrategy) -> Self {
        self.arbitration_strategy = strategy;
        self
    }

    pub fn with_provider_must_support_on_change(mut self, required: bool) -> Self {
        self.provider_must_support_on_change = required;
        self
    }

    pub fn lookup_qos(&self) -> LookupQos {
        LookupQos {
            cache_max_age_ms: self.cache_max_age_ms,
            discovery_timeout_ms: self.discovery_timeout_ms,
            discovery_scope: self.discovery_scope,
            provider_must_support_on_change: self.provider_must_support_on_change,
        }
    }
}
