// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription requests, QoS policies and publications.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Expiry date meaning "never expires".
pub const NO_EXPIRY_DATE: u64 = 0;

/// Default TTL of a publication message (ms).
pub const DEFAULT_PUBLICATION_TTL_MS: u64 = 10_000;

/// Filter parameters of a selective broadcast subscription.
pub type BroadcastFilterParameters = BTreeMap<String, String>;

/// Timing policy of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubscriptionQos {
    /// Publish every `period_ms`.
    #[serde(rename_all = "camelCase")]
    Periodic {
        period_ms: u64,
        expiry_date_ms: u64,
        publication_ttl_ms: u64,
    },
    /// Publish on change, at most once per `min_interval_ms`.
    #[serde(rename_all = "camelCase")]
    OnChange {
        min_interval_ms: u64,
        expiry_date_ms: u64,
        publication_ttl_ms: u64,
    },
    /// On change, plus at least once per `max_interval_ms`.
    #[serde(rename_all = "camelCase")]
    OnChangeWithKeepAlive {
        min_interval_ms: u64,
        max_interval_ms: u64,
        expiry_date_ms: u64,
        publication_ttl_ms: u64,
        #[serde(default)]
        alert_after_interval_ms: u64,
    },
}

impl SubscriptionQos {
    pub fn periodic(period_ms: u64, expiry_date_ms: u64) -> Self {
        SubscriptionQos::Periodic {
            period_ms,
            expiry_date_ms,
            publication_ttl_ms: DEFAULT_PUBLICATION_TTL_MS,
        }
    }

    pub fn on_change(min_interval_ms: u64, expiry_date_ms: u64) -> Self {
        SubscriptionQos::OnChange {
            min_interval_ms,
            expiry_date_ms,
            publication_ttl_ms: DEFAULT_PUBLICATION_TTL_MS,
        }
    }

    pub fn on_change_with_keep_alive(
        min_interval_ms: u64,
        max_interval_ms: u64,
        expiry_date_ms: u64,
    ) -> Self {
        SubscriptionQos::OnChangeWithKeepAlive {
            min_interval_ms,
            max_interval_ms,
            expiry_date_ms,
            publication_ttl_ms: DEFAULT_PUBLICATION_TTL_MS,
            alert_after_interval_ms: 0,
        }
    }

    pub fn with_publication_ttl_ms(mut self, ttl: u64) -> Self {
        match &mut self {
            SubscriptionQos::Periodic {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::OnChange {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::OnChangeWithKeepAlive {
                publication_ttl_ms, ..
            } => *publication_ttl_ms = ttl,
        }
        self
    }

    pub fn expiry_date_ms(&self) -> u64 {
        match self {
            SubscriptionQos::Periodic { expiry_date_ms, .. }
            | SubscriptionQos::OnChange { expiry_date_ms, .. }
            | SubscriptionQos::OnChangeWithKeepAlive { expiry_date_ms, .. } => *expiry_date_ms,
        }
    }

    pub fn set_expiry_date_ms(&mut self, value: u64) {
        match self {
            SubscriptionQos::Periodic { expiry_date_ms, .. }
            | SubscriptionQos::OnChange { expiry_date_ms, .. }
            | SubscriptionQos::OnChangeWithKeepAlive { expiry_date_ms, .. } => {
                *expiry_date_ms = value
            }
        }
    }

    pub fn publication_ttl_ms(&self) -> u64 {
        match self {
            SubscriptionQos::Periodic {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::OnChange {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::OnChangeWithKeepAlive {
                publication_ttl_ms, ..
            } => *publication_ttl_ms,
        }
    }

    /// Debounce window for on-change publications.
    pub fn min_interval_ms(&self) -> Option<u64> {
        match self {
            SubscriptionQos::Periodic { .. } => None,
            SubscriptionQos::OnChange {
                min_interval_ms, ..
            }
            | SubscriptionQos::OnChangeWithKeepAlive {
                min_interval_ms, ..
            } => Some(*min_interval_ms).filter(|ms| *ms > 0),
        }
    }

    /// Interval of the timer-driven publication, if any.
    pub fn period_ms(&self) -> Option<u64> {
        match self {
            SubscriptionQos::Periodic { period_ms, .. } => Some(*period_ms),
            SubscriptionQos::OnChangeWithKeepAlive {
                max_interval_ms, ..
            } => Some(*max_interval_ms),
            SubscriptionQos::OnChange { .. } => None,
        }
    }

    pub fn has_expiry(&self) -> bool {
        self.expiry_date_ms() != NO_EXPIRY_DATE
    }
}

/// Subscription to an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub subscription_id: String,
    pub subscribed_to_name: String,
    pub qos: SubscriptionQos,
}

/// Subscription to a selective event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSubscriptionRequest {
    pub subscription_id: String,
    pub subscribed_to_name: String,
    pub qos: SubscriptionQos,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_parameters: Option<BroadcastFilterParameters>,
}

/// Subscription to a non-selective event, delivered by multicast id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastSubscriptionRequest {
    pub subscription_id: String,
    pub subscribed_to_name: String,
    pub multicast_id: String,
    pub qos: SubscriptionQos,
}

/// Reason a subscription request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionException {
    pub subscription_id: String,
    pub detail_message: String,
}

impl SubscriptionException {
    pub fn new(subscription_id: impl Into<String>, detail_message: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            detail_message: detail_message.into(),
        }
    }
}

impl fmt::Display for SubscriptionException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (subscription {})", self.detail_message, self.subscription_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionReply {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubscriptionException>,
}

impl SubscriptionReply {
    pub fn ok(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            error: None,
        }
    }

    pub fn failed(error: SubscriptionException) -> Self {
        Self {
            subscription_id: error.subscription_id.clone(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStop {
    pub subscription_id: String,
}

/// Publication for one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPublication {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Publication for every subscriber of a multicast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastPublication {
    pub multicast_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
