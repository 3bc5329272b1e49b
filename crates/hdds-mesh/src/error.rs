// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by every mesh component.

use crate::types::discovery::Version;
use crate::types::subscription::SubscriptionException;
use thiserror::Error;

/// Errors raised by routing, dispatch, arbitration and publication.
///
/// The enum is `Clone` so one outcome can be handed to several waiters
/// (shared parent escalations, replayed deferred calls).
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error("Message {msg_id} expired at {expiry_date_ms} (now {now_ms})")]
    ExpiredMessage {
        msg_id: String,
        expiry_date_ms: u64,
        now_ms: u64,
    },

    #[error("No stub or skeleton factory registered for address type '{0}'")]
    UnknownAddressType(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("No compatible provider found for '{interface_name}' (discovered versions: {})", format_versions(.discovered_versions))]
    NoCompatibleProviderFound {
        interface_name: String,
        discovered_versions: Vec<Version>,
    },

    #[error("Subscription error: {0}")]
    Subscription(SubscriptionException),

    #[error("Invalid multicast id: {0}")]
    InvalidMulticastId(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0} is shut down")]
    Shutdown(&'static str),

    #[error("Participant not reachable: {0}")]
    Unresolved(String),

    #[error("Message {msg_id} evicted from full message queue")]
    QueueOverflow { msg_id: String },

    #[error("Message {msg_id} ({size} bytes) exceeds queue capacity of {capacity} bytes")]
    MessageTooLarge {
        msg_id: String,
        size: usize,
        capacity: usize,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_versions(versions: &[Version]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<crate::config::ConfigError> for MeshError {
    fn from(e: crate::config::ConfigError) -> Self {
        MeshError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

/// Result alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
