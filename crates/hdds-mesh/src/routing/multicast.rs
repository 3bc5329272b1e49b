// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast addressing.
//!
//! A multicast id is `providerId/eventName[/partition...]`. Receivers may
//! subscribe with wildcards in the partition levels: `+` matches exactly one
//! level, `*` (last level only) matches any number of remaining levels.

use crate::error::{MeshError, Result};
use crate::types::{Address, Message};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "*";

/// Derives the address a multicast is fanned out to globally.
pub trait MulticastAddressCalculator: Send + Sync {
    fn calculate(&self, message: &Message) -> Option<Address>;
}

/// Sends every multicast to one fixed address (usually the parent router).
#[derive(Debug, Clone)]
pub struct FixedMulticastAddressCalculator {
    address: Address,
}

impl FixedMulticastAddressCalculator {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl MulticastAddressCalculator for FixedMulticastAddressCalculator {
    fn calculate(&self, _message: &Message) -> Option<Address> {
        Some(self.address.clone())
    }
}

/// No global fan-out; multicasts only reach local receivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMulticastAddressCalculator;

impl MulticastAddressCalculator for LocalMulticastAddressCalculator {
    fn calculate(&self, _message: &Message) -> Option<Address> {
        None
    }
}

/// Registration of one subscriber for a multicast id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastReceiver {
    pub multicast_id: String,
    pub subscriber_participant_id: String,
    pub provider_participant_id: String,
}

impl MulticastReceiver {
    pub fn new(
        multicast_id: impl Into<String>,
        subscriber_participant_id: impl Into<String>,
        provider_participant_id: impl Into<String>,
    ) -> Self {
        Self {
            multicast_id: multicast_id.into(),
            subscriber_participant_id: subscriber_participant_id.into(),
            provider_participant_id: provider_participant_id.into(),
        }
    }
}

/// Check partition names: alphanumeric or a wildcard, `*` only last.
pub fn validate_partitions(partitions: &[String]) -> Result<()> {
    for (i, partition) in partitions.iter().enumerate() {
        if partition == SINGLE_LEVEL_WILDCARD {
            continue;
        }
        if partition == MULTI_LEVEL_WILDCARD {
            if i + 1 == partitions.len() {
                continue;
            }
            return Err(MeshError::InvalidMulticastId(format!(
                "multi-level wildcard must be the last partition: {:?}",
                partitions
            )));
        }
        if partition.is_empty() || !partition.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MeshError::InvalidMulticastId(format!(
                "invalid partition '{}'",
                partition
            )));
        }
    }
    Ok(())
}

/// Check the partitions of a fired event: concrete names only.
pub fn validate_publication_partitions(partitions: &[String]) -> Result<()> {
    if let Some(wildcard) = partitions
        .iter()
        .find(|p| *p == SINGLE_LEVEL_WILDCARD || *p == MULTI_LEVEL_WILDCARD)
    {
        return Err(MeshError::InvalidMulticastId(format!(
            "wildcard '{}' is only valid when subscribing: {:?}",
            wildcard, partitions
        )));
    }
    validate_partitions(partitions)
}

/// Build the multicast id of an event.
pub fn multicast_id(provider_participant_id: &str, event_name: &str, partitions: &[String]) -> String {
    let mut id = format!("{}/{}", provider_participant_id, event_name);
    for partition in partitions {
        id.push('/');
        id.push_str(partition);
    }
    id
}

/// Compiled receiver pattern of a (possibly wildcarded) multicast id.
#[derive(Debug, Clone)]
pub struct MulticastPattern {
    regex: Regex,
}

impl MulticastPattern {
    pub fn new(multicast_id: &str) -> Result<Self> {
        let levels: Vec<&str> = multicast_id.split('/').collect();
        let mut pattern = String::from("^");
        for (i, level) in levels.iter().enumerate() {
            if *level == MULTI_LEVEL_WILDCARD {
                if i + 1 != levels.len() {
                    return Err(MeshError::InvalidMulticastId(format!(
                        "'*' must be the last level of {}",
                        multicast_id
                    )));
                }
                pattern.push_str(if i == 0 { ".*" } else { "(/.*)?" });
                break;
            }
            if i > 0 {
                pattern.push('/');
            }
            if *level == SINGLE_LEVEL_WILDCARD {
                pattern.push_str("[^/]+");
            } else {
                pattern.push_str(&regex::escape(level));
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| MeshError::InvalidMulticastId(format!("{}: {}", multicast_id, e)))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, multicast_id: &str) -> bool {
        self.regex.is_match(multicast_id)
    }
}
