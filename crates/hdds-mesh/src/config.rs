// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh runtime configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Instance identifier, used as persistence key prefix.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub publication: PublicationConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Message routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Extra time added to every outbound expiry date (ms).
    #[serde(default)]
    pub ttl_uplift_ms: u64,

    /// Byte cap of the queue holding messages for unknown participants (KiB).
    #[serde(default = "default_max_queue_size_kbytes")]
    pub max_queue_size_kbytes: u64,

    /// Period of the expired-message sweep (ms).
    #[serde(default = "default_queue_reaper_interval_ms")]
    pub queue_reaper_interval_ms: u64,

    /// Default TTL for outbound requests (ms).
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
}

/// Defaults applied to discovery QoS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    #[serde(default = "default_discovery_retry_delay_ms")]
    pub discovery_retry_delay_ms: u64,

    #[serde(default)]
    pub cache_max_age_ms: u64,
}

/// Publication scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationConfig {
    /// Lower bound for periodic and max-interval subscriptions (ms).
    #[serde(default = "default_min_period_ms")]
    pub min_period_ms: u64,

    #[serde(default = "default_publication_ttl_ms")]
    pub default_publication_ttl_ms: u64,
}

/// Durable storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON store file. Absent means in-memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_instance_id() -> String {
    "hdds-mesh".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_queue_size_kbytes() -> u64 {
    10_000
}

fn default_queue_reaper_interval_ms() -> u64 {
    1_000
}

fn default_ttl_ms() -> u64 {
    60_000
}

fn default_discovery_timeout_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_discovery_retry_delay_ms() -> u64 {
    10_000
}

fn default_min_period_ms() -> u64 {
    50
}

fn default_publication_ttl_ms() -> u64 {
    10_000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ttl_uplift_ms: 0,
            max_queue_size_kbytes: default_max_queue_size_kbytes(),
            queue_reaper_interval_ms: default_queue_reaper_interval_ms(),
            default_ttl_ms: default_ttl_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout_ms(),
            discovery_retry_delay_ms: default_discovery_retry_delay_ms(),
            cache_max_age_ms: 0,
        }
    }
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            min_period_ms: default_min_period_ms(),
            default_publication_ttl_ms: default_publication_ttl_ms(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            log_level: default_log_level(),
            messaging: MessagingConfig::default(),
            discovery: DiscoveryConfig::default(),
            publication: PublicationConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Set the instance identifier.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Set the TTL uplift.
    pub fn ttl_uplift_ms(mut self, uplift: u64) -> Self {
        self.messaging.ttl_uplift_ms = uplift;
        self
    }

    /// Set the JSON store file.
    pub fn persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence.path = Some(path.into());
        self
    }

    /// Queue cap in bytes.
    pub fn max_queue_size_bytes(&self) -> usize {
        (self.messaging.max_queue_size_kbytes as usize).saturating_mul(1024)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".into()));
        }
        if self.messaging.max_queue_size_kbytes == 0 {
            return Err(ConfigError::Invalid(
                "messaging.max_queue_size_kbytes must be greater than 0".into(),
            ));
        }
        if self.messaging.queue_reaper_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "messaging.queue_reaper_interval_ms must be greater than 0".into(),
            ));
        }
        if self.discovery.discovery_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.discovery_retry_delay_ms must be greater than 0".into(),
            ));
        }
        if self.discovery.discovery_retry_delay_ms > self.discovery.discovery_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "discovery.discovery_retry_delay_ms ({}) exceeds discovery_timeout_ms ({})",
                self.discovery.discovery_retry_delay_ms, self.discovery.discovery_timeout_ms
            )));
        }
        if self.publication.min_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "publication.min_period_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
