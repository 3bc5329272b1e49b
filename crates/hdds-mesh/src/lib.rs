// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Mesh Runtime
//!
//! Transport-agnostic RPC and publish/subscribe middleware: participants
//! call providers and subscribe to their attributes and events without
//! knowing where the provider lives.
//!
//! # Features
//!
//! - **Message Routing**: Next-hop directory, parent escalation, multicast fan-out
//! - **Delivery Queue**: Messages for unknown participants wait, bounded in bytes
//! - **Arbitration**: Discovery with retries, version filtering and strategies
//! - **Publications**: Periodic, on-change and keep-alive subscriptions
//! - **Persistence**: Routing entries and subscriptions survive restarts
//!
//! # Quick Start
//!
//! ```bash
//! # Write an example configuration
//! hdds-mesh gen-config --output mesh.toml
//!
//! # Run a runtime instance
//! hdds-mesh --config mesh.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! instance_id = "node-a"
//!
//! [messaging]
//! ttl_uplift_ms = 0
//! max_queue_size_kbytes = 10000
//!
//! [discovery]
//! discovery_timeout_ms = 600000
//! discovery_retry_delay_ms = 10000
//!
//! [publication]
//! min_period_ms = 50
//!
//! [persistence]
//! path = "/var/lib/hdds-mesh/state.json"
//! ```

pub mod arbitration;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod persistence;
pub mod publication;
pub mod routing;
pub mod runtime;
pub mod types;

pub use arbitration::{
    ArbitrationRequest, ArbitrationStrategy, Arbitrator, DiscoveryProxy, DiscoveryQos,
    LocalCapabilitiesDirectory,
};
pub use config::{ConfigError, MeshConfig};
pub use context::RuntimeContext;
pub use dispatch::{Dispatcher, MessagingQos};
pub use error::{MeshError, Result};
pub use publication::{NotifyAttribute, Provider, ProviderEvent, PublicationManager};
pub use routing::{MessageRouter, RouterStatsSnapshot};
pub use runtime::{MeshRuntime, MeshRuntimeBuilder};
