// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider discovery and arbitration.

pub mod arbitrator;
pub mod discovery;
pub mod local;
pub mod strategy;

pub use arbitrator::{ArbitrationRequest, Arbitrator};
pub use discovery::{DiscoveryProxy, DiscoveryScope, LookupQos};
pub use local::LocalCapabilitiesDirectory;
pub use strategy::{ArbitrationFn, ArbitrationStrategy, DiscoveryQos, KEYWORD_PARAMETER};
