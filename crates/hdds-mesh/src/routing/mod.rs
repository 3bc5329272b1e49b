// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message routing: next-hop directory, delivery queue, transports and the router.

pub mod directory;
pub mod inprocess;
pub mod multicast;
pub mod parent;
pub mod queue;
pub mod router;
pub mod stats;
pub mod stub;

pub use directory::{AddressDirectory, RoutingEntry};
pub use inprocess::{InProcessRegistry, InProcessSkeleton, InProcessStub, InProcessStubFactory};
pub use multicast::{
    multicast_id, validate_partitions, validate_publication_partitions,
    FixedMulticastAddressCalculator, LocalMulticastAddressCalculator, MulticastAddressCalculator,
    MulticastPattern, MulticastReceiver,
};
pub use parent::RoutingProxy;
pub use queue::{MessageQueue, QueuedMessage};
pub use router::{MessageRouter, MessageRouterBuilder};
pub use stats::{RouterStats, RouterStatsSnapshot};
pub use stub::{
    MessageListener, MessagingSkeleton, MessagingStub, MessagingStubFactory, SkeletonRegistry,
    StubFactoryRegistry,
};
