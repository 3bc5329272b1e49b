// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Assembly of a complete mesh runtime from a [`MeshConfig`].
//!
//! Every participant of the runtime (provider or consumer) gets an
//! in-process address whose listener is the shared [`Dispatcher`]. Remote
//! transports are added as stub factories and skeletons; their inbound
//! traffic enters through the router, which forwards it to the in-process
//! address of the recipient.

use crate::arbitration::{Arbitrator, DiscoveryProxy, DiscoveryQos, LocalCapabilitiesDirectory};
use crate::clock::{Clock, RuntimeClock};
use crate::config::MeshConfig;
use crate::context::RuntimeContext;
use crate::dispatch::{Dispatcher, PublicationHandler};
use crate::error::{MeshError, Result};
use crate::persistence::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::publication::{Provider, PublicationManager};
use crate::routing::{
    AddressDirectory, InProcessRegistry, InProcessStubFactory, MessageQueue, MessageRouter,
    MessagingSkeleton, MessagingStubFactory, MulticastAddressCalculator, SkeletonRegistry,
    StubFactoryRegistry,
};
use crate::types::{Address, AddressType, DiscoveryEntry, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Builder for [`MeshRuntime`].
pub struct MeshRuntimeBuilder {
    config: MeshConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KeyValueStore>>,
    discovery: Option<Arc<dyn DiscoveryProxy>>,
    static_capabilities: Vec<DiscoveryEntry>,
    stub_factories: StubFactoryRegistry,
    skeletons: SkeletonRegistry,
    multicast_calculator: Option<Arc<dyn MulticastAddressCalculator>>,
    parent: Option<(Address, Address)>,
}

impl MeshRuntimeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the store selected by `persistence.path`.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Discovery service used by the arbitrator and for provider registration.
    pub fn discovery(mut self, discovery: Arc<dyn DiscoveryProxy>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn static_capabilities(mut self, entries: Vec<DiscoveryEntry>) -> Self {
        self.static_capabilities = entries;
        self
    }

    /// Add a transport: stubs for `address_type`, plus its inbound skeleton.
    pub fn transport(
        mut self,
        address_type: AddressType,
        factory: Arc<dyn MessagingStubFactory>,
        skeleton: Option<Arc<dyn MessagingSkeleton>>,
    ) -> Self {
        self.stub_factories = self.stub_factories.with_factory(address_type, factory);
        if let Some(skeleton) = skeleton {
            self.skeletons = self.skeletons.with_skeleton(address_type, skeleton);
        }
        self
    }

    pub fn multicast_calculator(mut self, calculator: Arc<dyn MulticastAddressCalculator>) -> Self {
        self.multicast_calculator = Some(calculator);
        self
    }

    /// Run as a child of the router at `parent_address`.
    pub fn parent(mut self, parent_address: Address, incoming_address: Address) -> Self {
        self.parent = Some((parent_address, incoming_address));
        self
    }

    /// Wire all components on the tokio runtime of the caller.
    pub fn build(self) -> Result<MeshRuntime> {
        self.config.validate()?;
        let handle = Handle::try_current()
            .map_err(|e| MeshError::Transport(format!("no tokio runtime: {}", e)))?;

        let config = self.config;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(RuntimeClock::new()),
        };
        let ctx = RuntimeContext::new(config.instance_id.clone(), clock.clone(), handle);

        let store: Arc<dyn KeyValueStore> = match (self.store, &config.persistence.path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let queue = Arc::new(MessageQueue::new(config.max_queue_size_bytes(), clock.clone()));
        queue.start_reaper(
            &ctx,
            Duration::from_millis(config.messaging.queue_reaper_interval_ms),
        );
        let directory = Arc::new(AddressDirectory::new(config.instance_id.clone(), store.clone()));

        let registry = InProcessRegistry::new();
        let stub_factories = self.stub_factories.with_factory(
            AddressType::InProcess,
            Arc::new(InProcessStubFactory::new(registry.clone())),
        );

        let mut router_builder = MessageRouter::builder(ctx.clone())
            .directory(directory)
            .queue(queue)
            .stub_factories(stub_factories)
            .skeletons(self.skeletons.clone());
        if let Some(calculator) = self.multicast_calculator {
            router_builder = router_builder.multicast_calculator(calculator);
        }
        if let Some((parent_address, incoming_address)) = self.parent {
            router_builder = router_builder.parent(parent_address, incoming_address);
        }
        let router = router_builder.build();
        self.skeletons.register_listener(router.inbound_listener());

        let dispatcher = Dispatcher::new(ctx.clone(), router.clone(), &config.messaging);

        let discovery: Arc<dyn DiscoveryProxy> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(LocalCapabilitiesDirectory::new(clock.clone())),
        };
        let arbitrator = Arbitrator::with_default_qos(
            ctx.clone(),
            discovery.clone(),
            self.static_capabilities,
            DiscoveryQos::from_config(&config.discovery),
        );

        let publication = PublicationManager::new(
            ctx.clone(),
            Arc::new(dispatcher.clone()),
            store.clone(),
            &config.publication,
        );
        dispatcher.register_publication_handler(
            Arc::new(publication.clone()) as Arc<dyn PublicationHandler>
        );
        match publication.restore() {
            Ok(0) => {}
            Ok(n) => info!("{} subscriptions waiting for their providers", n),
            Err(e) => warn!("Cannot restore subscriptions: {}", e),
        }

        info!("Mesh runtime {} started", config.instance_id);
        Ok(MeshRuntime {
            ctx,
            config,
            registry,
            router,
            dispatcher,
            arbitrator,
            publication,
            discovery,
        })
    }
}

/// A running mesh instance.
pub struct MeshRuntime {
    ctx: RuntimeContext,
    config: MeshConfig,
    registry: InProcessRegistry,
    router: MessageRouter,
    dispatcher: Dispatcher,
    arbitrator: Arbitrator,
    publication: PublicationManager,
    discovery: Arc<dyn DiscoveryProxy>,
}

impl MeshRuntime {
    pub fn builder(config: MeshConfig) -> MeshRuntimeBuilder {
        MeshRuntimeBuilder {
            config,
            clock: None,
            store: None,
            discovery: None,
            static_capabilities: Vec::new(),
            stub_factories: StubFactoryRegistry::new(),
            skeletons: SkeletonRegistry::new(),
            multicast_calculator: None,
            parent: None,
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    pub fn publication_manager(&self) -> &PublicationManager {
        &self.publication
    }

    pub fn discovery(&self) -> &Arc<dyn DiscoveryProxy> {
        &self.discovery
    }

    pub fn in_process_registry(&self) -> &InProcessRegistry {
        &self.registry
    }

    /// Give `participant_id` an in-process address served by the dispatcher.
    pub async fn register_participant(&self, participant_id: &str) -> Result<Address> {
        let (address, skeleton) = self.registry.register(participant_id);
        let dispatcher = self.dispatcher.clone();
        skeleton.register_listener(Arc::new(move |message: Message| dispatcher.receive(message)));
        self.router
            .add_next_hop(participant_id, address.clone(), false)
            .await?;
        Ok(address)
    }

    /// Register a provider: address, publication manager and discovery.
    pub async fn register_provider(
        &self,
        entry: DiscoveryEntry,
        provider: Arc<Provider>,
    ) -> Result<()> {
        self.register_participant(&entry.participant_id).await?;
        self.publication
            .add_publication_provider(&entry.participant_id, provider)?;
        info!(
            "Provider {} of {} registered in domain {}",
            entry.participant_id, entry.interface_name, entry.domain
        );
        self.discovery.add(entry, false).await
    }

    pub async fn unregister_provider(&self, participant_id: &str) -> Result<()> {
        self.discovery.remove(participant_id).await?;
        self.publication.remove_publication_provider(participant_id)?;
        self.router.remove_next_hop(participant_id).await?;
        self.registry.unregister(participant_id);
        info!("Provider {} unregistered", participant_id);
        Ok(())
    }

    /// Stop every component, consumers of the router first. Idempotent.
    pub fn shutdown(&self) {
        self.publication.shutdown();
        self.arbitrator.shutdown();
        self.dispatcher.shutdown();
        self.router.shutdown();
        info!("Mesh runtime {} stopped", self.config.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::ArbitrationRequest;
    use crate::types::{MessageType, Request, Version};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let runtime = MeshRuntime::builder(MeshConfig::default().instance_id("node-a"))
            .build()
            .expect("runtime builds");
        assert_eq!(runtime.context().instance_id(), "node-a");
        assert!(runtime.router().is_running());

        let address = runtime
            .register_participant("consumer-1")
            .await
            .expect("participant registered");
        assert_eq!(address, Address::in_process("consumer-1"));
        assert!(runtime.router().directory().contains("consumer-1"));

        runtime.shutdown();
        runtime.shutdown();
        assert!(!runtime.router().is_running());
        assert!(!runtime.publication_manager().is_running());
    }

    #[tokio::test]
    async fn test_provider_registration_reaches_discovery() {
        let runtime = MeshRuntime::builder(MeshConfig::default())
            .build()
            .expect("runtime builds");
        let entry = DiscoveryEntry::new("car", "vehicle/Radio", "radio-1", Version::new(1, 0));
        runtime
            .register_provider(entry, Arc::new(Provider::new("vehicle/Radio")))
            .await
            .expect("provider registered");

        let found = runtime
            .discovery()
            .lookup_by_participant_id("radio-1", &DiscoveryQos::default().lookup_qos(), &[])
            .await
            .expect("in discovery");
        assert!(found.is_local);

        runtime
            .unregister_provider("radio-1")
            .await
            .expect("provider unregistered");
        assert!(runtime.in_process_registry().get("radio-1").is_none());
        runtime.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_config_drives_arbitration() {
        let mut config = MeshConfig::default();
        config.discovery.discovery_timeout_ms = 2_000;
        config.discovery.discovery_retry_delay_ms = 500;
        let runtime = MeshRuntime::builder(config)
            .build()
            .expect("runtime builds");
        assert_eq!(runtime.arbitrator().default_qos().discovery_timeout_ms, 2_000);

        let started = tokio::time::Instant::now();
        let err = runtime
            .arbitrator()
            .start_arbitration(ArbitrationRequest::new(
                vec!["car".into()],
                "vehicle/Unknown",
                Version::new(1, 0),
            ))
            .await
            .err()
            .expect("no provider");
        assert!(matches!(err, MeshError::Discovery(_)));
        assert_eq!(started.elapsed(), Duration::from_millis(2_000));
        runtime.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_messaging_config_sets_default_ttl() {
        const NOW: u64 = 1_000_000;
        let mut config = MeshConfig::default();
        config.messaging.default_ttl_ms = 5_000;
        config.messaging.ttl_uplift_ms = 0;
        let runtime = MeshRuntime::builder(config)
            .clock(Arc::new(RuntimeClock::anchored_at(NOW)))
            .build()
            .expect("runtime builds");

        let captured = Arc::new(Mutex::new(Vec::new()));
        let (address, skeleton) = runtime.in_process_registry().register("sink");
        let sink = captured.clone();
        skeleton.register_listener(Arc::new(move |m: Message| sink.lock().push(m)));
        runtime
            .router()
            .add_next_hop("sink", address, false)
            .await
            .expect("hop added");

        let qos = runtime.dispatcher().default_messaging_qos();
        assert_eq!(qos.ttl_ms, 5_000);
        runtime
            .dispatcher()
            .send_request(
                "consumer-1",
                &DiscoveryEntry::new("car", "vehicle/Radio", "sink", Version::new(1, 0)),
                &qos,
                &Request::new("tune", vec![]),
            )
            .await
            .expect("request sent");

        let sent = captured.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::Request);
        assert_eq!(sent[0].expiry_date_ms, NOW + 5_000);
        drop(sent);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = MeshConfig::default();
        config.instance_id.clear();
        let err = MeshRuntime::builder(config).build().err().expect("rejected");
        assert!(matches!(err, MeshError::Config(_)));
    }
}
