// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider arbitration.
//!
//! An arbitration looks providers up until a version-compatible one is
//! found or the discovery timeout elapses. Empty results and lookup
//! errors share one retry path paced by the retry delay.

use crate::arbitration::discovery::DiscoveryProxy;
use crate::arbitration::strategy::DiscoveryQos;
use crate::context::RuntimeContext;
use crate::error::{MeshError, Result};
use crate::types::{DiscoveryEntry, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const COMPONENT: &str = "arbitrator";

/// What to arbitrate.
#[derive(Debug, Clone)]
pub struct ArbitrationRequest {
    pub domains: Vec<String>,
    pub interface_name: String,
    pub proxy_version: Version,
    /// `None` uses the default QoS of the arbitrator.
    pub discovery_qos: Option<DiscoveryQos>,
    pub gbids: Vec<String>,
    /// Arbitrate once over the static capabilities, without lookups.
    pub static_arbitration: bool,
}

impl ArbitrationRequest {
    pub fn new(
        domains: Vec<String>,
        interface_name: impl Into<String>,
        proxy_version: Version,
    ) -> Self {
        Self {
            domains,
            interface_name: interface_name.into(),
            proxy_version,
            discovery_qos: None,
            gbids: Vec::new(),
            static_arbitration: false,
        }
    }

    pub fn with_discovery_qos(mut self, qos: DiscoveryQos) -> Self {
        self.discovery_qos = Some(qos);
        self
    }

    pub fn with_gbids(mut self, gbids: Vec<String>) -> Self {
        self.gbids = gbids;
        self
    }

    pub fn static_arbitration(mut self) -> Self {
        self.static_arbitration = true;
        self
    }
}

fn supports_on_change(entry: &DiscoveryEntry, required: bool) -> bool {
    !required || entry.qos.supports_on_change_subscriptions
}

/// Split `entries` into usable providers and the distinct incompatible versions.
fn filter_compatible(
    entries: Vec<DiscoveryEntry>,
    request: &ArbitrationRequest,
    qos: &DiscoveryQos,
) -> (Vec<DiscoveryEntry>, Vec<Version>) {
    let must_support_on_change = qos.provider_must_support_on_change;
    let mut compatible = Vec::new();
    let mut incompatible: Vec<Version> = Vec::new();
    for entry in entries {
        if !entry
            .provider_version
            .is_compatible_with(&request.proxy_version)
        {
            if !incompatible.contains(&entry.provider_version) {
                incompatible.push(entry.provider_version);
            }
        } else if supports_on_change(&entry, must_support_on_change) {
            compatible.push(entry);
        }
    }
    (compatible, incompatible)
}

async fn discover(
    discovery: Arc<dyn DiscoveryProxy>,
    request: ArbitrationRequest,
    qos: DiscoveryQos,
) -> Result<Vec<DiscoveryEntry>> {
    let lookup_qos = qos.lookup_qos();
    let retry_delay = Duration::from_millis(qos.discovery_retry_delay_ms);
    let deadline = Instant::now() + Duration::from_millis(qos.discovery_timeout_ms);
    let mut incompatible_versions: Vec<Version> = Vec::new();
    let mut last_error: Option<String> = None;

    loop {
        let lookup = discovery.lookup(
            &request.domains,
            &request.interface_name,
            &lookup_qos,
            &request.gbids,
        );
        match tokio::time::timeout_at(deadline, lookup).await {
            Err(_) => break,
            Ok(Ok(entries)) => {
                let found = entries.len();
                let (compatible, incompatible) = filter_compatible(entries, &request, &qos);
                incompatible_versions = incompatible;
                let arbitrated = qos.arbitration_strategy.apply(compatible);
                if !arbitrated.is_empty() {
                    info!(
                        "Arbitration of {} selected {} provider(s)",
                        request.interface_name,
                        arbitrated.len()
                    );
                    return Ok(arbitrated);
                }
                debug!(
                    "Lookup of {} found {} provider(s), none usable; retrying",
                    request.interface_name, found
                );
            }
            Ok(Err(e)) => {
                debug!("Lookup of {} failed: {}; retrying", request.interface_name, e);
                last_error = Some(e.to_string());
            }
        }

        let wake = (Instant::now() + retry_delay).min(deadline);
        tokio::time::sleep_until(wake).await;
        if Instant::now() >= deadline {
            break;
        }
    }

    if !incompatible_versions.is_empty() {
        return Err(MeshError::NoCompatibleProviderFound {
            interface_name: request.interface_name,
            discovered_versions: incompatible_versions,
        });
    }
    Err(MeshError::Discovery(format!(
        "no provider found within discovery timeout for domains {:?}, interface {}{}",
        request.domains,
        request.interface_name,
        last_error
            .map(|e| format!(". Error: {}", e))
            .unwrap_or_default()
    )))
}

struct PendingArbitration {
    reply: oneshot::Sender<Result<Vec<DiscoveryEntry>>>,
    task: JoinHandle<()>,
}

struct ArbitratorInner {
    ctx: RuntimeContext,
    discovery: Arc<dyn DiscoveryProxy>,
    static_capabilities: Vec<DiscoveryEntry>,
    default_qos: DiscoveryQos,
    pending: Mutex<HashMap<u64, PendingArbitration>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Provider arbitrator. Cheap to clone.
#[derive(Clone)]
pub struct Arbitrator {
    inner: Arc<ArbitratorInner>,
}

impl Arbitrator {
    pub fn new(ctx: RuntimeContext, discovery: Arc<dyn DiscoveryProxy>) -> Self {
        Self::with_static_capabilities(ctx, discovery, Vec::new())
    }

    pub fn with_static_capabilities(
        ctx: RuntimeContext,
        discovery: Arc<dyn DiscoveryProxy>,
        static_capabilities: Vec<DiscoveryEntry>,
    ) -> Self {
        Self::with_default_qos(ctx, discovery, static_capabilities, DiscoveryQos::default())
    }

    /// Arbitrator applying `default_qos` to requests that carry no QoS.
    pub fn with_default_qos(
        ctx: RuntimeContext,
        discovery: Arc<dyn DiscoveryProxy>,
        static_capabilities: Vec<DiscoveryEntry>,
        default_qos: DiscoveryQos,
    ) -> Self {
        Self {
            inner: Arc::new(ArbitratorInner {
                ctx,
                discovery,
                static_capabilities,
                default_qos,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn default_qos(&self) -> &DiscoveryQos {
        &self.inner.default_qos
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Find the providers for `request`.
    pub async fn start_arbitration(
        &self,
        request: ArbitrationRequest,
    ) -> Result<Vec<DiscoveryEntry>> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown(COMPONENT));
        }
        let qos = request
            .discovery_qos
            .clone()
            .unwrap_or_else(|| self.inner.default_qos.clone());
        if request.static_arbitration && !self.inner.static_capabilities.is_empty() {
            return self.arbitrate_static(&request, &qos);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if !self.inner.running.load(Ordering::Acquire) {
                return Err(MeshError::Shutdown(COMPONENT));
            }
            debug!(
                "Arbitration {} started for {} in {:?}",
                id, request.interface_name, request.domains
            );
            let arbitrator = self.clone();
            let discovery = self.inner.discovery.clone();
            let task = self.inner.ctx.spawn(async move {
                let result = discover(discovery, request, qos).await;
                arbitrator.finish(id, result);
            });
            pending.insert(id, PendingArbitration { reply, task });
        }

        rx.await
            .unwrap_or_else(|_| Err(MeshError::Shutdown(COMPONENT)))
    }

    fn finish(&self, id: u64, result: Result<Vec<DiscoveryEntry>>) {
        if let Some(pending) = self.inner.pending.lock().remove(&id) {
            let _ = pending.reply.send(result);
        }
    }

    fn arbitrate_static(
        &self,
        request: &ArbitrationRequest,
        qos: &DiscoveryQos,
    ) -> Result<Vec<DiscoveryEntry>> {
        let candidates: Vec<DiscoveryEntry> = self
            .inner
            .static_capabilities
            .iter()
            .filter(|e| {
                request.domains.contains(&e.domain)
                    && e.interface_name == request.interface_name
                    && e.provider_version.is_compatible_with(&request.proxy_version)
                    && supports_on_change(e, qos.provider_must_support_on_change)
            })
            .cloned()
            .collect();

        let arbitrated = qos.arbitration_strategy.apply(candidates);
        if arbitrated.is_empty() {
            return Err(MeshError::Discovery(format!(
                "no static provider for domains {:?}, interface {}",
                request.domains, request.interface_name
            )));
        }
        Ok(arbitrated)
    }

    /// Reject every pending arbitration and refuse new ones. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<PendingArbitration> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, p)| p)
            .collect();
        for arbitration in pending {
            arbitration.task.abort();
            let _ = arbitration.reply.send(Err(MeshError::Shutdown(COMPONENT)));
        }
        info!("Arbitrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::discovery::LookupQos;
    use crate::arbitration::strategy::ArbitrationStrategy;
    use crate::clock::RuntimeClock;
    use crate::types::ProviderQos;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Answers lookups from a script; the last answer repeats.
    struct ScriptedDiscovery {
        script: Mutex<VecDeque<Result<Vec<DiscoveryEntry>>>>,
        last: Mutex<Result<Vec<DiscoveryEntry>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDiscovery {
        fn new(script: Vec<Result<Vec<DiscoveryEntry>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Ok(Vec::new())),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiscoveryProxy for ScriptedDiscovery {
        async fn lookup(
            &self,
            _domains: &[String],
            _interface_name: &str,
            _qos: &LookupQos,
            _gbids: &[String],
        ) -> Result<Vec<DiscoveryEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(answer) => {
                    *self.last.lock() = answer.clone();
                    answer
                }
                None => self.last.lock().clone(),
            }
        }

        async fn lookup_by_participant_id(
            &self,
            participant_id: &str,
            _qos: &LookupQos,
            _gbids: &[String],
        ) -> Result<DiscoveryEntry> {
            Err(MeshError::Discovery(format!("{} unknown", participant_id)))
        }

        async fn add(&self, _entry: DiscoveryEntry, _await_global: bool) -> Result<()> {
            Ok(())
        }

        async fn add_to_all(&self, _entry: DiscoveryEntry, _await_global: bool) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _participant_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn ctx() -> RuntimeContext {
        RuntimeContext::new(
            "test",
            Arc::new(RuntimeClock::new()),
            tokio::runtime::Handle::current(),
        )
    }

    fn provider(id: &str, major: i32, minor: i32, priority: i64) -> DiscoveryEntry {
        DiscoveryEntry::new("domain", "vehicle/Radio", id, Version::new(major, minor)).with_qos(
            ProviderQos {
                priority,
                ..ProviderQos::default()
            },
        )
    }

    fn request() -> ArbitrationRequest {
        ArbitrationRequest::new(vec!["domain".into()], "vehicle/Radio", Version::new(2, 1))
            .with_discovery_qos(
                DiscoveryQos::default()
                    .with_timeout_ms(1_000)
                    .with_retry_delay_ms(300)
                    .with_strategy(ArbitrationStrategy::HighestPriority),
            )
    }

    fn ids(entries: &[DiscoveryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.participant_id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_compatible_providers_arbitrated() {
        let discovery = ScriptedDiscovery::new(vec![Ok(vec![
            provider("low", 2, 1, 1),
            provider("old", 1, 9, 10),
            provider("high", 2, 4, 5),
        ])]);
        let arbitrator = Arbitrator::new(ctx(), discovery.clone());

        let result = arbitrator.start_arbitration(request()).await.expect("found");
        assert_eq!(ids(&result), ["high", "low"]);
        assert_eq!(discovery.calls(), 1);
        assert_eq!(arbitrator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_lookups_are_retried() {
        let discovery = ScriptedDiscovery::new(vec![
            Ok(Vec::new()),
            Err(MeshError::Transport("directory unreachable".into())),
            Ok(vec![provider("p1", 2, 1, 0)]),
        ]);
        let arbitrator = Arbitrator::new(ctx(), discovery.clone());

        let started = Instant::now();
        let result = arbitrator.start_arbitration(request()).await.expect("found");
        assert_eq!(ids(&result), ["p1"]);
        assert_eq!(discovery.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_versions_reported_at_timeout() {
        let discovery = ScriptedDiscovery::new(vec![
            Ok(vec![provider("a", 1, 0, 0)]),
            Ok(vec![provider("b", 3, 1, 0), provider("c", 2, 0, 0), provider("d", 3, 1, 0)]),
        ]);
        let arbitrator = Arbitrator::new(ctx(), discovery.clone());

        let err = arbitrator
            .start_arbitration(request())
            .await
            .expect_err("no compatible provider");
        match err {
            MeshError::NoCompatibleProviderFound {
                interface_name,
                discovered_versions,
            } => {
                assert_eq!(interface_name, "vehicle/Radio");
                assert_eq!(discovered_versions, vec![Version::new(3, 1), Version::new(2, 0)]);
            }
            other => panic!("unexpected error: {}", other),
        }
        // lookups at 0, 300, 600 and 900 ms
        assert_eq!(discovery.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_qos_uses_arbitrator_default() {
        let discovery = ScriptedDiscovery::new(vec![Ok(Vec::new())]);
        let arbitrator = Arbitrator::with_default_qos(
            ctx(),
            discovery.clone(),
            Vec::new(),
            DiscoveryQos::default()
                .with_timeout_ms(2_000)
                .with_retry_delay_ms(500),
        );

        let started = Instant::now();
        let err = arbitrator
            .start_arbitration(ArbitrationRequest::new(
                vec!["domain".into()],
                "vehicle/Radio",
                Version::new(2, 1),
            ))
            .await
            .expect_err("times out");
        assert!(matches!(err, MeshError::Discovery(_)));
        assert_eq!(started.elapsed(), Duration::from_millis(2_000));
        // lookups at 0, 500, 1000 and 1500 ms
        assert_eq!(discovery.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_error() {
        let discovery = ScriptedDiscovery::new(vec![Err(MeshError::Transport(
            "directory unreachable".into(),
        ))]);
        let arbitrator = Arbitrator::new(ctx(), discovery);

        let err = arbitrator
            .start_arbitration(request())
            .await
            .expect_err("times out");
        match err {
            MeshError::Discovery(detail) => assert!(detail.contains("directory unreachable")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_support_required() {
        let mut capable = provider("capable", 2, 1, 0);
        capable.qos.supports_on_change_subscriptions = true;
        let discovery = ScriptedDiscovery::new(vec![Ok(vec![provider("plain", 2, 1, 9), capable])]);
        let arbitrator = Arbitrator::new(ctx(), discovery);

        let mut req = request();
        req.discovery_qos = req
            .discovery_qos
            .map(|qos| qos.with_provider_must_support_on_change(true));
        let result = arbitrator.start_arbitration(req).await.expect("found");
        assert_eq!(ids(&result), ["capable"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_arbitration_skips_lookup() {
        let discovery = ScriptedDiscovery::new(vec![]);
        let mut other_domain = provider("elsewhere", 2, 1, 0);
        other_domain.domain = "other".into();
        let arbitrator = Arbitrator::with_static_capabilities(
            ctx(),
            discovery.clone(),
            vec![provider("static", 2, 3, 0), provider("old", 1, 0, 0), other_domain],
        );

        let result = arbitrator
            .start_arbitration(request().static_arbitration())
            .await
            .expect("found");
        assert_eq!(ids(&result), ["static"]);

        let mut wrong_interface = request().static_arbitration();
        wrong_interface.interface_name = "vehicle/Navigation".into();
        assert!(matches!(
            arbitrator.start_arbitration(wrong_interface).await,
            Err(MeshError::Discovery(_))
        ));
        assert_eq!(discovery.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_pending_arbitrations() {
        let discovery = ScriptedDiscovery::new(vec![Ok(Vec::new())]);
        let arbitrator = Arbitrator::new(ctx(), discovery.clone());

        let pending = tokio::spawn({
            let arbitrator = arbitrator.clone();
            async move { arbitrator.start_arbitration(request()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(arbitrator.pending_count(), 1);

        arbitrator.shutdown();
        arbitrator.shutdown();
        assert!(matches!(
            pending.await.expect("join"),
            Err(MeshError::Shutdown(_))
        ));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(discovery.calls(), 1);
        assert!(matches!(
            arbitrator.start_arbitration(request()).await,
            Err(MeshError::Shutdown(_))
        ));
    }
}
