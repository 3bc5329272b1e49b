// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end subscriptions between participants of one runtime.

use hdds_mesh::dispatch::SubscriptionHandler;
use hdds_mesh::publication::ProviderAttribute;
use hdds_mesh::types::{
    DiscoveryEntry, MulticastPublication, MulticastSubscriptionRequest, SubscriptionPublication,
    SubscriptionQos, SubscriptionReply, SubscriptionRequest, SubscriptionStop, Version,
    NO_EXPIRY_DATE,
};
use hdds_mesh::{
    ArbitrationRequest, MeshConfig, MeshRuntime, MessagingQos, NotifyAttribute, Provider,
    ProviderEvent,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CONSUMER: &str = "consumer-1";
const RADIO: &str = "radio-1";
const INTERFACE: &str = "vehicle/Radio";

#[derive(Default)]
struct Consumer {
    replies: Mutex<Vec<SubscriptionReply>>,
    publications: Mutex<Vec<SubscriptionPublication>>,
    multicasts: Mutex<Vec<MulticastPublication>>,
}

impl SubscriptionHandler for Consumer {
    fn handle_subscription_reply(&self, reply: SubscriptionReply) {
        self.replies.lock().push(reply);
    }

    fn handle_publication(&self, publication: SubscriptionPublication) {
        self.publications.lock().push(publication);
    }

    fn handle_multicast_publication(&self, publication: MulticastPublication) {
        self.multicasts.lock().push(publication);
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Setup {
    runtime: MeshRuntime,
    consumer: Arc<Consumer>,
    speed: Arc<NotifyAttribute>,
    weak_signal: Arc<ProviderEvent>,
    provider_entry: DiscoveryEntry,
}

async fn setup() -> Setup {
    let runtime = MeshRuntime::builder(MeshConfig::default().instance_id("node-a"))
        .build()
        .expect("runtime builds");

    let speed = Arc::new(NotifyAttribute::new(json!(10)));
    let weak_signal = Arc::new(ProviderEvent::non_selective("weakSignal"));
    let provider = Provider::new(INTERFACE)
        .with_attribute("speed", speed.clone() as Arc<dyn ProviderAttribute>)
        .with_event(weak_signal.clone());
    runtime
        .register_provider(
            DiscoveryEntry::new("car", INTERFACE, RADIO, Version::new(1, 0)),
            Arc::new(provider),
        )
        .await
        .expect("provider registered");

    let consumer = Arc::new(Consumer::default());
    runtime
        .dispatcher()
        .register_subscription_handler(consumer.clone());
    runtime
        .register_participant(CONSUMER)
        .await
        .expect("consumer registered");

    let providers = runtime
        .arbitrator()
        .start_arbitration(ArbitrationRequest::new(
            vec!["car".into()],
            INTERFACE,
            Version::new(1, 0),
        ))
        .await
        .expect("arbitration succeeds");
    assert_eq!(providers.len(), 1);
    let provider_entry = providers[0].clone();
    assert_eq!(provider_entry.participant_id, RADIO);

    Setup {
        runtime,
        consumer,
        speed,
        weak_signal,
        provider_entry,
    }
}

#[tokio::test]
async fn test_attribute_subscription_end_to_end() {
    let s = setup().await;
    let qos = MessagingQos::default();

    s.runtime
        .dispatcher()
        .send_subscription_request(
            CONSUMER,
            &s.provider_entry,
            &qos,
            &SubscriptionRequest {
                subscription_id: "speed-sub".into(),
                subscribed_to_name: "speed".into(),
                qos: SubscriptionQos::on_change(0, NO_EXPIRY_DATE),
            },
        )
        .await
        .expect("request sent");

    let consumer = s.consumer.clone();
    wait_until("subscription reply", || !consumer.replies.lock().is_empty()).await;
    {
        let replies = s.consumer.replies.lock();
        assert_eq!(replies[0].subscription_id, "speed-sub");
        assert!(replies[0].error.is_none());
    }
    wait_until("initial publication", || {
        !consumer.publications.lock().is_empty()
    })
    .await;
    assert_eq!(
        s.consumer.publications.lock()[0].response,
        Some(vec![json!(10)])
    );
    assert!(s.runtime.publication_manager().has_subscriptions());

    s.speed.value_changed(json!(11));
    wait_until("change publication", || consumer.publications.lock().len() == 2).await;
    assert_eq!(
        s.consumer.publications.lock()[1].response,
        Some(vec![json!(11)])
    );

    s.runtime
        .dispatcher()
        .send_subscription_stop(
            CONSUMER,
            &s.provider_entry,
            &qos,
            &SubscriptionStop {
                subscription_id: "speed-sub".into(),
            },
        )
        .await
        .expect("stop sent");
    let manager = s.runtime.publication_manager().clone();
    wait_until("subscription removed", || !manager.has_subscriptions()).await;

    s.speed.value_changed(json!(12));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.consumer.publications.lock().len(), 2);

    s.runtime.shutdown();
}

#[tokio::test]
async fn test_multicast_subscription_end_to_end() {
    let s = setup().await;
    let qos = MessagingQos::default();

    s.runtime
        .dispatcher()
        .send_multicast_subscription_request(
            CONSUMER,
            &s.provider_entry,
            &qos,
            &MulticastSubscriptionRequest {
                subscription_id: "signal-sub".into(),
                subscribed_to_name: "weakSignal".into(),
                multicast_id: format!("{}/weakSignal", RADIO),
                qos: SubscriptionQos::on_change(0, NO_EXPIRY_DATE),
            },
        )
        .await
        .expect("request sent");
    assert!(s.runtime.router().has_multicast_receivers());

    let manager = s.runtime.publication_manager().clone();
    wait_until("multicast subscription", || {
        manager.has_multicast_subscriptions()
    })
    .await;
    let consumer = s.consumer.clone();
    wait_until("subscription reply", || !consumer.replies.lock().is_empty()).await;
    assert!(s.consumer.replies.lock()[0].error.is_none());

    s.weak_signal
        .fire(vec![json!("FM4")], vec![])
        .expect("event fired");
    wait_until("multicast publication", || {
        !consumer.multicasts.lock().is_empty()
    })
    .await;
    {
        let multicasts = s.consumer.multicasts.lock();
        assert_eq!(multicasts[0].multicast_id, "radio-1/weakSignal");
        assert_eq!(multicasts[0].response, Some(vec![json!("FM4")]));
    }
    assert!(s.consumer.publications.lock().is_empty());

    s.runtime
        .dispatcher()
        .send_multicast_subscription_stop(
            CONSUMER,
            &s.provider_entry,
            &qos,
            "radio-1/weakSignal",
            &SubscriptionStop {
                subscription_id: "signal-sub".into(),
            },
        )
        .await
        .expect("stop sent");
    assert!(!s.runtime.router().has_multicast_receivers());
    wait_until("multicast subscription removed", || {
        !manager.has_multicast_subscriptions()
    })
    .await;

    s.runtime.shutdown();
}
