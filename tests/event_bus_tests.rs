//! Event bus delivery, filtering and history

use edge_discovery::events::{handler_fn, EventPriority};
use edge_discovery::{DiscoveryEvent, EngineError, EventBus, EventFilter, EventKind, EventType};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_test::traced_test;

mod common;
use common::device;

fn completed(protocol: &str) -> DiscoveryEvent {
    DiscoveryEvent::new(
        EventKind::DiscoveryCompleted {
            protocol: protocol.to_string(),
            duration_ms: 12,
            devices_found: 0,
            success: true,
        },
        "scheduler",
    )
}

fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn edge_discovery::events::EventHandler> {
    handler_fn(move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_filters_select_by_type_source_and_priority() {
    let bus = EventBus::new(100);
    let by_type = Arc::new(AtomicUsize::new(0));
    let by_source = Arc::new(AtomicUsize::new(0));
    let urgent = Arc::new(AtomicUsize::new(0));
    let everything = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        counting_handler(by_type.clone()),
        Some(EventFilter::new().event_types([EventType::DeviceDiscovered])),
    )
    .await;
    bus.subscribe(
        counting_handler(by_source.clone()),
        Some(EventFilter::new().sources(["scheduler"])),
    )
    .await;
    bus.subscribe(
        counting_handler(urgent.clone()),
        Some(EventFilter::new().min_priority(EventPriority::High)),
    )
    .await;
    bus.subscribe(counting_handler(everything.clone()), None).await;

    bus.publish(DiscoveryEvent::device_discovered(device("10.0.0.1", "mdns"), "mdns", true))
        .await;
    bus.publish(completed("mdns")).await;
    bus.publish(completed("ssdp").with_priority(EventPriority::Critical)).await;

    assert_eq!(by_type.load(Ordering::SeqCst), 1);
    assert_eq!(by_source.load(Ordering::SeqCst), 2);
    assert_eq!(urgent.load(Ordering::SeqCst), 1);
    assert_eq!(everything.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_predicate_filters_on_payload() {
    let bus = EventBus::new(10);
    let (_, mut rx) = bus
        .subscribe_channel(Some(EventFilter::new().predicate(|event| {
            matches!(&event.kind, EventKind::DiscoveryCompleted { protocol, .. } if protocol == "ssdp")
        })))
        .await;

    bus.publish(completed("mdns")).await;
    bus.publish(completed("ssdp")).await;

    let received = rx.recv().await.unwrap();
    assert!(matches!(&received.kind, EventKind::DiscoveryCompleted { protocol, .. } if protocol == "ssdp"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
#[traced_test]
async fn test_failing_subscriber_is_isolated_and_counted() {
    let bus = EventBus::new(10);
    let healthy = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        handler_fn(|_event| async { Err(EngineError::subscriber("dashboard offline")) }),
        None,
    )
    .await;
    bus.subscribe(counting_handler(healthy.clone()), None).await;

    let delivered = bus.publish(completed("mdns")).await;
    assert_eq!(delivered, 1);
    assert_eq!(healthy.load(Ordering::SeqCst), 1);
    assert!(logs_contain("Event handler failed"));

    let stats = bus.get_statistics().await;
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.delivery_failures, 1);
    assert_eq!(stats.subscriptions.iter().map(|s| s.failure_count).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_history_queries_by_type_time_and_limit() {
    let bus = EventBus::new(3);
    let before = Utc::now();
    for protocol in ["a", "b", "c", "d"] {
        bus.publish(completed(protocol)).await;
    }
    bus.publish(DiscoveryEvent::discovery_error("ssdp", "timeout", "timeout", true))
        .await;

    let all = bus.get_event_history(None, None, None).await;
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].event_type(), EventType::DiscoveryError);

    let completed_only = bus
        .get_event_history(Some(&[EventType::DiscoveryCompleted]), Some(before), Some(1))
        .await;
    assert_eq!(completed_only.len(), 1);
    assert!(matches!(&completed_only[0].kind, EventKind::DiscoveryCompleted { protocol, .. } if protocol == "d"));

    let future = Utc::now() + chrono::Duration::seconds(60);
    assert!(bus.get_event_history(None, Some(future), None).await.is_empty());

    bus.clear_history().await;
    assert!(bus.get_event_history(None, None, None).await.is_empty());
}
