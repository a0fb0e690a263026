//! Async pub/sub hub for discovery events
//!
//! `publish` records the event in a bounded history, then hands it to every
//! matching subscription in its own task and waits for all of them. A
//! subscription never runs two handler invocations at once, so each subscriber
//! observes events in publish order while different subscribers run
//! concurrently.

use super::filter::EventFilter;
use super::types::{DiscoveryEvent, EventType};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle returned by [`EventBus::subscribe`]
pub type SubscriptionId = Uuid;

/// Receives events from the bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<DiscoveryEvent>) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<DiscoveryEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<DiscoveryEvent>) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<DiscoveryEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forwards events into an unbounded channel
struct ChannelHandler {
    tx: mpsc::UnboundedSender<Arc<DiscoveryEvent>>,
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: Arc<DiscoveryEvent>) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| EngineError::subscriber("event receiver dropped"))
    }
}

/// Per-subscription counters
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub subscription_id: SubscriptionId,
    pub event_count: u64,
    pub failure_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
    /// Held for the duration of one delivery; tokio mutexes are FIFO-fair
    delivery: Mutex<()>,
    stats: std::sync::Mutex<SubscriptionStats>,
}

impl Subscription {
    fn record(&self, ok: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.event_count += 1;
            stats.last_event_time = Some(Utc::now());
            if !ok {
                stats.failure_count += 1;
            }
        }
    }

    fn snapshot(&self) -> Option<SubscriptionStats> {
        self.stats.lock().ok().map(|s| s.clone())
    }
}

#[derive(Debug, Default)]
struct Counters {
    events_published: u64,
    events_delivered: u64,
    delivery_failures: u64,
}

/// Bus statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BusStatistics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub subscriptions_count: usize,
    pub history_size: usize,
    pub history_capacity: usize,
    pub uptime_seconds: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

/// Event bus with filtered subscriptions and bounded history
pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    history: Mutex<VecDeque<Arc<DiscoveryEvent>>>,
    history_capacity: usize,
    counters: Mutex<Counters>,
    started_at: Instant,
    closed: AtomicBool,
}

impl EventBus {
    /// Create a bus keeping at most `history_capacity` events (minimum 1)
    pub fn new(history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        debug!(history_capacity, "📢 Initializing event bus");

        Self {
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(4096))),
            history_capacity,
            counters: Mutex::new(Counters::default()),
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler; `None` filter receives every event
    pub async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        let subscription = Arc::new(Subscription {
            id,
            filter: filter.unwrap_or_default(),
            handler,
            delivery: Mutex::new(()),
            stats: std::sync::Mutex::new(SubscriptionStats {
                subscription_id: id,
                event_count: 0,
                failure_count: 0,
                last_event_time: None,
                created_at: Utc::now(),
            }),
        });

        self.subscriptions.write().await.insert(id, subscription);
        debug!(subscription_id = %id, "✅ Subscription added");
        id
    }

    /// Subscribe with a channel instead of a callback
    pub async fn subscribe_channel(
        &self,
        filter: Option<EventFilter>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<DiscoveryEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(ChannelHandler { tx }), filter).await;
        (id, rx)
    }

    /// Remove a subscription; `false` if it was not registered
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().await.remove(&id).is_some();
        if removed {
            debug!(subscription_id = %id, "📭 Subscription removed");
        }
        removed
    }

    /// Record and deliver an event; returns how many subscribers handled it
    pub async fn publish(&self, event: DiscoveryEvent) -> usize {
        let event = Arc::new(event);

        {
            let mut history = self.history.lock().await;
            while history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.counters.lock().await.events_published += 1;

        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|sub| sub.filter.matches(&event))
            .cloned()
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let deliveries: Vec<_> = targets
            .iter()
            .map(|sub| {
                let sub = sub.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let _turn = sub.delivery.lock().await;
                    sub.handler.handle(event).await
                })
            })
            .collect();

        let outcomes = futures::future::join_all(deliveries).await;

        let mut delivered = 0;
        for (sub, outcome) in targets.iter().zip(outcomes) {
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) => Some(format!("handler panicked: {join_error}")),
            };
            sub.record(failure.is_none());

            match failure {
                None => delivered += 1,
                Some(error) => warn!(
                    subscription_id = %sub.id,
                    event_id = %event.event_id,
                    event_type = %event.event_type(),
                    source = %event.source,
                    error = %error,
                    "Event handler failed"
                ),
            }
        }

        let mut counters = self.counters.lock().await;
        counters.events_delivered += delivered as u64;
        counters.delivery_failures += (targets.len() - delivered) as u64;

        delivered
    }

    /// Retained events, newest first.
    ///
    /// `event_types` and `since` narrow the result, `limit` caps it after
    /// filtering. The history itself is left untouched.
    pub async fn get_event_history(
        &self,
        event_types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<Arc<DiscoveryEvent>> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .filter(|e| event_types.map_or(true, |types| types.contains(&e.event_type())))
            .filter(|e| since.map_or(true, |since| e.timestamp >= since))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn get_statistics(&self) -> BusStatistics {
        let subscriptions: Vec<SubscriptionStats> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter_map(|s| s.snapshot())
            .collect();
        let history_size = self.history.lock().await.len();
        let counters = self.counters.lock().await;

        BusStatistics {
            events_published: counters.events_published,
            events_delivered: counters.events_delivered,
            delivery_failures: counters.delivery_failures,
            subscriptions_count: subscriptions.len(),
            history_size,
            history_capacity: self.history_capacity,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            subscriptions,
        }
    }

    /// Drop every subscription; later events are still recorded in history
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut subscriptions = self.subscriptions.write().await;
        let count = subscriptions.len();
        subscriptions.clear();
        info!(subscriptions = count, "🛑 Event bus shut down");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventKind, EventPriority};
    use std::sync::atomic::AtomicUsize;

    fn started(n: usize) -> DiscoveryEvent {
        DiscoveryEvent::new(
            EventKind::DiscoveryStarted {
                protocols: vec![format!("p{n}")],
                parameters: Default::default(),
            },
            "test",
        )
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish(started(n)).await;
        }

        let history = bus.get_event_history(None, None, None).await;
        assert_eq!(history.len(), 3);
        let names: Vec<_> = history
            .iter()
            .map(|e| match &e.kind {
                EventKind::DiscoveryStarted { protocols, .. } => protocols[0].clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["p4", "p3", "p2"]);

        assert_eq!(bus.get_event_history(None, None, Some(1)).await.len(), 1);
        bus.clear_history().await;
        assert!(bus.get_event_history(None, None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new(10);
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            handler_fn(|_| async { Err::<(), _>(EngineError::subscriber("boom")) }),
            None,
        )
        .await;
        bus.subscribe(
            handler_fn(|event: Arc<DiscoveryEvent>| async move {
                if event.source == "test" {
                    panic!("handler bug");
                }
                Ok::<(), EngineError>(())
            }),
            None,
        )
        .await;
        let counter = hits.clone();
        bus.subscribe(
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), EngineError>(())
                }
            }),
            None,
        )
        .await;

        let delivered = bus.publish(started(0)).await;
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stats = bus.get_statistics().await;
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.delivery_failures, 2);
        assert_eq!(stats.subscriptions_count, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::default();
        let (id, _rx) = bus.subscribe_channel(None).await;
        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
    }

    #[tokio::test]
    async fn test_channel_subscriber_sees_publish_order() {
        let bus = EventBus::default();
        let (_id, mut rx) = bus
            .subscribe_channel(Some(EventFilter::new().min_priority(EventPriority::Normal)))
            .await;

        for n in 0..20 {
            bus.publish(started(n)).await;
        }
        for n in 0..20 {
            let event = rx.recv().await.unwrap();
            match &event.kind {
                EventKind::DiscoveryStarted { protocols, .. } => {
                    assert_eq!(protocols[0], format!("p{n}"))
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery_but_keeps_history() {
        let bus = EventBus::default();
        let (_id, _rx) = bus.subscribe_channel(None).await;
        bus.shutdown().await;

        assert_eq!(bus.publish(started(1)).await, 0);
        assert_eq!(bus.subscription_count().await, 0);
        assert_eq!(bus.get_event_history(None, None, None).await.len(), 1);
    }
}
