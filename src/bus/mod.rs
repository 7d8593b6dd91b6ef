//! # Event Bus
//!
//! ## Responsibility
//! In-process publish/subscribe tying pod activity, evolution triggers and
//! cross-pod signals together.
//!
//! ## Guarantees
//! - `publish` is synchronous: matching subscribers run in subscription
//!   order before it returns, and a failing or panicking subscriber never
//!   stops delivery to the rest
//! - Cross-pod routed events are published after every direct subscriber of
//!   the original event has run, and only while the hop count is below the
//!   configured maximum depth
//! - Persistence is fire-and-forget through a bounded queue; a full queue
//!   sheds the event with a warning instead of blocking the publisher
//! - Handlers may publish or subscribe from inside a callback; the
//!   subscriber table is never locked while handlers run
//!
//! ## NOT Responsible For
//! - Writing to storage (see [`persist`])
//! - Counting events toward evolution (see [`crate::scheduler`])

pub mod persist;
pub mod routing;

pub use routing::{default_routes, CrossPodRoute, EventPattern, PayloadPredicate};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Default maximum cross-pod hop depth.
pub const DEFAULT_MAX_DEPTH: u8 = 1;

/// Default persistence queue capacity.
pub const DEFAULT_PERSIST_CAPACITY: usize = 1_024;

// ─── Errors ────────────────────────────────────────────────────────────────

/// Errors raised by the bus.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    /// A subscription or route pattern could not be parsed.
    #[error("invalid event pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending text.
        pattern: String,
        /// What is wrong.
        reason: String,
    },

    /// The persistence queue is full; the event was shed.
    #[error("persistence queue full; event shed")]
    QueueFull,

    /// The persistence worker has stopped.
    #[error("persistence queue closed")]
    QueueClosed,
}

/// Failure reported by a subscriber. Logged and counted, never propagated.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─── Event ─────────────────────────────────────────────────────────────────

/// Something that happened in a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id; lets stores deduplicate retried writes.
    pub id: Uuid,
    /// Originating (or, for routed events, addressed) pod.
    pub pod: String,
    /// Short event type, e.g. `booking_failed`.
    pub event_type: String,
    /// Structured payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Cross-pod hops taken to produce this event; 0 for direct publishes.
    #[serde(default)]
    pub hop: u8,
}

impl Event {
    /// New event with an empty payload.
    pub fn new(pod: &str, event_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            pod: pod.to_string(),
            event_type: event_type.to_string(),
            payload: Map::new(),
            timestamp: Utc::now(),
            hop: 0,
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Set one payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// `"{pod}.{event_type}"`.
    pub fn qualified_type(&self) -> String {
        format!("{}.{}", self.pod, self.event_type)
    }
}

// ─── Subscriptions ─────────────────────────────────────────────────────────

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionToken(Uuid);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscription {
    token: SubscriptionToken,
    pattern: EventPattern,
    handler: Handler,
}

/// Totals for one `publish` call, including routed descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Handler invocations that returned `Ok`.
    pub delivered: usize,
    /// Handler invocations that returned `Err` or panicked.
    pub handler_failures: usize,
    /// Events synthesized by cross-pod routes.
    pub routed: usize,
    /// Events accepted by the persistence queue.
    pub persisted_enqueued: usize,
}

// ─── Bus ───────────────────────────────────────────────────────────────────

/// In-process event bus.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscription>>,
    routes: Vec<CrossPodRoute>,
    max_depth: u8,
    persist_tx: Option<mpsc::Sender<Event>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .field("routes", &self.routes.len())
            .field("max_depth", &self.max_depth)
            .field("persisting", &self.persist_tx.is_some())
            .finish()
    }
}

impl EventBus {
    /// Bus with the given route table and no persistence.
    pub fn new(routes: Vec<CrossPodRoute>, max_depth: u8) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            routes,
            max_depth,
            persist_tx: None,
        }
    }

    /// Attach a bounded persistence queue; returns the receiving end for
    /// [`persist::spawn_worker`].
    pub fn with_persistence(mut self, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.persist_tx = Some(tx);
        (self, rx)
    }

    /// Register `handler` for events matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidPattern`] if `pattern` does not parse.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionToken, BusError>
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let pattern: EventPattern = pattern.parse()?;
        let token = SubscriptionToken(Uuid::new_v4());
        debug!(%token, %pattern, "subscribed");
        self.subscribers.lock().push(Subscription {
            token,
            pattern,
            handler: Arc::new(handler),
        });
        Ok(token)
    }

    /// Remove every registration made under `token`. Returns `false` if
    /// nothing was registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.token != token);
        let removed = subs.len() != before;
        debug!(%token, removed, "unsubscribed");
        removed
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// The configured route table.
    pub fn routes(&self) -> &[CrossPodRoute] {
        &self.routes
    }

    /// Publish an event: dispatch to subscribers, enqueue for persistence,
    /// then fan out along matching routes.
    ///
    /// # Panics
    ///
    /// This function never panics; subscriber panics are contained.
    pub fn publish(&self, event: Event) -> PublishReport {
        let mut report = PublishReport::default();
        self.dispatch(&event, &mut report);
        report
    }

    fn dispatch(&self, event: &Event, report: &mut PublishReport) {
        let qualified = event.qualified_type();
        metrics::inc_event_published(&qualified);

        // Snapshot so handlers can re-enter the bus.
        let handlers: Vec<(SubscriptionToken, Handler)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.pattern.matches(event))
            .map(|s| (s.token, Arc::clone(&s.handler)))
            .collect();

        for (token, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.handler_failures += 1;
                    warn!(event = %qualified, %token, error = %e, "bus: handler failed");
                }
                Err(_) => {
                    report.handler_failures += 1;
                    warn!(event = %qualified, %token, "bus: handler panicked");
                }
            }
        }

        match self.enqueue(event) {
            Ok(()) => report.persisted_enqueued += 1,
            Err(BusError::QueueFull) => {
                metrics::inc_persistence_failure("event_shed");
                warn!(event = %qualified, "bus: persistence queue full, event shed");
            }
            Err(e) => debug!(event = %qualified, error = %e, "bus: event not persisted"),
        }

        if event.hop >= self.max_depth {
            return;
        }
        for route in self.routes.iter().filter(|r| r.matches(event)) {
            let routed = route.synthesize(event);
            info!(
                from = %qualified,
                to = %routed.qualified_type(),
                hop = routed.hop,
                "bus: cross-pod signal"
            );
            report.routed += 1;
            self.dispatch(&routed, report);
        }
    }

    fn enqueue(&self, event: &Event) -> Result<(), BusError> {
        let Some(tx) = &self.persist_tx else {
            return Err(BusError::QueueClosed);
        };
        tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BusError::QueueClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(bus: &EventBus, pattern: &str) -> (SubscriptionToken, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = bus
            .subscribe(pattern, move |e| {
                sink.lock().push(e.qualified_type());
                Ok(())
            })
            .unwrap();
        (token, seen)
    }

    #[test]
    fn test_exact_and_wildcard_subscribers_both_receive() {
        let bus = EventBus::new(vec![], DEFAULT_MAX_DEPTH);
        let (_, exact) = recorder(&bus, "aurora.call_completed");
        let (_, any) = recorder(&bus, "*");
        let (_, other) = recorder(&bus, "janus.*");

        let report = bus.publish(Event::new("aurora", "call_completed"));
        assert_eq!(report.delivered, 2);
        assert_eq!(exact.lock().len(), 1);
        assert_eq!(any.lock().len(), 1);
        assert!(other.lock().is_empty());
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let bus = EventBus::new(vec![], DEFAULT_MAX_DEPTH);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            let pattern = if i % 2 == 0 { "*" } else { "dan.ping" };
            bus.subscribe(pattern, move |_| {
                order.lock().push(i);
                Ok(())
            })
            .unwrap();
        }
        bus.publish(Event::new("dan", "ping"));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_failing_and_panicking_handlers_do_not_stop_delivery() {
        let bus = EventBus::new(vec![], DEFAULT_MAX_DEPTH);
        bus.subscribe("*", |_| Err("boom".into())).unwrap();
        bus.subscribe("*", |_| panic!("handler bug")).unwrap();
        let (_, seen) = recorder(&bus, "*");

        let report = bus.publish(Event::new("ralph", "story_done"));
        assert_eq!(report.handler_failures, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let bus = EventBus::new(vec![], DEFAULT_MAX_DEPTH);
        let (token, seen) = recorder(&bus, "*");
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        bus.publish(Event::new("dan", "ping"));
        assert!(seen.lock().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let bus = EventBus::new(vec![], DEFAULT_MAX_DEPTH);
        assert!(matches!(
            bus.subscribe("a*b", |_| Ok(())),
            Err(BusError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_route_fires_once_after_direct_subscribers() {
        let bus = EventBus::new(default_routes(), DEFAULT_MAX_DEPTH);
        let (_, log) = recorder(&bus, "*");

        let report = bus.publish(Event::new("aurora", "booking_failed").with("lead", "L-1"));

        assert_eq!(report.routed, 2);
        assert_eq!(
            *log.lock(),
            vec![
                "aurora.booking_failed",
                "syntropy.generate_resource",
                "janus.analyze_objection"
            ]
        );
    }

    #[test]
    fn test_routing_depth_bounds_cycles() {
        let routes = vec![
            CrossPodRoute::new("a.ping".parse().unwrap(), "b", "ping"),
            CrossPodRoute::new("b.ping".parse().unwrap(), "a", "ping"),
        ];
        let bus = EventBus::new(routes.clone(), 1);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        let report = bus.publish(Event::new("a", "ping"));
        assert_eq!(report.routed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let deeper = EventBus::new(routes, 3);
        assert_eq!(deeper.publish(Event::new("a", "ping")).routed, 3);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let bus = Arc::new(EventBus::new(vec![], DEFAULT_MAX_DEPTH));
        let (_, seen) = recorder(&bus, "dan.echo");
        let inner = Arc::downgrade(&bus);
        bus.subscribe("dan.ping", move |_| {
            if let Some(bus) = inner.upgrade() {
                bus.publish(Event::new("dan", "echo"));
            }
            Ok(())
        })
        .unwrap();

        bus.publish(Event::new("dan", "ping"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_sheds_without_blocking() {
        let (bus, mut rx) = EventBus::new(vec![], DEFAULT_MAX_DEPTH).with_persistence(2);
        let mut enqueued = 0;
        for _ in 0..5 {
            enqueued += bus.publish(Event::new("dan", "ping")).persisted_enqueued;
        }
        assert_eq!(enqueued, 2);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_event_serializes_with_qualified_fields() {
        let event = Event::new("aurora", "booking_failed").with("lead", "L-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["pod"], "aurora");
        assert_eq!(json["payload"]["lead"], "L-1");
        assert_eq!(json["hop"], 0);
    }
}
