//! In-process subscription bus.
//!
//! Display surfaces (chart, map, dashboard, alert list) subscribe to typed
//! categories without knowing which transport produced the data. Handlers of
//! a category run in subscription order. The handler list is snapshotted
//! before a publish round, so unsubscribing from inside a handler neither
//! corrupts the round nor affects co-subscribed handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{Alert, ConnectionStatus, DeviceStatus, ObservationEvent};
use crate::reconciler::ReconciledUpdate;

/// Event categories consumers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Accepted observation delivered as new data (push or poll)
    NewData,
    /// Accepted observation delivered as an update
    Update,
    /// Reconciled state changed
    Reconciled,
    Alert,
    Connected,
    Disconnected,
    /// Any connection status change
    StatusChanged,
    DeviceStatus,
    /// No data accepted within the staleness threshold
    DataStale,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::NewData => "newData",
            Category::Update => "update",
            Category::Reconciled => "reconciled",
            Category::Alert => "alert",
            Category::Connected => "connected",
            Category::Disconnected => "disconnected",
            Category::StatusChanged => "statusChanged",
            Category::DeviceStatus => "deviceStatus",
            Category::DataStale => "dataStale",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload published on the bus. Shared values; subscribers must not expect
/// to mutate them.
#[derive(Debug, Clone)]
pub enum BusEvent {
    NewData(Arc<ObservationEvent>),
    Update(Arc<ObservationEvent>),
    Reconciled(Arc<ReconciledUpdate>),
    Alert(Arc<Alert>),
    Connected(ConnectionStatus),
    Disconnected(ConnectionStatus),
    StatusChanged(ConnectionStatus),
    DeviceStatus(Arc<DeviceStatus>),
    DataStale {
        last_data_at: Option<DateTime<Utc>>,
    },
}

impl BusEvent {
    pub fn category(&self) -> Category {
        match self {
            BusEvent::NewData(_) => Category::NewData,
            BusEvent::Update(_) => Category::Update,
            BusEvent::Reconciled(_) => Category::Reconciled,
            BusEvent::Alert(_) => Category::Alert,
            BusEvent::Connected(_) => Category::Connected,
            BusEvent::Disconnected(_) => Category::Disconnected,
            BusEvent::StatusChanged(_) => Category::StatusChanged,
            BusEvent::DeviceStatus(_) => Category::DeviceStatus,
            BusEvent::DataStale { .. } => Category::DataStale,
        }
    }
}

/// A subscriber callback.
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Publish/subscribe capability.
pub trait EventBus: Send + Sync {
    /// Register a handler for one category.
    fn subscribe(&self, category: Category, handler: Handler) -> Subscription;

    /// Deliver an event to every handler of its category.
    fn publish(&self, event: BusEvent);
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<Category, Vec<(u64, Handler)>>,
}

impl Registry {
    fn remove(&mut self, category: Category, id: u64) {
        if let Some(list) = self.handlers.get_mut(&category) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }
}

/// Handle returned by `subscribe`. Unsubscribing is idempotent; dropping the
/// handle leaves the subscription in place.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    category: Category,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.category, self.id);
        }
    }

    /// The handler is still registered.
    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|registry| {
            registry
                .lock()
                .handlers
                .get(&self.category)
                .is_some_and(|list| list.iter().any(|(id, _)| *id == self.id))
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("category", &self.category)
            .field("id", &self.id)
            .finish()
    }
}

/// The bus implementation shared by a session.
#[derive(Default)]
pub struct SubscriptionBus {
    registry: Arc<Mutex<Registry>>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience wrapper around [`EventBus::subscribe`] taking a closure.
    pub fn on<F>(&self, category: Category, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribe(category, Arc::new(handler))
    }

    /// Number of handlers registered for a category.
    pub fn handler_count(&self, category: Category) -> usize {
        self.registry
            .lock()
            .handlers
            .get(&category)
            .map_or(0, Vec::len)
    }
}

impl EventBus for SubscriptionBus {
    fn subscribe(&self, category: Category, handler: Handler) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(category)
            .or_default()
            .push((id, handler));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            category,
            id,
        }
    }

    fn publish(&self, event: BusEvent) {
        // Snapshot under the lock, invoke without it
        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .handlers
            .get(&event.category())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&event);
        }
    }
}

impl fmt::Debug for SubscriptionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let counts: HashMap<Category, usize> = registry
            .handlers
            .iter()
            .map(|(category, list)| (*category, list.len()))
            .collect();
        f.debug_struct("SubscriptionBus")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::TimeZone;

    fn sample_event() -> BusEvent {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        BusEvent::NewData(Arc::new(ObservationEvent::new(
            "S1",
            at,
            Location::new(21.0, 105.8),
        )))
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = SubscriptionBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            bus.on(Category::NewData, move |_| order.lock().push(n));
        }

        bus.publish(sample_event());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_categories_are_isolated() {
        let bus = SubscriptionBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        bus.on(Category::Alert, move |_| *counter.lock() += 1);

        bus.publish(sample_event());
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = SubscriptionBus::new();
        let sub = bus.on(Category::NewData, |_| {});
        assert!(sub.is_active());

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.handler_count(Category::NewData), 0);
    }

    #[test]
    fn test_self_unsubscribe_during_publish() {
        let bus = SubscriptionBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let own: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let first_calls = calls.clone();
        let own_handle = own.clone();
        let sub = bus.on(Category::NewData, move |_| {
            first_calls.lock().push("first");
            if let Some(sub) = own_handle.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        *own.lock() = Some(sub);

        let second_calls = calls.clone();
        bus.on(Category::NewData, move |_| second_calls.lock().push("second"));

        bus.publish(sample_event());
        assert_eq!(*calls.lock(), vec!["first", "second"]);

        bus.publish(sample_event());
        assert_eq!(*calls.lock(), vec!["first", "second", "second"]);
    }

    #[test]
    fn test_unsubscribing_a_peer_mid_round_keeps_the_round_intact() {
        let bus = SubscriptionBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let peer: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let peer_handle = peer.clone();
        bus.on(Category::NewData, move |_| {
            if let Some(sub) = peer_handle.lock().take() {
                sub.unsubscribe();
            }
        });
        let peer_calls = calls.clone();
        *peer.lock() = Some(bus.on(Category::NewData, move |_| peer_calls.lock().push("peer")));

        bus.publish(sample_event());
        bus.publish(sample_event());
        assert_eq!(*calls.lock(), vec!["peer"]);
    }

    #[test]
    fn test_subscribe_from_handler_does_not_deadlock() {
        let bus = Arc::new(SubscriptionBus::new());
        let inner_bus = bus.clone();
        bus.on(Category::NewData, move |_| {
            inner_bus.on(Category::Alert, |_| {});
        });

        bus.publish(sample_event());
        assert_eq!(bus.handler_count(Category::Alert), 1);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = SubscriptionBus::new();
        let sub = bus.on(Category::NewData, |_| {});
        drop(bus);

        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
