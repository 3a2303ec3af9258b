//! Per-node Event Bus

use tracing::trace;

use super::{ChangeEvent, Subscriber, SubscriberId};

/// Ordered list of listeners on one node.
///
/// A bus is owned by its node. Removing the node drops the bus and with it
/// every listener closure.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are notified in subscription order.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriberId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let subscriber = Subscriber::new(listener);
        let id = subscriber.id();
        self.subscribers.push(subscriber);
        id
    }

    /// Remove a listener. Returns `false` if it was not registered here.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id() != id);
        self.subscribers.len() != before
    }

    pub fn publish(&self, event: &ChangeEvent) {
        trace!(kind = ?event.kind(), listeners = self.subscribers.len(), "publish");
        for subscriber in &self.subscribers {
            subscriber.notify(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn publishes_in_order_and_unsubscribes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();

        let first = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().push("first"))
        };
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().push("second"));
        }

        bus.publish(&ChangeEvent::Change { value: None });
        assert_eq!(*seen.lock(), vec!["first", "second"]);

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish(&ChangeEvent::Change { value: None });
        assert_eq!(*seen.lock(), vec!["first", "second", "second"]);
        assert_eq!(bus.len(), 1);
    }
}
