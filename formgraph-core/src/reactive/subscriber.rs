//! Event Subscribers
//!
//! A Subscriber is a listener registered on one node's event bus. The
//! presentation layer subscribes to redraw a control; tests subscribe to
//! count emissions.

use std::sync::atomic::{AtomicU64, Ordering};

use super::ChangeEvent;

/// Unique identifier for a subscriber.
///
/// Returned by `subscribe` and used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A listener on a node's events.
///
/// Listeners run synchronously inside the mutation that caused the event and
/// must not call back into the tree.
pub struct Subscriber {
    id: SubscriberId,
    notify: Box<dyn Fn(&ChangeEvent) + Send + Sync>,
}

impl Subscriber {
    /// Create a new subscriber with the given notification callback.
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        Self {
            id: SubscriberId::new(),
            notify: Box::new(notify),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver an event.
    pub fn notify(&self, event: &ChangeEvent) {
        (self.notify)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn subscriber_notify_calls_callback() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let subscriber = Subscriber::new(move |event| {
            if matches!(event, ChangeEvent::Change { .. }) {
                called_clone.store(true, Ordering::SeqCst);
            }
        });

        assert!(!called.load(Ordering::SeqCst));
        subscriber.notify(&ChangeEvent::Change { value: None });
        assert!(called.load(Ordering::SeqCst));
    }
}
