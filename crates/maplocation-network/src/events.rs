//! In-process publish/subscribe for decoded records
//!
//! Handlers run synchronously on the receive thread, in decode order. A handler
//! that blocks stalls the receive loop; consumers that may be slow should use
//! [`EventBus::subscribe_channel`] instead, which drops records when the
//! consumer falls behind.

use crate::types::Record;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Record) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Handler(Handler),
    Channel(Sender<Record>),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

/// Shared subscriber list. Clones publish to the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Handlers never run under the lock, so a poisoned registry is still consistent
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, subscriber: Subscriber) -> SubscriptionId {
        let mut registry = self.registry();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.push((id, subscriber));
        id
    }

    /// Register a handler called for every published record
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.register(Subscriber::Handler(Arc::new(handler)))
    }

    /// Register a bounded queue of records.
    ///
    /// When the queue is full new records are dropped for this subscriber.
    /// Dropping the returned receiver unsubscribes on the next publish.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriptionId, Receiver<Record>) {
        let (tx, rx) = bounded(capacity);
        (self.register(Subscriber::Channel(tx)), rx)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(existing, _)| *existing != id);
        registry.subscribers.len() != before
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Deliver a record to every current subscriber.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, record: &Record) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let snapshot = self.registry().subscribers.clone();

        let mut delivered = 0;
        let mut disconnected = Vec::new();

        for (id, subscriber) in snapshot {
            match subscriber {
                Subscriber::Handler(handler) => {
                    handler(record);
                    delivered += 1;
                }
                Subscriber::Channel(tx) => match tx.try_send(record.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!("Subscriber {:?} queue full, dropping record", id);
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(id),
                },
            }
        }

        if !disconnected.is_empty() {
            self.registry()
                .subscribers
                .retain(|(id, _)| !disconnected.contains(id));
        }

        delivered
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
