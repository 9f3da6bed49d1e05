//! Single-listener event fan-out
//!
//! Worker events are pushed to at most one subscriber. Attaching a new
//! subscriber replaces the old one; with nobody attached, events are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// Handle held by the current event listener
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<JsonValue>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the subscription has been
    /// replaced or detached and all delivered events were read.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<JsonValue> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<JsonValue>,
}

/// Holds the current subscriber and forwards events to it
#[derive(Debug)]
pub struct EventBroadcaster {
    subscriber: Mutex<Option<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self {
            subscriber: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber, replacing any existing one.
    pub fn attach(&self) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();

        let previous = self.subscriber.lock().replace(Subscriber { id, sender });
        if let Some(previous) = previous {
            tracing::debug!("Event subscriber {} replaced by {}", previous.id, id);
        }

        EventSubscription { id, receiver }
    }

    /// Clear the subscriber; later events are dropped.
    pub fn detach(&self) {
        self.subscriber.lock().take();
    }

    /// Clear the subscriber only if `id` is still the attached one.
    pub fn detach_if(&self, id: u64) -> bool {
        let mut subscriber = self.subscriber.lock();
        if subscriber.as_ref().is_some_and(|s| s.id == id) {
            *subscriber = None;
            true
        } else {
            false
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    /// Forward an event to the subscriber, if any.
    ///
    /// Returns whether the event was delivered.
    pub fn publish(&self, event: JsonValue) -> bool {
        let mut subscriber = self.subscriber.lock();
        let Some(current) = subscriber.as_ref() else {
            return false;
        };

        if current.sender.send(event).is_err() {
            // Receiver dropped without unsubscribing
            tracing::debug!("Event subscriber {} went away, detaching", current.id);
            *subscriber = None;
            return false;
        }
        true
    }
}
