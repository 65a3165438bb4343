//! Cache event bus.
//!
//! Publishes invalidation completions and refresh failures to any number of
//! subscribers. Every subscription is a handle; dropping it unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::keys::ResourceKey;

/// Monotonic sequence number of published completions within this process.
pub type Epoch = u64;

/// Free-form metadata attached to invalidation events.
pub type Metadata = serde_json::Value;

/// Payload of the `cache:invalidated` topic.
#[derive(Debug, Clone)]
pub struct InvalidationCompleted {
    pub id: Uuid,
    pub epoch: Epoch,
    /// Trigger that caused the invalidation, or the sweep name.
    pub trigger: String,
    /// De-duplicated string forms of every invalidated target.
    pub keys: Vec<String>,
    pub metadata: Metadata,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Invalidated(InvalidationCompleted),
    /// A background refresh failed; the stale value kept being served.
    FetchFailed { key: ResourceKey, error: String },
}

impl CacheEvent {
    /// Topic name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::Invalidated(_) => "cache:invalidated",
            CacheEvent::FetchFailed { .. } => "cache:fetch-failed",
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
    epoch_counter: AtomicU64,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Build and publish an invalidation completion.
    pub fn invalidated(
        &self,
        trigger: &str,
        keys: Vec<String>,
        metadata: Metadata,
    ) -> InvalidationCompleted {
        let completed = InvalidationCompleted {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            trigger: trigger.to_string(),
            keys,
            metadata,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.publish(CacheEvent::Invalidated(completed.clone()));
        completed
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: CacheEvent) -> usize {
        let topic = event.name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(topic, "Cache event dropped: no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Subscription handle. Dropping it (or calling [`Subscription::unsubscribe`])
/// detaches from the bus.
pub struct Subscription {
    receiver: broadcast::Receiver<CacheEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CacheEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cache event subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<CacheEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cache event subscriber lagged behind");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
