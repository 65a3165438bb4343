//! Per-key scheduled task table.
//!
//! Scheduling a key that is already pending aborts the pending task and
//! replaces its metadata (last write wins); the delay restarts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::events::Metadata;
use super::lock::mutex_lock;
use super::registry::Priority;

const SOURCE: &str = "cache::debounce";

/// One debounce slot per trigger and priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub trigger: String,
    pub priority: Priority,
}

impl DebounceKey {
    pub fn new(trigger: impl Into<String>, priority: Priority) -> Self {
        Self {
            trigger: trigger.into(),
            priority,
        }
    }
}

struct PendingDebounce {
    ticket: u64,
    handle: JoinHandle<()>,
    metadata: Metadata,
}

#[derive(Default)]
pub struct DebounceTable {
    pending: Arc<Mutex<HashMap<DebounceKey, PendingDebounce>>>,
    next_ticket: AtomicU64,
}

impl DebounceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` with the latest metadata once `delay` passes without a newer
    /// schedule for `key`.
    pub fn schedule<F, Fut>(&self, key: DebounceKey, delay: Duration, metadata: Metadata, fire: F)
    where
        F: FnOnce(Metadata) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();

        let mut table = mutex_lock(&self.pending, SOURCE, "schedule");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let metadata = {
                let mut table = mutex_lock(&pending, SOURCE, "fire");
                match table.get(&task_key) {
                    Some(entry) if entry.ticket == ticket => {
                        table.remove(&task_key).map(|entry| entry.metadata)
                    }
                    _ => None,
                }
            };

            if let Some(metadata) = metadata {
                fire(metadata).await;
            }
        });

        if let Some(previous) = table.insert(
            key.clone(),
            PendingDebounce {
                ticket,
                handle,
                metadata,
            },
        ) {
            previous.handle.abort();
            debug!(
                trigger = %key.trigger,
                priority = %key.priority,
                "Debounced invalidation rescheduled"
            );
        }
    }

    /// Cancel every pending slot of `trigger`. Returns how many were cancelled.
    pub fn cancel_trigger(&self, trigger: &str) -> usize {
        let mut table = mutex_lock(&self.pending, SOURCE, "cancel_trigger");
        let keys: Vec<DebounceKey> = table
            .keys()
            .filter(|key| key.trigger == trigger)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = table.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    pub fn is_pending(&self, key: &DebounceKey) -> bool {
        mutex_lock(&self.pending, SOURCE, "is_pending").contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "pending_count").len()
    }
}

impl Drop for DebounceTable {
    fn drop(&mut self) {
        let mut table = mutex_lock(&self.pending, SOURCE, "drop");
        for (_, entry) in table.drain() {
            entry.handle.abort();
        }
    }
}
