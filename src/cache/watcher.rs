//! Connectivity and visibility signals.
//!
//! The platform reports both signals on `watch` channels; the watcher
//! forwards transitions to the invalidation manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::manager::InvalidationManager;

/// Shared online/visible flags. Only the manager's transition handlers
/// write them.
#[derive(Debug)]
pub struct ConnectivityState {
    online: AtomicBool,
    visible: AtomicBool,
}

impl ConnectivityState {
    pub fn new(online: bool, visible: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            visible: AtomicBool::new(visible),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// Store `online`, returning the previous value.
    pub(crate) fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// Store `visible`, returning the previous value.
    pub(crate) fn set_visible(&self, visible: bool) -> bool {
        self.visible.swap(visible, Ordering::SeqCst)
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::new(true, true)
    }
}

pub struct ConnectivityWatcher;

impl ConnectivityWatcher {
    /// Forward every change of `online` and `visible` to `manager` until
    /// both senders are gone or the handle is dropped.
    pub fn spawn(
        manager: Arc<InvalidationManager>,
        mut online: watch::Receiver<bool>,
        mut visible: watch::Receiver<bool>,
    ) -> WatcherHandle {
        let task = tokio::spawn(async move {
            // Values present before spawning count as the starting state.
            let initial_online = *online.borrow_and_update();
            let initial_visible = *visible.borrow_and_update();
            manager.on_connectivity_change(initial_online);
            manager.on_visibility_change(initial_visible);

            let mut online_open = true;
            let mut visible_open = true;

            while online_open || visible_open {
                tokio::select! {
                    changed = online.changed(), if online_open => {
                        if changed.is_err() {
                            debug!("Connectivity signal closed");
                            online_open = false;
                            continue;
                        }
                        let value = *online.borrow_and_update();
                        manager.on_connectivity_change(value);
                    }
                    changed = visible.changed(), if visible_open => {
                        if changed.is_err() {
                            debug!("Visibility signal closed");
                            visible_open = false;
                            continue;
                        }
                        let value = *visible.borrow_and_update();
                        manager.on_visibility_change(value);
                    }
                }
            }

            info!("Connectivity watcher stopped");
        });

        WatcherHandle { task: Some(task) }
    }
}

/// Owns the watcher task; dropping it stops the watcher.
pub struct WatcherHandle {
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the watcher and wait for the task to wind down.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
