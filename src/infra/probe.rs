//! Connectivity probe.
//!
//! Polls the API health endpoint and publishes reachability on a `watch`
//! channel, the same signal the connectivity watcher consumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::http::HttpSource;

/// Something that can tell whether the backend is reachable.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

#[async_trait]
impl HealthCheck for HttpSource {
    async fn is_healthy(&self) -> bool {
        self.check_health().await
    }
}

pub struct ConnectivityProbe {
    check: Arc<dyn HealthCheck>,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(check: Arc<dyn HealthCheck>, interval: Duration) -> Self {
        Self { check, interval }
    }

    /// Start polling. The receiver starts out online.
    pub fn spawn(self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (sender, receiver) = watch::channel(true);
        let task = tokio::spawn(self.run(sender));
        (receiver, task)
    }

    async fn run(self, sender: watch::Sender<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let online = self.check.is_healthy().await;
            let changed = sender.send_if_modified(|current| {
                if *current == online {
                    return false;
                }
                *current = online;
                true
            });

            if changed {
                if online {
                    info!("Storefront API reachable again");
                } else {
                    warn!("Storefront API unreachable, switching to offline mode");
                }
            }
            if sender.is_closed() {
                break;
            }
        }
    }
}
