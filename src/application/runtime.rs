//! Cache composition root.
//!
//! Builds every cache component once and hands out shared handles; nothing
//! in the cache layer reaches for global state.

use std::sync::Arc;

use metrics::gauge;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::{
    CacheConfig, CacheError, ConnectivityState, ConnectivityWatcher, EventBus, FetchCache,
    InvalidationManager, Preloader, ResourceKey, ResourceSource, RuleRegistry, Subscription,
    WatcherHandle,
};

const METRIC_ENTRIES: &str = "fotocache_entries";

pub struct CacheRuntime {
    config: CacheConfig,
    source: Arc<dyn ResourceSource>,
    events: Arc<EventBus>,
    cache: FetchCache,
    manager: Arc<InvalidationManager>,
    preloader: Arc<Preloader>,
}

impl CacheRuntime {
    pub fn new(config: CacheConfig, source: Arc<dyn ResourceSource>) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let cache = FetchCache::with_events(config.policies.clone(), Arc::clone(&events));
        let manager = Arc::new(InvalidationManager::new(
            cache.clone(),
            Arc::new(RuleRegistry::new()),
            Arc::clone(&events),
            Arc::new(ConnectivityState::default()),
            &config,
        ));
        let preloader = Arc::new(
            Preloader::new(Arc::clone(&source), config.preload_ttl).with_cache(cache.clone()),
        );

        info!(
            cascade_depth = config.cascade_depth,
            coalesce_window_ms = config.coalesce_window.as_millis() as u64,
            "Cache runtime initialised"
        );

        Self {
            config,
            source,
            events,
            cache,
            manager,
            preloader,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn manager(&self) -> &Arc<InvalidationManager> {
        &self.manager
    }

    pub fn preloader(&self) -> &Arc<Preloader> {
        &self.preloader
    }

    pub fn source(&self) -> &Arc<dyn ResourceSource> {
        &self.source
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Read `key` through the cache, fetching from the configured source.
    pub async fn read(&self, key: ResourceKey) -> Result<Arc<Value>, CacheError> {
        self.cache.read_from(Arc::clone(&self.source), key).await
    }

    /// Connect platform connectivity and visibility signals to the manager.
    pub fn attach_watcher(
        &self,
        online: watch::Receiver<bool>,
        visible: watch::Receiver<bool>,
    ) -> WatcherHandle {
        ConnectivityWatcher::spawn(Arc::clone(&self.manager), online, visible)
    }

    /// Periodically evict entries past their retention window.
    pub fn spawn_eviction_sweep(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let evicted = cache.evict_expired();
                let retained = cache.len();
                gauge!(METRIC_ENTRIES).set(retained as f64);
                debug!(evicted, retained, "Eviction sweep complete");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::FetchError;

    struct StaticSource;

    #[async_trait]
    impl ResourceSource for StaticSource {
        async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
            Ok(json!({ "key": key.to_string() }))
        }
    }

    fn runtime() -> CacheRuntime {
        CacheRuntime::new(CacheConfig::default(), Arc::new(StaticSource))
    }

    #[tokio::test]
    async fn reads_go_through_shared_cache() {
        let runtime = runtime();
        let value = runtime.read(ResourceKey::events()).await.expect("fetched");

        assert_eq!(*value, json!({"key": "eventos"}));
        assert!(runtime.manager().cache().contains(&ResourceKey::events()));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_sweep_runs_on_interval() {
        let runtime = runtime();
        runtime
            .cache()
            .prime(ResourceKey::photos("EventoX", "CoreoY"), json!(1))
            .expect("photos policy");

        let sweep = runtime.spawn_eviction_sweep();
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;

        assert!(runtime.cache().is_empty());
        assert_eq!(runtime.cache().stats().evictions, 1);
        sweep.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn preloads_prime_the_runtime_cache() {
        let runtime = runtime();
        runtime
            .preloader()
            .preload_key(ResourceKey::choreographies("EventoX"))
            .await
            .expect("preloaded");

        assert!(runtime.cache().contains(&ResourceKey::choreographies("EventoX")));
    }
}
