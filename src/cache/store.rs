//! Fetch cache storage.
//!
//! Time-bounded key/value storage with stale-while-revalidate reads and
//! per-key request de-duplication.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::{ResourcePolicies, ResourcePolicy};
use super::error::{CacheError, FetchError};
use super::events::{CacheEvent, EventBus};
use super::keys::{Category, KeyPattern, ResourceKey};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::source::ResourceSource;

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "fotocache_hit_total";
const METRIC_STALE_HIT: &str = "fotocache_stale_hit_total";
const METRIC_MISS: &str = "fotocache_miss_total";
const METRIC_EVICT: &str = "fotocache_evict_total";
const METRIC_FETCH_FAILURE: &str = "fotocache_fetch_failure_total";

type FetchOutcome = Result<Arc<Value>, Arc<FetchError>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<Value>,
    fetched_at: Instant,
    stale_after: Duration,
    retain_until: Instant,
}

impl CacheEntry {
    fn new(value: Arc<Value>, policy: ResourcePolicy, now: Instant) -> Self {
        Self {
            value,
            fetched_at: now,
            stale_after: policy.stale_after,
            retain_until: now + policy.retention,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.fetched_at + self.stale_after
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.retain_until
    }
}

struct InFlight {
    ticket: u64,
    fetch: SharedFetch,
    /// Invalidated while running: the result is handed to its readers but
    /// not stored, and the next read chains a fresh fetch behind it.
    superseded: bool,
}

enum Lookup {
    Fresh(Arc<Value>),
    Stale(Arc<Value>),
    Missing,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

struct Inner {
    policies: ResourcePolicies,
    entries: RwLock<HashMap<ResourceKey, CacheEntry>>,
    in_flight: Mutex<HashMap<ResourceKey, InFlight>>,
    next_ticket: AtomicU64,
    events: Option<Arc<EventBus>>,
    stats: StatCounters,
}

/// Request-deduplicating, time-bounded resource cache.
///
/// Cloning yields another handle to the same storage.
#[derive(Clone)]
pub struct FetchCache {
    inner: Arc<Inner>,
}

impl FetchCache {
    pub fn new(policies: ResourcePolicies) -> Self {
        Self::build(policies, None)
    }

    /// Create a cache that reports background refresh failures on `events`.
    pub fn with_events(policies: ResourcePolicies, events: Arc<EventBus>) -> Self {
        Self::build(policies, Some(events))
    }

    fn build(policies: ResourcePolicies, events: Option<Arc<EventBus>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                policies,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                events,
                stats: StatCounters::default(),
            }),
        }
    }

    pub fn policies(&self) -> &ResourcePolicies {
        &self.inner.policies
    }

    /// Read `key`, fetching it with `fetcher` when needed.
    ///
    /// - fresh entry: returned, `fetcher` is not called
    /// - stale entry: returned immediately, one background refresh started
    /// - no entry: fetched (sharing any in-flight request), stored, returned
    pub async fn read<F, Fut>(&self, key: ResourceKey, fetcher: F) -> Result<Arc<Value>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let category = key.category();
        let policy = self.inner.policies.config_for(category)?;

        match self.lookup(&key, Instant::now()) {
            Lookup::Fresh(value) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_HIT, "category" => category.token()).increment(1);
                debug!(key = %key, "Cache hit");
                Ok(value)
            }
            Lookup::Stale(value) => {
                self.inner.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_STALE_HIT, "category" => category.token()).increment(1);
                debug!(key = %key, "Cache hit (stale), refreshing in background");
                self.refresh_in_background(key, policy, fetcher);
                Ok(value)
            }
            Lookup::Missing => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_MISS, "category" => category.token()).increment(1);
                debug!(key = %key, "Cache miss");
                let (fetch, _) = self.fetch_shared(key.clone(), policy, fetcher);
                fetch
                    .await
                    .map_err(|source| CacheError::Fetch { key, source })
            }
        }
    }

    /// Read `key` through a [`ResourceSource`].
    pub async fn read_from(
        &self,
        source: Arc<dyn ResourceSource>,
        key: ResourceKey,
    ) -> Result<Arc<Value>, CacheError> {
        let fetch_key = key.clone();
        self.read(key, move || async move { source.fetch(&fetch_key).await })
            .await
    }

    /// Read `key` and deserialize the payload.
    pub async fn read_as<T, F, Fut>(&self, key: ResourceKey, fetcher: F) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let value = self.read(key.clone(), fetcher).await?;
        T::deserialize(value.as_ref()).map_err(|err| CacheError::Fetch {
            key,
            source: Arc::new(FetchError::Decode(err.to_string())),
        })
    }

    /// Cached value of `key` if it is still retained, fresh or not.
    pub fn peek(&self, key: &ResourceKey) -> Option<Arc<Value>> {
        match self.lookup(key, Instant::now()) {
            Lookup::Fresh(value) | Lookup::Stale(value) => Some(value),
            Lookup::Missing => None,
        }
    }

    /// Store `value` as a freshly fetched entry of `key`.
    pub fn prime(&self, key: ResourceKey, value: Value) -> Result<(), CacheError> {
        let policy = self.inner.policies.config_for(key.category())?;
        let entry = CacheEntry::new(Arc::new(value), policy, Instant::now());
        rw_write(&self.inner.entries, SOURCE, "prime").insert(key, entry);
        Ok(())
    }

    /// Remove every entry matching `pattern`, and supersede in-flight
    /// fetches for them so their results are not stored.
    ///
    /// Returns the number of stored entries removed.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let removed = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate");
            let before = entries.len();
            entries.retain(|key, _| !pattern.matches(key));
            before - entries.len()
        };
        for (key, pending) in
            mutex_lock(&self.inner.in_flight, SOURCE, "invalidate.in_flight").iter_mut()
        {
            if pattern.matches(key) {
                pending.superseded = true;
            }
        }

        debug!(pattern = %pattern, removed, "Cache pattern invalidated");
        removed
    }

    /// Remove every entry past its retention window.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.inner.entries, SOURCE, "evict_expired");
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - entries.len();
        drop(entries);

        if evicted > 0 {
            self.record_evictions(evicted);
            debug!(evicted, "Expired cache entries evicted");
        }
        evicted
    }

    /// Remove every entry whose freshness window has elapsed, leaving fresh
    /// entries untouched. Returns the removed keys.
    pub fn invalidate_stale(&self) -> Vec<ResourceKey> {
        let now = Instant::now();
        let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate_stale");
        let stale: Vec<ResourceKey> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.remove(key);
        }
        stale
    }

    /// Keys whose freshness window has elapsed but which are still retained.
    pub fn stale_keys(&self) -> Vec<ResourceKey> {
        let now = Instant::now();
        rw_read(&self.inner.entries, SOURCE, "stale_keys")
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Categories holding at least one entry fetched more than `idle` ago.
    pub fn categories_idle_for(&self, idle: Duration) -> BTreeSet<Category> {
        let now = Instant::now();
        rw_read(&self.inner.entries, SOURCE, "categories_idle_for")
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.fetched_at) > idle)
            .map(|(key, _)| key.category())
            .collect()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        rw_read(&self.inner.entries, SOURCE, "contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and supersede every in-flight fetch.
    pub fn clear(&self) {
        rw_write(&self.inner.entries, SOURCE, "clear").clear();
        for pending in mutex_lock(&self.inner.in_flight, SOURCE, "clear.in_flight").values_mut() {
            pending.superseded = true;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let stats = &self.inner.stats;
        CacheStats {
            hits: stats.hits.load(Ordering::Relaxed),
            stale_hits: stats.stale_hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            fetches: stats.fetches.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &ResourceKey, now: Instant) -> Lookup {
        let entry = rw_read(&self.inner.entries, SOURCE, "lookup").get(key).cloned();

        match entry {
            Some(entry) if entry.is_expired(now) => {
                let mut entries = rw_write(&self.inner.entries, SOURCE, "lookup.evict");
                if entries.get(key).is_some_and(|current| current.is_expired(now)) {
                    entries.remove(key);
                    drop(entries);
                    self.record_evictions(1);
                }
                Lookup::Missing
            }
            Some(entry) if entry.is_fresh(now) => Lookup::Fresh(entry.value),
            Some(entry) => Lookup::Stale(entry.value),
            None => Lookup::Missing,
        }
    }

    fn record_evictions(&self, count: usize) {
        let count = count as u64;
        self.inner.stats.evictions.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_EVICT).increment(count);
    }

    /// Join the in-flight fetch of `key` or start one.
    ///
    /// A superseded fetch still running for `key` is awaited before the new
    /// one calls `fetcher`, so a key never has two fetches running at once.
    /// The fetch is driven by a detached task, so it completes even if
    /// every reader goes away. Returns whether this call started it.
    fn fetch_shared<F, Fut>(
        &self,
        key: ResourceKey,
        policy: ResourcePolicy,
        fetcher: F,
    ) -> (SharedFetch, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "fetch_shared");
        let previous = match in_flight.get(&key) {
            Some(existing) if !existing.superseded => {
                debug!(key = %key, "Joining in-flight fetch");
                return (existing.fetch.clone(), false);
            }
            Some(existing) => Some(existing.fetch.clone()),
            None => None,
        };

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let fetch = async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = match AssertUnwindSafe(async move { fetcher().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(key = %task_key, "Fetcher panicked");
                    Err(FetchError::unavailable("fetcher panicked"))
                }
            };
            inner.complete_fetch(task_key, ticket, policy, result)
        }
        .boxed()
        .shared();

        in_flight.insert(
            key,
            InFlight {
                ticket,
                fetch: fetch.clone(),
                superseded: false,
            },
        );
        drop(in_flight);

        tokio::spawn(fetch.clone());
        (fetch, true)
    }

    fn refresh_in_background<F, Fut>(&self, key: ResourceKey, policy: ResourcePolicy, fetcher: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let (fetch, started) = self.fetch_shared(key.clone(), policy, fetcher);
        if !started {
            return;
        }

        let events = self.inner.events.clone();
        tokio::spawn(async move {
            if let Err(error) = fetch.await {
                warn!(key = %key, error = %error, "Background refresh failed, serving stale value");
                if let Some(events) = events {
                    events.publish(CacheEvent::FetchFailed {
                        key,
                        error: error.to_string(),
                    });
                }
            }
        });
    }
}

impl Inner {
    fn complete_fetch(
        &self,
        key: ResourceKey,
        ticket: u64,
        policy: ResourcePolicy,
        result: Result<Value, FetchError>,
    ) -> FetchOutcome {
        // A superseded or replaced fetch still answers its readers but is
        // not stored.
        let current = {
            let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "complete_fetch");
            match in_flight.get(&key) {
                Some(pending) if pending.ticket == ticket => {
                    let superseded = pending.superseded;
                    in_flight.remove(&key);
                    !superseded
                }
                _ => false,
            }
        };

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                if current {
                    let entry = CacheEntry::new(Arc::clone(&value), policy, Instant::now());
                    rw_write(&self.entries, SOURCE, "complete_fetch.store").insert(key, entry);
                }
                Ok(value)
            }
            Err(error) => {
                counter!(METRIC_FETCH_FAILURE, "category" => key.category().token()).increment(1);
                Err(Arc::new(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn counting_fetcher(
        calls: &Arc<AtomicUsize>,
        value: Value,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        }
    }

    fn failing_fetcher(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::unavailable("backend down"))
            }
            .boxed()
        }
    }

    fn panicking_fetcher()
    -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static {
        || async { panic!("fetcher exploded") }.boxed()
    }

    /// Fetcher that tracks how many fetches of the key overlap.
    fn overlapping_fetcher(
        active: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
        value: Value,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static {
        let active = Arc::clone(active);
        let peak = Arc::clone(peak);
        move || {
            async move {
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_is_served_without_fetching() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::photos("EventoX", "CoreoY");

        let first = cache
            .read(key.clone(), counting_fetcher(&calls, json!(["a.jpg", "b.jpg"])))
            .await
            .expect("initial fetch");
        assert_eq!(*first, json!(["a.jpg", "b.jpg"]));

        tokio::time::advance(4 * MINUTE).await;
        let second = cache
            .read(key, counting_fetcher(&calls, json!(["other"])))
            .await
            .expect("fresh hit");

        assert_eq!(*second, json!(["a.jpg", "b.jpg"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_served_while_revalidating() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::photos("EventoX", "CoreoY");

        cache
            .read(key.clone(), counting_fetcher(&calls, json!(["a.jpg"])))
            .await
            .expect("initial fetch");

        tokio::time::advance(6 * MINUTE).await;
        let stale = cache
            .read(key.clone(), counting_fetcher(&calls, json!(["a.jpg", "c.jpg"])))
            .await
            .expect("stale hit");
        assert_eq!(*stale, json!(["a.jpg"]));

        // A second stale read joins the running refresh.
        cache
            .read(key.clone(), counting_fetcher(&calls, json!(["never"])))
            .await
            .expect("stale hit");

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.peek(&key).as_deref(), Some(&json!(["a.jpg", "c.jpg"])));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::choreographies("EventoX");

        let slow = |calls: Arc<AtomicUsize>| {
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!(["Coreo1", "Coreo2"]))
                }
                .boxed()
            }
        };

        let reads = (0..5).map(|_| cache.read(key.clone(), slow(Arc::clone(&calls))));
        let results = futures::future::join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(*result.expect("shared fetch"), json!(["Coreo1", "Coreo2"]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_failure() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::events();

        let (a, b) = tokio::join!(
            cache.read(key.clone(), failing_fetcher(&calls)),
            cache.read(key.clone(), failing_fetcher(&calls)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(a, Err(CacheError::Fetch { .. })));
        assert!(matches!(b, Err(CacheError::Fetch { .. })));
        assert!(!cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_serving_stale_value() {
        let bus = Arc::new(EventBus::default());
        let mut subscription = bus.subscribe();
        let cache = FetchCache::with_events(ResourcePolicies::default(), Arc::clone(&bus));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::metadata("EventoX");

        cache
            .read(key.clone(), counting_fetcher(&calls, json!({"photos": 10})))
            .await
            .expect("initial fetch");

        tokio::time::advance(11 * MINUTE).await;
        let stale = cache
            .read(key.clone(), failing_fetcher(&calls))
            .await
            .expect("stale value despite failing fetch");
        assert_eq!(*stale, json!({"photos": 10}));

        settle().await;
        assert!(matches!(
            subscription.try_recv(),
            Some(CacheEvent::FetchFailed { .. })
        ));
        assert_eq!(cache.peek(&key).as_deref(), Some(&json!({"photos": 10})));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_evicted_and_refetched() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::photos("EventoX", "CoreoY");

        cache
            .read(key.clone(), counting_fetcher(&calls, json!(1)))
            .await
            .expect("initial fetch");

        tokio::time::advance(30 * MINUTE).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(!cache.contains(&key));

        let value = cache
            .read(key, counting_fetcher(&calls, json!(2)))
            .await
            .expect("refetch");
        assert_eq!(*value, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_eviction_on_access() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let key = ResourceKey::photos("EventoX", "CoreoY");
        cache.prime(key.clone(), json!(1)).expect("photos policy");

        tokio::time::advance(31 * MINUTE).await;
        assert!(cache.peek(&key).is_none());
        assert!(!cache.contains(&key));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pattern_invalidation_removes_matches_only() {
        let cache = FetchCache::new(ResourcePolicies::default());
        cache.prime(ResourceKey::photos("EventoX", "CoreoY"), json!(1)).expect("photos");
        cache.prime(ResourceKey::photos_page("EventoX", "CoreoY", 1), json!(2)).expect("infinite");
        cache.prime(ResourceKey::thumbnails("EventoX", "CoreoY"), json!(3)).expect("thumbs");

        let removed = cache.invalidate(&KeyPattern::glob("fotos*").expect("glob"));

        assert_eq!(removed, 2);
        assert!(cache.contains(&ResourceKey::thumbnails("EventoX", "CoreoY")));
        assert_eq!(cache.invalidate(&KeyPattern::glob("nothing*").expect("glob")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_fetch_discards_result() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let key = ResourceKey::events();

        let reader = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .read(key, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!(["old"]))
                    })
                    .await
            })
        };

        settle().await;
        cache.invalidate(&KeyPattern::exact(key.clone()));

        let value = reader.await.expect("reader task").expect("fetch result");
        assert_eq!(*value, json!(["old"]));
        assert!(!cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn read_after_mid_fetch_invalidation_waits_for_running_fetch() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let key = ResourceKey::events();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let key = key.clone();
            let fetcher = overlapping_fetcher(&active, &peak, json!(["old"]));
            tokio::spawn(async move { cache.read(key, fetcher).await })
        };
        settle().await;
        cache.invalidate(&KeyPattern::exact(key.clone()));

        let second = {
            let cache = cache.clone();
            let key = key.clone();
            let fetcher = overlapping_fetcher(&active, &peak, json!(["new"]));
            tokio::spawn(async move { cache.read(key, fetcher).await })
        };

        let first = first.await.expect("first task").expect("first fetch");
        let second = second.await.expect("second task").expect("second fetch");

        assert_eq!(*first, json!(["old"]));
        assert_eq!(*second, json!(["new"]));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek(&key).as_deref(), Some(&json!(["new"])));
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn panicking_fetcher_fails_the_read_and_frees_the_key() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::photos("EventoX", "CoreoY");

        let failed = cache.read(key.clone(), panicking_fetcher()).await;
        assert!(matches!(failed, Err(CacheError::Fetch { .. })));
        assert!(!cache.contains(&key));

        let value = cache
            .read(key.clone(), counting_fetcher(&calls, json!("healthy")))
            .await
            .expect("later read fetches again");
        assert_eq!(*value, json!("healthy"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sweep_leaves_fresh_entries() {
        let cache = FetchCache::new(ResourcePolicies::default());
        cache.prime(ResourceKey::photos("EventoX", "CoreoY"), json!(1)).expect("photos");
        cache.prime(ResourceKey::events(), json!(2)).expect("events");

        tokio::time::advance(6 * MINUTE).await;
        assert_eq!(cache.stale_keys(), vec![ResourceKey::photos("EventoX", "CoreoY")]);
        let removed = cache.invalidate_stale();

        assert_eq!(removed, vec![ResourceKey::photos("EventoX", "CoreoY")]);
        assert!(cache.contains(&ResourceKey::events()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_categories_are_grouped() {
        let cache = FetchCache::new(ResourcePolicies::default());
        cache.prime(ResourceKey::photos("A", "1"), json!(1)).expect("photos");
        cache.prime(ResourceKey::photos("A", "2"), json!(1)).expect("photos");

        tokio::time::advance(6 * MINUTE).await;
        cache.prime(ResourceKey::events(), json!(1)).expect("events");

        let idle = cache.categories_idle_for(5 * MINUTE);
        assert_eq!(idle.into_iter().collect::<Vec<_>>(), vec![Category::Photos]);
    }

    #[tokio::test]
    async fn unknown_category_is_reported() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .read(
                ResourceKey::new(Category::Batch, ["EventoX"]),
                counting_fetcher(&calls, json!(null)),
            )
            .await;

        assert!(matches!(
            result,
            Err(CacheError::UnknownCategory(Category::Batch))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn read_as_deserializes_payload() {
        let cache = FetchCache::new(ResourcePolicies::default());
        let photos: Vec<String> = cache
            .read_as(ResourceKey::photos("EventoX", "CoreoY"), || async {
                Ok(json!(["a.jpg", "b.jpg"]))
            })
            .await
            .expect("typed read");

        assert_eq!(photos, vec!["a.jpg".to_string(), "b.jpg".to_string()]);
    }

    #[test]
    fn cache_recovers_from_poisoned_lock() {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let cache = FetchCache::new(ResourcePolicies::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache
                .inner
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        assert!(cache.is_empty());
    }
}
