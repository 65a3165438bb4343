//! Best-effort preloading ahead of navigation.
//!
//! Preloads never fail the caller: source errors and panics end as `None`
//! and a debug log line.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use super::keys::{Category, ParamValue, ResourceKey};
use super::source::ResourceSource;
use super::store::FetchCache;

const METRIC_PRELOAD: &str = "fotocache_preload_total";

const EVENTS_SEGMENT: &str = "eventos";

#[derive(Debug, Clone)]
struct MemoEntry {
    data: Arc<Value>,
    stored_at: Instant,
}

pub struct Preloader {
    source: Arc<dyn ResourceSource>,
    memo: DashMap<ResourceKey, MemoEntry>,
    ttl: Duration,
    cache: Option<FetchCache>,
}

impl Preloader {
    pub fn new(source: Arc<dyn ResourceSource>, ttl: Duration) -> Self {
        Self {
            source,
            memo: DashMap::new(),
            ttl,
            cache: None,
        }
    }

    /// Also store successful preloads in `cache`, so later reads hit.
    pub fn with_cache(mut self, cache: FetchCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn preload<I, P>(&self, category: Category, params: I) -> Option<Arc<Value>>
    where
        I: IntoIterator<Item = P>,
        P: Into<ParamValue>,
    {
        self.preload_key(ResourceKey::new(category, params)).await
    }

    /// Preload one key. Expired memo entries are purged first.
    pub async fn preload_key(&self, key: ResourceKey) -> Option<Arc<Value>> {
        self.purge_expired();
        if let Some(entry) = self.memo.get(&key)
            && Instant::now().saturating_duration_since(entry.stored_at) < self.ttl
        {
            counter!(METRIC_PRELOAD, "outcome" => "memo").increment(1);
            return Some(Arc::clone(&entry.data));
        }

        let outcome = AssertUnwindSafe(self.source.fetch(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                let data = Arc::new(value);
                self.memo.insert(
                    key.clone(),
                    MemoEntry {
                        data: Arc::clone(&data),
                        stored_at: Instant::now(),
                    },
                );
                if let Some(cache) = &self.cache
                    && let Err(error) = cache.prime(key.clone(), Value::clone(&data))
                {
                    debug!(key = %key, error = %error, "Preloaded value not cached");
                }
                counter!(METRIC_PRELOAD, "outcome" => "fetched").increment(1);
                debug!(key = %key, "Preloaded");
                Some(data)
            }
            Ok(Err(error)) => {
                counter!(METRIC_PRELOAD, "outcome" => "failed").increment(1);
                debug!(key = %key, error = %error, "Preload failed");
                None
            }
            Err(_) => {
                counter!(METRIC_PRELOAD, "outcome" => "failed").increment(1);
                debug!(key = %key, "Preload panicked");
                None
            }
        }
    }

    /// Start detached preloads for what `path` will probably need next and
    /// return the keys being preloaded. Never waits for the preloads.
    pub fn smart_preload(self: &Arc<Self>, path: &str) -> Vec<ResourceKey> {
        let PreloadTargets { keys, warm_event } = PreloadTargets::for_path(path);

        for key in &keys {
            let preloader = Arc::clone(self);
            let key = key.clone();
            tokio::spawn(async move {
                preloader.preload_key(key).await;
            });
        }

        if let Some(event) = warm_event {
            let source = Arc::clone(&self.source);
            tokio::spawn(async move {
                match AssertUnwindSafe(source.warm_event(&event)).catch_unwind().await {
                    Ok(Ok(())) => debug!(event = %event, "Backend cache warmed"),
                    Ok(Err(error)) => {
                        debug!(event = %event, error = %error, "Backend warm-up failed")
                    }
                    Err(_) => debug!(event = %event, "Backend warm-up panicked"),
                }
            });
        }

        self.purge_expired();
        keys
    }

    /// Drop memo entries older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.memo.len();
        self.memo
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < self.ttl);
        before.saturating_sub(self.memo.len())
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

/// What a navigation path will probably need next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadTargets {
    pub keys: Vec<ResourceKey>,
    /// Event whose backend cache should be warmed.
    pub warm_event: Option<String>,
}

impl PreloadTargets {
    pub fn for_path(path: &str) -> Self {
        let Some(segments) = path_segments(path) else {
            return Self::default();
        };
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match segments.as_slice() {
            [] | [EVENTS_SEGMENT] => Self {
                keys: vec![ResourceKey::events()],
                warm_event: None,
            },
            [EVENTS_SEGMENT, event] => Self {
                keys: vec![ResourceKey::choreographies(event)],
                warm_event: Some(event.to_string()),
            },
            [EVENTS_SEGMENT, event, choreography] => Self {
                keys: vec![
                    ResourceKey::choreographies(event),
                    ResourceKey::photos(event, choreography),
                    ResourceKey::thumbnails(event, choreography),
                ],
                warm_event: Some(event.to_string()),
            },
            _ => Self::default(),
        }
    }
}

/// Non-empty path segments, with query and fragment stripped and dot
/// segments resolved.
fn path_segments(path: &str) -> Option<Vec<String>> {
    let base = Url::parse("http://localhost/").ok()?;
    let url = base.join(path).ok()?;
    Some(
        url.path_segments()?
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
