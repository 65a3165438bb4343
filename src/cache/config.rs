//! Cache configuration.
//!
//! Freshness and retention windows per resource category, plus the timing
//! knobs of the invalidation engine and preloader.

use std::collections::HashMap;
use std::time::Duration;

use super::error::CacheError;
use super::keys::Category;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(1000);
const DEFAULT_CASCADE_DEPTH: usize = 2;
const DEFAULT_VISIBILITY_STALENESS: Duration = Duration::from_secs(5 * 60);
const DEFAULT_PRELOAD_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Freshness and retention of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePolicy {
    /// Entries younger than this are served without fetching.
    pub stale_after: Duration,
    /// Entries older than this are evicted.
    pub retention: Duration,
}

impl ResourcePolicy {
    pub const fn new(stale_after: Duration, retention: Duration) -> Self {
        Self {
            stale_after,
            retention,
        }
    }
}

/// Category -> policy lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePolicies {
    table: HashMap<Category, ResourcePolicy>,
}

impl ResourcePolicies {
    /// An empty table; every lookup fails.
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Returns the policy of `category`.
    ///
    /// A missing category is a programming error and is reported as
    /// [`CacheError::UnknownCategory`].
    pub fn config_for(&self, category: Category) -> Result<ResourcePolicy, CacheError> {
        self.table
            .get(&category)
            .copied()
            .ok_or(CacheError::UnknownCategory(category))
    }

    pub fn set(&mut self, category: Category, policy: ResourcePolicy) {
        self.table.insert(category, policy);
    }

    pub fn with(mut self, category: Category, policy: ResourcePolicy) -> Self {
        self.set(category, policy);
        self
    }

    pub fn remove(&mut self, category: Category) -> Option<ResourcePolicy> {
        self.table.remove(&category)
    }
}

impl Default for ResourcePolicies {
    fn default() -> Self {
        let photos = ResourcePolicy::new(5 * MINUTE, 30 * MINUTE);
        Self::empty()
            .with(Category::Events, ResourcePolicy::new(30 * MINUTE, 2 * HOUR))
            .with(
                Category::Choreographies,
                ResourcePolicy::new(15 * MINUTE, HOUR),
            )
            .with(Category::Photos, photos)
            .with(Category::PhotosInfinite, photos)
            .with(Category::Thumbnails, ResourcePolicy::new(HOUR, 4 * HOUR))
            .with(Category::Metadata, ResourcePolicy::new(10 * MINUTE, HOUR))
    }
}

/// Runtime configuration of the cache layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub policies: ResourcePolicies,
    /// Targets invalidated within this window are skipped unless the rule is
    /// high priority.
    pub coalesce_window: Duration,
    /// Maximum dependency hops followed by cascading rules.
    pub cascade_depth: usize,
    /// Idle age after which the visibility check invalidates a category.
    pub visibility_staleness: Duration,
    /// Lifetime of preloader memo entries.
    pub preload_ttl: Duration,
    /// Interval of the background eviction sweep.
    pub sweep_interval: Duration,
    /// Buffered events per event-bus subscriber.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policies: ResourcePolicies::default(),
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            cascade_depth: DEFAULT_CASCADE_DEPTH,
            visibility_staleness: DEFAULT_VISIBILITY_STALENESS,
            preload_ttl: DEFAULT_PRELOAD_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        let mut policies = ResourcePolicies::default();
        for (category, policy) in &settings.policies {
            policies.set(*category, *policy);
        }

        Self {
            policies,
            coalesce_window: settings.coalesce_window,
            cascade_depth: settings.cascade_depth,
            visibility_staleness: settings.visibility_staleness,
            preload_ttl: settings.preload_ttl,
            sweep_interval: settings.sweep_interval,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_table() {
        let policies = ResourcePolicies::default();

        let events = policies.config_for(Category::Events).expect("events policy");
        assert_eq!(events.stale_after, 30 * MINUTE);
        assert_eq!(events.retention, 2 * HOUR);

        let choreographies = policies
            .config_for(Category::Choreographies)
            .expect("choreographies policy");
        assert_eq!(choreographies.stale_after, 15 * MINUTE);
        assert_eq!(choreographies.retention, HOUR);

        let photos = policies.config_for(Category::Photos).expect("photos policy");
        assert_eq!(photos.stale_after, 5 * MINUTE);
        assert_eq!(photos.retention, 30 * MINUTE);

        let thumbnails = policies
            .config_for(Category::Thumbnails)
            .expect("thumbnails policy");
        assert_eq!(thumbnails.stale_after, HOUR);
        assert_eq!(thumbnails.retention, 4 * HOUR);

        let metadata = policies
            .config_for(Category::Metadata)
            .expect("metadata policy");
        assert_eq!(metadata.stale_after, 10 * MINUTE);
        assert_eq!(metadata.retention, HOUR);
    }

    #[test]
    fn infinite_photos_share_photo_policy() {
        let policies = ResourcePolicies::default();
        assert_eq!(
            policies.config_for(Category::PhotosInfinite).ok(),
            policies.config_for(Category::Photos).ok()
        );
    }

    #[test]
    fn batch_has_no_policy() {
        let policies = ResourcePolicies::default();
        assert!(matches!(
            policies.config_for(Category::Batch),
            Err(CacheError::UnknownCategory(Category::Batch))
        ));
    }

    #[test]
    fn default_engine_knobs() {
        let config = CacheConfig::default();
        assert_eq!(config.coalesce_window, Duration::from_millis(1000));
        assert_eq!(config.cascade_depth, 2);
        assert_eq!(config.visibility_staleness, 5 * MINUTE);
        assert_eq!(config.preload_ttl, 5 * MINUTE);
    }

    #[test]
    fn override_replaces_single_category() {
        let policies = ResourcePolicies::default().with(
            Category::Photos,
            ResourcePolicy::new(MINUTE, 10 * MINUTE),
        );

        assert_eq!(
            policies
                .config_for(Category::Photos)
                .expect("photos policy")
                .stale_after,
            MINUTE
        );
        assert_eq!(
            policies
                .config_for(Category::PhotosInfinite)
                .expect("infinite policy")
                .stale_after,
            5 * MINUTE
        );
    }
}
