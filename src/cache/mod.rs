//! Fotocache cache system
//!
//! Client-side data cache for the event photo storefront:
//!
//! - **FetchCache**: time-bounded resource cache with stale-while-revalidate
//!   reads and per-key request de-duplication
//! - **InvalidationManager**: named triggers resolved to key patterns, with
//!   debouncing, dependency cascades and online/offline gating
//! - **ConnectivityWatcher**: forwards connectivity and visibility changes
//! - **Preloader**: best-effort warm-up ahead of navigation
//!
//! ## Configuration
//!
//! Per-category freshness is controlled via `fotocache.toml`:
//!
//! ```toml
//! [cache.policies.fotos]
//! stale_after_minutes = 5
//! retention_minutes = 30
//! ```

mod config;
mod debounce;
mod error;
mod events;
mod keys;
mod lock;
mod manager;
mod planner;
mod preload;
mod registry;
mod source;
mod store;
mod watcher;

pub use config::{CacheConfig, ResourcePolicies, ResourcePolicy};
pub use debounce::{DebounceKey, DebounceTable};
pub use error::{CacheError, FetchError};
pub use events::{CacheEvent, Epoch, EventBus, InvalidationCompleted, Metadata, Subscription};
pub use keys::{Category, Glob, KeyPattern, ParamMatcher, ParamValue, ResourceKey};
pub use manager::{InvalidationManager, RECONNECT_TRIGGER, VISIBILITY_TRIGGER};
pub use planner::{CoalesceGuard, InvalidationPlan, order_targets};
pub use preload::{PreloadTargets, Preloader};
pub use registry::{Condition, InvalidationRule, Priority, RuleOptions, RuleRegistry};
pub use source::ResourceSource;
pub use store::{CacheStats, FetchCache};
pub use watcher::{ConnectivityState, ConnectivityWatcher, WatcherHandle};
