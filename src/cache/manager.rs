//! Invalidation manager.
//!
//! Turns named triggers into cache invalidations: rule lookup, condition
//! check, debouncing, connectivity gating, planning and execution.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::config::CacheConfig;
use super::debounce::{DebounceKey, DebounceTable};
use super::error::CacheError;
use super::events::{EventBus, InvalidationCompleted, Metadata, Subscription};
use super::keys::{Category, KeyPattern};
use super::lock::mutex_lock;
use super::planner::{CoalesceGuard, InvalidationPlan};
use super::registry::{InvalidationRule, Priority, RuleOptions, RuleRegistry};
use super::store::FetchCache;
use super::watcher::ConnectivityState;

const SOURCE: &str = "cache::manager";

const METRIC_INVALIDATION: &str = "fotocache_invalidation_total";
const METRIC_INVALIDATE_MS: &str = "fotocache_invalidate_ms";

/// Trigger name of the sweep run after reconnecting.
pub const RECONNECT_TRIGGER: &str = "connectivity:reconnected";
/// Trigger name of the staleness check run when the app becomes visible.
pub const VISIBILITY_TRIGGER: &str = "visibility:visible";

pub struct InvalidationManager {
    cache: FetchCache,
    registry: Arc<RuleRegistry>,
    debounce: DebounceTable,
    guard: Mutex<CoalesceGuard>,
    connectivity: Arc<ConnectivityState>,
    events: Arc<EventBus>,
    /// Executions parked while offline, in arrival order; one per key.
    deferred: Mutex<Vec<(DebounceKey, Metadata)>>,
    cascade_depth: usize,
    visibility_staleness: Duration,
}

impl InvalidationManager {
    pub fn new(
        cache: FetchCache,
        registry: Arc<RuleRegistry>,
        events: Arc<EventBus>,
        connectivity: Arc<ConnectivityState>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            cache,
            registry,
            debounce: DebounceTable::new(),
            guard: Mutex::new(CoalesceGuard::new(config.coalesce_window)),
            connectivity,
            events,
            deferred: Mutex::new(Vec::new()),
            cascade_depth: config.cascade_depth,
            visibility_staleness: config.visibility_staleness,
        }
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityState> {
        &self.connectivity
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Register (or replace) the rule fired by `trigger`.
    pub fn register_rule<I>(&self, trigger: impl Into<String>, targets: I, options: RuleOptions)
    where
        I: IntoIterator<Item = KeyPattern>,
    {
        let rule = InvalidationRule {
            trigger: trigger.into(),
            targets: targets.into_iter().collect(),
            options,
        };
        debug!(
            trigger = %rule.trigger,
            targets = rule.targets.len(),
            options = ?rule.options,
            "Invalidation rule registered"
        );
        self.registry.register(rule);
    }

    /// Remove the rule of `trigger` together with its pending and deferred
    /// executions. Returns whether a rule existed.
    pub fn unregister_rule(&self, trigger: &str) -> bool {
        let removed = self.registry.unregister(trigger).is_some();
        let cancelled = self.debounce.cancel_trigger(trigger);
        mutex_lock(&self.deferred, SOURCE, "unregister_rule")
            .retain(|(key, _)| key.trigger != trigger);

        if removed {
            debug!(trigger, cancelled, "Invalidation rule unregistered");
        }
        removed
    }

    /// Fire `trigger`.
    ///
    /// A trigger without a rule is read as a literal key pattern and
    /// invalidated immediately. Otherwise the rule's condition decides,
    /// and execution is debounced per trigger and priority.
    pub fn invalidate(self: &Arc<Self>, trigger: &str, metadata: Metadata) -> Result<(), CacheError> {
        let Some(rule) = self.registry.get(trigger) else {
            let pattern = KeyPattern::from_str(trigger)?;
            let removed = self.cache.invalidate(&pattern);
            debug!(trigger, removed, "Ad-hoc pattern invalidated");
            self.events
                .invalidated(trigger, vec![pattern.to_string()], metadata);
            return Ok(());
        };

        if !rule.applies(&metadata) {
            debug!(trigger, "Invalidation skipped: condition not met");
            return Ok(());
        }

        if rule.options.debounce.is_zero() {
            self.execute_invalidation(trigger, metadata);
            return Ok(());
        }

        let key = DebounceKey::new(trigger, rule.options.priority);
        let manager = Arc::downgrade(self);
        let owned_trigger = trigger.to_string();
        self.debounce
            .schedule(key, rule.options.debounce, metadata, move |metadata| async move {
                if let Some(manager) = manager.upgrade() {
                    manager.execute_invalidation(&owned_trigger, metadata);
                }
            });
        Ok(())
    }

    /// Run the rule of `trigger` now.
    ///
    /// While offline, anything below high priority is parked until the
    /// connection returns. Returns the published completion, or `None` when
    /// nothing ran.
    #[instrument(skip(self, metadata))]
    pub fn execute_invalidation(
        &self,
        trigger: &str,
        metadata: Metadata,
    ) -> Option<InvalidationCompleted> {
        let rule = self.registry.get(trigger)?;
        let priority = rule.options.priority;

        if !self.connectivity.is_online() && priority != Priority::High {
            self.defer(DebounceKey::new(trigger, priority), metadata);
            debug!(trigger, %priority, "Offline: invalidation deferred");
            return None;
        }

        let started_at = Instant::now();
        let plan = {
            let mut guard = mutex_lock(&self.guard, SOURCE, "execute.plan");
            guard.prune(started_at);
            let plan = InvalidationPlan::build(
                &rule,
                &self.registry,
                &guard,
                self.cascade_depth,
                started_at,
            );
            for target in plan.targets() {
                guard.mark(target, started_at);
            }
            plan
        };

        if plan.is_empty() {
            debug!(trigger, plan = %plan, "Invalidation coalesced");
            return None;
        }

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut removed = 0;
        for target in plan.targets() {
            removed += self.cache.invalidate(target);
            let key = target.to_string();
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        counter!(METRIC_INVALIDATION, "priority" => priority.to_string()).increment(1);
        histogram!(METRIC_INVALIDATE_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        info!(trigger, plan = %plan, removed, "Invalidation executed");
        Some(self.events.invalidated(trigger, keys, metadata))
    }

    /// Handle a connectivity signal. Going back online sweeps stale entries
    /// once, then replays deferred executions.
    pub fn on_connectivity_change(&self, online: bool) {
        let was_online = self.connectivity.set_online(online);
        if was_online == online {
            return;
        }

        if !online {
            info!("Connection lost: deferring non-critical invalidations");
            return;
        }

        let swept = self.cache.invalidate_stale();
        info!(swept = swept.len(), "Connection restored: stale entries swept");
        self.events.invalidated(
            RECONNECT_TRIGGER,
            swept.iter().map(ToString::to_string).collect(),
            Metadata::Null,
        );

        let deferred = std::mem::take(&mut *mutex_lock(&self.deferred, SOURCE, "replay"));
        for (key, metadata) in deferred {
            self.execute_invalidation(&key.trigger, metadata);
        }
    }

    /// Handle a visibility signal. Becoming visible while online
    /// invalidates every category idle for longer than the staleness
    /// threshold, one pattern per category.
    pub fn on_visibility_change(&self, visible: bool) -> Vec<Category> {
        let was_visible = self.connectivity.set_visible(visible);
        if was_visible == visible || !visible || !self.connectivity.is_online() {
            return Vec::new();
        }

        let idle: Vec<Category> = self
            .cache
            .categories_idle_for(self.visibility_staleness)
            .into_iter()
            .collect();
        if idle.is_empty() {
            return idle;
        }

        let keys = idle
            .iter()
            .map(|category| {
                let pattern = KeyPattern::category(*category);
                self.cache.invalidate(&pattern);
                pattern.to_string()
            })
            .collect();
        info!(categories = ?idle, "Visible again: idle categories invalidated");
        self.events.invalidated(VISIBILITY_TRIGGER, keys, Metadata::Null);
        idle
    }

    pub fn pending_count(&self) -> usize {
        self.debounce.pending_count()
    }

    pub fn deferred_count(&self) -> usize {
        mutex_lock(&self.deferred, SOURCE, "deferred_count").len()
    }

    fn defer(&self, key: DebounceKey, metadata: Metadata) {
        let mut deferred = mutex_lock(&self.deferred, SOURCE, "defer");
        match deferred.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = metadata,
            None => deferred.push((key, metadata)),
        }
    }
}
