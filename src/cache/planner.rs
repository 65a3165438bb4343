//! Invalidation planning.
//!
//! Orders a rule's targets, applies the coalescing guard and expands
//! cascades through the dependency graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::keys::KeyPattern;
use super::registry::{InvalidationRule, Priority, RuleRegistry};

/// Exact targets first, then wildcard patterns; declaration order otherwise.
pub fn order_targets(targets: &[KeyPattern]) -> Vec<KeyPattern> {
    let (exact, wildcard): (Vec<_>, Vec<_>) = targets
        .iter()
        .cloned()
        .partition(|target| !target.is_wildcard());
    exact.into_iter().chain(wildcard).collect()
}

/// Remembers when each target was last invalidated.
#[derive(Debug)]
pub struct CoalesceGuard {
    window: Duration,
    seen: HashMap<KeyPattern, Instant>,
}

impl CoalesceGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether `target` was invalidated less than one window ago.
    pub fn is_recent(&self, target: &KeyPattern, now: Instant) -> bool {
        self.seen
            .get(target)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.window)
    }

    pub fn mark(&mut self, target: &KeyPattern, now: Instant) {
        self.seen.insert(target.clone(), now);
    }

    /// Forget entries older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Targets to invalidate for one rule execution, in execution order.
#[derive(Debug, Default)]
pub struct InvalidationPlan {
    /// Rule targets that passed the coalescing guard.
    pub direct: Vec<KeyPattern>,
    /// Targets reached through the dependency graph.
    pub cascaded: Vec<KeyPattern>,
    /// Rule targets skipped by the coalescing guard.
    pub coalesced: Vec<KeyPattern>,
}

impl InvalidationPlan {
    /// Plan the execution of `rule` at `now`.
    ///
    /// Every target appears at most once across `direct` and `cascaded`,
    /// whatever the shape of the dependency graph.
    pub fn build(
        rule: &InvalidationRule,
        registry: &RuleRegistry,
        guard: &CoalesceGuard,
        cascade_depth: usize,
        now: Instant,
    ) -> Self {
        let mut plan = Self::default();
        let mut visited: HashSet<KeyPattern> = HashSet::new();
        let bypass_guard = rule.options.priority == Priority::High;

        for target in order_targets(&rule.targets) {
            if !visited.insert(target.clone()) {
                continue;
            }
            if !bypass_guard && guard.is_recent(&target, now) {
                plan.coalesced.push(target);
                continue;
            }
            plan.direct.push(target);
        }

        if rule.options.cascade {
            plan.cascaded = expand_cascade(&plan.direct, registry, cascade_depth, &mut visited);
        }

        plan
    }

    /// Every target to invalidate, direct ones first.
    pub fn targets(&self) -> impl Iterator<Item = &KeyPattern> {
        self.direct.iter().chain(&self.cascaded)
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.cascaded.is_empty()
    }
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ direct: {}, cascaded: {}, coalesced: {} }}",
            self.direct.len(),
            self.cascaded.len(),
            self.coalesced.len(),
        )
    }
}

/// Breadth-first expansion: each hop maps a target to the triggers that
/// invalidate it, then to those triggers' targets.
fn expand_cascade(
    roots: &[KeyPattern],
    registry: &RuleRegistry,
    max_depth: usize,
    visited: &mut HashSet<KeyPattern>,
) -> Vec<KeyPattern> {
    let mut expanded = Vec::new();
    let mut frontier: Vec<KeyPattern> = roots.to_vec();

    for _ in 0..max_depth {
        let mut next = Vec::new();
        for target in &frontier {
            for trigger in registry.triggers_for(target) {
                for dependent in order_targets(&registry.cascade_targets(&trigger)) {
                    if visited.insert(dependent.clone()) {
                        next.push(dependent);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        expanded.extend(next.iter().cloned());
        frontier = next;
    }

    expanded
}
