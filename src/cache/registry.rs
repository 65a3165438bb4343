//! Invalidation rule registry.
//!
//! Stores rules by trigger and maintains the reverse dependency graph used
//! for cascading invalidation.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use super::events::Metadata;
use super::keys::KeyPattern;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        })
    }
}

/// Predicate over event metadata deciding whether a rule fires.
pub type Condition = Arc<dyn Fn(&Metadata) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RuleOptions {
    pub debounce: Duration,
    pub priority: Priority,
    pub condition: Option<Condition>,
    /// Follow the dependency graph from every invalidated target.
    pub cascade: bool,
}

impl RuleOptions {
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn debounce_ms(self, millis: u64) -> Self {
        self.debounce(Duration::from_millis(millis))
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Metadata) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            priority: Priority::Normal,
            condition: None,
            cascade: true,
        }
    }
}

impl fmt::Debug for RuleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleOptions")
            .field("debounce", &self.debounce)
            .field("priority", &self.priority)
            .field("conditional", &self.condition.is_some())
            .field("cascade", &self.cascade)
            .finish()
    }
}

/// Maps a trigger to the cache patterns it invalidates.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub trigger: String,
    /// Declaration order is preserved.
    pub targets: Vec<KeyPattern>,
    pub options: RuleOptions,
}

impl InvalidationRule {
    /// Whether the rule fires for `metadata`.
    pub fn applies(&self, metadata: &Metadata) -> bool {
        self.options
            .condition
            .as_ref()
            .is_none_or(|condition| condition(metadata))
    }
}

/// Bidirectional trigger <-> target index of cascading rules.
#[derive(Debug, Default)]
struct DependencyGraph {
    /// Target pattern -> triggers that invalidate it.
    target_to_triggers: HashMap<KeyPattern, BTreeSet<String>>,
    /// Trigger -> its indexed targets.
    trigger_to_targets: HashMap<String, Vec<KeyPattern>>,
}

impl DependencyGraph {
    fn link(&mut self, trigger: &str, targets: &[KeyPattern]) {
        for target in targets {
            self.target_to_triggers
                .entry(target.clone())
                .or_default()
                .insert(trigger.to_string());
        }
        self.trigger_to_targets
            .insert(trigger.to_string(), targets.to_vec());
    }

    fn unlink(&mut self, trigger: &str) {
        let Some(targets) = self.trigger_to_targets.remove(trigger) else {
            return;
        };
        for target in targets {
            if let Some(triggers) = self.target_to_triggers.get_mut(&target) {
                triggers.remove(trigger);
                if triggers.is_empty() {
                    self.target_to_triggers.remove(&target);
                }
            }
        }
    }
}

/// Rule storage plus reverse dependency index.
///
/// Registration is idempotent: re-registering a trigger replaces the rule
/// and its graph edges.
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<InvalidationRule>>>,
    graph: RwLock<DependencyGraph>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            graph: RwLock::new(DependencyGraph::default()),
        }
    }

    pub fn register(&self, rule: InvalidationRule) {
        let mut rules = rw_write(&self.rules, SOURCE, "register.rules");
        let mut graph = rw_write(&self.graph, SOURCE, "register.graph");

        graph.unlink(&rule.trigger);
        if rule.options.cascade {
            graph.link(&rule.trigger, &rule.targets);
        }
        rules.insert(rule.trigger.clone(), Arc::new(rule));
    }

    /// Remove a rule and only its own graph edges.
    pub fn unregister(&self, trigger: &str) -> Option<Arc<InvalidationRule>> {
        let mut rules = rw_write(&self.rules, SOURCE, "unregister.rules");
        let mut graph = rw_write(&self.graph, SOURCE, "unregister.graph");

        graph.unlink(trigger);
        rules.remove(trigger)
    }

    pub fn get(&self, trigger: &str) -> Option<Arc<InvalidationRule>> {
        rw_read(&self.rules, SOURCE, "get").get(trigger).cloned()
    }

    /// Triggers of cascading rules that list `target`, in name order.
    pub fn triggers_for(&self, target: &KeyPattern) -> Vec<String> {
        rw_read(&self.graph, SOURCE, "triggers_for")
            .target_to_triggers
            .get(target)
            .map(|triggers| triggers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Targets of the cascading rule registered under `trigger`.
    pub fn cascade_targets(&self, trigger: &str) -> Vec<KeyPattern> {
        rw_read(&self.graph, SOURCE, "cascade_targets")
            .trigger_to_targets
            .get(trigger)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_count(&self) -> usize {
        rw_read(&self.rules, SOURCE, "rule_count").len()
    }

    /// Number of distinct targets indexed in the dependency graph.
    pub fn indexed_target_count(&self) -> usize {
        rw_read(&self.graph, SOURCE, "indexed_target_count")
            .target_to_triggers
            .len()
    }

    pub fn clear(&self) {
        rw_write(&self.rules, SOURCE, "clear.rules").clear();
        let mut graph = rw_write(&self.graph, SOURCE, "clear.graph");
        graph.target_to_triggers.clear();
        graph.trigger_to_targets.clear();
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn glob(source: &str) -> KeyPattern {
        KeyPattern::glob(source).expect("valid glob")
    }

    fn rule(trigger: &str, targets: &[&str], options: RuleOptions) -> InvalidationRule {
        InvalidationRule {
            trigger: trigger.to_string(),
            targets: targets.iter().map(|t| glob(t)).collect(),
            options,
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = RuleRegistry::new();
        registry.register(rule("fotos_modified", &["fotos*", "thumbnails*"], RuleOptions::default()));

        let stored = registry.get("fotos_modified").expect("registered rule");
        assert_eq!(stored.targets.len(), 2);
        assert_eq!(registry.triggers_for(&glob("fotos*")), vec!["fotos_modified"]);
        assert_eq!(registry.indexed_target_count(), 2);
    }

    #[test]
    fn non_cascading_rules_are_not_indexed() {
        let registry = RuleRegistry::new();
        registry.register(rule(
            "metadata_modified",
            &["metadata*"],
            RuleOptions::default().cascade(false),
        ));

        assert!(registry.get("metadata_modified").is_some());
        assert!(registry.triggers_for(&glob("metadata*")).is_empty());
    }

    #[test]
    fn reregistering_replaces_edges() {
        let registry = RuleRegistry::new();
        registry.register(rule("fotos_modified", &["fotos*", "thumbnails*"], RuleOptions::default()));
        registry.register(rule("fotos_modified", &["fotos*"], RuleOptions::default()));

        assert_eq!(registry.rule_count(), 1);
        assert!(registry.triggers_for(&glob("thumbnails*")).is_empty());
        assert_eq!(registry.indexed_target_count(), 1);
    }

    #[test]
    fn unregister_keeps_shared_targets_of_other_rules() {
        let registry = RuleRegistry::new();
        registry.register(rule("fotos_modified", &["fotos*", "thumbnails*"], RuleOptions::default()));
        registry.register(rule("fotos_uploaded", &["fotos*"], RuleOptions::default()));

        registry.unregister("fotos_modified");

        assert!(registry.get("fotos_modified").is_none());
        assert_eq!(registry.triggers_for(&glob("fotos*")), vec!["fotos_uploaded"]);
        assert!(registry.triggers_for(&glob("thumbnails*")).is_empty());
    }

    #[test]
    fn unregister_unknown_trigger_is_no_op() {
        let registry = RuleRegistry::new();
        assert!(registry.unregister("missing").is_none());
        assert_eq!(registry.rule_count(), 0);
    }

    #[test]
    fn condition_gates_rule() {
        let rule = rule(
            "fotos_uploaded",
            &["fotos*"],
            RuleOptions::default().when(|metadata| metadata["count"].as_u64().unwrap_or(0) > 0),
        );

        assert!(rule.applies(&json!({"count": 3})));
        assert!(!rule.applies(&json!({"count": 0})));
        assert!(!rule.applies(&json!({})));
    }

    #[test]
    fn rules_without_condition_always_apply() {
        let rule = rule("eventos_modified", &["eventos*"], RuleOptions::default());
        assert!(rule.applies(&json!(null)));
    }

    #[test]
    fn clear_removes_all_rules_and_edges() {
        let registry = RuleRegistry::new();
        registry.register(rule("a", &["eventos*"], RuleOptions::default()));
        registry.register(rule("b", &["fotos*"], RuleOptions::default()));

        registry.clear();
        assert_eq!(registry.rule_count(), 0);
        assert_eq!(registry.indexed_target_count(), 0);
    }
}
