//! Rule-driven cache invalidation
//!
//! Rules decide *what* to invalidate; the engine never touches the cache
//! directly. It resolves rules against a caller-provided key universe and
//! returns the matched keys, so the repository stays the single owner of
//! its map. TTL rules self-reschedule on a timer channel the repository
//! drains.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How a rule decides what to invalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationStrategy {
    /// Fires on a timer
    Ttl,
    /// Fires only when explicitly triggered
    Manual,
    /// Fires when a named event occurs
    Event,
    /// Matches keys by regular expression
    Pattern,
    /// Fires when a named dependency is invalidated
    Dependency,
    /// Delegates to the cache's LRU policy
    Lru,
}

/// What causes a rule to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationTrigger {
    /// A TTL timer elapsed
    Expiry,
    /// The transport lost its connection
    ConnectionLost,
    /// A component changed on the Core
    ComponentChanged,
    /// The memory checker demanded space
    MemoryPressure,
    /// A caller asked for it
    OnDemand,
}

/// One invalidation rule
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    /// Unique rule id
    pub id: String,
    /// How the rule selects keys
    pub strategy: InvalidationStrategy,
    /// What fires it
    pub trigger: InvalidationTrigger,
    /// Key-matching regex for Pattern rules
    pub pattern: Option<String>,
    /// Timer period for TTL rules
    pub ttl_ms: Option<u64>,
    /// Names whose invalidation cascades into this rule
    pub dependencies: Vec<String>,
    /// Disabled rules never fire
    pub enabled: bool,
    /// Higher priority rules run first in a cascade
    pub priority: i32,
}

/// Rule registry with a dependency graph and TTL timers
pub struct InvalidationEngine {
    rules: HashMap<String, InvalidationRule>,
    compiled: HashMap<String, Regex>,
    dependency_graph: HashMap<String, HashSet<String>>,
    fired_tx: mpsc::UnboundedSender<String>,
    fired_rx: Option<mpsc::UnboundedReceiver<String>>,
    ttl_tasks: HashMap<String, CancellationToken>,
}

impl InvalidationEngine {
    /// Empty engine
    pub fn new() -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            rules: HashMap::new(),
            compiled: HashMap::new(),
            dependency_graph: HashMap::new(),
            fired_tx,
            fired_rx: Some(fired_rx),
            ttl_tasks: HashMap::new(),
        }
    }

    /// Take the channel TTL rules announce themselves on.
    ///
    /// The owner drains it and calls [`resolve_rule`](Self::resolve_rule)
    /// for each fired rule id. Can be taken once.
    pub fn take_fired_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.fired_rx.take()
    }

    /// Register a rule, compiling its pattern and scheduling its timer
    pub fn add_rule(&mut self, rule: InvalidationRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(Error::Validation("rule id must not be empty".to_string()));
        }
        if let Some(pattern) = &rule.pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("invalid rule pattern: {}", e)))?;
            self.compiled.insert(rule.id.clone(), regex);
        }
        for dependency in &rule.dependencies {
            self.dependency_graph
                .entry(dependency.clone())
                .or_default()
                .insert(rule.id.clone());
        }
        if rule.strategy == InvalidationStrategy::Ttl && rule.enabled {
            self.schedule_ttl(&rule);
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Remove a rule and its timer
    pub fn remove_rule(&mut self, id: &str) -> Option<InvalidationRule> {
        if let Some(token) = self.ttl_tasks.remove(id) {
            token.cancel();
        }
        self.compiled.remove(id);
        let rule = self.rules.remove(id)?;
        for dependency in &rule.dependencies {
            if let Some(rule_ids) = self.dependency_graph.get_mut(dependency) {
                rule_ids.remove(id);
                if rule_ids.is_empty() {
                    self.dependency_graph.remove(dependency);
                }
            }
        }
        Some(rule)
    }

    /// Enable or disable a rule; TTL timers stop while disabled
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let rule = self
            .rules
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("unknown rule '{}'", id)))?;
        if rule.enabled == enabled {
            return Ok(());
        }
        rule.enabled = enabled;
        let rule = rule.clone();

        if rule.strategy == InvalidationStrategy::Ttl {
            if enabled {
                self.schedule_ttl(&rule);
            } else if let Some(token) = self.ttl_tasks.remove(id) {
                token.cancel();
            }
        }
        Ok(())
    }

    /// Look up a rule
    pub fn rule(&self, id: &str) -> Option<&InvalidationRule> {
        self.rules.get(id)
    }

    /// Resolve one rule against the key universe, returning the keys it
    /// invalidates. Disabled rules resolve to nothing.
    pub fn resolve_rule(&self, id: &str, keys: &[String]) -> Result<Vec<String>> {
        let rule = self
            .rules
            .get(id)
            .ok_or_else(|| Error::Validation(format!("unknown rule '{}'", id)))?;
        if !rule.enabled {
            return Ok(Vec::new());
        }
        Ok(self.match_rule(rule, keys))
    }

    /// Keys matching an ad-hoc pattern
    pub fn invalidate_by_pattern(&self, pattern: &str, keys: &[String]) -> Result<Vec<String>> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Validation(format!("invalid pattern: {}", e)))?;
        Ok(keys
            .iter()
            .filter(|key| regex.is_match(key))
            .cloned()
            .collect())
    }

    /// Cascade an invalidation through the dependency graph.
    ///
    /// Rules registered for the dependency run highest-priority first; keys
    /// they match are themselves treated as dependencies, breadth-first,
    /// until the cascade settles.
    pub fn invalidate_by_dependency(&self, dependency: &str, keys: &[String]) -> Vec<String> {
        let mut matched: Vec<String> = Vec::new();
        let mut matched_set: HashSet<String> = HashSet::new();
        let mut visited_deps: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(dependency.to_string());

        while let Some(dep) = queue.pop_front() {
            if !visited_deps.insert(dep.clone()) {
                continue;
            }
            let Some(rule_ids) = self.dependency_graph.get(&dep) else {
                continue;
            };

            let mut rules: Vec<&InvalidationRule> = rule_ids
                .iter()
                .filter_map(|id| self.rules.get(id))
                .filter(|rule| rule.enabled)
                .collect();
            rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

            for rule in rules {
                for key in self.match_rule(rule, keys) {
                    if matched_set.insert(key.clone()) {
                        queue.push_back(key.clone());
                        matched.push(key);
                    }
                }
            }
        }

        matched
    }

    fn match_rule(&self, rule: &InvalidationRule, keys: &[String]) -> Vec<String> {
        match self.compiled.get(&rule.id) {
            Some(regex) => keys
                .iter()
                .filter(|key| regex.is_match(key))
                .cloned()
                .collect(),
            // No pattern: the rule covers the whole universe
            None => keys.to_vec(),
        }
    }

    fn schedule_ttl(&mut self, rule: &InvalidationRule) {
        let Some(ttl_ms) = rule.ttl_ms else {
            tracing::warn!(rule = %rule.id, "TTL rule without ttl_ms; not scheduling");
            return;
        };
        if let Some(previous) = self.ttl_tasks.remove(&rule.id) {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let fired = self.fired_tx.clone();
        let rule_id = rule.id.clone();
        let period = Duration::from_millis(ttl_ms.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        if fired.send(rule_id.clone()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.ttl_tasks.insert(rule.id.clone(), cancel);
    }
}

impl Default for InvalidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InvalidationEngine {
    fn drop(&mut self) {
        for token in self.ttl_tasks.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_rule(id: &str, pattern: &str, deps: &[&str], priority: i32) -> InvalidationRule {
        InvalidationRule {
            id: id.to_string(),
            strategy: InvalidationStrategy::Pattern,
            trigger: InvalidationTrigger::OnDemand,
            pattern: Some(pattern.to_string()),
            ttl_ms: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            enabled: true,
            priority,
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_pattern_rule() {
        let mut engine = InvalidationEngine::new();
        engine
            .add_rule(pattern_rule("mixer-rule", r"^MainMixer\.", &[], 0))
            .unwrap();

        let universe = keys(&["MainMixer.gain", "MainMixer.mute", "Other.gain"]);
        let matched = engine.resolve_rule("mixer-rule", &universe).unwrap();
        assert_eq!(matched, keys(&["MainMixer.gain", "MainMixer.mute"]));
    }

    #[tokio::test]
    async fn test_disabled_rule_resolves_to_nothing() {
        let mut engine = InvalidationEngine::new();
        engine
            .add_rule(pattern_rule("rule", r".*", &[], 0))
            .unwrap();
        engine.set_enabled("rule", false).unwrap();

        let matched = engine
            .resolve_rule("rule", &keys(&["a", "b"]))
            .unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let mut engine = InvalidationEngine::new();
        let result = engine.add_rule(pattern_rule("bad", r"([", &[], 0));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_ad_hoc() {
        let engine = InvalidationEngine::new();
        let matched = engine
            .invalidate_by_pattern(r"gain$", &keys(&["a.gain", "a.mute", "b.gain"]))
            .unwrap();
        assert_eq!(matched, keys(&["a.gain", "b.gain"]));
    }

    #[tokio::test]
    async fn test_dependency_cascade_priority_order() {
        let mut engine = InvalidationEngine::new();
        engine
            .add_rule(pattern_rule("low", r"^low\.", &["root"], 1))
            .unwrap();
        engine
            .add_rule(pattern_rule("high", r"^high\.", &["root"], 10))
            .unwrap();

        let universe = keys(&["high.a", "low.a", "other"]);
        let matched = engine.invalidate_by_dependency("root", &universe);
        // Highest priority rule's keys come first.
        assert_eq!(matched, keys(&["high.a", "low.a"]));
    }

    #[tokio::test]
    async fn test_dependency_cascade_transitive() {
        let mut engine = InvalidationEngine::new();
        engine
            .add_rule(pattern_rule("first", r"^mid$", &["root"], 0))
            .unwrap();
        // The key "mid" matched by the first rule is itself a dependency
        // of the second rule.
        engine
            .add_rule(pattern_rule("second", r"^leaf$", &["mid"], 0))
            .unwrap();

        let universe = keys(&["mid", "leaf", "unrelated"]);
        let matched = engine.invalidate_by_dependency("root", &universe);
        assert_eq!(matched, keys(&["mid", "leaf"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_rule_self_reschedules() {
        let mut engine = InvalidationEngine::new();
        let mut fired = engine.take_fired_receiver().unwrap();
        engine
            .add_rule(InvalidationRule {
                id: "ttl-rule".to_string(),
                strategy: InvalidationStrategy::Ttl,
                trigger: InvalidationTrigger::Expiry,
                pattern: None,
                ttl_ms: Some(100),
                dependencies: Vec::new(),
                enabled: true,
                priority: 0,
            })
            .unwrap();

        tokio::time::advance(Duration::from_millis(110)).await;
        assert_eq!(fired.recv().await.unwrap(), "ttl-rule");

        // Fires again without re-registration.
        tokio::time::advance(Duration::from_millis(110)).await;
        assert_eq!(fired.recv().await.unwrap(), "ttl-rule");

        // Disabling stops the timer.
        engine.set_enabled("ttl-rule", false).unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_rule_cleans_dependency_graph() {
        let mut engine = InvalidationEngine::new();
        engine
            .add_rule(pattern_rule("rule", r".*", &["dep"], 0))
            .unwrap();
        engine.remove_rule("rule");

        let matched = engine.invalidate_by_dependency("dep", &keys(&["a"]));
        assert!(matched.is_empty());
        assert!(engine.rule("rule").is_none());
    }
}
