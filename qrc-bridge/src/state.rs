//! State facade: the repository contract over cache, invalidation,
//! change groups, and persistence
//!
//! Single entry point owning the control-state cache (LRU + TTL), the
//! invalidation engine, the change-group lifecycle, and the snapshot store.
//! Everything else reads and writes control state through here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::invalidation::InvalidationEngine;
use crate::cache::lru::LruTtlCache;
use crate::changegroup::{ChangeGroupExecutor, ChangeGroupOptions};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::events::{EventHub, StateEvent};
use crate::eventcache::manager::utf16_bytes;
use crate::model::{
    CacheStatistics, ChangeGroup, ChangeGroupExecutionResult, ChangeGroupStatus, ControlState,
    ControlWrite,
};
use crate::persistence::{SnapshotConfig, SnapshotStore};

/// Accounting overhead per cached control state
const STATE_OVERHEAD_BYTES: u64 = 112;

/// Outcome of a best-effort batch write
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Entries written
    pub updated: usize,
    /// Per-entry failures as (name, reason)
    pub failures: Vec<(String, String)>,
}

/// The repository contract the facade implements
#[async_trait::async_trait]
pub trait ControlRepository: Send + Sync {
    /// Read one control state
    async fn get_state(&self, name: &str) -> Option<ControlState>;
    /// Read several control states, positionally
    async fn get_states(&self, names: &[String]) -> Vec<Option<ControlState>>;
    /// Write one control state
    async fn set_state(&self, state: ControlState) -> Result<()>;
    /// Best-effort batch write with per-entry error accounting
    async fn set_states(&self, states: Vec<ControlState>) -> BatchResult;
    /// Remove one state; true when something was removed
    async fn remove_state(&self, name: &str) -> bool;
    /// Remove several states; returns how many were removed
    async fn remove_states(&self, names: &[String]) -> usize;
    /// Drop everything
    async fn clear(&self);
    /// Whether a fresh state exists
    async fn has_state(&self, name: &str) -> bool;
    /// All fresh keys
    async fn get_keys(&self) -> Vec<String>;
    /// Running counters
    async fn get_statistics(&self) -> CacheStatistics;
}

struct RepoInner {
    cache: LruTtlCache<ControlState>,
    groups: HashMap<String, ChangeGroup>,
}

/// Facade owning control state, change groups, invalidation, persistence
pub struct StateRepository {
    inner: Mutex<RepoInner>,
    invalidation: Mutex<InvalidationEngine>,
    executor: ChangeGroupExecutor,
    store: StdMutex<Option<SnapshotStore>>,
    config: StdMutex<CacheConfig>,
    events: EventHub<StateEvent>,
    initialized: AtomicBool,
    started_at: StdMutex<Option<Instant>>,
    cleanup_task: StdMutex<Option<CancellationToken>>,
    invalidation_task: StdMutex<Option<CancellationToken>>,
}

impl StateRepository {
    /// Repository around the given change-group executor; call
    /// [`initialize`](Self::initialize) before use
    pub fn new(executor: ChangeGroupExecutor) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RepoInner {
                cache: LruTtlCache::new(1, None),
                groups: HashMap::new(),
            }),
            invalidation: Mutex::new(InvalidationEngine::new()),
            executor,
            store: StdMutex::new(None),
            config: StdMutex::new(CacheConfig::default()),
            events: EventHub::new(),
            initialized: AtomicBool::new(false),
            started_at: StdMutex::new(None),
            cleanup_task: StdMutex::new(None),
            invalidation_task: StdMutex::new(None),
        })
    }

    /// Subscribe to facade events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// The change-group executor this repository owns
    pub fn executor(&self) -> &ChangeGroupExecutor {
        &self.executor
    }

    /// Initialize with the given cache configuration.
    ///
    /// Idempotent: a repeat call warns and changes nothing.
    pub async fn initialize(self: &Arc<Self>, config: CacheConfig) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::warn!("State repository already initialized; ignoring");
            return Ok(());
        }

        if config.max_entries == 0 {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(Error::Validation(
                "cache.max_entries must be positive".to_string(),
            ));
        }
        if config.persistence_enabled && config.persistence_file.is_none() {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(Error::Validation(
                "cache.persistence_file is required when persistence is enabled".to_string(),
            ));
        }

        let ttl = if config.ttl_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(config.ttl_ms))
        };
        {
            let mut inner = self.inner.lock().await;
            inner.cache = LruTtlCache::new(config.max_entries, ttl);
        }

        if config.persistence_enabled {
            let path = config
                .persistence_file
                .clone()
                .expect("checked persistence_file above");
            *self.store.lock().expect("store lock poisoned") =
                Some(SnapshotStore::new(SnapshotConfig::json(path)));
        }

        *self.started_at.lock().expect("uptime lock poisoned") = Some(Instant::now());
        *self.config.lock().expect("config lock poisoned") = config.clone();

        self.start_cleanup_timer(Duration::from_millis(config.cleanup_interval_ms.max(1)));
        self.start_invalidation_drain().await;

        tracing::info!(
            max_entries = config.max_entries,
            ttl_ms = config.ttl_ms,
            persistence = config.persistence_enabled,
            "State repository initialized"
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    // ------------------------------------------------------------------
    // Change-group lifecycle
    // ------------------------------------------------------------------

    /// Create a pending change group
    pub async fn create_change_group(
        &self,
        controls: Vec<ControlWrite>,
        source: &str,
    ) -> Result<ChangeGroup> {
        self.ensure_initialized()?;
        let group = ChangeGroup::new(controls, source);
        {
            let mut inner = self.inner.lock().await;
            inner.groups.insert(group.id.clone(), group.clone());
        }
        self.events.emit(StateEvent::ChangeGroupCreated {
            id: group.id.clone(),
        });
        Ok(group)
    }

    /// Fetch a change group by id
    pub async fn get_change_group(&self, id: &str) -> Option<ChangeGroup> {
        let inner = self.inner.lock().await;
        inner.groups.get(id).cloned()
    }

    /// Move a group through its monotonic lifecycle
    pub async fn update_change_group_status(
        &self,
        id: &str,
        status: ChangeGroupStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("unknown change group '{}'", id)))?;
        if !group.status.can_transition_to(status) {
            return Err(Error::Validation(format!(
                "change group '{}' cannot move {:?} -> {:?}",
                id, group.status, status
            )));
        }
        group.status = status;
        Ok(())
    }

    /// Execute a pending group through the transaction engine
    pub async fn execute_change_group(
        &self,
        id: &str,
        options: Option<ChangeGroupOptions>,
    ) -> Result<ChangeGroupExecutionResult> {
        self.ensure_initialized()?;
        let mut group = self
            .get_change_group(id)
            .await
            .ok_or_else(|| Error::Validation(format!("unknown change group '{}'", id)))?;
        if group.status != ChangeGroupStatus::Pending {
            return Err(Error::Validation(format!(
                "change group '{}' is {:?}, not PENDING",
                id, group.status
            )));
        }

        let outcome = self.executor.execute(&mut group, options).await;

        // Whatever happened, store the group's final status
        {
            let mut inner = self.inner.lock().await;
            inner.groups.insert(group.id.clone(), group.clone());
        }

        match outcome {
            Ok(result) => {
                // Reflect successful writes in the cache
                for control in result.results.iter().filter(|r| r.success) {
                    let state = ControlState::new(
                        &control.name,
                        control.target_value.clone(),
                        crate::model::StateSource::User,
                    );
                    if let Err(e) = self.set_state(state).await {
                        tracing::warn!(control = %control.name, "Cache update failed: {}", e);
                    }
                }
                self.events.emit(StateEvent::ChangeGroupCompleted {
                    id: group.id.clone(),
                    success: result.failure_count == 0,
                });
                Ok(result)
            }
            Err(err) => {
                self.events.emit(StateEvent::ChangeGroupCompleted {
                    id: group.id.clone(),
                    success: false,
                });
                Err(err)
            }
        }
    }

    /// Best-effort cancel: the group is marked FAILED; in-flight writes are
    /// not interrupted
    pub async fn cancel_change_group(&self, id: &str) -> bool {
        let cancelled = self.executor.cancel(id);
        let mut inner = self.inner.lock().await;
        match inner.groups.get_mut(id) {
            Some(group) if !group.status.is_terminal() => {
                group.status = ChangeGroupStatus::Failed;
                true
            }
            Some(_) => cancelled,
            None => false,
        }
    }

    /// Drop terminal groups older than the cache TTL; returns how many
    pub async fn cleanup_change_groups(&self) -> usize {
        let ttl_ms = self.config.lock().expect("config lock poisoned").ttl_ms;
        if ttl_ms == 0 {
            return 0;
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::milliseconds(ttl_ms as i64);

        let mut inner = self.inner.lock().await;
        let before = inner.groups.len();
        inner
            .groups
            .retain(|_, group| !(group.status.is_terminal() && group.created_at < cutoff));
        before - inner.groups.len()
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Register an invalidation rule
    pub async fn add_invalidation_rule(
        &self,
        rule: crate::cache::invalidation::InvalidationRule,
    ) -> Result<()> {
        self.invalidation.lock().await.add_rule(rule)
    }

    /// Remove named states; returns how many were present
    pub async fn invalidate_states(&self, names: &[String]) -> usize {
        let removed = {
            let mut inner = self.inner.lock().await;
            names
                .iter()
                .filter(|name| inner.cache.remove(name).is_some())
                .count()
        };
        if removed > 0 {
            self.events.emit(StateEvent::StateInvalidated {
                names: names.to_vec(),
            });
        }
        removed
    }

    /// Remove every state whose name matches the pattern
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let keys = self.get_keys().await;
        let matched = {
            let engine = self.invalidation.lock().await;
            engine.invalidate_by_pattern(pattern, &keys)?
        };
        Ok(self.invalidate_states(&matched).await)
    }

    /// Cascade an invalidation through the rule dependency graph
    pub async fn invalidate_dependency(&self, dependency: &str) -> usize {
        let keys = self.get_keys().await;
        let matched = {
            let engine = self.invalidation.lock().await;
            engine.invalidate_by_dependency(dependency, &keys)
        };
        self.invalidate_states(&matched).await
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Snapshot the cache; no-op unless persistence is enabled
    pub async fn persist(&self) -> Result<()> {
        let store = self.store.lock().expect("store lock poisoned").clone();
        let Some(store) = store else {
            return Ok(());
        };
        let controls: HashMap<String, ControlState> = {
            let inner = self.inner.lock().await;
            inner.cache.snapshot().into_iter().collect()
        };
        store.persist(&controls).await
    }

    /// Restore the cache from the snapshot; no-op unless persistence is
    /// enabled
    pub async fn restore(&self) -> Result<usize> {
        self.ensure_initialized()?;
        let store = self.store.lock().expect("store lock poisoned").clone();
        let Some(store) = store else {
            return Ok(0);
        };

        let started = std::time::Instant::now();
        let controls = store.restore().await?;
        let count = controls.len();
        {
            let mut inner = self.inner.lock().await;
            for (name, state) in controls {
                inner.cache.insert(name, state);
            }
        }
        self.events.emit(StateEvent::SyncCompleted {
            synced_count: count,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(count)
    }

    /// Shutdown: persist (when enabled), stop timers, drop listeners
    pub async fn shutdown(&self) {
        if let Err(e) = self.persist().await {
            tracing::error!("Shutdown persist failed: {}", e);
            self.events.emit(StateEvent::Error {
                message: e.to_string(),
                context: "shutdown.persist".to_string(),
            });
        }
        if let Some(token) = self
            .cleanup_task
            .lock()
            .expect("cleanup lock poisoned")
            .take()
        {
            token.cancel();
        }
        if let Some(token) = self
            .invalidation_task
            .lock()
            .expect("invalidation task lock poisoned")
            .take()
        {
            token.cancel();
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("State repository shut down");
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_cleanup_timer(self: &Arc<Self>, interval: Duration) {
        let repo = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let evicted = {
                    let mut inner = repo.inner.lock().await;
                    inner.cache.sweep_expired()
                };
                for entry in &evicted {
                    repo.events.emit(StateEvent::CacheEvicted {
                        key: entry.key.clone(),
                        reason: entry.reason,
                    });
                }
                let groups = repo.cleanup_change_groups().await;
                if !evicted.is_empty() || groups > 0 {
                    tracing::debug!(
                        expired_states = evicted.len(),
                        expired_groups = groups,
                        "Cleanup pass complete"
                    );
                }
            }
        });

        let mut slot = self.cleanup_task.lock().expect("cleanup lock poisoned");
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        *slot = Some(cancel);
    }

    /// Drain TTL-rule firings from the invalidation engine
    async fn start_invalidation_drain(self: &Arc<Self>) {
        let receiver = self.invalidation.lock().await.take_fired_receiver();
        let Some(mut receiver) = receiver else {
            return;
        };
        let repo = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let rule_id = tokio::select! {
                    _ = token.cancelled() => break,
                    fired = receiver.recv() => match fired {
                        Some(rule_id) => rule_id,
                        None => break,
                    }
                };
                let keys = repo.get_keys().await;
                let matched = {
                    let engine = repo.invalidation.lock().await;
                    engine.resolve_rule(&rule_id, &keys).unwrap_or_default()
                };
                if !matched.is_empty() {
                    tracing::debug!(rule = %rule_id, count = matched.len(), "TTL rule fired");
                    repo.invalidate_states(&matched).await;
                }
            }
        });

        let mut slot = self
            .invalidation_task
            .lock()
            .expect("invalidation task lock poisoned");
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        *slot = Some(cancel);
    }
}

#[async_trait::async_trait]
impl ControlRepository for StateRepository {
    async fn get_state(&self, name: &str) -> Option<ControlState> {
        if self.ensure_initialized().is_err() {
            return None;
        }
        let (state, evicted) = {
            let mut inner = self.inner.lock().await;
            let (state, evicted) = inner.cache.get(name);
            (state.cloned(), evicted)
        };
        if let Some(entry) = evicted {
            self.events.emit(StateEvent::CacheEvicted {
                key: entry.key,
                reason: entry.reason,
            });
        }
        state
    }

    async fn get_states(&self, names: &[String]) -> Vec<Option<ControlState>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.get_state(name).await);
        }
        out
    }

    async fn set_state(&self, mut state: ControlState) -> Result<()> {
        self.ensure_initialized()?;
        if state.name.trim().is_empty() {
            return Err(Error::Validation(
                "control name must not be empty".to_string(),
            ));
        }

        let (old, evicted) = {
            let mut inner = self.inner.lock().await;
            // Timestamps are monotonically non-decreasing per key
            if let Some(existing) = inner.cache.peek(&state.name) {
                if existing.timestamp > state.timestamp {
                    state.timestamp = existing.timestamp;
                }
            }
            inner.cache.insert(state.name.clone(), state.clone())
        };

        if let Some(entry) = evicted {
            self.events.emit(StateEvent::CacheEvicted {
                key: entry.key,
                reason: entry.reason,
            });
        }
        self.events.emit(StateEvent::StateChanged {
            name: state.name.clone(),
            old: old.map(|o| o.value),
            new: state.value.clone(),
            source: state.source,
        });
        Ok(())
    }

    async fn set_states(&self, states: Vec<ControlState>) -> BatchResult {
        let mut result = BatchResult::default();
        for state in states {
            let name = state.name.clone();
            match self.set_state(state).await {
                Ok(()) => result.updated += 1,
                Err(err) => result.failures.push((name, err.to_string())),
            }
        }
        self.events.emit(StateEvent::BatchUpdate {
            updated: result.updated,
            failed: result.failures.len(),
        });
        result
    }

    async fn remove_state(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.cache.remove(name).is_some()
    }

    async fn remove_states(&self, names: &[String]) -> usize {
        let mut inner = self.inner.lock().await;
        names
            .iter()
            .filter(|name| inner.cache.remove(name).is_some())
            .count()
    }

    async fn clear(&self) {
        let count = {
            let mut inner = self.inner.lock().await;
            inner.cache.clear()
        };
        if count > 0 {
            self.events.emit(StateEvent::StateInvalidated {
                names: Vec::new(),
            });
            tracing::info!(count, "Control-state cache cleared");
        }
    }

    async fn has_state(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.cache.contains_fresh(name)
    }

    async fn get_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.cache.keys()
    }

    async fn get_statistics(&self) -> CacheStatistics {
        let enable_metrics = self
            .config
            .lock()
            .expect("config lock poisoned")
            .enable_metrics;
        let inner = self.inner.lock().await;
        if !enable_metrics {
            return CacheStatistics::default();
        }

        let hits = inner.cache.hits();
        let misses = inner.cache.misses();
        let memory: u64 = inner
            .cache
            .snapshot()
            .iter()
            .map(|(key, state)| {
                let mut size = STATE_OVERHEAD_BYTES + utf16_bytes(key);
                if let crate::model::ControlValue::Text(s) = &state.value {
                    size += utf16_bytes(s);
                }
                size
            })
            .sum();
        let uptime_ms = self
            .started_at
            .lock()
            .expect("uptime lock poisoned")
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        CacheStatistics {
            hits,
            misses,
            evictions: inner.cache.evictions(),
            memory_usage_bytes: memory,
            uptime_ms,
            hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ControlValue, StateSource};
    use crate::transport::testing::MockQrcPort;

    async fn repo() -> Arc<StateRepository> {
        repo_with_config(CacheConfig::default()).await
    }

    async fn repo_with_config(config: CacheConfig) -> Arc<StateRepository> {
        let port = Arc::new(MockQrcPort::new());
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());
        let repo = StateRepository::new(executor);
        repo.initialize(config).await.unwrap();
        repo
    }

    fn state(name: &str, value: f64) -> ControlState {
        ControlState::new(name, ControlValue::Number(value), StateSource::User)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let repo = repo().await;
        repo.set_state(state("Mixer.gain", -10.0)).await.unwrap();

        let loaded = repo.get_state("Mixer.gain").await.unwrap();
        assert_eq!(loaded.value, ControlValue::Number(-10.0));
        assert!(repo.has_state("Mixer.gain").await);
    }

    #[tokio::test]
    async fn test_uninitialized_repository_rejects_writes() {
        let port = Arc::new(MockQrcPort::new());
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());
        let repo = StateRepository::new(executor);

        let result = repo.set_state(state("a", 1.0)).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
        assert!(repo.get_state("a").await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let repo = repo().await;
        // Second initialize warns but succeeds.
        repo.initialize(CacheConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_timestamps_never_regress() {
        let repo = repo().await;
        let mut newer = state("a", 1.0);
        newer.timestamp = chrono::Utc::now();
        repo.set_state(newer.clone()).await.unwrap();

        let mut older = state("a", 2.0);
        older.timestamp = newer.timestamp - chrono::Duration::seconds(60);
        repo.set_state(older).await.unwrap();

        let stored = repo.get_state("a").await.unwrap();
        assert_eq!(stored.value, ControlValue::Number(2.0));
        assert!(stored.timestamp >= newer.timestamp);
    }

    #[tokio::test]
    async fn test_invalidate_then_get_is_none() {
        let repo = repo().await;
        repo.set_state(state("a", 1.0)).await.unwrap();

        let removed = repo.invalidate_states(&["a".to_string()]).await;
        assert_eq!(removed, 1);
        assert!(repo.get_state("a").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let repo = repo().await;
        repo.set_state(state("Mixer.gain", 1.0)).await.unwrap();
        repo.set_state(state("Mixer.mute", 0.0)).await.unwrap();
        repo.set_state(state("Other.gain", 2.0)).await.unwrap();

        let removed = repo.invalidate_pattern(r"^Mixer\.").await.unwrap();
        assert_eq!(removed, 2);
        assert!(repo.get_state("Other.gain").await.is_some());
    }

    #[tokio::test]
    async fn test_batch_set_accounts_per_entry_errors() {
        let repo = repo().await;
        let result = repo
            .set_states(vec![state("a", 1.0), state("  ", 2.0), state("b", 3.0)])
            .await;
        assert_eq!(result.updated, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, "  ");
    }

    #[tokio::test]
    async fn test_state_changed_events() {
        let repo = repo().await;
        let mut rx = repo.subscribe();

        repo.set_state(state("a", 1.0)).await.unwrap();
        repo.set_state(state("a", 2.0)).await.unwrap();

        match rx.recv().await.unwrap() {
            StateEvent::StateChanged { name, old, new, .. } => {
                assert_eq!(name, "a");
                assert!(old.is_none());
                assert_eq!(new, ControlValue::Number(1.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StateEvent::StateChanged { old, new, .. } => {
                assert_eq!(old, Some(ControlValue::Number(1.0)));
                assert_eq!(new, ControlValue::Number(2.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_statistics_hit_ratio() {
        let repo = repo().await;
        repo.set_state(state("a", 1.0)).await.unwrap();

        repo.get_state("a").await;
        repo.get_state("a").await;
        repo.get_state("missing").await;

        let stats = repo.get_statistics().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(stats.memory_usage_bytes > 0);
    }

    #[tokio::test]
    async fn test_change_group_lifecycle_and_status_monotonicity() {
        let repo = repo().await;
        let group = repo
            .create_change_group(
                vec![ControlWrite {
                    name: "Mixer.gain".to_string(),
                    value: ControlValue::Number(0.0),
                    ramp: None,
                }],
                "test",
            )
            .await
            .unwrap();

        assert_eq!(group.status, ChangeGroupStatus::Pending);
        repo.update_change_group_status(&group.id, ChangeGroupStatus::Applying)
            .await
            .unwrap();
        repo.update_change_group_status(&group.id, ChangeGroupStatus::Completed)
            .await
            .unwrap();

        // Terminal status never regresses.
        let result = repo
            .update_change_group_status(&group.id, ChangeGroupStatus::Applying)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_execute_change_group_updates_cache() {
        let port = Arc::new(MockQrcPort::with_responder(|method, _| {
            match method {
                crate::transport::methods::COMPONENT_GET => Ok(serde_json::json!({
                    "Controls": [{"Name": "gain", "Value": -20.0}]
                })),
                _ => Ok(serde_json::Value::Null),
            }
        }));
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());
        let repo = StateRepository::new(executor);
        repo.initialize(CacheConfig::default()).await.unwrap();

        let group = repo
            .create_change_group(
                vec![ControlWrite {
                    name: "Mixer.gain".to_string(),
                    value: ControlValue::Number(-5.0),
                    ramp: None,
                }],
                "test",
            )
            .await
            .unwrap();

        let result = repo.execute_change_group(&group.id, None).await.unwrap();
        assert_eq!(result.success_count, 1);

        let cached = repo.get_state("Mixer.gain").await.unwrap();
        assert_eq!(cached.value, ControlValue::Number(-5.0));
        assert_eq!(
            repo.get_change_group(&group.id).await.unwrap().status,
            ChangeGroupStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cleanup_change_groups_removes_stale_terminal() {
        let mut config = CacheConfig::default();
        config.ttl_ms = 1000;
        let repo = repo_with_config(config).await;

        let group = repo
            .create_change_group(Vec::new(), "test")
            .await
            .unwrap();
        {
            let mut inner = repo.inner.lock().await;
            let stored = inner.groups.get_mut(&group.id).unwrap();
            stored.status = ChangeGroupStatus::Completed;
            stored.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        }

        let removed = repo.cleanup_change_groups().await;
        assert_eq!(removed, 1);
        assert!(repo.get_change_group(&group.id).await.is_none());
    }

    #[tokio::test]
    async fn test_persist_restore_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.persistence_enabled = true;
        config.persistence_file = Some(dir.path().join("cache.json"));
        let repo = repo_with_config(config.clone()).await;

        repo.set_state(state("a", 1.0)).await.unwrap();
        repo.set_state(state("b", 2.0)).await.unwrap();
        repo.persist().await.unwrap();

        let restored_repo = repo_with_config(config).await;
        let count = restored_repo.restore().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            restored_repo.get_state("a").await.unwrap().value,
            ControlValue::Number(1.0)
        );
    }

    #[tokio::test]
    async fn test_persist_without_store_is_noop() {
        let repo = repo().await;
        repo.set_state(state("a", 1.0)).await.unwrap();
        repo.persist().await.unwrap();
        assert_eq!(repo.restore().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_invalidation_rule_prunes_matching_states() {
        let repo = repo().await;
        repo.set_state(state("Meters.level", 1.0)).await.unwrap();
        repo.set_state(state("Mixer.gain", 2.0)).await.unwrap();

        repo.add_invalidation_rule(crate::cache::invalidation::InvalidationRule {
            id: "meters".to_string(),
            strategy: crate::cache::invalidation::InvalidationStrategy::Ttl,
            trigger: crate::cache::invalidation::InvalidationTrigger::Expiry,
            pattern: Some(r"^Meters\.".to_string()),
            ttl_ms: Some(100),
            dependencies: Vec::new(),
            enabled: true,
            priority: 0,
        })
        .await
        .unwrap();

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        // Drain task needs a few polls to resolve and apply the rule.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert!(repo.get_state("Meters.level").await.is_none());
        assert!(repo.get_state("Mixer.gain").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_persists_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.persistence_enabled = true;
        config.persistence_file = Some(dir.path().join("cache.json"));
        let repo = repo_with_config(config).await;

        repo.set_state(state("a", 1.0)).await.unwrap();
        repo.shutdown().await;

        assert!(dir.path().join("cache.json").exists());
        // Post-shutdown writes are rejected.
        assert!(matches!(
            repo.set_state(state("b", 2.0)).await,
            Err(Error::NotInitialized)
        ));
    }
}
