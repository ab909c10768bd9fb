//! Discovery cache: component list and per-component control descriptors
//!
//! The component list is a single slot with a coarse TTL. Control
//! descriptors are cached per component, with an LRU bound on how many
//! component control sets stay resident. Everything here is cleared on
//! connection loss and rebuilt on demand.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::lru::LruTtlCache;
use crate::model::{CachedComponent, CachedControl};

/// Default freshness of the component list
pub const DEFAULT_COMPONENT_LIST_TTL: Duration = Duration::from_secs(300);

/// Default freshness of a control descriptor set
pub const DEFAULT_CONTROL_TTL: Duration = Duration::from_secs(300);

/// Default bound on resident component control sets
pub const DEFAULT_CONTROL_SET_CAP: usize = 50;

/// Cache of what the Core's design looks like
pub struct DiscoveryCache {
    component_list: Option<(Vec<CachedComponent>, Instant)>,
    component_list_ttl: Duration,
    control_ttl: Duration,
    control_sets: LruTtlCache<HashMap<String, CachedControl>>,
}

impl DiscoveryCache {
    /// Cache with explicit TTLs and control-set bound
    pub fn new(component_list_ttl: Duration, control_ttl: Duration, max_sets: usize) -> Self {
        Self {
            component_list: None,
            component_list_ttl,
            control_ttl,
            control_sets: LruTtlCache::new(max_sets, Some(control_ttl)),
        }
    }

    /// The control-descriptor TTL this cache stamps onto entries
    pub fn control_ttl(&self) -> Duration {
        self.control_ttl
    }

    /// Fresh component list, or `None` when absent or stale
    pub fn components(&self) -> Option<&[CachedComponent]> {
        match &self.component_list {
            Some((components, fetched_at))
                if fetched_at.elapsed() < self.component_list_ttl =>
            {
                Some(components)
            }
            _ => None,
        }
    }

    /// Store a freshly fetched component list
    pub fn store_components(&mut self, components: Vec<CachedComponent>) {
        self.component_list = Some((components, Instant::now()));
    }

    /// Fresh control set for one component; promotes it in the LRU order
    pub fn controls(&mut self, component: &str) -> Option<&HashMap<String, CachedControl>> {
        self.control_sets.get(component).0
    }

    /// Store (or replace) the control set of one component
    pub fn store_controls(&mut self, component: &str, controls: Vec<CachedControl>) {
        let set: HashMap<String, CachedControl> = controls
            .into_iter()
            .map(|control| (control.name.clone(), control))
            .collect();
        self.control_sets.insert(component.to_string(), set);
    }

    /// Tri-state control existence:
    /// `Some(true)` present and fresh, `Some(false)` known-absent because the
    /// component's set is cached, `None` unknown (not cached or expired).
    pub fn has_control(&mut self, component: &str, control: &str) -> Option<bool> {
        self.control_sets
            .get(component)
            .0
            .map(|set| set.contains_key(control))
    }

    /// Number of resident control sets
    pub fn control_set_count(&self) -> usize {
        self.control_sets.len()
    }

    /// Forget one component's control set
    pub fn invalidate_component(&mut self, component: &str) {
        self.control_sets.remove(component);
    }

    /// Forget everything; used on connection loss
    pub fn invalidate_all(&mut self) {
        self.component_list = None;
        self.control_sets.clear();
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(
            DEFAULT_COMPONENT_LIST_TTL,
            DEFAULT_CONTROL_TTL,
            DEFAULT_CONTROL_SET_CAP,
        )
    }
}
