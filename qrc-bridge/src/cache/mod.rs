//! Caching: control state (LRU + TTL), discovery, and invalidation rules

pub mod discovery;
pub mod invalidation;
pub mod lru;

pub use discovery::DiscoveryCache;
pub use invalidation::{
    InvalidationEngine, InvalidationRule, InvalidationStrategy, InvalidationTrigger,
};
pub use lru::{Evicted, LruTtlCache};
