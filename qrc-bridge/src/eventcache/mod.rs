//! Event cache: bounded per-group history of observed control changes

pub mod compression;
pub mod manager;
pub mod query;
pub mod ring;
pub mod spillover;

pub use manager::{
    event_size, EventCacheManager, EventCacheStatistics, GroupPriority, GroupStatistics,
};
pub use query::{EventQuery, ValueFilter, ValueOperator};
pub use ring::EventRing;
pub use spillover::{JanitorReport, SpilloverStore};
