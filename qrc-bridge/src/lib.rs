//! # qrc-bridge
//!
//! Bridge service between tool-calling clients and a Q-SYS audio DSP Core
//! over its QRC control protocol (JSON-RPC 2.0 over TLS WebSocket).
//!
//! ## Architecture
//!
//! - **Transport**: framed JSON-RPC client with request/response
//!   correlation, authenticated logon, heartbeats, and reconnect with
//!   exponential backoff behind a circuit breaker
//! - **Control state**: LRU + TTL cache with rule-driven invalidation,
//!   fronted by a repository facade
//! - **Writes**: change-group transactions with bounded concurrency,
//!   per-write timeouts, and capture-and-rollback
//! - **Observation**: a poll loop feeding per-group bounded event buffers
//!   with priority-based eviction, compression, and disk spillover
//!
//! ## Example
//!
//! ```rust,no_run
//! use qrc_bridge::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let breaker = CircuitBreaker::new(config.breaker.clone());
//!     let manager = ConnectionManager::new(RetryPolicy::from(&config.transport), breaker);
//!     let client = QrcClient::new(config.transport.clone(), manager);
//!     client.connect().await?;
//!
//!     let executor = ChangeGroupExecutor::new(
//!         Arc::clone(&client) as Arc<dyn QrcPort>,
//!         ChangeGroupOptions::from(&config.change_group),
//!     );
//!     let repo = StateRepository::new(executor);
//!     repo.initialize(config.cache.clone()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod breaker;
pub mod cache;
pub mod changegroup;
pub mod config;
pub mod connection;
pub mod error;
pub mod eventcache;
pub mod events;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod poller;
pub mod state;
pub mod transport;

/// Commonly used types, re-exported for applications
pub mod prelude {
    pub use crate::adapter::SemanticAdapter;
    pub use crate::breaker::{BreakerState, CircuitBreaker};
    pub use crate::cache::{DiscoveryCache, InvalidationEngine, InvalidationRule};
    pub use crate::changegroup::{ChangeGroupExecutor, ChangeGroupOptions};
    pub use crate::config::Config;
    pub use crate::connection::{ConnectionManager, ConnectionState, RetryPolicy};
    pub use crate::error::{Error, ErrorCode, ErrorPayload, Result};
    pub use crate::eventcache::{EventCacheManager, EventQuery, GroupPriority};
    pub use crate::events::{ChangeGroupChanges, StateEvent};
    pub use crate::model::{
        CacheStatistics, CachedControl, CachedEvent, ChangeGroup, ChangeGroupExecutionResult,
        ChangeGroupStatus, ControlAddress, ControlFilter, ControlState, ControlValue,
        ControlWrite, StateSource,
    };
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::persistence::{SnapshotConfig, SnapshotFormat, SnapshotStore};
    pub use crate::poller::ChangeGroupPoller;
    pub use crate::state::{BatchResult, ControlRepository, StateRepository};
    pub use crate::transport::{QrcClient, QrcPort, TransportEvent};
}
