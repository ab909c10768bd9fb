//! Typed event hub for component event emission
//!
//! Each component owns an [`EventHub`] for the event types it emits;
//! subscribers receive clones over a tokio broadcast channel. The channel is
//! lossy under lag (oldest events dropped for slow consumers), which is the
//! contract for observation-plane events. Lifecycle notifications that must
//! never drop go over dedicated mpsc channels at their call sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::model::{ControlValue, StateSource};

/// Default per-hub channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// A broadcast-backed emitter for one event type.
///
/// Emission never blocks and never fails: with no subscribers the event is
/// simply dropped, matching a fire-and-forget notification contract.
#[derive(Debug, Clone)]
pub struct EventHub<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventHub<T> {
    /// Hub with the default capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Hub with an explicit channel capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a cache entry was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionReason {
    /// Least-recently-used displacement at capacity
    Lru,
    /// Per-entry TTL expired
    Ttl,
    /// Dropped under memory pressure
    Memory,
    /// Explicit invalidation
    Manual,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Ttl => write!(f, "ttl"),
            Self::Memory => write!(f, "memory"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Events emitted by the state facade
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A control state was written
    StateChanged {
        /// Control name
        name: String,
        /// Previous value, when one existed
        old: Option<ControlValue>,
        /// New value
        new: ControlValue,
        /// Origin of the write
        source: StateSource,
    },
    /// A batch write settled
    BatchUpdate {
        /// Entries written
        updated: usize,
        /// Entries that failed validation or storage
        failed: usize,
    },
    /// States were explicitly invalidated
    StateInvalidated {
        /// Names removed
        names: Vec<String>,
    },
    /// An entry was evicted from the control-state cache
    CacheEvicted {
        /// Control name
        key: String,
        /// Why it left the cache
        reason: EvictionReason,
    },
    /// A change group was created
    ChangeGroupCreated {
        /// Group id
        id: String,
    },
    /// A change group reached a terminal status
    ChangeGroupCompleted {
        /// Group id
        id: String,
        /// True when every write succeeded
        success: bool,
    },
    /// A cache sync (restore or refresh) finished
    SyncCompleted {
        /// Entries synced
        synced_count: usize,
        /// Wall-clock duration
        duration_ms: u64,
    },
    /// A component-level error worth surfacing to observers
    Error {
        /// Error description
        message: String,
        /// Where it happened
        context: String,
    },
}

/// A single control change inside a poll batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlChange {
    /// Control name as reported by the Core
    pub name: String,
    /// New value
    pub value: ControlValue,
    /// Core-provided string rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
}

/// A batch of changes observed for one change group on one poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeGroupChanges {
    /// Group the changes belong to
    pub group_id: String,
    /// Changes in arrival order
    pub changes: Vec<ControlChange>,
    /// Observation instant
    pub timestamp: DateTime<Utc>,
    /// Millisecond timestamp of the observation
    pub timestamp_ms: i64,
    /// Per-group poll sequence, monotonic until `ChangeGroup.Invalidate`
    pub sequence_number: u64,
}

/// Progress events emitted during change-group execution
#[derive(Debug, Clone)]
pub enum ChangeProgressEvent {
    /// One write succeeded
    ControlChanged {
        /// Group id
        group_id: String,
        /// Control name
        name: String,
        /// Value written
        value: ControlValue,
    },
    /// One write failed
    ControlFailed {
        /// Group id
        group_id: String,
        /// Control name
        name: String,
        /// Failure description
        error: String,
    },
}

/// Memory pressure severity reported by the event cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressureLevel {
    /// Usage at or above 80% of the limit
    High,
    /// Usage at or above 90% of the limit
    Critical,
}

/// Events emitted by the event-cache manager
#[derive(Debug, Clone)]
pub enum EventCacheEvent {
    /// Usage crossed a pressure threshold
    MemoryPressure {
        /// Severity band
        level: MemoryPressureLevel,
        /// Usage as a percentage of the limit
        percentage: f64,
        /// Current usage in bytes
        total_usage: u64,
        /// Configured limit in bytes
        limit: u64,
    },
    /// Eviction brought usage back at or under the limit
    MemoryPressureResolved {
        /// Bytes freed by the eviction pass
        freed: u64,
    },
    /// Events were dropped from a group buffer
    GroupEvicted {
        /// Group id
        group_id: String,
        /// Events removed
        dropped: usize,
        /// Why they were removed
        reason: EvictionReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let hub: EventHub<StateEvent> = EventHub::new();
        // Must not panic or error with nobody listening.
        hub.emit(StateEvent::BatchUpdate {
            updated: 3,
            failed: 0,
        });
        assert_eq!(hub.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let hub: EventHub<EvictionReason> = EventHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.emit(EvictionReason::Ttl);

        assert_eq!(rx1.recv().await.unwrap(), EvictionReason::Ttl);
        assert_eq!(rx2.recv().await.unwrap(), EvictionReason::Ttl);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_oldest() {
        let hub: EventHub<u32> = EventHub::with_capacity(2);
        let mut rx = hub.subscribe();

        for i in 0..5 {
            hub.emit(i);
        }

        // The first recv reports the lag; subsequent recvs yield the newest
        // retained events.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), 3);
        assert_eq!(rx.recv().await.unwrap(), 4);
    }

    #[test]
    fn test_eviction_reason_display() {
        assert_eq!(format!("{}", EvictionReason::Lru), "lru");
        assert_eq!(format!("{}", EvictionReason::Ttl), "ttl");
        assert_eq!(format!("{}", EvictionReason::Memory), "memory");
    }
}
