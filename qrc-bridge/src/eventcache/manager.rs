//! Event cache manager: per-group ring buffers under a global memory budget
//!
//! Ingests change batches from the poll loop, classifies each event, and
//! retains them per group with priority-aware eviction under memory
//! pressure, optional significance compression, and optional disk spillover.
//!
//! Memory accounting is UTF-16-equivalent: every string field counts as two
//! bytes per UTF-16 code unit, plus a fixed overhead per event and per
//! buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EventCacheConfig;
use crate::error::Result;
use crate::events::{ChangeGroupChanges, EventCacheEvent, EventHub, EvictionReason, MemoryPressureLevel};
use crate::eventcache::compression::compress_events;
use crate::eventcache::query::{self, EventQuery};
use crate::eventcache::ring::EventRing;
use crate::eventcache::spillover::SpilloverStore;
use crate::model::{CachedEvent, ControlValue, EventKind};

/// Fixed accounting overhead per event
pub const EVENT_OVERHEAD_BYTES: u64 = 112;

/// Fixed accounting overhead per group buffer
pub const BUFFER_OVERHEAD_BYTES: u64 = 256;

/// Pressure thresholds as fractions of the limit
const HIGH_WATERMARK: f64 = 0.80;
const CRITICAL_WATERMARK: f64 = 0.90;

/// Eviction drains usage down to this fraction of the limit
const EVICTION_TARGET: f64 = 0.75;

/// Minimum spacing between compression passes per group
const COMPRESSION_COOLDOWN: Duration = Duration::from_secs(30);

/// Per-group eviction weight under memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPriority {
    /// Evicted first
    Low,
    /// Default
    Normal,
    /// Evicted only after every lower-priority buffer is empty
    High,
}

/// UTF-16-equivalent byte count of a string
pub fn utf16_bytes(s: &str) -> u64 {
    s.encode_utf16().count() as u64 * 2
}

/// Accounted size of one event
pub fn event_size(event: &CachedEvent) -> u64 {
    let mut size = EVENT_OVERHEAD_BYTES;
    size += utf16_bytes(&event.group_id);
    size += utf16_bytes(&event.control_name);
    if let Some(s) = &event.string_value {
        size += utf16_bytes(s);
    }
    if let ControlValue::Text(s) = &event.value {
        size += utf16_bytes(s);
    }
    if let Some(ControlValue::Text(s)) = &event.previous_value {
        size += utf16_bytes(s);
    }
    size
}

struct GroupBuffer {
    ring: EventRing,
    priority: GroupPriority,
    next_seq: u64,
    usage_bytes: u64,
    last_compaction: Option<Instant>,
    last_values: HashMap<String, ControlValue>,
    spill_seq: u64,
    total_ingested: u64,
}

impl GroupBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            ring: EventRing::new(capacity),
            priority: GroupPriority::Normal,
            next_seq: 0,
            usage_bytes: 0,
            last_compaction: None,
            last_values: HashMap::new(),
            spill_seq: 0,
            total_ingested: 0,
        }
    }
}

struct Inner {
    groups: HashMap<String, GroupBuffer>,
    total_usage: u64,
    last_pressure: Option<MemoryPressureLevel>,
}

/// Per-group statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatistics {
    /// Buffered events
    pub events: usize,
    /// Accounted bytes
    pub usage_bytes: u64,
    /// Eviction priority
    pub priority: GroupPriority,
    /// Events ever ingested for this group
    pub total_ingested: u64,
}

/// Manager-wide statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EventCacheStatistics {
    /// Accounted bytes across all buffers
    pub total_usage_bytes: u64,
    /// Configured limit in bytes
    pub limit_bytes: u64,
    /// Live group buffers
    pub group_count: usize,
    /// Buffered events across all groups
    pub total_events: usize,
    /// Per-group breakdown
    pub groups: HashMap<String, GroupStatistics>,
}

/// Owns all per-group event buffers
pub struct EventCacheManager {
    config: EventCacheConfig,
    inner: Mutex<Inner>,
    spillover: Option<SpilloverStore>,
    events: EventHub<EventCacheEvent>,
    checker: StdMutex<Option<CancellationToken>>,
}

impl EventCacheManager {
    /// Manager with the given configuration; creates the spillover
    /// directory when spillover is configured
    pub fn new(config: EventCacheConfig) -> Result<Arc<Self>> {
        let spillover = match &config.spillover {
            Some(spill_config) => Some(SpilloverStore::new(spill_config.clone())?),
            None => None,
        };
        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                groups: HashMap::new(),
                total_usage: 0,
                last_pressure: None,
            }),
            spillover,
            events: EventHub::new(),
            checker: StdMutex::new(None),
        }))
    }

    /// Subscribe to memory-pressure and eviction events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventCacheEvent> {
        self.events.subscribe()
    }

    /// Ingest one change batch from the poll loop
    pub async fn ingest(&self, batch: &ChangeGroupChanges) {
        let spill_batch = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            if !inner.groups.contains_key(&batch.group_id) {
                inner
                    .groups
                    .insert(batch.group_id.clone(), GroupBuffer::new(self.config.max_events));
                inner.total_usage += BUFFER_OVERHEAD_BYTES;
            }

            // Age out stale events before appending
            let min_ts = batch.timestamp_ms - self.config.max_age_ms as i64;
            {
                let buffer = inner
                    .groups
                    .get_mut(&batch.group_id)
                    .expect("group buffer just ensured");
                let pruned = buffer.ring.prune_older_than(min_ts);
                if !pruned.is_empty() {
                    let freed: u64 = pruned.iter().map(event_size).sum();
                    buffer.usage_bytes = buffer.usage_bytes.saturating_sub(freed);
                    inner.total_usage = inner.total_usage.saturating_sub(freed);
                    self.events.emit(EventCacheEvent::GroupEvicted {
                        group_id: batch.group_id.clone(),
                        dropped: pruned.len(),
                        reason: EvictionReason::Ttl,
                    });
                }
            }

            let mut displaced_count = 0usize;
            let mut displaced_bytes = 0u64;
            {
                let buffer = inner
                    .groups
                    .get_mut(&batch.group_id)
                    .expect("group buffer just ensured");

                for change in &batch.changes {
                    buffer.next_seq += 1;
                    let sequence_number = buffer.next_seq;

                    let previous_value = buffer.last_values.get(&change.name).cloned();
                    let delta = match (
                        previous_value.as_ref().and_then(ControlValue::as_number),
                        change.value.as_number(),
                    ) {
                        (Some(prev), Some(next)) => Some(next - prev),
                        _ => None,
                    };
                    let event_kind = self.classify(
                        &change.name,
                        previous_value.as_ref(),
                        &change.value,
                        delta,
                    );

                    let event = CachedEvent {
                        group_id: batch.group_id.clone(),
                        control_name: change.name.clone(),
                        value: change.value.clone(),
                        string_value: change.string_value.clone(),
                        timestamp_ns: batch.timestamp_ms * 1_000_000,
                        timestamp_ms: batch.timestamp_ms,
                        sequence_number,
                        previous_value,
                        delta,
                        event_kind,
                    };

                    let size = event_size(&event);
                    buffer
                        .last_values
                        .insert(change.name.clone(), change.value.clone());

                    if let Some(displaced) = buffer.ring.push(event) {
                        let freed = event_size(&displaced);
                        buffer.usage_bytes = buffer.usage_bytes.saturating_sub(freed);
                        displaced_bytes += freed;
                        displaced_count += 1;
                    }
                    buffer.usage_bytes += size;
                    buffer.total_ingested += 1;
                    inner.total_usage += size;
                }
            }
            inner.total_usage = inner.total_usage.saturating_sub(displaced_bytes);
            if displaced_count > 0 {
                self.events.emit(EventCacheEvent::GroupEvicted {
                    group_id: batch.group_id.clone(),
                    dropped: displaced_count,
                    reason: EvictionReason::Lru,
                });
            }

            // Spill older events to disk once the ring nears capacity
            if self.spillover.is_some() {
                let buffer = inner
                    .groups
                    .get_mut(&batch.group_id)
                    .expect("group buffer just ensured");
                let high_water = buffer.ring.capacity() * 9 / 10;
                if buffer.ring.len() >= high_water.max(1) {
                    let to_spill = buffer.ring.drain_oldest(buffer.ring.len() / 2);
                    if !to_spill.is_empty() {
                        let freed: u64 = to_spill.iter().map(event_size).sum();
                        buffer.usage_bytes = buffer.usage_bytes.saturating_sub(freed);
                        inner.total_usage = inner.total_usage.saturating_sub(freed);
                        buffer.spill_seq += 1;
                        Some((batch.group_id.clone(), buffer.spill_seq, to_spill))
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let (Some(store), Some((group_id, seq, events))) = (&self.spillover, spill_batch) {
            if let Err(err) = store.write(&group_id, seq, &events).await {
                tracing::error!(group = %group_id, "Spillover write failed, events lost: {}", err);
            }
        }
    }

    /// Query one group's events, merging disk spillover with memory
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<CachedEvent>> {
        let mut candidates: Vec<CachedEvent> = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .get(&query.group_id)
                .map(|buffer| buffer.ring.iter().cloned().collect())
                .unwrap_or_default()
        };

        if let Some(store) = &self.spillover {
            let spilled = store
                .load_range(&query.group_id, query.start_time, query.end_time)
                .await?;
            candidates.extend(spilled);
        }

        Ok(query::apply(candidates, query))
    }

    /// Set a group's eviction priority, creating its buffer if needed
    pub async fn set_group_priority(&self, group_id: &str, priority: GroupPriority) {
        let mut inner = self.inner.lock().await;
        if !inner.groups.contains_key(group_id) {
            inner
                .groups
                .insert(group_id.to_string(), GroupBuffer::new(self.config.max_events));
            inner.total_usage += BUFFER_OVERHEAD_BYTES;
        }
        if let Some(buffer) = inner.groups.get_mut(group_id) {
            buffer.priority = priority;
        }
    }

    /// Buffered event count for one group
    pub async fn group_len(&self, group_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_id)
            .map(|buffer| buffer.ring.len())
            .unwrap_or(0)
    }

    /// Accounted usage across all buffers
    pub async fn total_usage(&self) -> u64 {
        self.inner.lock().await.total_usage
    }

    /// Statistics snapshot
    pub async fn statistics(&self) -> EventCacheStatistics {
        let inner = self.inner.lock().await;
        let groups: HashMap<String, GroupStatistics> = inner
            .groups
            .iter()
            .map(|(id, buffer)| {
                (
                    id.clone(),
                    GroupStatistics {
                        events: buffer.ring.len(),
                        usage_bytes: buffer.usage_bytes,
                        priority: buffer.priority,
                        total_ingested: buffer.total_ingested,
                    },
                )
            })
            .collect();
        EventCacheStatistics {
            total_usage_bytes: inner.total_usage,
            limit_bytes: self.config.global_memory_limit_bytes(),
            group_count: inner.groups.len(),
            total_events: inner.groups.values().map(|b| b.ring.len()).sum(),
            groups,
        }
    }

    /// Drop one group's buffer entirely
    pub async fn remove_group(&self, group_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(buffer) = inner.groups.remove(group_id) {
            inner.total_usage = inner
                .total_usage
                .saturating_sub(buffer.usage_bytes + BUFFER_OVERHEAD_BYTES);
        }
    }

    /// Compress one group's history by significance.
    ///
    /// No-op when compression is not configured or the per-group cooldown
    /// has not elapsed. Returns how many events were dropped.
    pub async fn compress_group(&self, group_id: &str) -> usize {
        let Some(compression) = self.config.compression.clone() else {
            return 0;
        };
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(buffer) = inner.groups.get_mut(group_id) else {
            return 0;
        };
        if let Some(last) = buffer.last_compaction {
            if last.elapsed() < COMPRESSION_COOLDOWN {
                tracing::debug!(group = group_id, "Compression skipped: cooldown active");
                return 0;
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let events: Vec<CachedEvent> = buffer.ring.iter().cloned().collect();
        let kept = compress_events(&events, &compression, now_ms);
        let dropped = events.len() - kept.len();
        if dropped > 0 {
            let kept_bytes: u64 = kept.iter().map(event_size).sum();
            let freed = buffer.usage_bytes.saturating_sub(kept_bytes);
            buffer.ring.replace(kept);
            buffer.usage_bytes = kept_bytes;
            inner.total_usage = inner.total_usage.saturating_sub(freed);
        }
        if let Some(buffer) = inner.groups.get_mut(group_id) {
            buffer.last_compaction = Some(Instant::now());
        }
        dropped
    }

    /// One memory-checker pass: emit pressure levels on crossings and evict
    /// down to the target when critical
    pub async fn check_memory(&self) {
        let limit = self.config.global_memory_limit_bytes();
        if limit == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        let usage = inner.total_usage;
        let fraction = usage as f64 / limit as f64;

        let level = if fraction >= CRITICAL_WATERMARK {
            Some(MemoryPressureLevel::Critical)
        } else if fraction >= HIGH_WATERMARK {
            Some(MemoryPressureLevel::High)
        } else {
            None
        };

        if level != inner.last_pressure {
            if let Some(level) = level {
                tracing::warn!(
                    percentage = fraction * 100.0,
                    total_usage = usage,
                    limit,
                    "Event cache memory pressure: {:?}",
                    level
                );
                self.events.emit(EventCacheEvent::MemoryPressure {
                    level,
                    percentage: fraction * 100.0,
                    total_usage: usage,
                    limit,
                });
            }
            inner.last_pressure = level;
        }

        if fraction >= CRITICAL_WATERMARK || usage > limit {
            let target = (limit as f64 * EVICTION_TARGET) as u64;
            let freed = self.evict_to_target(&mut inner, target);
            if inner.total_usage <= limit {
                self.events
                    .emit(EventCacheEvent::MemoryPressureResolved { freed });
            }
            let fraction = inner.total_usage as f64 / limit as f64;
            inner.last_pressure = if fraction >= CRITICAL_WATERMARK {
                Some(MemoryPressureLevel::Critical)
            } else if fraction >= HIGH_WATERMARK {
                Some(MemoryPressureLevel::High)
            } else {
                None
            };
        }
    }

    /// Start the periodic memory checker; returns a token that stops it
    pub fn start_memory_checker(self: &Arc<Self>) -> CancellationToken {
        let manager = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = Duration::from_millis(self.config.memory_check_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.check_memory().await,
                }
            }
        });

        {
            let mut slot = self.checker.lock().expect("checker lock poisoned");
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }
        cancel
    }

    /// Start the spillover janitor, when spillover is configured
    pub fn start_spillover_janitor(&self) -> Option<CancellationToken> {
        self.spillover.as_ref().map(|store| store.start_janitor())
    }

    /// Stop the memory checker
    pub fn stop(&self) {
        if let Some(token) = self.checker.lock().expect("checker lock poisoned").take() {
            token.cancel();
        }
    }

    /// Drop events ascending by priority, oldest first within a priority,
    /// until usage reaches `target`. Returns bytes freed.
    fn evict_to_target(&self, inner: &mut Inner, target: u64) -> u64 {
        let mut freed = 0u64;
        let mut dropped_per_group: HashMap<String, usize> = HashMap::new();

        while inner.total_usage > target {
            let candidate = inner
                .groups
                .iter()
                .filter(|(_, buffer)| !buffer.ring.is_empty())
                .min_by(|(id_a, a), (id_b, b)| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| {
                            let ts_a = a.ring.oldest().map(|e| e.timestamp_ns).unwrap_or(i64::MAX);
                            let ts_b = b.ring.oldest().map(|e| e.timestamp_ns).unwrap_or(i64::MAX);
                            ts_a.cmp(&ts_b)
                        })
                        .then_with(|| id_a.cmp(id_b))
                })
                .map(|(id, _)| id.clone());

            let Some(group_id) = candidate else {
                break;
            };
            let Some(buffer) = inner.groups.get_mut(&group_id) else {
                break;
            };
            let Some(event) = buffer.ring.pop_oldest() else {
                break;
            };
            let size = event_size(&event);
            buffer.usage_bytes = buffer.usage_bytes.saturating_sub(size);
            inner.total_usage = inner.total_usage.saturating_sub(size);
            freed += size;
            *dropped_per_group.entry(group_id).or_default() += 1;
        }

        for (group_id, dropped) in dropped_per_group {
            self.events.emit(EventCacheEvent::GroupEvicted {
                group_id,
                dropped,
                reason: EvictionReason::Memory,
            });
        }
        freed
    }

    fn classify(
        &self,
        control_name: &str,
        previous: Option<&ControlValue>,
        value: &ControlValue,
        delta: Option<f64>,
    ) -> EventKind {
        // Threshold crossings outrank every other classification
        if let (Some(prev), Some(next)) = (
            previous.and_then(ControlValue::as_number),
            value.as_number(),
        ) {
            if let Some(thresholds) = self.config.thresholds.get(control_name) {
                for threshold in thresholds {
                    let crossed = (prev < *threshold && next >= *threshold)
                        || (prev > *threshold && next <= *threshold);
                    if crossed {
                        return EventKind::ThresholdCrossed;
                    }
                }
            }
        }

        match (previous, value) {
            (Some(ControlValue::Bool(prev)), ControlValue::Bool(next)) if prev != next => {
                return EventKind::StateTransition;
            }
            (Some(ControlValue::Number(prev)), ControlValue::Number(next))
                if (*prev < 0.0) != (*next < 0.0) && *prev != 0.0 && *next != 0.0 =>
            {
                return EventKind::StateTransition;
            }
            _ => {}
        }

        let significant_percent = self
            .config
            .compression
            .as_ref()
            .map(|c| c.significant_change_percent)
            .unwrap_or(10.0);
        if let (Some(prev), Some(delta)) = (
            previous.and_then(ControlValue::as_number),
            delta,
        ) {
            if prev != 0.0 && (delta / prev).abs() * 100.0 >= significant_percent {
                return EventKind::SignificantChange;
            }
        }

        EventKind::Change
    }
}
