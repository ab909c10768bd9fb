//! Arena-backed LRU cache with per-entry TTL
//!
//! The recency list is an intrusive doubly-linked list over arena indices,
//! so promotion, insertion, and eviction are all O(1) with no sentinel
//! entries in the key map. Single-owner: callers serialize access.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::events::EvictionReason;

const NIL: usize = usize::MAX;

struct Slot<V> {
    key: String,
    value: V,
    prev: usize,
    next: usize,
    expires_at: Option<Instant>,
}

/// An entry removed by the cache rather than the caller
#[derive(Debug)]
pub struct Evicted<V> {
    /// Key of the removed entry
    pub key: String,
    /// Its value at removal
    pub value: V,
    /// Why it was removed
    pub reason: EvictionReason,
}

/// LRU + TTL map from string keys to values
pub struct LruTtlCache<V> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    max_entries: usize,
    default_ttl: Option<Duration>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> LruTtlCache<V> {
    /// Cache bounded at `max_entries`; `default_ttl` of `None` disables expiry
    pub fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            max_entries: max_entries.max(1),
            default_ttl,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no entries are cached
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Cache-served reads so far
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Missed reads so far
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Entries removed by LRU or TTL so far
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// All live keys, most recently used first
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut idx = self.head;
        while idx != NIL {
            let slot = self.slot(idx);
            keys.push(slot.key.clone());
            idx = slot.next;
        }
        keys
    }

    /// Insert with the default TTL.
    ///
    /// Returns the replaced value for an existing key, and the entry
    /// displaced by LRU when the cache was full.
    pub fn insert(&mut self, key: String, value: V) -> (Option<V>, Option<Evicted<V>>) {
        let ttl = self.default_ttl;
        self.insert_with_ttl(key, value, ttl)
    }

    /// Insert with an explicit TTL override
    pub fn insert_with_ttl(
        &mut self,
        key: String,
        value: V,
        ttl: Option<Duration>,
    ) -> (Option<V>, Option<Evicted<V>>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);

        if let Some(&idx) = self.map.get(&key) {
            self.detach(idx);
            self.push_front(idx);
            let slot = self.slot_mut(idx);
            slot.expires_at = expires_at;
            let old = std::mem::replace(&mut slot.value, value);
            return (Some(old), None);
        }

        let displaced = if self.map.len() >= self.max_entries {
            self.evict_tail()
        } else {
            None
        };

        let idx = self.alloc(Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
            expires_at,
        });
        self.map.insert(key, idx);
        self.push_front(idx);

        (None, displaced)
    }

    /// Read and promote. An expired entry counts as a miss and is removed;
    /// the eviction is returned so the owner can emit it.
    pub fn get(&mut self, key: &str) -> (Option<&V>, Option<Evicted<V>>) {
        let Some(&idx) = self.map.get(key) else {
            self.misses += 1;
            return (None, None);
        };

        if self.is_expired(idx) {
            self.misses += 1;
            let evicted = self.remove_index(idx, EvictionReason::Ttl);
            return (None, evicted);
        }

        self.hits += 1;
        self.detach(idx);
        self.push_front(idx);
        (Some(&self.slot(idx).value), None)
    }

    /// Read without promoting or counting; expired entries read as absent
    pub fn peek(&self, key: &str) -> Option<&V> {
        let &idx = self.map.get(key)?;
        if self.is_expired(idx) {
            return None;
        }
        Some(&self.slot(idx).value)
    }

    /// Mutable read without promotion; expired entries read as absent
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut V> {
        let &idx = self.map.get(key)?;
        if self.is_expired(idx) {
            return None;
        }
        Some(&mut self.slot_mut(idx).value)
    }

    /// Whether a fresh entry exists, without counting a hit or miss
    pub fn contains_fresh(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Clone out all fresh entries, most recently used first
    pub fn snapshot(&self) -> Vec<(String, V)>
    where
        V: Clone,
    {
        let mut entries = Vec::with_capacity(self.map.len());
        let mut idx = self.head;
        while idx != NIL {
            let slot = self.slot(idx);
            if !self.is_expired(idx) {
                entries.push((slot.key.clone(), slot.value.clone()));
            }
            idx = slot.next;
        }
        entries
    }

    /// Remove one entry
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = self.map.get(key).copied()?;
        self.remove_index(idx, EvictionReason::Manual)
            .map(|evicted| evicted.value)
    }

    /// Drop everything; returns how many entries were removed
    pub fn clear(&mut self) -> usize {
        let count = self.map.len();
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        count
    }

    /// Remove the least-recently-used entry
    pub fn pop_lru(&mut self) -> Option<Evicted<V>> {
        self.evict_tail()
    }

    /// Remove all expired entries; call this from a cleanup timer
    pub fn sweep_expired(&mut self) -> Vec<Evicted<V>> {
        let expired: Vec<usize> = self
            .map
            .values()
            .copied()
            .filter(|&idx| self.is_expired(idx))
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for idx in expired {
            if let Some(entry) = self.remove_index(idx, EvictionReason::Ttl) {
                evicted.push(entry);
            }
        }
        evicted
    }

    fn is_expired(&self, idx: usize) -> bool {
        match self.slot(idx).expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    fn evict_tail(&mut self) -> Option<Evicted<V>> {
        if self.tail == NIL {
            return None;
        }
        self.remove_index(self.tail, EvictionReason::Lru)
    }

    fn remove_index(&mut self, idx: usize, reason: EvictionReason) -> Option<Evicted<V>> {
        self.detach(idx);
        let slot = self.slots[idx].take()?;
        self.map.remove(&slot.key);
        self.free.push(idx);
        if !matches!(reason, EvictionReason::Manual) {
            self.evictions += 1;
        }
        Some(Evicted {
            key: slot.key,
            value: slot.value,
            reason,
        })
    }

    fn alloc(&mut self, slot: Slot<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slot_mut(prev).next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.slot_mut(next).prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        let slot = self.slot_mut(idx);
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slot_mut(old_head).prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn slot(&self, idx: usize) -> &Slot<V> {
        self.slots[idx].as_ref().expect("cache slot vacated")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<V> {
        self.slots[idx].as_mut().expect("cache slot vacated")
    }
}
