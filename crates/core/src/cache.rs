//! TTL cache for search results.
//!
//! Keys are scoped by account: every key starts with the account id and a
//! unit separator, so a write to one account can drop exactly that
//! account's results with [`QueryCache::invalidate_prefix`].

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SEP: char = '\u{1f}';

/// Default bound on cached queries; the oldest entry is evicted past it.
pub const DEFAULT_CAPACITY: usize = 512;

struct Slot<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

/// Query result cache with an injected clock.
pub struct QueryCache<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY, clock)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
            capacity,
            clock,
            enabled: capacity > 0 && ttl > Duration::zero(),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(Duration::zero(), 0, clock)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Build an account-scoped key from its parts.
    pub fn key(account_id: &str, query: &str, tags: &[String], options: &str) -> String {
        let mut tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        tags.sort_unstable();
        format!(
            "{account_id}{SEP}{}{SEP}{}{SEP}{options}",
            query.trim().to_lowercase(),
            tags.join(",")
        )
    }

    /// Fresh value for `key`, if any. Expired values are dropped on read.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let now = self.clock.now();
        let mut slots = self.lock();
        match slots.get(key) {
            Some(slot) if now - slot.inserted_at < self.ttl => Some(slot.value.clone()),
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: V) {
        if !self.enabled {
            return;
        }
        let now = self.clock.now();
        let mut slots = self.lock();
        if slots.len() >= self.capacity && !slots.contains_key(&key) {
            let ttl = self.ttl;
            slots.retain(|_, s| now - s.inserted_at < ttl);
            if slots.len() >= self.capacity {
                if let Some(oldest) = slots
                    .iter()
                    .min_by_key(|(_, s)| s.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    slots.remove(&oldest);
                }
            }
        }
        slots.insert(
            key,
            Slot {
                value,
                inserted_at: now,
            },
        );
    }

    /// Drop every key belonging to `account_id`. Returns how many went.
    pub fn invalidate_prefix(&self, account_id: &str) -> usize {
        let prefix = format!("{account_id}{SEP}");
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|k, _| !k.starts_with(&prefix));
        before - slots.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}
