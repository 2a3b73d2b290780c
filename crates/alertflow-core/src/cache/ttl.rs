//! Keyed store with per-entry expiry and insertion-ordered scans
//!
//! Every entry carries its own deadline. Expired entries are dropped lazily
//! on read and during scans; `purge_expired` drops them eagerly. Time comes
//! from `tokio::time::Instant` so a paused test runtime can drive it.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion sequence -> key, oldest first
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Thread-safe TTL cache
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    default_ttl: Duration,
    max_entries: Option<usize>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an unbounded cache
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            default_ttl,
            max_entries: None,
        }
    }

    /// Cap the number of live entries; the oldest are evicted first
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// TTL used by [`TtlCache::set_default`]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace an entry; a replaced key becomes the newest
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.remove(&key);
        self.insert_locked(&mut inner, key, value, now + ttl, now);
    }

    /// Replace an entry with `f(current live value)` under a single lock.
    ///
    /// The entry becomes the newest and its TTL restarts. Returns the stored value.
    pub fn upsert<F>(&self, key: K, ttl: Duration, f: F) -> V
    where
        F: FnOnce(Option<V>) -> V,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let current = inner
            .remove(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value);
        let value = f(current);

        self.insert_locked(&mut inner, key, value.clone(), now + ttl, now);
        value
    }

    fn insert_locked(&self, inner: &mut Inner<K, V>, key: K, value: V, expires_at: Instant, now: Instant) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );

        if let Some(max) = self.max_entries {
            if inner.entries.len() > max {
                inner.purge_expired(now);
            }
            while inner.entries.len() > max {
                if inner.evict_oldest().is_none() {
                    break;
                }
            }
        }
    }

    /// Insert with the default TTL
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Fetch a live entry
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(key);
        }
        None
    }

    /// Up to `n` live keys, oldest insertion first
    pub fn oldest_n_keys(&self, n: usize) -> Vec<K> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut keys = Vec::with_capacity(n.min(inner.entries.len()));
        let mut expired = Vec::new();

        for key in inner.order.values() {
            if keys.len() >= n {
                break;
            }
            match inner.entries.get(key) {
                Some(entry) if entry.expires_at > now => keys.push(key.clone()),
                _ => expired.push(key.clone()),
            }
        }

        for key in &expired {
            inner.remove(key);
        }
        keys
    }

    /// Remove an entry, returning its value if it was live. Absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entry = self.inner.lock().remove(key)?;
        (entry.expires_at > now).then_some(entry.value)
    }

    /// Drop every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including ones not yet purged
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache stores no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
