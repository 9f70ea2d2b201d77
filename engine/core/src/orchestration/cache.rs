//! TTL Cache for Source Results
//!
//! Keyed by `(source_id, request_fingerprint)`. Expiry is lazy: a read past
//! the entry's TTL is a miss, but the entry stays around for
//! `stale_retention` so the collector can still serve it as a degraded
//! result when the source is down. [`TtlCache::sweep`] drops entries past
//! retention; nothing depends on it running.
//!
//! Concurrent inserts for the same key are last-writer-wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

/// Cache key for one source and one request shape
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_id: String,
    pub fingerprint: u32,
}

impl CacheKey {
    pub fn new(source_id: impl Into<String>, fingerprint: u32) -> Self {
        Self {
            source_id: source_id.into(),
            fingerprint,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

/// A retained value that may be past its TTL
#[derive(Clone, Debug)]
pub struct StaleValue<V> {
    pub value: V,
    /// Time since insertion
    pub age: Duration,
    /// Whether the value is still within its TTL
    pub fresh: bool,
}

/// Counters since creation (or the last `clear`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Expired values handed out for degraded results
    pub stale_hits: u64,
}

/// Concurrent TTL cache
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    stale_retention: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache keeping expired entries for `stale_retention`
    #[must_use]
    pub fn new(stale_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stale_retention,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
        }
    }

    /// Value for `key` if it is still within its TTL
    pub fn get_fresh(&self, key: &CacheKey) -> Option<V> {
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone());

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Value for `key` regardless of TTL, as long as it is retained
    pub fn get_stale(&self, key: &CacheKey) -> Option<StaleValue<V>> {
        let entry = self.entries.get(key)?;
        let age = entry.age();
        if age >= entry.ttl + self.stale_retention {
            return None;
        }

        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        Some(StaleValue {
            value: entry.value.clone(),
            age,
            fresh: age < entry.ttl,
        })
    }

    /// Insert or replace a value
    pub fn insert(&self, key: CacheKey, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove a value
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop entries past TTL plus stale retention; returns how many went
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.age() < entry.ttl + self.stale_retention);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Number of retained entries, fresh or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything and zero the counters
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stale_hits.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
        }
    }
}
