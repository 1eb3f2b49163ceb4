// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small time-bounded memoization cache.
//!
//! Each entry remembers when it was inserted; a lookup older than the TTL is
//! a miss and evicts the entry. The `*_at` variants take an explicit clock so
//! the staleness window can be exercised in tests.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Size at which an insert first sweeps out expired entries.
pub const DEFAULT_PURGE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

/// Expiring key/value cache guarded by a `parking_lot` lock.
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    purge_threshold: usize,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
        }
    }

    /// Sweep expired entries on insert once the map holds `threshold` keys.
    pub fn with_purge_threshold(mut self, threshold: usize) -> Self {
        self.purge_threshold = threshold.max(1);
        self
    }

    /// Configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key` against the wall clock.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Utc::now())
    }

    /// Look up `key` as of `now`.
    pub fn get_at(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !self.is_expired(entry, now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key)
            && self.is_expired(entry, now)
        {
            entries.remove(key);
        }
        None
    }

    /// Insert or replace `key` using the wall clock.
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Utc::now());
    }

    /// Insert or replace `key`, stamped at `now`. A new key arriving at a
    /// full map first drops every expired entry.
    pub fn insert_at(&self, key: K, value: V, now: DateTime<Utc>) {
        let mut entries = self.entries.write();
        if entries.len() >= self.purge_threshold && !entries.contains_key(&key) {
            entries.retain(|_, entry| !self.is_expired(entry, now));
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Drop `key` so the next lookup misses.
    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.inserted_at);
        match age.to_std() {
            Ok(age) => age >= self.ttl,
            // Entry stamped in the future (clock moved backwards).
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ExpiringCache::new(Duration::from_secs(300));
        cache.insert_at("acme", 42_i64, t0());

        let later = t0() + chrono::Duration::seconds(299);
        assert_eq!(cache.get_at(&"acme", later), Some(42));
    }

    #[test]
    fn test_miss_after_ttl_evicts() {
        let cache = ExpiringCache::new(Duration::from_secs(300));
        cache.insert_at("acme", 42_i64, t0());

        let later = t0() + chrono::Duration::seconds(300);
        assert_eq!(cache.get_at(&"acme", later), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = ExpiringCache::new(Duration::from_secs(300));
        cache.insert_at("acme", 1_i64, t0());
        cache.insert_at("globex", 2_i64, t0());

        cache.invalidate(&"acme");

        assert_eq!(cache.get_at(&"acme", t0()), None);
        assert_eq!(cache.get_at(&"globex", t0()), Some(2));
    }

    #[test]
    fn test_insert_replaces_and_restamps() {
        let cache = ExpiringCache::new(Duration::from_secs(60));
        cache.insert_at("acme", 1_i64, t0());
        let restamp = t0() + chrono::Duration::seconds(50);
        cache.insert_at("acme", 2_i64, restamp);

        let later = t0() + chrono::Duration::seconds(100);
        assert_eq!(cache.get_at(&"acme", later), Some(2));
    }

    #[test]
    fn test_purge_expired() {
        let cache = ExpiringCache::new(Duration::from_secs(60));
        cache.insert_at("old", 1_i64, t0());
        cache.insert_at("new", 2_i64, t0() + chrono::Duration::seconds(45));

        let removed = cache.purge_expired_at(t0() + chrono::Duration::seconds(61));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_past_threshold_drops_expired() {
        let cache = ExpiringCache::new(Duration::from_secs(60)).with_purge_threshold(3);
        cache.insert_at("a", 1_i64, t0());
        cache.insert_at("b", 2_i64, t0());
        cache.insert_at("c", 3_i64, t0() + chrono::Duration::seconds(30));
        assert_eq!(cache.len(), 3);

        let later = t0() + chrono::Duration::seconds(70);
        cache.insert_at("d", 4_i64, later);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&"c", later), Some(3));
        assert_eq!(cache.get_at(&"d", later), Some(4));
    }

    #[test]
    fn test_below_threshold_keeps_expired_until_lookup() {
        let cache = ExpiringCache::new(Duration::from_secs(60));
        cache.insert_at("a", 1_i64, t0());
        cache.insert_at("b", 2_i64, t0() + chrono::Duration::seconds(70));
        assert_eq!(cache.len(), 2);
    }
}
