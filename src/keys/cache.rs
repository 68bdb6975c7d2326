//! In-memory keyset cache.
//!
//! Three independently bounded LRU+TTL indices sit in front of the durable
//! store:
//!
//! - parsed device key by key-id
//! - full keyset by user-id
//! - owning user-id by key-id (reverse lookup)
//!
//! The cache is a disposable view. Dropping any entry at any time only costs
//! a store round trip.
//!
//! # Eviction
//!
//! - `get` on an expired entry removes it and counts as a miss
//! - `get` promotes the entry to most-recently-used
//! - `put` evicts the least-recently-used entry once over capacity

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::UserId;

use super::keyset::{DeviceKey, Keyset};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the keyset cache.
#[derive(Debug, Clone)]
pub struct KeysetCacheConfig {
    /// Capacity of the parsed-key index
    pub parsed_key_capacity: usize,

    /// Capacity of the keyset index
    pub keyset_capacity: usize,

    /// Capacity of the reverse key-owner index
    pub key_owner_capacity: usize,

    /// Time-to-live for every entry
    pub ttl: Duration,

    /// How often the background task sweeps expired entries
    pub cleanup_interval: Duration,
}

impl Default for KeysetCacheConfig {
    fn default() -> Self {
        Self {
            parsed_key_capacity: 1000,
            keyset_capacity: 500,
            key_owner_capacity: 2000,
            ttl: Duration::from_secs(30 * 60),              // 30 minutes
            cleanup_interval: Duration::from_secs(5 * 60), // 5 minutes
        }
    }
}

// =============================================================================
// Cache Statistics
// =============================================================================

/// Counters shared by all three indices.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired_cleanups: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.expired_cleanups.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expired_cleanups.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_cleanups: u64,
}

/// Derived health view over the counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheHealth {
    /// Hits over total lookups, 0.0 when there was no traffic
    pub hit_rate: f64,
    pub total_operations: u64,
    pub evictions: u64,
    pub expired_cleanups: u64,
}

impl CacheHealth {
    pub fn from_stats(stats: CacheStatsSnapshot) -> Self {
        let total_operations = stats.hits + stats.misses;
        let hit_rate = if total_operations == 0 {
            0.0
        } else {
            stats.hits as f64 / total_operations as f64
        };

        Self {
            hit_rate,
            total_operations,
            evictions: stats.evictions,
            expired_cleanups: stats.expired_cleanups,
        }
    }

    /// Hit rate of at least 70% with some traffic.
    pub fn is_healthy(&self) -> bool {
        self.total_operations > 0 && self.hit_rate >= 0.7
    }

    /// Hit rate below 50% or more than 20% of lookups causing evictions.
    pub fn needs_attention(&self) -> bool {
        if self.total_operations == 0 {
            return false;
        }
        let eviction_rate = self.evictions as f64 / self.total_operations as f64;
        self.hit_rate < 0.5 || eviction_rate > 0.2
    }
}

// =============================================================================
// LRU + TTL Index
// =============================================================================

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    tick: u64,
}

struct LruState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access order, oldest first
    order: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruState<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn take(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }
}

/// One capacity-bounded, TTL-aware LRU index.
///
/// Every operation takes the internal lock; `get` mutates the access order so
/// there is no shared read path.
pub struct LruTtlCache<K, V> {
    state: Mutex<LruState<K, V>>,
    capacity: usize,
    ttl: Duration,
    stats: Arc<CacheStats>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruTtlCache<K, V> {
    /// A `capacity` of 0 is raised to 1 so the index can always hold the
    /// most recent entry.
    pub fn new(capacity: usize, ttl: Duration, stats: Arc<CacheStats>) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            stats,
        }
    }

    /// Look up an entry, promoting it on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        if expired {
            state.take(key);
            self.stats.record_expired(1);
            self.stats.record_miss();
            return None;
        }

        state.touch(key);
        self.stats.record_hit();
        state.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace an entry as most-recently-used.
    pub fn put(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.take(&key);

        let tick = state.next_tick;
        state.next_tick += 1;
        state.order.insert(tick, key.clone());
        state.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                tick,
            },
        );

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            self.stats.record_eviction();
        }
    }

    /// Remove an entry, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.lock().take(key).map(|e| e.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.take(key);
        }

        self.stats.record_expired(expired.len() as u64);
        expired.len()
    }

    /// Keys whose value satisfies `predicate` (expired entries included).
    pub fn keys_matching(&self, predicate: impl Fn(&V) -> bool) -> Vec<K> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| predicate(&e.value))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }
}

// =============================================================================
// Keyset Cache
// =============================================================================

/// Number of live entries per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSizes {
    pub parsed_keys: usize,
    pub keysets: usize,
    pub key_owners: usize,
}

/// The three cache indices plus their shared statistics.
pub struct KeysetCache {
    /// Parsed device key by key-id
    pub parsed_keys: LruTtlCache<String, Arc<DeviceKey>>,

    /// Whole keyset by user-id
    pub keysets: LruTtlCache<UserId, Arc<Keyset>>,

    /// Owning user-id by key-id
    pub key_owners: LruTtlCache<String, UserId>,

    stats: Arc<CacheStats>,
    config: KeysetCacheConfig,
}

impl KeysetCache {
    pub fn new(config: KeysetCacheConfig) -> Self {
        let stats = Arc::new(CacheStats::default());
        Self {
            parsed_keys: LruTtlCache::new(config.parsed_key_capacity, config.ttl, stats.clone()),
            keysets: LruTtlCache::new(config.keyset_capacity, config.ttl, stats.clone()),
            key_owners: LruTtlCache::new(config.key_owner_capacity, config.ttl, stats.clone()),
            stats,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(KeysetCacheConfig::default())
    }

    pub fn config(&self) -> &KeysetCacheConfig {
        &self.config
    }

    /// Cache every key of a keyset in the key and owner indices.
    pub fn put_keys(&self, keyset: &Keyset) {
        for key in keyset.keys() {
            self.parsed_keys
                .put(key.key_id().to_string(), key.clone());
            self.key_owners
                .put(key.key_id().to_string(), keyset.user_id());
        }
    }

    /// Drop a key-id from the key and owner indices.
    pub fn forget_key(&self, key_id: &str) {
        let key_id = key_id.to_string();
        self.parsed_keys.remove(&key_id);
        self.key_owners.remove(&key_id);
    }

    /// Key-ids the reverse index attributes to `user_id`.
    pub fn key_ids_owned_by(&self, user_id: UserId) -> Vec<String> {
        self.key_owners.keys_matching(|owner| *owner == user_id)
    }

    /// Sweep all three indices, returning the total removed.
    pub fn cleanup_expired(&self) -> usize {
        self.parsed_keys.cleanup_expired()
            + self.keysets.cleanup_expired()
            + self.key_owners.cleanup_expired()
    }

    pub fn sizes(&self) -> CacheSizes {
        CacheSizes {
            parsed_keys: self.parsed_keys.len(),
            keysets: self.keysets.len(),
            key_owners: self.key_owners.len(),
        }
    }

    pub fn metrics(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.stats.reset();
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth::from_stats(self.stats.snapshot())
    }

    /// Drop every entry in every index.
    pub fn clear(&self) {
        self.parsed_keys.clear();
        self.keysets.clear();
        self.key_owners.clear();
    }
}

impl Default for KeysetCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// Tests
// =============================================================================
