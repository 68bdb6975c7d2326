//! Session key manager.
//!
//! Owns the "one active key per device category" rule for every user and
//! mediates between the codec, the durable store and the keyset cache.
//!
//! # Consistency
//!
//! - Mutations of one user's keyset run under a per-user async mutex held
//!   across load, modify, persist and cache update.
//! - The store is written before the cache; a failed write leaves the cache
//!   exactly as it was.
//! - Cache misses that populate the keyset index also take the user lock, so
//!   a reader can never reinstall a keyset a concurrent writer just replaced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::store::{KeysetRecord, SessionKeyStore};
use crate::types::{AuthError, Result, UserId};

use super::cache::{CacheHealth, CacheStatsSnapshot, KeysetCache, KeysetCacheConfig};
use super::codec::{self, DEFAULT_KEY_BITS, MIN_KEY_BITS};
use super::crypto::{KeysetCipher, PlaintextCipher};
use super::events::{KeyEvent, KeyEventPublisher};
use super::jwk::{Jwk, JwkSet};
use super::keyset::{validate_device_category, DeviceKey, Keyset};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the session key manager.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// RSA modulus size for new device keys
    pub key_bits: usize,

    /// Cache sizing and expiry
    pub cache: KeysetCacheConfig,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            cache: KeysetCacheConfig::default(),
        }
    }
}

// =============================================================================
// Per-User Locks
// =============================================================================

/// Holds one user's mutation lock; drops the map entry once unused.
struct UserLock<'a> {
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// =============================================================================
// Session Key Manager
// =============================================================================

/// Manages the lifecycle of per-device session keys.
pub struct SessionKeyManager {
    store: Arc<dyn SessionKeyStore>,
    cache: Arc<KeysetCache>,
    cipher: Arc<dyn KeysetCipher>,
    key_bits: usize,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
    events: KeyEventPublisher,
}

impl SessionKeyManager {
    /// Create a manager storing keysets as plain JWK Set JSON.
    pub fn new(store: Arc<dyn SessionKeyStore>, config: KeyManagerConfig) -> Result<Self> {
        if config.key_bits < MIN_KEY_BITS {
            return Err(AuthError::Config(format!(
                "key size {} is below the minimum of {MIN_KEY_BITS} bits",
                config.key_bits
            )));
        }

        Ok(Self {
            store,
            cache: Arc::new(KeysetCache::new(config.cache)),
            cipher: Arc::new(PlaintextCipher),
            key_bits: config.key_bits,
            user_locks: DashMap::new(),
            events: KeyEventPublisher::new(),
        })
    }

    /// Seal stored keysets with `cipher`.
    pub fn with_cipher(mut self, cipher: Arc<dyn KeysetCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn cache(&self) -> &Arc<KeysetCache> {
        &self.cache
    }

    /// Subscribe to key lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Create a fresh key for `(user_id, device_category)`, replacing any
    /// existing key of that category. Returns the new key-id.
    pub async fn create_session_key(&self, user_id: UserId, device_category: &str) -> Result<String> {
        validate_device_category(device_category)?;

        let _lock = self.lock_user(user_id).await;

        let mut keyset = match self.fetch_keyset(user_id, false).await? {
            Some(current) => (*current).clone(),
            None => Keyset::new(user_id),
        };

        let replaced = keyset.remove_category(device_category);

        let bits = self.key_bits;
        let category = device_category.to_string();
        let key = tokio::task::spawn_blocking(move || DeviceKey::generate(user_id, &category, bits))
            .await
            .map_err(|e| AuthError::Generation(format!("key generation task failed: {e}")))??;
        let key = Arc::new(key);
        let key_id = key.key_id().to_string();

        keyset.insert(key.clone());
        self.persist(&keyset).await?;

        if let Some(old) = &replaced {
            self.cache.forget_key(old.key_id());
        }
        self.cache.keysets.put(user_id, Arc::new(keyset));
        self.cache.parsed_keys.put(key_id.clone(), key);
        self.cache.key_owners.put(key_id.clone(), user_id);

        let replaced_key_id = replaced.map(|k| k.key_id().to_string());
        info!(
            user_id,
            key_id = %key_id,
            device_category,
            replaced = ?replaced_key_id,
            "Created session key"
        );

        self.events.publish(KeyEvent::SessionKeyCreated {
            user_id,
            key_id: key_id.clone(),
            device_category: device_category.to_string(),
            replaced_key_id,
            at: Utc::now(),
        });

        Ok(key_id)
    }

    /// Delete one device key. `KeyNotFound` if the user has no such key.
    pub async fn delete_session_key(&self, user_id: UserId, key_id: &str) -> Result<()> {
        let _lock = self.lock_user(user_id).await;

        let Some(current) = self.fetch_keyset(user_id, false).await? else {
            return Err(AuthError::KeyNotFound(format!(
                "user {user_id} has no session keys"
            )));
        };

        let mut keyset = (*current).clone();
        if keyset.remove_key_id(key_id).is_none() {
            return Err(AuthError::KeyNotFound(format!(
                "key {key_id} does not belong to user {user_id}"
            )));
        }

        let keyset_removed = keyset.is_empty();
        if keyset_removed {
            match self.store.delete(user_id).await {
                Ok(()) | Err(AuthError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            self.cache.keysets.remove(&user_id);
        } else {
            self.persist(&keyset).await?;
            self.cache.keysets.put(user_id, Arc::new(keyset));
        }

        self.cache.forget_key(key_id);

        info!(user_id, key_id, keyset_removed, "Deleted session key");

        self.events.publish(KeyEvent::SessionKeyDeleted {
            user_id,
            key_id: key_id.to_string(),
            keyset_removed,
            at: Utc::now(),
        });

        Ok(())
    }

    /// Key-ids of every active device key of a user. Empty if none.
    pub async fn list_session_keys(&self, user_id: UserId) -> Result<Vec<String>> {
        Ok(self
            .load_keyset(user_id)
            .await?
            .map(|keyset| keyset.key_ids())
            .unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Resolve the device key holding the private material for `key_id`.
    pub async fn get_signing_key(&self, key_id: &str) -> Result<Arc<DeviceKey>> {
        let cache_key = key_id.to_string();

        if let Some(key) = self.cache.parsed_keys.get(&cache_key) {
            return Ok(key);
        }

        if let Some(owner) = self.cache.key_owners.get(&cache_key) {
            match self.resolve_in_owner(owner, key_id).await {
                Ok(Some(key)) => return Ok(key),
                Ok(None) => debug!(key_id, owner, "Reverse index entry is stale"),
                Err(e) => warn!(key_id, owner, error = %e, "Cached owner keyset is unreadable"),
            }
            self.cache.key_owners.remove(&cache_key);
        }

        debug!(key_id, "Falling back to full keyset scan");
        for record in self.store.load_all().await? {
            let user_id = record.user_id;
            let keyset = match self.decode_record(record) {
                Ok(keyset) => keyset,
                Err(e) => {
                    warn!(user_id, error = %e, "Skipping corrupt keyset during scan");
                    continue;
                }
            };

            if keyset.find_by_key_id(key_id).is_some() {
                match self.resolve_in_owner(user_id, key_id).await {
                    Ok(Some(key)) => return Ok(key),
                    Ok(None) => {}
                    Err(e) => warn!(user_id, error = %e, "Skipping keyset that failed to reload"),
                }
            }
        }

        Err(AuthError::KeyNotFound(key_id.to_string()))
    }

    /// Public half of the key identified by `key_id`.
    pub async fn get_public_key(&self, key_id: &str) -> Result<Jwk> {
        Ok(self.get_signing_key(key_id).await?.public_jwk())
    }

    /// Public keys of one user. Empty set if the user has none.
    pub async fn get_public_keys_for_user(&self, user_id: UserId) -> Result<JwkSet> {
        let keys = self
            .load_keyset(user_id)
            .await?
            .map(|keyset| keyset.public_jwks())
            .unwrap_or_default();
        Ok(JwkSet::new(keys))
    }

    /// Public keys of every user, skipping corrupt rows and keys.
    pub async fn get_all_public_keys(&self) -> Result<JwkSet> {
        let mut keys = Vec::new();
        for record in self.store.load_all().await? {
            let user_id = record.user_id;
            match self.decode_record(record) {
                Ok(keyset) => keys.extend(keyset.public_jwks()),
                Err(e) => warn!(user_id, error = %e, "Skipping corrupt keyset during export"),
            }
        }
        Ok(JwkSet::new(keys))
    }

    // -------------------------------------------------------------------------
    // Cache Maintenance
    // -------------------------------------------------------------------------

    /// Drop a user's cache entries and reload them from the store.
    ///
    /// Returns the number of keys now cached for the user.
    pub async fn prime_cache_for_user(&self, user_id: UserId) -> Result<usize> {
        let _lock = self.lock_user(user_id).await;

        for key_id in self.cache.key_ids_owned_by(user_id) {
            self.cache.forget_key(&key_id);
        }
        self.cache.keysets.remove(&user_id);

        let key_count = match self.load_from_store(user_id, true).await? {
            Some(keyset) => {
                self.cache.put_keys(&keyset);
                keyset.len()
            }
            None => 0,
        };

        info!(user_id, key_count, "Primed keyset cache");

        self.events.publish(KeyEvent::CachePrimed {
            user_id,
            key_count,
            at: Utc::now(),
        });

        Ok(key_count)
    }

    /// Sweep expired cache entries.
    pub fn cleanup_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }

    pub fn cache_metrics(&self) -> CacheStatsSnapshot {
        self.cache.metrics()
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.cache.health()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn lock_user(&self, user_id: UserId) -> UserLock<'_> {
        let lock = self.user_locks.entry(user_id).or_default().clone();
        let guard = lock.lock_owned().await;
        UserLock {
            locks: &self.user_locks,
            user_id,
            guard: Some(guard),
        }
    }

    /// Cached keyset, or a store load under the user lock.
    async fn load_keyset(&self, user_id: UserId) -> Result<Option<Arc<Keyset>>> {
        if let Some(keyset) = self.cache.keysets.get(&user_id) {
            return Ok(Some(keyset));
        }

        let _lock = self.lock_user(user_id).await;
        self.load_from_store(user_id, true).await
    }

    /// Cached keyset or store load. Caller holds the user lock.
    async fn fetch_keyset(&self, user_id: UserId, populate: bool) -> Result<Option<Arc<Keyset>>> {
        if let Some(keyset) = self.cache.keysets.get(&user_id) {
            return Ok(Some(keyset));
        }
        self.load_from_store(user_id, populate).await
    }

    async fn load_from_store(&self, user_id: UserId, populate: bool) -> Result<Option<Arc<Keyset>>> {
        let record = match self.store.load(user_id).await {
            Ok(record) => record,
            Err(AuthError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let keyset = Arc::new(self.decode_record(record)?);
        if populate {
            self.cache.keysets.put(user_id, keyset.clone());
        }
        Ok(Some(keyset))
    }

    /// Look for `key_id` in its owner's keyset, caching it on success.
    async fn resolve_in_owner(&self, owner: UserId, key_id: &str) -> Result<Option<Arc<DeviceKey>>> {
        let _lock = self.lock_user(owner).await;

        let Some(keyset) = self.fetch_keyset(owner, true).await? else {
            return Ok(None);
        };

        let Some(key) = keyset.find_by_key_id(key_id).cloned() else {
            return Ok(None);
        };

        self.cache.parsed_keys.put(key_id.to_string(), key.clone());
        self.cache.key_owners.put(key_id.to_string(), owner);
        Ok(Some(key))
    }

    fn decode_record(&self, record: KeysetRecord) -> Result<Keyset> {
        let plaintext = self.cipher.open(&record.key_data)?;
        let set = codec::parse_set(&plaintext)?;
        Ok(Keyset::from_jwk_set(
            record.user_id,
            set,
            record.created_at,
            record.updated_at,
        ))
    }

    async fn persist(&self, keyset: &Keyset) -> Result<()> {
        let serialized = codec::serialize_set(&keyset.to_jwk_set())?;
        let key_data = self.cipher.seal(&serialized)?;
        self.store.save(keyset.user_id(), &key_data).await
    }
}

// =============================================================================
// Background Cleanup Task
// =============================================================================

/// Spawn a background task that periodically sweeps expired cache entries.
pub fn spawn_cleanup_task(manager: Arc<SessionKeyManager>, interval: Duration) -> JoinHandle<()> {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = manager.cleanup_expired();
            let health = manager.cache_health();
            debug!(
                removed,
                hit_rate = format!("{:.1}%", health.hit_rate * 100.0),
                evictions = health.evictions,
                needs_attention = health.needs_attention(),
                "Keyset cache cleanup completed"
            );
        }
    });

    info!(
        interval_secs = interval.as_secs(),
        "Keyset cache cleanup task started"
    );

    handle
}

// =============================================================================
// Tests
// =============================================================================
