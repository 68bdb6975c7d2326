//! Durable keyset storage contract.
//!
//! One row per user holding the (possibly sealed) serialized JWK Set. The
//! store is the consistency anchor; every cache entry is derived from it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{AuthError, Result, UserId};

/// A stored keyset row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetRecord {
    pub user_id: UserId,

    /// Serialized JWK Set, in the form produced by the configured cipher
    pub key_data: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for user keysets.
#[async_trait]
pub trait SessionKeyStore: Send + Sync {
    /// Upsert the keyset row for a user.
    ///
    /// `created_at` is kept on overwrite; `updated_at` moves to now.
    async fn save(&self, user_id: UserId, key_data: &str) -> Result<()>;

    /// Load one user's row, or `NotFound`.
    async fn load(&self, user_id: UserId) -> Result<KeysetRecord>;

    /// Hard-delete one user's row, or `NotFound`.
    async fn delete(&self, user_id: UserId) -> Result<()>;

    /// Every row in the store.
    async fn load_all(&self) -> Result<Vec<KeysetRecord>>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Store backed by a concurrent map. Used for tests and `--memory-store`.
#[derive(Debug, Default)]
pub struct MemoryKeysetStore {
    rows: DashMap<UserId, KeysetRecord>,
}

impl MemoryKeysetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row verbatim, bypassing the save path.
    pub fn insert_record(&self, record: KeysetRecord) {
        self.rows.insert(record.user_id, record);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SessionKeyStore for MemoryKeysetStore {
    async fn save(&self, user_id: UserId, key_data: &str) -> Result<()> {
        let now = Utc::now();
        self.rows
            .entry(user_id)
            .and_modify(|row| {
                row.key_data = key_data.to_string();
                row.updated_at = now;
            })
            .or_insert_with(|| KeysetRecord {
                user_id,
                key_data: key_data.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn load(&self, user_id: UserId) -> Result<KeysetRecord> {
        self.rows
            .get(&user_id)
            .map(|row| row.value().clone())
            .ok_or_else(|| AuthError::NotFound(format!("keyset for user {user_id}")))
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.rows
            .remove(&user_id)
            .map(|_| ())
            .ok_or_else(|| AuthError::NotFound(format!("keyset for user {user_id}")))
    }

    async fn load_all(&self) -> Result<Vec<KeysetRecord>> {
        Ok(self.rows.iter().map(|row| row.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryKeysetStore::new();
        store.save(1, r#"{"keys":[]}"#).await.unwrap();

        let row = store.load(1).await.unwrap();
        assert_eq!(row.user_id, 1);
        assert_eq!(row.key_data, r#"{"keys":[]}"#);
    }

    #[tokio::test]
    async fn test_save_preserves_created_at() {
        let store = MemoryKeysetStore::new();
        store.save(1, "a").await.unwrap();
        let first = store.load(1).await.unwrap();

        store.save(1, "b").await.unwrap();
        let second = store.load(1).await.unwrap();

        assert_eq!(second.key_data, "b");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let store = MemoryKeysetStore::new();
        assert!(matches!(store.load(9).await, Err(AuthError::NotFound(_))));
        assert!(matches!(store.delete(9).await, Err(AuthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_and_load_all() {
        let store = MemoryKeysetStore::new();
        store.save(1, "a").await.unwrap();
        store.save(2, "b").await.unwrap();

        store.delete(1).await.unwrap();

        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 2);
    }
}
