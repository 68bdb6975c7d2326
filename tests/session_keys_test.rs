//! Integration tests for the session key manager
//!
//! Exercises the single-device rule, cache coherence and failure handling
//! against the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jwk_auth::db::{KeysetRecord, MemoryKeysetStore, SessionKeyStore};
use jwk_auth::keys::{
    spawn_cleanup_task, KeyEvent, KeyManagerConfig, KeysetCacheConfig, SessionKeyManager,
};
use jwk_auth::types::UserId;
use jwk_auth::AuthError;

/// Store wrapper whose writes can be switched to fail
#[derive(Default)]
struct FailingStore {
    inner: MemoryKeysetStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> jwk_auth::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AuthError::Persistence("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionKeyStore for FailingStore {
    async fn save(&self, user_id: UserId, key_data: &str) -> jwk_auth::Result<()> {
        self.check()?;
        self.inner.save(user_id, key_data).await
    }

    async fn load(&self, user_id: UserId) -> jwk_auth::Result<KeysetRecord> {
        self.inner.load(user_id).await
    }

    async fn delete(&self, user_id: UserId) -> jwk_auth::Result<()> {
        self.check()?;
        self.inner.delete(user_id).await
    }

    async fn load_all(&self) -> jwk_auth::Result<Vec<KeysetRecord>> {
        self.inner.load_all().await
    }
}

/// Helper to create a manager over a fresh in-memory store
fn create_manager() -> (Arc<MemoryKeysetStore>, Arc<SessionKeyManager>) {
    let store = Arc::new(MemoryKeysetStore::new());
    let manager = SessionKeyManager::new(store.clone(), KeyManagerConfig::default()).unwrap();
    (store, Arc::new(manager))
}

fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

#[tokio::test]
async fn test_single_key_per_category() {
    let (_store, manager) = create_manager();

    for _ in 0..3 {
        manager.create_session_key(7, "web").await.unwrap();
    }

    let keys = manager.list_session_keys(7).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("web-7-"));

    let public = manager.get_public_keys_for_user(7).await.unwrap();
    let web_keys = public
        .keys
        .iter()
        .filter(|k| k.device_category() == Some("web"))
        .count();
    assert_eq!(web_keys, 1);
}

#[tokio::test]
async fn test_categories_are_independent() {
    let (_store, manager) = create_manager();

    let android = manager.create_session_key(7, "android").await.unwrap();
    let web_first = manager.create_session_key(7, "web").await.unwrap();
    let web_second = manager.create_session_key(7, "web").await.unwrap();

    let keys = sorted(manager.list_session_keys(7).await.unwrap());
    assert_eq!(keys, sorted(vec![android.clone(), web_second]));

    // The android key is untouched by web rotations
    let key = manager.get_signing_key(&android).await.unwrap();
    assert_eq!(key.device_category(), "android");
    assert!(manager.get_signing_key(&web_first).await.is_err());
}

#[tokio::test]
async fn test_users_are_independent() {
    let (_store, manager) = create_manager();

    let alice = manager.create_session_key(1, "web").await.unwrap();
    let bob = manager.create_session_key(2, "web").await.unwrap();

    manager.delete_session_key(1, &alice).await.unwrap();

    assert!(manager.list_session_keys(1).await.unwrap().is_empty());
    assert_eq!(manager.list_session_keys(2).await.unwrap(), vec![bob]);

    // A user cannot delete another user's key
    let carol = manager.create_session_key(3, "web").await.unwrap();
    assert!(matches!(
        manager.delete_session_key(2, &carol).await,
        Err(AuthError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_cache_transparency() {
    let (store, manager) = create_manager();

    let web = manager.create_session_key(5, "web").await.unwrap();
    let ios = manager.create_session_key(5, "ios").await.unwrap();
    manager.create_session_key(6, "web").await.unwrap();

    let warm_list = sorted(manager.list_session_keys(5).await.unwrap());
    let warm_public = manager.get_public_keys_for_user(5).await.unwrap();
    let warm_key = manager.get_signing_key(&web).await.unwrap().public_jwk();

    // Fully cold
    manager.cache().clear();
    assert_eq!(manager.get_signing_key(&web).await.unwrap().public_jwk(), warm_key);
    manager.cache().clear();
    assert_eq!(sorted(manager.list_session_keys(5).await.unwrap()), warm_list);
    manager.cache().clear();
    let mut cold_public = manager.get_public_keys_for_user(5).await.unwrap();
    let mut warm_sorted = warm_public.clone();
    cold_public.keys.sort_by(|a, b| a.kid.cmp(&b.kid));
    warm_sorted.keys.sort_by(|a, b| a.kid.cmp(&b.kid));
    assert_eq!(cold_public, warm_sorted);

    // Partially populated: only the reverse index survives
    manager.cache().clear();
    manager.cache().key_owners.put(ios.clone(), 5);
    assert_eq!(manager.get_signing_key(&ios).await.unwrap().key_id(), ios);

    // Incoherent: reverse index points at the wrong owner
    manager.cache().clear();
    manager.cache().key_owners.put(web.clone(), 6);
    assert_eq!(manager.get_signing_key(&web).await.unwrap().key_id(), web);
    assert_eq!(manager.cache().key_owners.get(&web), Some(5));

    // Reverse index points at an owner whose row no longer decodes
    store.insert_record(KeysetRecord {
        user_id: 6,
        key_data: "{not json".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });
    manager.cache().clear();
    manager.cache().key_owners.put(web.clone(), 6);
    assert_eq!(manager.get_signing_key(&web).await.unwrap().key_id(), web);
    assert_eq!(manager.cache().key_owners.get(&web), Some(5));
}

#[tokio::test]
async fn test_deletion_completeness() {
    let (store, manager) = create_manager();

    let web = manager.create_session_key(9, "web").await.unwrap();
    let ios = manager.create_session_key(9, "ios").await.unwrap();

    manager.delete_session_key(9, &web).await.unwrap();
    assert!(matches!(
        manager.get_signing_key(&web).await,
        Err(AuthError::KeyNotFound(_))
    ));
    assert_eq!(store.len(), 1);

    manager.delete_session_key(9, &ios).await.unwrap();
    assert!(matches!(
        manager.get_signing_key(&ios).await,
        Err(AuthError::KeyNotFound(_))
    ));
    assert!(manager.list_session_keys(9).await.unwrap().is_empty());
    assert!(matches!(store.load(9).await, Err(AuthError::NotFound(_))));

    // Deleting from an absent user is a precise error, not a crash
    assert!(matches!(
        manager.delete_session_key(9, &ios).await,
        Err(AuthError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_save_leaves_state_untouched() {
    let store = Arc::new(FailingStore::default());
    let manager = SessionKeyManager::new(store.clone(), KeyManagerConfig::default()).unwrap();

    let original = manager.create_session_key(4, "web").await.unwrap();
    let sizes_before = manager.cache().sizes();

    store.set_failing(true);
    assert!(matches!(
        manager.create_session_key(4, "web").await,
        Err(AuthError::Persistence(_))
    ));
    assert!(matches!(
        manager.create_session_key(4, "ios").await,
        Err(AuthError::Persistence(_))
    ));
    assert!(matches!(
        manager.delete_session_key(4, &original).await,
        Err(AuthError::Persistence(_))
    ));

    assert_eq!(manager.cache().sizes(), sizes_before);
    assert_eq!(manager.list_session_keys(4).await.unwrap(), vec![original.clone()]);
    assert!(manager.get_signing_key(&original).await.is_ok());

    // And the store agrees once the cache is gone
    store.set_failing(false);
    manager.cache().clear();
    assert_eq!(manager.list_session_keys(4).await.unwrap(), vec![original]);
}

#[tokio::test]
async fn test_corrupt_rows_are_skipped_in_scans() {
    let (store, manager) = create_manager();
    let kid = manager.create_session_key(1, "web").await.unwrap();

    store.insert_record(KeysetRecord {
        user_id: 2,
        key_data: "{not json".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });

    let all = manager.get_all_public_keys().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all.keys.iter().all(|k| !k.is_private()));

    manager.cache().clear();
    assert_eq!(manager.get_signing_key(&kid).await.unwrap().key_id(), kid);
    assert!(matches!(
        manager.get_signing_key("web-2-missing").await,
        Err(AuthError::KeyNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_do_not_lose_updates() {
    let (store, manager) = create_manager();

    let categories = ["web", "ios", "android", "desktop"];
    let mut handles = Vec::new();
    for category in categories {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.create_session_key(11, category).await
        }));
    }

    let mut created = Vec::new();
    for handle in handles {
        created.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(
        sorted(manager.list_session_keys(11).await.unwrap()),
        sorted(created.clone())
    );

    manager.cache().clear();
    let record = store.load(11).await.unwrap();
    for kid in &created {
        assert!(record.key_data.contains(kid.as_str()));
    }
}

#[tokio::test]
async fn test_lifecycle_events() {
    let (_store, manager) = create_manager();
    let mut events = manager.subscribe();

    let first = manager.create_session_key(3, "web").await.unwrap();
    let second = manager.create_session_key(3, "web").await.unwrap();
    manager.delete_session_key(3, &second).await.unwrap();

    match events.recv().await.unwrap() {
        KeyEvent::SessionKeyCreated {
            key_id,
            replaced_key_id,
            ..
        } => {
            assert_eq!(key_id, first);
            assert!(replaced_key_id.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }

    match events.recv().await.unwrap() {
        KeyEvent::SessionKeyCreated {
            key_id,
            replaced_key_id,
            ..
        } => {
            assert_eq!(key_id, second);
            assert_eq!(replaced_key_id, Some(first));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(
        events.recv().await.unwrap(),
        KeyEvent::SessionKeyDeleted {
            keyset_removed: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cleanup_task_sweeps_expired_entries() {
    let store = Arc::new(MemoryKeysetStore::new());
    let config = KeyManagerConfig {
        cache: KeysetCacheConfig {
            ttl: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    };
    let manager = Arc::new(SessionKeyManager::new(store, config).unwrap());

    let kid = manager.create_session_key(1, "web").await.unwrap();
    let handle = spawn_cleanup_task(manager.clone(), Duration::from_millis(20));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let sizes = manager.cache().sizes();
    assert_eq!(sizes.parsed_keys, 0);
    assert_eq!(sizes.keysets, 0);
    assert_eq!(sizes.key_owners, 0);
    assert!(manager.cache_metrics().expired_cleanups >= 3);

    // Still resolvable through the store
    assert_eq!(manager.get_signing_key(&kid).await.unwrap().key_id(), kid);

    handle.abort();
}
