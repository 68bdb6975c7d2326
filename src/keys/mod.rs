//! Per-device session keys
//!
//! Every user owns one keyset with at most one RSA key per device category.
//! Tokens are signed with the key of the device session that requested
//! them, so logging a device out revokes exactly its tokens.
//!
//! ## Components
//!
//! - **codec**: RSA generation and JWK import/export
//! - **keyset**: device key and keyset model, key-id grammar
//! - **crypto**: optional sealing of stored keysets
//! - **cache**: three-index LRU+TTL cache
//! - **manager**: lifecycle, lookups and cache coherence
//! - **events**: lifecycle event broadcast

pub mod cache;
pub mod codec;
pub mod crypto;
pub mod events;
pub mod jwk;
pub mod keyset;
pub mod manager;

pub use cache::{CacheHealth, CacheStatsSnapshot, KeysetCache, KeysetCacheConfig};
pub use crypto::{ChaChaKeysetCipher, KeysetCipher, PlaintextCipher};
pub use events::KeyEvent;
pub use jwk::{Jwk, JwkSet};
pub use keyset::{DeviceKey, Keyset};
pub use manager::{spawn_cleanup_task, KeyManagerConfig, SessionKeyManager};
