//! Keyset persistence
//!
//! [`SessionKeyStore`] is the storage contract; [`MemoryKeysetStore`] and
//! [`MongoKeysetStore`] implement it.

pub mod mongo;
pub mod schemas;
pub mod store;

pub use mongo::{MongoClient, MongoKeysetStore};
pub use store::{KeysetRecord, MemoryKeysetStore, SessionKeyStore};
