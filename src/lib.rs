//! jwk-auth - per-device session keys for JWT authentication
//!
//! Every user owns one keyset holding at most one RSA key per device
//! category (`web`, `android`, `ios`, ...). Logging in on a device category
//! creates a fresh key and signs the token pair with it; logging in again
//! on the same category replaces the key, which invalidates every token the
//! old key signed.
//!
//! ## Components
//!
//! - **Keys**: JWK codec, keyset model, LRU+TTL cache and the session key
//!   manager enforcing the single-device-login rule
//! - **Storage**: keyset rows in MongoDB or in memory
//! - **Auth**: RS256 issuance/verification and the login, logout, refresh
//!   and verify flows

pub mod auth;
pub mod config;
pub mod db;
pub mod keys;
pub mod types;

pub use auth::{AuthService, JwtService, TokenPair, UserIdentity};
pub use config::Args;
pub use keys::SessionKeyManager;
pub use types::{AuthError, Result};
