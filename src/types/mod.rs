//! Shared types for jwk-auth

pub mod error;

pub use error::{AuthError, Result};

/// Numeric user identifier, the primary key of a keyset record.
pub type UserId = u64;
