//! Token issuance, verification and the authentication flows built on them

pub mod jwt;
pub mod service;

pub use jwt::{extract_key_id, Claims, JwtService, TokenClaims, TokenConfig, TokenType};
pub use service::{AuthService, TokenPair, UserIdentity};
