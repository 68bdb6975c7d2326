//! Error types for jwk-auth
//!
//! Absence (`NotFound`, `KeyNotFound`) is an expected outcome and is kept
//! apart from corruption and I/O failures so callers can branch on it.

/// Main error type for session-key and token operations
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token signature is invalid")]
    SignatureInvalid,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Signing key unavailable: {0}")]
    SigningKeyUnavailable(String),

    #[error("Invalid token type: expected {expected}, got {actual}")]
    InvalidTokenType { expected: String, actual: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// True for the "absent" family of errors (row or key does not exist).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::KeyNotFound(_))
    }

    /// True for failures on the token verification path.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::MalformedToken(_)
                | Self::SignatureInvalid
                | Self::TokenExpired
                | Self::InvalidTokenType { .. }
        )
    }
}

// Implement From conversions for common error types

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for AuthError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<rsa::Error> for AuthError {
    fn from(err: rsa::Error) -> Self {
        Self::Codec(format!("RSA error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            _ => Self::MalformedToken(format!("JWT error: {}", err)),
        }
    }
}

/// Result type alias for jwk-auth operations
pub type Result<T> = std::result::Result<T, AuthError>;
