//! RS256 token issuance and verification.
//!
//! Every token is signed with the private key of one device session. The
//! key-id travels in the `kid` claim (and the header); verification resolves
//! the matching public key through the session key manager, so deleting the
//! device key revokes every token it signed.
//!
//! Verification errors are categorical: malformed, bad signature, expired
//! and unknown key are distinct [`AuthError`] variants.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::keys::codec;
use crate::keys::SessionKeyManager;
use crate::types::{AuthError, Result, UserId};

// =============================================================================
// Constants
// =============================================================================

/// Longest accepted token validity (1 year)
pub const MAX_TOKEN_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Largest accepted serialized size of the extra claims (10 KiB)
pub const MAX_EXTRA_CLAIMS_BYTES: usize = 10 * 1024;

/// Claim names owned by the token format
pub const RESERVED_CLAIMS: [&str; 6] = ["user_id", "username", "token_type", "iat", "exp", "kid"];

// =============================================================================
// Configuration
// =============================================================================

/// Token lifetimes.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Access token validity
    pub access_ttl: Duration,

    /// Refresh token validity
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(15 * 60),            // 15 minutes
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

impl TokenConfig {
    pub fn validate(&self) -> Result<()> {
        validate_validity(self.access_ttl)?;
        validate_validity(self.refresh_ttl)?;
        Ok(())
    }
}

// =============================================================================
// Claims
// =============================================================================

/// Access or refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => write!(f, "access"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// Claim set of an issued token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,

    /// Present on access tokens only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    pub token_type: TokenType,

    /// Issued at (Unix seconds)
    pub iat: i64,

    /// Expiration (Unix seconds)
    pub exp: i64,

    /// Signing device key
    pub kid: String,

    /// Caller-supplied claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Claims supplied by the caller; timestamps and `kid` are stamped on issue.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub user_id: UserId,
    pub username: Option<String>,
    pub token_type: TokenType,
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// Access token claims: user id and username.
    pub fn access(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: Some(username.into()),
            token_type: TokenType::Access,
            extra: Map::new(),
        }
    }

    /// Refresh token claims: user id only.
    pub fn refresh(user_id: UserId) -> Self {
        Self {
            user_id,
            username: None,
            token_type: TokenType::Refresh,
            extra: Map::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Extra claims may not shadow reserved names or exceed the size cap.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self
            .extra
            .keys()
            .find(|name| RESERVED_CLAIMS.contains(&name.as_str()))
        {
            return Err(AuthError::InvalidInput(format!(
                "claim '{name}' is reserved"
            )));
        }

        let size = serde_json::to_vec(&self.extra)?.len();
        if size > MAX_EXTRA_CLAIMS_BYTES {
            return Err(AuthError::InvalidInput(format!(
                "extra claims are {size} bytes, limit is {MAX_EXTRA_CLAIMS_BYTES}"
            )));
        }

        Ok(())
    }
}

fn validate_validity(validity: Duration) -> Result<()> {
    if validity.is_zero() {
        return Err(AuthError::InvalidInput("token validity must be positive".into()));
    }
    if validity > MAX_TOKEN_VALIDITY {
        return Err(AuthError::InvalidInput(
            "token validity cannot exceed one year".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Key-Id Extraction
// =============================================================================

/// Read `kid` from a token's claims without checking the signature.
pub fn extract_key_id(token: &str) -> Result<String> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::MalformedToken(
            "token must have three segments".into(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {e}")))?;

    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedToken(format!("payload is not JSON: {e}")))?;

    match claims.get("kid") {
        Some(Value::String(kid)) if !kid.is_empty() => Ok(kid.clone()),
        Some(_) => Err(AuthError::MalformedToken(
            "'kid' claim must be a non-empty string".into(),
        )),
        None => Err(AuthError::MalformedToken("token has no 'kid' claim".into())),
    }
}

// =============================================================================
// JWT Service
// =============================================================================

/// Issues and verifies tokens signed by device session keys.
#[derive(Clone)]
pub struct JwtService {
    manager: Arc<SessionKeyManager>,
    config: TokenConfig,
    validation: Validation,
}

impl JwtService {
    pub fn new(manager: Arc<SessionKeyManager>, config: TokenConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AuthError::Config(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        // Expiry is checked after signature verification so the two
        // failures stay distinguishable
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;
        // Audience is an ordinary extra claim; callers apply their own policy
        validation.validate_aud = false;

        Ok(Self {
            manager,
            config,
            validation,
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Sign `claims` with the device key `key_id`.
    pub async fn issue(&self, claims: TokenClaims, key_id: &str, validity: Duration) -> Result<String> {
        validate_validity(validity)?;
        claims.validate()?;

        let key = self
            .manager
            .get_signing_key(key_id)
            .await
            .map_err(|e| AuthError::SigningKeyUnavailable(format!("{key_id}: {e}")))?;
        let encoding_key = key
            .encoding_key()
            .map_err(|e| AuthError::SigningKeyUnavailable(format!("{key_id}: {e}")))?;

        let iat = Utc::now().timestamp();
        let exp = iat.saturating_add(validity.as_secs() as i64);

        let full = Claims {
            user_id: claims.user_id,
            username: claims.username,
            token_type: claims.token_type,
            iat,
            exp,
            kid: key_id.to_string(),
            extra: claims.extra,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key_id.to_string());

        let token = encode(&header, &full, &encoding_key)
            .map_err(|e| AuthError::Codec(format!("Failed to sign token: {}", e)))?;

        debug!(user_id = full.user_id, key_id, token_type = %full.token_type, "Issued token");
        Ok(token)
    }

    /// Issue an access token with the configured lifetime.
    pub async fn issue_access(&self, user_id: UserId, username: &str, key_id: &str) -> Result<String> {
        self.issue(TokenClaims::access(user_id, username), key_id, self.config.access_ttl)
            .await
    }

    /// Issue a refresh token with the configured lifetime.
    pub async fn issue_refresh(&self, user_id: UserId, key_id: &str) -> Result<String> {
        self.issue(TokenClaims::refresh(user_id), key_id, self.config.refresh_ttl)
            .await
    }

    /// Verify signature and expiry, returning the claims.
    ///
    /// An unknown `kid` surfaces as `KeyNotFound`.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let key_id = extract_key_id(token)?;

        let public = self.manager.get_public_key(&key_id).await?;
        let decoding_key = codec::decoding_key(&public)?;

        let data = decode::<Claims>(token, &decoding_key, &self.validation)?;
        let claims = data.claims;

        if claims.kid != key_id {
            return Err(AuthError::MalformedToken("'kid' claim mismatch".into()));
        }
        if let Some(header_kid) = &data.header.kid {
            if header_kid != &key_id {
                return Err(AuthError::MalformedToken(
                    "header 'kid' does not match claims".into(),
                ));
            }
        }

        if Utc::now().timestamp() > claims.exp {
            return Err(AuthError::TokenExpired);
        }

        Ok(claims)
    }

    /// Verify and require a specific token type.
    pub async fn verify_as(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.verify(token).await?;
        if claims.token_type != expected {
            return Err(AuthError::InvalidTokenType {
                expected: expected.to_string(),
                actual: claims.token_type.to_string(),
            });
        }
        Ok(claims)
    }
}

// =============================================================================
// Tests
// =============================================================================
