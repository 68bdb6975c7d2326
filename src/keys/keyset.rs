//! Keyset and device key model.
//!
//! A user owns exactly one [`Keyset`], holding at most one [`DeviceKey`] per
//! device category. Key identifiers follow
//! `{deviceCategory}-{userID}-{nonce}`; the nonce is a hyphen-free random
//! UUID so the id can still be split from the right even when the category
//! itself contains hyphens.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use rsa::RsaPrivateKey;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AuthError, Result, UserId};

use super::codec::{self, ATTR_DEVICE_CATEGORY, ATTR_KEY_ID};
use super::jwk::{Jwk, JwkSet};

/// Maximum length of a device category tag
pub const MAX_DEVICE_CATEGORY_LEN: usize = 50;

// =============================================================================
// Validation
// =============================================================================

/// Validate a caller-supplied device category.
///
/// 1 to 50 characters of ASCII letters, digits, `-` and `_`.
pub fn validate_device_category(category: &str) -> Result<()> {
    if category.is_empty() || category.len() > MAX_DEVICE_CATEGORY_LEN {
        return Err(AuthError::InvalidInput(format!(
            "device category must be between 1 and {MAX_DEVICE_CATEGORY_LEN} characters"
        )));
    }

    if !category
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AuthError::InvalidInput(
            "device category may only contain letters, digits, hyphens and underscores".into(),
        ));
    }

    Ok(())
}

// =============================================================================
// Key Identifiers
// =============================================================================

/// Components of a structured key identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdParts {
    pub device_category: String,
    pub user_id: UserId,
    pub nonce: String,
}

/// Build a fresh key identifier for a (user, category) pair.
pub fn new_key_id(device_category: &str, user_id: UserId) -> String {
    format!("{}-{}-{}", device_category, user_id, Uuid::new_v4().simple())
}

/// Split a key identifier into its components.
///
/// Legacy fallback only: the device category is normally read from the
/// key's `use` attribute.
pub fn parse_key_id(key_id: &str) -> Option<KeyIdParts> {
    let mut parts = key_id.rsplitn(3, '-');
    let nonce = parts.next()?;
    let user_id = parts.next()?.parse::<UserId>().ok()?;
    let device_category = parts.next()?;

    if nonce.is_empty() || device_category.is_empty() {
        return None;
    }

    Some(KeyIdParts {
        device_category: device_category.to_string(),
        user_id,
        nonce: nonce.to_string(),
    })
}

// =============================================================================
// Device Key
// =============================================================================

/// One device session's RSA key pair plus its JWK representation.
pub struct DeviceKey {
    key_id: String,
    device_category: String,
    private_key: RsaPrivateKey,
    jwk: Jwk,
    encoding_key: OnceLock<EncodingKey>,
}

impl DeviceKey {
    /// Generate a new key for `(user_id, device_category)`.
    pub fn generate(user_id: UserId, device_category: &str, bits: usize) -> Result<Self> {
        validate_device_category(device_category)?;

        let private_key = codec::generate(bits)?;
        let mut jwk = codec::import_private(&private_key);
        let key_id = new_key_id(device_category, user_id);

        codec::set_attribute(&mut jwk, ATTR_KEY_ID, Value::String(key_id.clone()))?;
        codec::set_attribute(
            &mut jwk,
            ATTR_DEVICE_CATEGORY,
            Value::String(device_category.to_string()),
        )?;

        Ok(Self {
            key_id,
            device_category: device_category.to_string(),
            private_key,
            jwk,
            encoding_key: OnceLock::new(),
        })
    }

    /// Rebuild a device key from a stored JWK.
    ///
    /// The device category comes from the `use` attribute; keys written
    /// before the attribute existed fall back to the key-id prefix.
    pub fn from_jwk(jwk: Jwk) -> Result<Self> {
        let key_id = jwk
            .key_id()
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| AuthError::Codec("stored key has no 'kid'".into()))?
            .to_string();

        let device_category = match jwk.device_category() {
            Some(category) => category.to_string(),
            None => parse_key_id(&key_id)
                .map(|parts| parts.device_category)
                .ok_or_else(|| {
                    AuthError::Codec(format!("cannot determine device category of key {key_id}"))
                })?,
        };

        let private_key = codec::export_private(&jwk)?;

        Ok(Self {
            key_id,
            device_category,
            private_key,
            jwk,
            encoding_key: OnceLock::new(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn device_category(&self) -> &str {
        &self.device_category
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Full JWK including private members.
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// Public-only JWK, suitable for a JWKS endpoint.
    pub fn public_jwk(&self) -> Jwk {
        self.jwk.to_public()
    }

    /// JWT signing key, built once per device key.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        if let Some(key) = self.encoding_key.get() {
            return Ok(key.clone());
        }
        let key = codec::encoding_key(&self.private_key)?;
        Ok(self.encoding_key.get_or_init(|| key).clone())
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("key_id", &self.key_id)
            .field("device_category", &self.device_category)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Keyset
// =============================================================================

/// All device keys of one user.
#[derive(Debug, Clone)]
pub struct Keyset {
    user_id: UserId,
    keys: Vec<Arc<DeviceKey>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Keyset {
    /// Empty keyset for a user seen for the first time.
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            keys: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a keyset from its stored JWK Set.
    ///
    /// Keys that fail to import are skipped with a warning. If two stored
    /// keys claim the same category only the first is kept.
    pub fn from_jwk_set(
        user_id: UserId,
        set: JwkSet,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let mut keyset = Self {
            user_id,
            keys: Vec::with_capacity(set.keys.len()),
            created_at,
            updated_at,
        };

        for jwk in set.keys {
            match DeviceKey::from_jwk(jwk) {
                Ok(key) => {
                    if keyset.find_by_category(key.device_category()).is_some() {
                        warn!(
                            user_id,
                            key_id = %key.key_id(),
                            "Dropping duplicate device key for category"
                        );
                        continue;
                    }
                    keyset.keys.push(Arc::new(key));
                }
                Err(e) => warn!(user_id, error = %e, "Skipping corrupt device key"),
            }
        }

        keyset
    }

    /// Stored form: every key with its private members.
    pub fn to_jwk_set(&self) -> JwkSet {
        JwkSet::new(self.keys.iter().map(|k| k.jwk().clone()).collect())
    }

    /// Public form for a JWKS endpoint.
    pub fn public_jwks(&self) -> Vec<Jwk> {
        self.keys.iter().map(|k| k.public_jwk()).collect()
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn keys(&self) -> &[Arc<DeviceKey>] {
        &self.keys
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.key_id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn find_by_category(&self, device_category: &str) -> Option<&Arc<DeviceKey>> {
        self.keys
            .iter()
            .find(|k| k.device_category() == device_category)
    }

    pub fn find_by_key_id(&self, key_id: &str) -> Option<&Arc<DeviceKey>> {
        self.keys.iter().find(|k| k.key_id() == key_id)
    }

    /// Remove the key for a device category, returning it.
    pub fn remove_category(&mut self, device_category: &str) -> Option<Arc<DeviceKey>> {
        let index = self
            .keys
            .iter()
            .position(|k| k.device_category() == device_category)?;
        self.updated_at = Utc::now();
        Some(self.keys.remove(index))
    }

    /// Remove a key by identifier, returning it.
    pub fn remove_key_id(&mut self, key_id: &str) -> Option<Arc<DeviceKey>> {
        let index = self.keys.iter().position(|k| k.key_id() == key_id)?;
        self.updated_at = Utc::now();
        Some(self.keys.remove(index))
    }

    /// Insert a key, first removing any key of the same category.
    ///
    /// Returns the replaced key, if there was one.
    pub fn insert(&mut self, key: Arc<DeviceKey>) -> Option<Arc<DeviceKey>> {
        let replaced = self.remove_category(key.device_category());
        self.keys.push(key);
        self.updated_at = Utc::now();
        replaced
    }
}
