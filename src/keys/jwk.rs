//! JSON Web Key wire types.
//!
//! Only the RSA key type is modelled. Private parameters are optional so the
//! same struct carries both the stored private keys and the public subset
//! published through a JWKS endpoint.
//!
//! The `use` member is repurposed as the device-category tag (`"web"`,
//! `"android"`, ...). Generic JWKS consumers still see a string-valued `use`
//! and ignore values they do not understand, so the field keeps its standard
//! name for interop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key type identifier for RSA keys
pub const KTY_RSA: &str = "RSA";

/// A single JSON Web Key (RFC 7517) for an RSA key pair or public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `"RSA"` for keys produced here
    pub kty: String,

    /// Key identifier (`{deviceCategory}-{userID}-{nonce}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Public key use; carries the device category
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Intended signing algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Modulus (base64url, big-endian)
    pub n: String,

    /// Public exponent (base64url, big-endian)
    pub e: String,

    /// Private exponent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,

    /// First prime factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,

    /// Second prime factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    /// First factor CRT exponent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,

    /// Second factor CRT exponent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,

    /// First CRT coefficient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,

    /// Any other members, preserved verbatim across parse/serialize
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Jwk {
    /// Key identifier, if set.
    pub fn key_id(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Device category carried in `use`, if set.
    pub fn device_category(&self) -> Option<&str> {
        self.key_use.as_deref()
    }

    /// Whether this key carries private material.
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// Copy of this key with every private member removed.
    ///
    /// Custom members are kept; none of the ones written by this crate are
    /// secret.
    pub fn to_public(&self) -> Jwk {
        Jwk {
            kty: self.kty.clone(),
            kid: self.kid.clone(),
            key_use: self.key_use.clone(),
            alg: self.alg.clone(),
            n: self.n.clone(),
            e: self.e.clone(),
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            extra: self.extra.clone(),
        }
    }
}

/// A JWK Set document: `{"keys": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn new(keys: Vec<Jwk>) -> Self {
        Self { keys }
    }

    /// Find a key by `kid`.
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.key_id() == Some(kid))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Public-only view of the whole set.
    pub fn to_public(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.iter().map(Jwk::to_public).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Jwk {
        serde_json::from_str(
            r#"{"kty":"RSA","kid":"web-7-abc","use":"web","n":"AQAB","e":"AQAB","d":"AQ","p":"Aw","q":"BQ","x-custom":1}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_use_field_is_device_category() {
        let jwk = sample();
        assert_eq!(jwk.device_category(), Some("web"));

        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["use"], "web");
        assert!(json.get("key_use").is_none());
    }

    #[test]
    fn test_to_public_strips_private_members() {
        let public = sample().to_public();
        assert!(!public.is_private());
        assert!(public.p.is_none() && public.q.is_none());
        assert_eq!(public.key_id(), Some("web-7-abc"));

        let json = serde_json::to_value(&public).unwrap();
        assert!(json.get("d").is_none());
        assert_eq!(json["x-custom"], 1);
    }

    #[test]
    fn test_set_find() {
        let set = JwkSet::new(vec![sample()]);
        assert!(set.find("web-7-abc").is_some());
        assert!(set.find("ios-7-abc").is_none());
    }
}
