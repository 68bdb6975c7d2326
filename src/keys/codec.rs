//! Key codec: RSA key generation and JWK import/export.
//!
//! Pure functions over key material, no internal state.
//!
//! # Round-trip guarantees
//!
//! - `export_private(&import_private(&key))` reproduces the modulus, public
//!   exponent and private exponent of `key`.
//! - `parse_set(&serialize_set(&set))` reproduces every member of every key,
//!   including `kid`, `use` and custom attributes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use tracing::warn;

use crate::types::{AuthError, Result};

use super::jwk::{Jwk, JwkSet, KTY_RSA};

// =============================================================================
// Constants
// =============================================================================

/// Smallest accepted RSA modulus size in bits
pub const MIN_KEY_BITS: usize = 2048;

/// Default RSA modulus size in bits
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Signing algorithm advertised in `alg`
pub const SIGNING_ALG: &str = "RS256";

/// Attribute holding the key identifier
pub const ATTR_KEY_ID: &str = "kid";

/// Attribute holding the device category
pub const ATTR_DEVICE_CATEGORY: &str = "use";

// =============================================================================
// Key Generation
// =============================================================================

/// Generate a new RSA private key of `bits` size.
///
/// CPU-heavy; async callers should run it on a blocking thread.
pub fn generate(bits: usize) -> Result<RsaPrivateKey> {
    if bits < MIN_KEY_BITS {
        return Err(AuthError::Generation(format!(
            "key size {bits} is below the minimum of {MIN_KEY_BITS} bits"
        )));
    }

    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| AuthError::Generation(format!("failed to generate RSA key: {e}")))
}

// =============================================================================
// Import / Export
// =============================================================================

/// Import a private key into a JWK carrying all private parameters.
pub fn import_private(key: &RsaPrivateKey) -> Jwk {
    let primes = key.primes();

    Jwk {
        kty: KTY_RSA.to_string(),
        kid: None,
        key_use: None,
        alg: Some(SIGNING_ALG.to_string()),
        n: encode_uint(key.n()),
        e: encode_uint(key.e()),
        d: Some(encode_uint(key.d())),
        p: primes.first().map(encode_uint),
        q: primes.get(1).map(encode_uint),
        dp: key.dp().map(encode_uint),
        dq: key.dq().map(encode_uint),
        qi: key.crt_coefficient().as_ref().map(encode_uint),
        extra: Default::default(),
    }
}

/// Export the private key held by a JWK.
///
/// Fails if the JWK is not an RSA key or lacks the private exponent or
/// either prime factor.
pub fn export_private(jwk: &Jwk) -> Result<RsaPrivateKey> {
    ensure_rsa(jwk)?;

    let n = decode_uint("n", &jwk.n)?;
    let e = decode_uint("e", &jwk.e)?;
    let d = decode_uint("d", required("d", &jwk.d)?)?;
    let p = decode_uint("p", required("p", &jwk.p)?)?;
    let q = decode_uint("q", required("q", &jwk.q)?)?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])?;
    key.validate()?;
    Ok(key)
}

/// Export the public half of a JWK (private or public).
pub fn export_public(jwk: &Jwk) -> Result<RsaPublicKey> {
    ensure_rsa(jwk)?;

    let n = decode_uint("n", &jwk.n)?;
    let e = decode_uint("e", &jwk.e)?;
    Ok(RsaPublicKey::new(n, e)?)
}

/// JWT signing key for a private key.
pub fn encoding_key(key: &RsaPrivateKey) -> Result<EncodingKey> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| AuthError::Codec(format!("failed to encode private key: {e}")))?;
    Ok(EncodingKey::from_rsa_der(der.as_bytes()))
}

/// JWT verification key for a public JWK.
pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
    ensure_rsa(jwk)?;
    Ok(DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?)
}

// =============================================================================
// Attributes
// =============================================================================

/// Stamp an attribute onto a key.
///
/// `kid`, `use` and `alg` must be strings. Core numeric members cannot be
/// overwritten through this call.
pub fn set_attribute(jwk: &mut Jwk, name: &str, value: Value) -> Result<()> {
    match name {
        "kid" => jwk.kid = Some(string_attr(name, value)?),
        "use" => jwk.key_use = Some(string_attr(name, value)?),
        "alg" => jwk.alg = Some(string_attr(name, value)?),
        "kty" | "n" | "e" | "d" | "p" | "q" | "dp" | "dq" | "qi" => {
            return Err(AuthError::InvalidInput(format!(
                "attribute '{name}' is key material and cannot be set directly"
            )));
        }
        _ => {
            jwk.extra.insert(name.to_string(), value);
        }
    }
    Ok(())
}

/// Read an attribute from a key.
pub fn get_attribute(jwk: &Jwk, name: &str) -> Option<Value> {
    let text = |v: &Option<String>| v.clone().map(Value::String);
    match name {
        "kty" => Some(Value::String(jwk.kty.clone())),
        "kid" => text(&jwk.kid),
        "use" => text(&jwk.key_use),
        "alg" => text(&jwk.alg),
        "n" => Some(Value::String(jwk.n.clone())),
        "e" => Some(Value::String(jwk.e.clone())),
        _ => jwk.extra.get(name).cloned(),
    }
}

// =============================================================================
// Serialization
// =============================================================================

/// Serialize a single key as a JWK document.
pub fn serialize_key(jwk: &Jwk) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(jwk)?)
}

/// Parse a single JWK document.
pub fn parse_key(bytes: &[u8]) -> Result<Jwk> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a JWK Set document.
pub fn serialize_set(set: &JwkSet) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(set)?)
}

/// Parse a JWK Set document.
///
/// The envelope must be a valid `{"keys": [...]}` object. Individual entries
/// that are not valid JWKs are skipped with a warning so one corrupt key does
/// not take down the rest of the set.
pub fn parse_set(bytes: &[u8]) -> Result<JwkSet> {
    #[derive(serde::Deserialize)]
    struct RawSet {
        keys: Vec<Value>,
    }

    let raw: RawSet = serde_json::from_slice(bytes)?;
    let mut keys = Vec::with_capacity(raw.keys.len());

    for (index, entry) in raw.keys.into_iter().enumerate() {
        match serde_json::from_value::<Jwk>(entry) {
            Ok(jwk) => keys.push(jwk),
            Err(e) => warn!(index, error = %e, "Skipping unparseable JWK in key set"),
        }
    }

    Ok(JwkSet { keys })
}

// =============================================================================
// Helpers
// =============================================================================

fn encode_uint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_uint(member: &str, encoded: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| AuthError::Codec(format!("invalid base64url in '{member}': {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn required<'a>(member: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| AuthError::Codec(format!("JWK is missing private member '{member}'")))
}

fn ensure_rsa(jwk: &Jwk) -> Result<()> {
    if jwk.kty != KTY_RSA {
        return Err(AuthError::Codec(format!(
            "unsupported key type '{}', expected RSA",
            jwk.kty
        )));
    }
    Ok(())
}

fn string_attr(name: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(AuthError::InvalidInput(format!(
            "attribute '{name}' must be a string, got {other}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_rejects_small_keys() {
        let result = generate(1024);
        assert!(matches!(result, Err(AuthError::Generation(_))));
    }

    #[test]
    fn test_private_round_trip() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let jwk = import_private(&key);
        assert!(jwk.is_private());

        let restored = export_private(&jwk).unwrap();
        assert_eq!(restored.n(), key.n());
        assert_eq!(restored.e(), key.e());
        assert_eq!(restored.d(), key.d());
    }

    #[test]
    fn test_export_public_from_private_jwk() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let jwk = import_private(&key);

        let public = export_public(&jwk.to_public()).unwrap();
        assert_eq!(public, key.to_public_key());
    }

    #[test]
    fn test_export_private_requires_private_members() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let public_only = import_private(&key).to_public();

        assert!(matches!(export_private(&public_only), Err(AuthError::Codec(_))));
    }

    #[test]
    fn test_attributes_survive_serialization() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let mut jwk = import_private(&key);
        set_attribute(&mut jwk, ATTR_KEY_ID, json!("web-7-abc")).unwrap();
        set_attribute(&mut jwk, ATTR_DEVICE_CATEGORY, json!("web")).unwrap();
        set_attribute(&mut jwk, "x-issued-by", json!("login")).unwrap();

        let set = JwkSet::new(vec![jwk.clone()]);
        let parsed = parse_set(&serialize_set(&set).unwrap()).unwrap();

        let restored = parsed.find("web-7-abc").unwrap();
        assert_eq!(restored, &jwk);
        assert_eq!(get_attribute(restored, "use"), Some(json!("web")));
        assert_eq!(get_attribute(restored, "x-issued-by"), Some(json!("login")));

        let single = parse_key(&serialize_key(&jwk).unwrap()).unwrap();
        assert_eq!(single, jwk);
    }

    #[test]
    fn test_set_attribute_rejects_key_material_and_bad_types() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let mut jwk = import_private(&key);

        assert!(set_attribute(&mut jwk, "n", json!("AQAB")).is_err());
        assert!(set_attribute(&mut jwk, "kid", json!(42)).is_err());
        assert_eq!(get_attribute(&jwk, "kid"), None);
    }

    #[test]
    fn test_parse_set_skips_corrupt_entries() {
        let key = generate(DEFAULT_KEY_BITS).unwrap();
        let mut good = import_private(&key);
        good.kid = Some("ios-1-abc".into());

        let doc = json!({ "keys": [ {"kty": "RSA"}, good, "garbage" ] });
        let parsed = parse_set(doc.to_string().as_bytes()).unwrap();

        assert_eq!(parsed.len(), 1);
        assert!(parsed.find("ios-1-abc").is_some());
    }

    #[test]
    fn test_parse_set_rejects_bad_envelope() {
        assert!(parse_set(b"not json").is_err());
        assert!(parse_set(br#"{"no_keys": []}"#).is_err());
    }
}
