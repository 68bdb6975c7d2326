//! At-rest protection for stored keysets.
//!
//! Keysets hold private key material. Before a keyset reaches the store it
//! passes through a [`KeysetCipher`]; the default [`PlaintextCipher`] keeps
//! the serialized JWK Set readable, while [`ChaChaKeysetCipher`] seals it
//! with a static 256-bit key from configuration.
//!
//! # Sealed format
//!
//! `base64(nonce || ciphertext || tag)` using ChaCha20-Poly1305 with a fresh
//! 12-byte nonce per write.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::types::{AuthError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Encryption key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

// =============================================================================
// Cipher Trait
// =============================================================================

/// Seals serialized keysets before they are persisted.
pub trait KeysetCipher: Send + Sync {
    /// Turn a serialized JWK Set into the stored text form.
    fn seal(&self, plaintext: &[u8]) -> Result<String>;

    /// Recover the serialized JWK Set from its stored text form.
    fn open(&self, stored: &str) -> Result<Vec<u8>>;
}

/// No-op cipher: the stored form is the JWK Set JSON itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl KeysetCipher for PlaintextCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        String::from_utf8(plaintext.to_vec())
            .map_err(|e| AuthError::Encryption(format!("keyset is not valid UTF-8: {e}")))
    }

    fn open(&self, stored: &str) -> Result<Vec<u8>> {
        Ok(stored.as_bytes().to_vec())
    }
}

/// ChaCha20-Poly1305 cipher with a static key.
pub struct ChaChaKeysetCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ChaChaKeysetCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build from a standard-base64 encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| AuthError::Config(format!("invalid encryption key encoding: {e}")))?,
        );

        if bytes.len() != KEY_LEN {
            return Err(AuthError::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key))
    }
}

impl KeysetCipher for ChaChaKeysetCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = generate_nonce();
        let ciphertext = encrypt(plaintext, &self.key, &nonce)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn open(&self, stored: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(stored)
            .map_err(|e| AuthError::Encryption(format!("stored keyset is not base64: {e}")))?;

        if sealed.len() < NONCE_LEN + AUTH_TAG_LEN {
            return Err(AuthError::Encryption(format!(
                "stored keyset too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);
        decrypt(ciphertext, &self.key, &nonce_bytes)
    }
}

// =============================================================================
// Primitives
// =============================================================================

/// Generate a random 256-bit encryption key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt bytes with ChaCha20-Poly1305.
///
/// The nonce must never be reused with the same key.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| AuthError::Encryption(format!("Encryption failed: {e}")))
}

/// Decrypt bytes with ChaCha20-Poly1305.
///
/// Fails if the ciphertext was tampered with or the key is wrong.
pub fn decrypt(
    ciphertext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AuthError::Encryption("Failed to decrypt keyset (wrong key?)".into()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_cipher_is_identity() {
        let cipher = PlaintextCipher;
        let sealed = cipher.seal(br#"{"keys":[]}"#).unwrap();
        assert_eq!(sealed, r#"{"keys":[]}"#);
        assert_eq!(cipher.open(&sealed).unwrap(), br#"{"keys":[]}"#.to_vec());
    }

    #[test]
    fn test_chacha_seal_open() {
        let cipher = ChaChaKeysetCipher::new(generate_key());
        let plaintext = br#"{"keys":[{"kty":"RSA"}]}"#;

        let sealed = cipher.seal(plaintext).unwrap();
        assert!(!sealed.contains("RSA"));
        assert_eq!(cipher.open(&sealed).unwrap(), plaintext.to_vec());

        // Fresh nonce per write
        assert_ne!(cipher.seal(plaintext).unwrap(), sealed);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = ChaChaKeysetCipher::new(generate_key())
            .seal(b"secret")
            .unwrap();
        let other = ChaChaKeysetCipher::new(generate_key());

        assert!(matches!(other.open(&sealed), Err(AuthError::Encryption(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = ChaChaKeysetCipher::new(generate_key());
        let sealed = cipher.seal(b"secret").unwrap();

        let mut raw = STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert!(cipher.open(&STANDARD.encode(raw)).is_err());
        assert!(cipher.open("AAAA").is_err());
    }

    #[test]
    fn test_from_base64_validates_length() {
        let key = STANDARD.encode(generate_key());
        assert!(ChaChaKeysetCipher::from_base64(&key).is_ok());
        assert!(ChaChaKeysetCipher::from_base64(&STANDARD.encode([0u8; 16])).is_err());
        assert!(ChaChaKeysetCipher::from_base64("not base64!").is_err());
    }
}
