//! Encryption of secret values at rest.
//!
//! ChaCha20-Poly1305 with a fresh random 96-bit nonce per value. Nonce and
//! ciphertext are stored base64 encoded.

use crate::error::{HavenError, Result};
use crate::state::StoredSecret;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

/// Key length for ChaCha20-Poly1305 (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Generate a new random data key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `value` under `key`.
pub fn seal(key: &[u8; KEY_LEN], name: &str, value: &str) -> Result<StoredSecret> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), value.as_bytes())
        .map_err(|e| HavenError::Crypto { reason: format!("Encryption failed: {e}") })?;

    Ok(StoredSecret {
        name: name.to_string(),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypt a stored secret.
///
/// # Errors
///
/// Returns `HavenError::Crypto` if the record is malformed, was tampered
/// with, or was sealed under a different key.
pub fn open(key: &[u8; KEY_LEN], secret: &StoredSecret) -> Result<String> {
    let nonce = BASE64
        .decode(&secret.nonce)
        .map_err(|e| HavenError::Crypto { reason: format!("Invalid nonce for '{}': {e}", secret.name) })?;
    if nonce.len() != NONCE_LEN {
        return Err(HavenError::Crypto {
            reason: format!("Invalid nonce length for '{}': {}", secret.name, nonce.len()),
        });
    }
    let ciphertext = BASE64.decode(&secret.ciphertext).map_err(|e| HavenError::Crypto {
        reason: format!("Invalid ciphertext for '{}': {e}", secret.name),
    })?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher.decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice()).map_err(|_| {
        HavenError::Crypto { reason: format!("Failed to decrypt '{}' (wrong key?)", secret.name) }
    })?;

    String::from_utf8(plaintext)
        .map_err(|_| HavenError::Crypto { reason: format!("Secret '{}' is not UTF-8", secret.name) })
}
