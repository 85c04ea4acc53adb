//! Provider token encryption.
//!
//! AES-256-GCM with a random 96-bit nonce prepended to the ciphertext, so a
//! single opaque byte string round-trips through the database. Key material
//! arrives hex- or base64-encoded in configuration and must decode to exactly
//! 32 bytes.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Encrypts `plaintext` with AES-256-GCM. The nonce is freshly generated per
/// call and prepended to the returned ciphertext, so two encryptions of the
/// same plaintext never produce the same output.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| anyhow!("encryption key must be {} bytes, got {}", KEY_LEN, key.len()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| anyhow!("encrypting plaintext"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts ciphertext produced by [`encrypt`].
pub fn decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| anyhow!("encryption key must be {} bytes, got {}", KEY_LEN, key.len()))?;
    if ciphertext.len() < NONCE_LEN {
        bail!("ciphertext too short");
    }
    let (nonce, ct) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| anyhow!("decrypting ciphertext"))
}

/// Decodes a hex- or base64-encoded 32-byte key.
pub fn decode_key(s: &str) -> Result<Vec<u8>> {
    // 64 hex chars = 32 bytes.
    if s.len() == 64 {
        if let Ok(b) = hex::decode(s) {
            if b.len() == KEY_LEN {
                return Ok(b);
            }
        }
    }

    let b = base64::engine::general_purpose::STANDARD
        .decode(s)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(s))
        .context("key is not valid hex or base64")?;
    if b.len() != KEY_LEN {
        bail!("key must be {} bytes, got {}", KEY_LEN, b.len());
    }
    Ok(b)
}

/// Returns `n` cryptographically random bytes as a lowercase hex string.
/// Used to mint webhook shared secrets.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
