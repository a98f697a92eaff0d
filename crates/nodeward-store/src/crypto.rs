use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::StoreError;

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Marker prepended to encrypted values stored as text.
pub const SEALED_PREFIX: &str = "enc:v1:";

/// Encrypt with AES-256-GCM. Returns `[12-byte nonce][ciphertext+tag]`.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, StoreError> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| StoreError::Crypto(format!("encryption failed: {}", e)))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt `[12-byte nonce][ciphertext+tag]`.
pub fn decrypt(encrypted: &[u8], key: &[u8]) -> Result<Vec<u8>, StoreError> {
    if encrypted.len() < NONCE_SIZE + 16 {
        return Err(StoreError::Crypto(format!(
            "encrypted data too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + 16
        )));
    }
    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| StoreError::Crypto("decryption failed: authentication tag mismatch".into()))
}

/// Encrypt a text value into `enc:v1:<base64>`.
pub fn seal(value: &str, key: &[u8]) -> Result<String, StoreError> {
    let sealed = encrypt(value.as_bytes(), key)?;
    Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(sealed)))
}

/// Reverse of [`seal`].
pub fn open(sealed: &str, key: &[u8]) -> Result<String, StoreError> {
    let encoded = sealed
        .strip_prefix(SEALED_PREFIX)
        .ok_or_else(|| StoreError::Crypto("value is not sealed".into()))?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Crypto(format!("invalid base64: {}", e)))?;
    let plain = decrypt(&raw, key)?;
    String::from_utf8(plain).map_err(|_| StoreError::Crypto("sealed value is not UTF-8".into()))
}

pub fn is_sealed(value: &str) -> bool {
    value.starts_with(SEALED_PREFIX)
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, StoreError> {
    if key.len() != 32 {
        return Err(StoreError::Crypto(format!(
            "AES-256-GCM key must be 32 bytes, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("failed to create cipher: {}", e)))
}
