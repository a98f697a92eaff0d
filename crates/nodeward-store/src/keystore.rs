use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Env var holding the hex-encoded store encryption key.
pub const KEY_ENV: &str = "NODEWARD_STORE_KEY";

/// Source of the 32-byte key used to seal secure values in self-hosted
/// backends. Holding the key is the decrypt capability.
pub trait KeyProvider: Send + Sync {
    fn store_key(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Reads the key from `NODEWARD_STORE_KEY` (hex).
pub struct EnvKeyProvider;

impl KeyProvider for EnvKeyProvider {
    fn store_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let hex = Zeroizing::new(
            std::env::var(KEY_ENV).with_context(|| format!("Missing store key env var: {}", KEY_ENV))?,
        );
        let key = hex_decode(hex.trim()).with_context(|| format!("Invalid hex in {}", KEY_ENV))?;
        check_len(key)
    }
}

/// Reads the key from a hex file provisioned on the node.
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl KeyProvider for FileKeyProvider {
    fn store_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let contents = Zeroizing::new(
            std::fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read key file: {}", self.path.display()))?,
        );
        let key = hex_decode(contents.trim())
            .with_context(|| format!("Invalid key data in {}", self.path.display()))?;
        check_len(key)
    }
}

/// File provider when a key file is configured, env otherwise.
pub fn default_provider(key_file: Option<&Path>) -> Box<dyn KeyProvider> {
    match key_file {
        Some(path) => Box::new(FileKeyProvider::new(path)),
        None => Box::new(EnvKeyProvider),
    }
}

fn check_len(key: Vec<u8>) -> Result<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(key);
    if key.len() != 32 {
        anyhow::bail!("Store key must be 32 bytes, got {}", key.len());
    }
    Ok(key)
}

fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    if !hex.len().is_multiple_of(2) {
        anyhow::bail!("Hex string has odd length: {}", hex.len());
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let s = std::str::from_utf8(chunk)?;
        let byte = u8::from_str_radix(s, 16).with_context(|| format!("Invalid hex byte: {}", s))?;
        bytes.push(byte);
    }
    Ok(bytes)
}
