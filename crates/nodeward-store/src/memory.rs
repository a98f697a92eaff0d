use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CoordinationStore, Entry, PutOptions, StoreError};

#[derive(Debug, Clone)]
struct Stored {
    value: String,
    secure: bool,
}

/// In-process store for tests and single-node dry runs.
///
/// Secure values can be made unreadable with [`MemoryStore::deny_decrypt`]
/// to exercise the `AccessDenied` path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Stored>>,
    reads: Mutex<HashMap<String, u32>>,
    decrypt_denied: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Secure reads fail with `AccessDenied` from now on.
    pub fn deny_decrypt(&self) {
        if let Ok(mut d) = self.decrypt_denied.lock() {
            *d = true;
        }
    }

    /// How many times `path` was read.
    pub fn read_count(&self, path: &str) -> u32 {
        self.reads
            .lock()
            .map(|r| r.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether `path` was written as a secure value.
    pub fn is_secure(&self, path: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.get(path).is_some_and(|s| s.secure))
            .unwrap_or(false)
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut e) = self.entries.lock() {
            e.remove(path);
        }
    }

    fn poisoned(path: &str) -> StoreError {
        StoreError::backend(path, "memory store lock poisoned")
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<String, StoreError> {
        if let Ok(mut reads) = self.reads.lock() {
            *reads.entry(path.to_string()).or_insert(0) += 1;
        }
        let denied = self.decrypt_denied.lock().map(|d| *d).unwrap_or(false);
        let entries = self.entries.lock().map_err(|_| Self::poisoned(path))?;
        match entries.get(path) {
            Some(stored) if stored.secure && denied => Err(StoreError::AccessDenied(format!(
                "decrypt not permitted for {}",
                path
            ))),
            Some(stored) => Ok(stored.value.clone()),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn put(&self, path: &str, value: &str, opts: PutOptions) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned(path))?;
        entries.insert(
            path.to_string(),
            Stored {
                value: value.to_string(),
                secure: opts.secure,
            },
        );
        Ok(())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<Entry>, StoreError> {
        let denied = self.decrypt_denied.lock().map(|d| *d).unwrap_or(false);
        let entries = self.entries.lock().map_err(|_| Self::poisoned(prefix))?;
        let mut out = Vec::new();
        for (path, stored) in entries.range(prefix.to_string()..) {
            if !path.starts_with(prefix) {
                break;
            }
            if stored.secure && denied {
                return Err(StoreError::AccessDenied(format!(
                    "decrypt not permitted for {}",
                    path
                )));
            }
            out.push(Entry {
                path: path.clone(),
                value: stored.value.clone(),
            });
        }
        Ok(out)
    }
}
