// nodeward-store: Coordination store trait and backends
// Depends on nodeward-core (config, shell runner)

pub mod crypto;
pub mod etcd;
pub mod keystore;
pub mod memory;
pub mod ssm;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use nodeward_core::config::{NodewardConfig, StoreBackend};

/// Errors surfaced by every store backend.
///
/// `NotFound` and `AccessDenied` are deliberately distinct: the first means
/// "not published yet" and is worth waiting for, the second means "not
/// authorized" and never resolves by waiting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("store error at {path}: {message}")]
    Backend { path: String, message: String },
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl StoreError {
    pub fn backend(path: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Encrypt at rest; reads then need decrypt capability.
    pub secure: bool,
}

impl PutOptions {
    pub fn plain() -> Self {
        Self { secure: false }
    }

    pub fn secure() -> Self {
        Self { secure: true }
    }
}

/// One key/value pair returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub value: String,
}

/// Shared, namespaced key-value store used to publish and discover join
/// materials, run identifiers and boot progress.
///
/// Writes overwrite, so re-bootstrapping a node is idempotent. Reads
/// always request decryption.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<String, StoreError>;

    async fn put(&self, path: &str, value: &str, opts: PutOptions) -> Result<(), StoreError>;

    /// All entries whose path starts with `prefix`, sorted by path.
    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<Entry>, StoreError>;

    /// `get`, mapping `NotFound` to `None`.
    async fn try_get(&self, path: &str) -> Result<Option<String>, StoreError> {
        match self.get(path).await {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Open the backend selected in config.
pub async fn open(config: &NodewardConfig) -> Result<Arc<dyn CoordinationStore>> {
    match config.store.backend {
        StoreBackend::Ssm => Ok(Arc::new(ssm::SsmStore::new(&config.cluster.region))),
        StoreBackend::Etcd => {
            let key = keystore::default_provider(config.store.key_file.as_deref()).store_key().ok();
            let store = etcd::EtcdStore::connect(&config.store.etcd_endpoints, key).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(Arc::new(memory::MemoryStore::new())),
    }
}
