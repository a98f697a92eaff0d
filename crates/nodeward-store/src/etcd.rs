use anyhow::{Context, Result};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::crypto;
use super::{CoordinationStore, Entry, PutOptions, StoreError};

/// etcd-backed store for self-hosted clusters.
///
/// Secure values are sealed client-side with AES-256-GCM. A store opened
/// without a key can read plain values only; sealed values yield
/// `AccessDenied`.
pub struct EtcdStore {
    client: Client,
    key: Option<Zeroizing<Vec<u8>>>,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], key: Option<Zeroizing<Vec<u8>>>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .with_context(|| format!("Failed to connect to etcd at {}", endpoints.join(",")))?;
        info!(endpoints = %endpoints.join(","), sealed = key.is_some(), "Connected to etcd");
        Ok(Self { client, key })
    }

    fn unseal(&self, path: &str, raw: &str) -> Result<String, StoreError> {
        if !crypto::is_sealed(raw) {
            return Ok(raw.to_string());
        }
        match &self.key {
            Some(key) => crypto::open(raw, key),
            None => Err(StoreError::AccessDenied(format!(
                "no store key to decrypt {}",
                path
            ))),
        }
    }
}

// Canonical gRPC status codes.
const GRPC_PERMISSION_DENIED: i32 = 7;
const GRPC_UNAUTHENTICATED: i32 = 16;

/// Map a client error onto the store taxonomy.
fn classify(path: &str, err: etcd_client::Error) -> StoreError {
    match err {
        etcd_client::Error::GRpcStatus(status) => {
            classify_status(path, status.code() as i32, status.message())
        }
        other => StoreError::backend(path, other.to_string()),
    }
}

fn classify_status(path: &str, code: i32, message: &str) -> StoreError {
    match code {
        GRPC_PERMISSION_DENIED | GRPC_UNAUTHENTICATED => {
            StoreError::AccessDenied(format!("{}: {}", path, message))
        }
        _ => StoreError::backend(path, format!("grpc status {}: {}", code, message)),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, path: &str) -> Result<String, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(|e| classify(path, e))?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let raw = kv
            .value_str()
            .map_err(|e| StoreError::backend(path, format!("non-UTF-8 value: {}", e)))?;
        debug!(path, "etcd get");
        self.unseal(path, raw)
    }

    async fn put(&self, path: &str, value: &str, opts: PutOptions) -> Result<(), StoreError> {
        let stored = if opts.secure {
            let key = self.key.as_ref().ok_or_else(|| {
                StoreError::Crypto(format!("secure write to {} requires a store key", path))
            })?;
            crypto::seal(value, key)?
        } else {
            value.to_string()
        };
        let mut client = self.client.clone();
        client
            .put(path, stored, None)
            .await
            .map_err(|e| classify(path, e))?;
        debug!(path, secure = opts.secure, "etcd put");
        Ok(())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<Entry>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| classify(prefix, e))?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let path = kv
                .key_str()
                .map_err(|e| StoreError::backend(prefix, format!("non-UTF-8 key: {}", e)))?;
            let raw = kv
                .value_str()
                .map_err(|e| StoreError::backend(path, format!("non-UTF-8 value: {}", e)))?;
            entries.push(Entry {
                path: path.to_string(),
                value: self.unseal(path, raw)?,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}
