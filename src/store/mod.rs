/// Persistent key-value storage contract and adapters

pub mod sqlite;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;

/// Namespaces of the persistent key-value store.
pub mod namespace {
    /// Bidirectional user-level LID/PN mapping.
    pub const LID_MAPPING: &str = "lid-mapping";
    /// Signal session records, keyed by `user.device`.
    pub const SESSION: &str = "session";
    /// One-time pre-keys, keyed by id.
    pub const PRE_KEY: &str = "pre-key";
    /// Signed pre-keys, keyed by id.
    pub const SIGNED_PRE_KEY: &str = "signed-pre-key";
    /// Group sender keys, keyed by sender-key name.
    pub const SENDER_KEY: &str = "sender-key";
    /// Known device lists, keyed by PN user.
    pub const DEVICE_LIST: &str = "device-list";
}

/// A set of writes that commit atomically.
///
/// Setting a key to a value and deleting it stage into the same batch; the
/// last operation for a `(namespace, key)` pair wins. Merging one batch into
/// another models a nested transaction joining its outer one.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: HashMap<String, HashMap<String, Option<Bytes>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write of `value` under `namespace`/`key`.
    pub fn set(&mut self, namespace: &str, key: impl Into<String>, value: impl Into<Bytes>) {
        self.ops
            .entry(namespace.to_string())
            .or_default()
            .insert(key.into(), Some(value.into()));
    }

    /// Stage a deletion of `namespace`/`key`.
    pub fn delete(&mut self, namespace: &str, key: impl Into<String>) {
        self.ops
            .entry(namespace.to_string())
            .or_default()
            .insert(key.into(), None);
    }

    /// Fold another batch into this one. The other batch's operations win on
    /// key collisions.
    pub fn merge(&mut self, other: WriteBatch) {
        for (namespace, keys) in other.ops {
            self.ops.entry(namespace).or_default().extend(keys);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(|keys| keys.is_empty())
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.values().map(|keys| keys.len()).sum()
    }

    /// Iterate staged operations as `(namespace, key, value-or-delete)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Option<&Bytes>)> {
        self.ops.iter().flat_map(|(namespace, keys)| {
            keys.iter()
                .map(move |(key, value)| (namespace.as_str(), key.as_str(), value.as_ref()))
        })
    }
}

/// Contract over the host-supplied transactional key-value store.
///
/// The adapter performs no business logic: gets are batched reads with
/// missing keys absent from the result, and `commit` applies a [`WriteBatch`]
/// atomically. `entries` enumerates a namespace, which the mapping repair and
/// stats passes need.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Batched read. Keys absent from the store are absent from the result.
    async fn get(&self, namespace: &str, keys: &[&str]) -> Result<HashMap<String, Bytes>>;

    /// Apply every operation in the batch, or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// All key/value pairs currently stored under a namespace.
    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Bytes)>>;

    /// Convenience single-key read.
    async fn get_one(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get(namespace, &[key]).await?.remove(key))
    }
}

/// In-memory key-value store.
///
/// Commits hold the write lock for the whole batch, so readers observe either
/// all of a batch or none of it.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    data: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, namespace: &str, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        let data = self.data.read().await;
        let mut result = HashMap::new();
        if let Some(ns) = data.get(namespace) {
            for key in keys {
                if let Some(value) = ns.get(*key) {
                    result.insert((*key).to_string(), value.clone());
                }
            }
        }
        Ok(result)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut data = self.data.write().await;
        for (namespace, key, value) in batch.iter() {
            let ns = data.entry(namespace.to_string()).or_default();
            match value {
                Some(value) => {
                    ns.insert(key.to_string(), value.clone());
                }
                None => {
                    ns.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Bytes)>> {
        let data = self.data.read().await;
        Ok(data
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
