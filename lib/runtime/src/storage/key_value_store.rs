// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key/value store seam.
//!
//! Every record the workers exchange out of band (instance registrations,
//! transfer metadata, load snapshots) flows through this trait. Production
//! uses the etcd-backed implementation in [`crate::transports::etcd`]; the
//! [`MemoryStore`] backs single-process deployments and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;

use crate::Result;

/// Flat key/value storage addressed as `(bucket, key)`.
///
/// Values round-trip unchanged. Implementations provide read-your-writes for
/// a single key and nothing stronger.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Upsert a value.
    async fn put(&self, bucket: &str, key: &str, value: Bytes) -> Result<()>;

    /// Fetch a value, `None` if absent.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// List `(key, value)` pairs whose key starts with `prefix`.
    async fn get_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Remove a key; absent keys are not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Process-unique identity of this store connection.
    fn connection_id(&self) -> u64;
}

/// In-memory [`KeyValueStore`]. Cloned handles share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    connection_id: u64,
    buckets: std::sync::Arc<RwLock<HashMap<String, BTreeMap<String, Bytes>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            connection_id: rand::rng().random(),
            buckets: std::sync::Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, bucket: &str, key: &str, value: Bytes) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    async fn get_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let buckets = self.buckets.read();
        let Some(entries) = buckets.get(bucket) else {
            return Ok(vec![]);
        };
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(entries) = self.buckets.write().get_mut(bucket) {
            entries.remove(key);
        }
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryStore::new();
        store
            .put("bucket", "key", Bytes::from_static(b"value"))
            .await
            .unwrap();
        let value = store.get("bucket", "key").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"value")));
        assert_eq!(store.get("bucket", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_prefix_filters_keys() {
        let store = MemoryStore::new();
        store.put("b", "ns/a/1", Bytes::from_static(b"1")).await.unwrap();
        store.put("b", "ns/a/2", Bytes::from_static(b"2")).await.unwrap();
        store.put("b", "ns/b/1", Bytes::from_static(b"3")).await.unwrap();

        let entries = store.get_prefix("b", "ns/a/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(k, _)| k.starts_with("ns/a/")));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("b", "k", Bytes::from_static(b"v")).await.unwrap();
        store.delete("b", "k").await.unwrap();
        store.delete("b", "k").await.unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), None);
    }
}
