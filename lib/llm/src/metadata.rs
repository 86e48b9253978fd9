// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-engine transfer metadata exchange.
//!
//! Each engine publishes its transfer-capability blob once per process
//! lifetime under its `engine_id`; peers fetch it the first time they see a
//! request from that engine. `get` blocks (bounded) until the peer has
//! published — workers usually come up together and the publish races the
//! first request.

use std::sync::Arc;
use std::time::Duration;

use disagg_runtime::{ErrorContext, KeyValueStore, Result, raise};

use crate::protocols::EngineTransferMetadata;

/// Store bucket holding transfer metadata, keyed `{namespace}/{engine_id}`.
pub const TRANSFER_METADATA_BUCKET: &str = "v1/transfer-metadata";

#[derive(Debug, Clone)]
pub struct MetadataStoreConfig {
    /// Attempts before a missing peer blob is an error.
    pub max_get_attempts: u32,
    /// Initial backoff between attempts; doubled up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            max_get_attempts: 30,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

pub struct MetadataStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    config: MetadataStoreConfig,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self::with_config(store, namespace, MetadataStoreConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        config: MetadataStoreConfig,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            config,
        }
    }

    fn key(&self, engine_id: &str) -> String {
        format!("{}/{}", self.namespace, engine_id)
    }

    /// Publish an engine's metadata. An upsert, but semantically insert-once:
    /// `engine_id` is unique per engine process lifetime.
    pub async fn put(&self, metadata: &EngineTransferMetadata) -> Result<()> {
        let key = self.key(&metadata.engine_id);
        let value = serde_json::to_vec(metadata)
            .context("failed to serialize engine transfer metadata")?;
        self.store
            .put(TRANSFER_METADATA_BUCKET, &key, value.into())
            .await
            .with_context(|| format!("failed to publish transfer metadata for {key}"))?;
        tracing::info!(engine_id = %metadata.engine_id, "published engine transfer metadata");
        Ok(())
    }

    /// Fetch a peer engine's metadata, retrying with backoff until published.
    ///
    /// The blob round-trips unchanged. Exhausting the retry budget is an
    /// error surfaced to the caller, never a hang.
    pub async fn get(&self, engine_id: &str) -> Result<EngineTransferMetadata> {
        let key = self.key(engine_id);
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=self.config.max_get_attempts {
            if let Some(bytes) = self.store.get(TRANSFER_METADATA_BUCKET, &key).await? {
                let metadata: EngineTransferMetadata = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt transfer metadata at {key}"))?;
                return Ok(metadata);
            }
            tracing::debug!(
                engine_id,
                attempt,
                "transfer metadata not yet published, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        raise!(
            "transfer metadata for engine {engine_id} not published after {} attempts",
            self.config.max_get_attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disagg_runtime::storage::MemoryStore;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    fn metadata(engine_id: &str) -> EngineTransferMetadata {
        EngineTransferMetadata {
            engine_id: engine_id.to_string(),
            payload: vec![1, 2, 3, 254],
        }
    }

    #[tokio::test]
    async fn put_get_round_trips_unchanged() {
        let metadata_store = MetadataStore::new(store(), "ns");
        let original = metadata("engine-a");
        metadata_store.put(&original).await.unwrap();

        let fetched = metadata_store.get("engine-a").await.unwrap();
        assert_eq!(fetched, original);
    }

    #[tokio::test]
    async fn get_blocks_until_published() {
        let shared = store();
        let reader = MetadataStore::new(shared.clone(), "ns");
        let writer = MetadataStore::new(shared, "ns");

        let fetch = tokio::spawn(async move { reader.get("engine-b").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.put(&metadata("engine-b")).await.unwrap();

        let fetched = fetch.await.unwrap().unwrap();
        assert_eq!(fetched.engine_id, "engine-b");
    }

    #[tokio::test]
    async fn get_gives_up_after_retry_budget() {
        let config = MetadataStoreConfig {
            max_get_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let metadata_store = MetadataStore::with_config(store(), "ns", config);
        assert!(metadata_store.get("never-published").await.is_err());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let shared = store();
        let a = MetadataStore::new(shared.clone(), "ns-a");
        let b = MetadataStore::with_config(
            shared,
            "ns-b",
            MetadataStoreConfig {
                max_get_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
        );

        a.put(&metadata("engine-a")).await.unwrap();
        assert!(b.get("engine-a").await.is_err());
    }
}
