// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::component::Namespace;
use crate::storage::key_value_store::MemoryStore;
use crate::transports::{etcd, nats};
use crate::{DistributedRuntime, KeyValueStore, Result, Runtime};
use tokio_util::sync::CancellationToken;

impl DistributedRuntime {
    /// Connect the shared transports. Called once per process lifetime.
    pub async fn new(runtime: Runtime, config: DistributedConfig) -> Result<Self> {
        let etcd_client = etcd::Client::new(config.etcd_config, runtime.clone()).await?;
        let nats_client = nats::Client::connect(config.nats_config).await?;
        let store: Arc<dyn KeyValueStore> = Arc::new(etcd::EtcdStore::new(etcd_client.clone()));

        Ok(Self {
            runtime,
            etcd_client: Some(etcd_client),
            nats_client: Some(nats_client),
            store,
        })
    }

    pub async fn from_settings(runtime: Runtime) -> Result<Self> {
        Self::new(runtime, DistributedConfig::from_settings()).await
    }

    /// Store-only runtime over in-process memory. No NATS, no etcd.
    ///
    /// Used by single-process loopback deployments and tests.
    pub fn new_local(runtime: Runtime) -> Self {
        Self {
            runtime,
            etcd_client: None,
            nats_client: None,
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Create a [`Namespace`] rooted at this runtime.
    pub fn namespace(&self, name: impl Into<String>) -> Result<Namespace> {
        Namespace::new(self.clone(), name.into())
    }

    pub fn etcd_client(&self) -> Option<etcd::Client> {
        self.etcd_client.clone()
    }

    pub fn nats_client(&self) -> Option<nats::Client> {
        self.nats_client.clone()
    }

    /// The shared key/value store.
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    /// Process instance identity, stable for the lifetime of the connection.
    pub fn connection_id(&self) -> u64 {
        self.store.connection_id()
    }

    pub fn primary_token(&self) -> CancellationToken {
        self.runtime.primary_token()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.runtime.child_token()
    }

    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}

pub struct DistributedConfig {
    pub etcd_config: etcd::ClientOptions,
    pub nats_config: nats::ClientOptions,
}

impl DistributedConfig {
    pub fn from_settings() -> DistributedConfig {
        DistributedConfig {
            etcd_config: etcd::ClientOptions::default(),
            nats_config: nats::ClientOptions::default(),
        }
    }
}
