// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! etcd transport.
//!
//! One connection per process. A primary lease is granted at connect time and
//! kept alive from the secondary runtime; keys written through [`EtcdStore`]
//! are attached to that lease so the records disappear when the process does.
//! The lease id doubles as the process instance id.

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{GetOptions, PutOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::environment;
use crate::storage::key_value_store::KeyValueStore;
use crate::{ErrorContext, Result, Runtime, error};

/// Consecutive keep-alive failures tolerated before the lease is declared lost.
const MAX_KEEPALIVE_FAILURES: u32 = 5;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub etcd_urls: Vec<String>,
    /// Grant a lease at connect time and attach written keys to it.
    pub attach_lease: bool,
    /// Lease time-to-live in seconds.
    pub lease_ttl: i64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let etcd_urls = std::env::var(environment::ETCD_ENDPOINTS)
            .unwrap_or_else(|_| "http://localhost:2379".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            etcd_urls,
            attach_lease: true,
            lease_ttl: 10,
        }
    }
}

/// etcd client with an attached primary lease.
#[derive(Clone)]
pub struct Client {
    client: etcd_client::Client,
    lease_id: i64,
}

impl Client {
    pub async fn new(options: ClientOptions, runtime: Runtime) -> Result<Self> {
        let client = etcd_client::Client::connect(options.etcd_urls.clone(), None)
            .await
            .with_context(|| {
                format!(
                    "unable to connect to etcd at {}; check etcd server status",
                    options.etcd_urls.join(", ")
                )
            })?;

        let lease_id = if options.attach_lease {
            let lease = client
                .clone()
                .lease_grant(options.lease_ttl, None)
                .await
                .context("failed to grant primary lease")?;
            runtime.secondary().spawn(keep_lease_alive(
                client.clone(),
                lease.id(),
                options.lease_ttl,
                runtime.primary_token(),
            ));
            lease.id()
        } else {
            0
        };

        Ok(Self { client, lease_id })
    }

    /// The primary lease id; 0 when no lease was requested.
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    pub async fn kv_put(&self, key: &str, value: Vec<u8>, with_lease: bool) -> Result<()> {
        let options = (with_lease && self.lease_id != 0)
            .then(|| PutOptions::new().with_lease(self.lease_id));
        self.client
            .clone()
            .put(key, value, options)
            .await
            .with_context(|| format!("etcd put failed for key {key}"))?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .clone()
            .get(key, None)
            .await
            .with_context(|| format!("etcd get failed for key {key}"))?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    pub async fn kv_get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .with_context(|| format!("etcd prefix get failed for {prefix}"))?;
        response
            .kvs()
            .iter()
            .map(|kv| {
                let key = kv
                    .key_str()
                    .map_err(|e| error!("etcd returned a non-utf8 key: {e}"))?
                    .to_string();
                Ok((key, kv.value().to_vec()))
            })
            .collect()
    }

    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        self.client
            .clone()
            .delete(key, None)
            .await
            .with_context(|| format!("etcd delete failed for key {key}"))?;
        Ok(())
    }
}

/// Renew the primary lease until cancelled. Losing the lease makes every
/// registration written by this process expire, so repeated failures cancel
/// the runtime token instead of limping along invisibly.
async fn keep_lease_alive(
    client: etcd_client::Client,
    lease_id: i64,
    ttl: i64,
    token: CancellationToken,
) {
    let interval = Duration::from_secs((ttl as u64 / 3).max(1));
    let mut failures: u32 = 0;

    let (mut keeper, mut responses) = match client.clone().lease_keep_alive(lease_id).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(lease_id, error = %e, "failed to start lease keep-alive");
            token.cancel();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(lease_id, "lease keep-alive stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let renewed = match keeper.keep_alive().await {
            Ok(()) => matches!(responses.message().await, Ok(Some(_))),
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "lease keep-alive send failed");
                false
            }
        };

        if renewed {
            failures = 0;
            continue;
        }

        failures += 1;
        if failures >= MAX_KEEPALIVE_FAILURES {
            tracing::error!(
                lease_id,
                failures,
                "lease presumed lost; requesting shutdown"
            );
            token.cancel();
            return;
        }
    }
}

/// [`KeyValueStore`] backed by etcd. Keys are laid out as `{bucket}/{key}`
/// and attached to the client's primary lease.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn full_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn put(&self, bucket: &str, key: &str, value: Bytes) -> Result<()> {
        self.client
            .kv_put(&Self::full_key(bucket, key), value.to_vec(), true)
            .await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .client
            .kv_get(&Self::full_key(bucket, key))
            .await?
            .map(Bytes::from))
    }

    async fn get_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let root = format!("{bucket}/");
        let entries = self.client.kv_get_prefix(&Self::full_key(bucket, prefix)).await?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| {
                let key = key.strip_prefix(&root).unwrap_or(&key).to_string();
                (key, Bytes::from(value))
            })
            .collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client.kv_delete(&Self::full_key(bucket, key)).await
    }

    fn connection_id(&self) -> u64 {
        self.client.lease_id() as u64
    }
}
