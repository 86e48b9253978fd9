// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker load metrics.
//!
//! The publisher keeps a process-wide latest-value snapshot in a watch
//! channel: publishing is a synchronous replace that never blocks the
//! generation path, and a superseded update is simply dropped. The endpoint
//! task mirrors the latest snapshot into the key/value store under the
//! component address for external routing and orchestration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use disagg_runtime::component::Component;
use disagg_runtime::{KeyValueStore, Result};

/// Store bucket holding worker load snapshots.
pub const METRICS_ROOT_PATH: &str = "v1/metrics";

/// One forward-pass load snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardPassMetrics {
    pub request_active_slots: u64,
    pub request_total_slots: u64,
    pub kv_active_blocks: u64,
    pub kv_total_blocks: u64,
    pub num_requests_waiting: u64,
    pub gpu_cache_usage_perc: f32,
    pub gpu_prefix_cache_hit_rate: f32,
}

pub struct WorkerMetricsPublisher {
    tx: watch::Sender<Arc<ForwardPassMetrics>>,
}

impl WorkerMetricsPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ForwardPassMetrics::default()));
        Self { tx }
    }

    /// Replace the snapshot. Latest value wins; never blocks.
    pub fn publish(&self, metrics: ForwardPassMetrics) {
        self.tx.send_replace(Arc::new(metrics));
    }

    /// Seed placeholder values so consumers see a signal before the engine's
    /// first forward pass produces a real measurement. Call once at startup.
    pub fn publish_initial(&self) {
        self.publish(ForwardPassMetrics {
            request_active_slots: 0,
            request_total_slots: 1024,
            kv_active_blocks: 0,
            kv_total_blocks: 1024,
            num_requests_waiting: 0,
            gpu_cache_usage_perc: 0.0,
            gpu_prefix_cache_hit_rate: 0.0,
        });
    }

    pub fn latest(&self) -> Arc<ForwardPassMetrics> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ForwardPassMetrics>> {
        self.tx.subscribe()
    }

    /// Mirror the latest snapshot into the store under the component address,
    /// at `v1/metrics/{namespace}/{component}/{instance_id:x}`. The task runs
    /// until the runtime shuts down.
    pub async fn create_endpoint(&self, component: &Component) -> Result<()> {
        let store = component.drt().store();
        let key = format!("{}/{:x}", component.path(), component.drt().connection_id());
        let token = component.drt().child_token();
        let mut rx = self.subscribe();

        tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                match serde_json::to_vec(&*snapshot) {
                    Ok(bytes) => {
                        if let Err(e) = store.put(METRICS_ROOT_PATH, &key, bytes.into()).await {
                            tracing::warn!(key, error = %e, "failed to mirror metrics snapshot");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize metrics snapshot"),
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("metrics endpoint task stopped");
        });

        Ok(())
    }
}

impl Default for WorkerMetricsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_publish_seeds_placeholder_totals() {
        let publisher = WorkerMetricsPublisher::new();
        publisher.publish_initial();
        let snapshot = publisher.latest();
        assert_eq!(snapshot.request_total_slots, 1024);
        assert_eq!(snapshot.kv_total_blocks, 1024);
        assert_eq!(snapshot.request_active_slots, 0);
    }

    #[test]
    fn latest_value_wins() {
        let publisher = WorkerMetricsPublisher::new();
        publisher.publish(ForwardPassMetrics {
            request_active_slots: 1,
            ..Default::default()
        });
        publisher.publish(ForwardPassMetrics {
            request_active_slots: 2,
            ..Default::default()
        });
        assert_eq!(publisher.latest().request_active_slots, 2);
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let publisher = WorkerMetricsPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.publish(ForwardPassMetrics {
            num_requests_waiting: 5,
            ..Default::default()
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().num_requests_waiting, 5);
    }

    #[tokio::test]
    async fn endpoint_mirrors_snapshots_into_store() {
        use disagg_runtime::{DistributedRuntime, Runtime};

        let drt = DistributedRuntime::new_local(Runtime::from_current().unwrap());
        let component = drt
            .namespace("ns")
            .unwrap()
            .component("decode")
            .unwrap();

        let publisher = WorkerMetricsPublisher::new();
        publisher.publish_initial();
        publisher.create_endpoint(&component).await.unwrap();

        publisher.publish(ForwardPassMetrics {
            kv_active_blocks: 42,
            ..Default::default()
        });

        let key = format!("{}/{:x}", component.path(), drt.connection_id());
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some(bytes) = drt.store().get(METRICS_ROOT_PATH, &key).await.unwrap() {
                let snapshot: ForwardPassMetrics = serde_json::from_slice(&bytes).unwrap();
                if snapshot.kv_active_blocks == 42 {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "snapshot was not mirrored in time"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
