// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prefill worker.
//!
//! Life-cycle: `Created -> Initializing -> Ready -> Draining -> Stopped`.
//! Initialization health-checks the peer quorum, publishes the engine's
//! transfer metadata, and registers the staging buffer; the ready loop
//! consumes the queue, executes prefill, and completes the remote write
//! against each request's transfer descriptor.
//!
//! Failure policy: a bad request is logged and dropped, the loop continues.
//! An error from the queue itself is returned to the caller — a supervised
//! restart beats a stalled-but-alive consumer.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use disagg_runtime::component;
use disagg_runtime::{ErrorContext, Result, raise};

use crate::connect::{Buffer, Connector, DataType, Descriptor, Device, SerializedRequest};
use crate::engine::{EngineRequest, InferenceEngine, RemotePrefillParams};
use crate::metadata::MetadataStore;
use crate::protocols::RemotePrefillRequest;
use crate::queue::PrefillQueue;

/// Worker life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initializing,
    Ready,
    Draining,
    Stopped,
}

/// Peer workers that must be visible before this worker goes ready.
#[derive(Clone)]
pub struct PeerQuorum {
    pub client: component::Client,
    pub min_instances: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PrefillWorkerConfig {
    /// Size of the staging buffer prefill compute fills, in bytes.
    pub staging_buffer_bytes: usize,
    /// Recently executed request ids remembered for duplicate suppression.
    pub dedupe_capacity: usize,
}

impl Default for PrefillWorkerConfig {
    fn default() -> Self {
        Self {
            staging_buffer_bytes: 4096,
            dedupe_capacity: 1024,
        }
    }
}

pub struct PrefillWorker {
    engine: Arc<dyn InferenceEngine>,
    queue: Arc<PrefillQueue>,
    metadata_store: MetadataStore,
    connector: Connector,
    peer_quorum: Option<PeerQuorum>,
    state: watch::Sender<WorkerState>,
    config: PrefillWorkerConfig,
}

impl PrefillWorker {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        queue: Arc<PrefillQueue>,
        metadata_store: MetadataStore,
        connector: Connector,
        peer_quorum: Option<PeerQuorum>,
        config: PrefillWorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        Self {
            engine,
            queue,
            metadata_store,
            connector,
            peer_quorum,
            state,
            config,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Readiness for the orchestrator: true once the consumer loop is up.
    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// Liveness for the orchestrator.
    pub fn is_live(&self) -> bool {
        self.state() != WorkerState::Stopped
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run until cancelled or until the queue fails.
    ///
    /// Initialization errors (unmet quorum, metadata publish failure) and
    /// queue errors are returned; the caller decides between exit and
    /// supervised restart. Teardown is best-effort: later steps still run
    /// when an earlier one errors.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.set_state(WorkerState::Initializing);

        let init = self.initialize().await;
        let result = match init {
            Ok(staging) => {
                self.set_state(WorkerState::Ready);
                tracing::info!(engine_id = %self.engine.engine_id(), "prefill worker ready");
                self.consume_loop(&staging, &cancel).await
            }
            Err(e) => Err(e),
        };

        self.set_state(WorkerState::Draining);
        tracing::info!("prefill worker draining");
        if let Err(e) = self.engine.close().await {
            tracing::warn!(error = %e, "engine close failed during drain");
        }
        if let Err(e) = self.queue.close().await {
            tracing::warn!(error = %e, "queue close failed during drain");
        }
        self.set_state(WorkerState::Stopped);
        tracing::info!("prefill worker stopped");

        result
    }

    async fn initialize(&self) -> Result<Descriptor> {
        if let Some(quorum) = &self.peer_quorum {
            quorum
                .client
                .wait_for_instances(quorum.min_instances, quorum.timeout)
                .await
                .context("required peer workers did not become available")?;
        }

        self.metadata_store
            .put(&self.engine.transfer_metadata())
            .await?;

        // Long-lived staging buffer, registered once and reused per request.
        let staging = self.connector.register(Buffer::zeroed(
            &[self.config.staging_buffer_bytes],
            DataType::U8,
            Device::Cpu,
        ))?;
        staging.register_memory(&self.connector)?;
        Ok(staging)
    }

    async fn consume_loop(&self, staging: &Descriptor, cancel: &CancellationToken) -> Result<()> {
        let mut loaded_metadata: HashSet<String> = HashSet::new();
        let mut recent = RecentRequests::new(self.config.dedupe_capacity);

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("termination requested, stopping queue consumption");
                    return Ok(());
                }
                // Queue errors are fatal to the loop by design.
                request = self.queue.dequeue_prefill_request() => request?,
            };

            let Some(request) = request else {
                continue;
            };

            if request.request_id.is_empty() {
                tracing::warn!("discarding prefill request with empty request_id");
                continue;
            }
            if !recent.insert(request.request_id.clone()) {
                // At-least-once delivery; re-executing would be wasteful, not unsafe.
                tracing::warn!(request_id = %request.request_id, "duplicate delivery, skipping");
                continue;
            }

            tracing::debug!(request_id = %request.request_id, "dequeued prefill request");
            if let Err(e) = self.process(&mut loaded_metadata, staging, request).await {
                tracing::warn!(error = %e, "prefill request failed, dropping");
            }
        }
    }

    async fn process(
        &self,
        loaded_metadata: &mut HashSet<String>,
        staging: &Descriptor,
        request: RemotePrefillRequest,
    ) -> Result<()> {
        // Remote registration is costly and not idempotent: import a peer
        // engine's metadata on first encounter only.
        if !loaded_metadata.contains(&request.engine_id) {
            let metadata = self.metadata_store.get(&request.engine_id).await?;
            self.engine.import_transfer_metadata(metadata).await?;
            loaded_metadata.insert(request.engine_id.clone());
            tracing::info!(
                engine_id = %request.engine_id,
                "loaded transfer metadata from remote engine"
            );
        }

        // Prefill only: a single token forces the full prompt pass without
        // meaningful decode work.
        let mut sampling_params = request.sampling_params.clone();
        sampling_params.max_tokens = Some(1);
        sampling_params.min_tokens = Some(1);

        let mut stream = self
            .engine
            .generate(EngineRequest {
                request_id: request.request_id.clone(),
                token_ids: request.token_ids.clone(),
                sampling_params,
                remote_prefill_params: Some(RemotePrefillParams {
                    is_remote_decode: true,
                    decode_block_ids: request.block_ids.clone(),
                    decode_computed_block_ids: request.computed_block_ids.clone(),
                    decode_engine_id: Some(request.engine_id.clone()),
                    ..Default::default()
                }),
                kv_staging: Some(staging.buffer().clone()),
            })
            .await?;

        while let Some(output) = stream.next().await {
            if !output.finished && output.outputs.is_empty() {
                raise!(
                    "engine produced no output for prefill request {}",
                    request.request_id
                );
            }
        }

        // Completion signal: move the computed state into the decode side's
        // buffer; its waiter resumes once this write lands.
        let target = SerializedRequest::from_bytes(&request.transfer_descriptor)
            .context("prefill request carried an unparseable transfer descriptor")?;
        self.connector.write(&target, &staging.buffer().to_vec()).await?;

        tracing::debug!(request_id = %request.request_id, "remote write complete");
        Ok(())
    }
}

/// Bounded set of recently executed request ids.
struct RecentRequests {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentRequests {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the id was already present.
    fn insert(&mut self, request_id: String) -> bool {
        if self.seen.contains(&request_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(request_id.clone());
        self.seen.insert(request_id);
        true
    }
}
