// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Decode worker.
//!
//! Accepts generation requests, consults the router for a local-vs-remote
//! prefill decision, and on a remote decision injects a handoff callback into
//! the engine's generation call: the callback packages the reserved blocks
//! into a [`RemotePrefillRequest`], enqueues it, and awaits the transfer into
//! the worker's registered KV buffer under the configured ceiling.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use uuid::Uuid;

use disagg_runtime::{ErrorContext, Result, error};

use crate::connect::{Buffer, Connector, DataType, Descriptor, Device};
use crate::engine::{InferenceEngine, EngineRequest, RemotePrefillCallback, RemotePrefillParams};
use crate::metadata::MetadataStore;
use crate::metrics::WorkerMetricsPublisher;
use crate::protocols::{
    MultimodalDataSource, PreprocessedRequest, RemotePrefillRequest, ResponseDelta, SamplingParams,
    TokenId,
};
use crate::queue::PrefillQueue;
use crate::router::DisaggregatedRouter;

#[derive(Debug, Clone)]
pub struct DecodeWorkerConfig {
    /// Offload prefill for eligible requests.
    pub remote_prefill: bool,
    /// Ceiling on the wait for a remote transfer to complete.
    pub transfer_timeout: Duration,
    /// Size of the long-lived KV landing buffer in bytes.
    pub kv_buffer_bytes: usize,
}

impl Default for DecodeWorkerConfig {
    fn default() -> Self {
        Self {
            remote_prefill: false,
            transfer_timeout: Duration::from_secs(30),
            kv_buffer_bytes: 4096,
        }
    }
}

pub struct DecodeWorker {
    engine: Arc<dyn InferenceEngine>,
    /// `None` means unconditional: every prefill goes remote when enabled.
    router: Option<DisaggregatedRouter>,
    queue: Arc<PrefillQueue>,
    connector: Connector,
    metrics: Arc<WorkerMetricsPublisher>,
    kv_descriptor: Descriptor,
    config: DecodeWorkerConfig,
}

impl DecodeWorker {
    pub async fn new(
        engine: Arc<dyn InferenceEngine>,
        router: Option<DisaggregatedRouter>,
        queue: Arc<PrefillQueue>,
        connector: Connector,
        metadata_store: &MetadataStore,
        metrics: Arc<WorkerMetricsPublisher>,
        config: DecodeWorkerConfig,
    ) -> Result<Self> {
        // The landing buffer outlives individual requests; registration cost
        // is paid once here, not on the hot path.
        let buffer = Buffer::zeroed(&[config.kv_buffer_bytes], DataType::U8, Device::Cpu);
        let kv_descriptor = connector.register(buffer)?;
        kv_descriptor.register_memory(&connector)?;

        // Prefill workers import this engine's metadata before writing back.
        if config.remote_prefill {
            metadata_store.put(&engine.transfer_metadata()).await?;
        }

        // Consumers need a signal before the first real forward pass.
        metrics.publish_initial();

        Ok(Self {
            engine,
            router,
            queue,
            connector,
            metrics,
            kv_descriptor,
            config,
        })
    }

    /// The KV landing buffer remote prefills write into.
    pub fn kv_descriptor(&self) -> &Descriptor {
        &self.kv_descriptor
    }

    pub fn metrics(&self) -> &Arc<WorkerMetricsPublisher> {
        &self.metrics
    }

    /// Serve one generation request as a stream of deltas.
    pub async fn generate(
        &self,
        request: PreprocessedRequest,
    ) -> Result<impl Stream<Item = ResponseDelta> + Send + 'static> {
        let request_id = Uuid::new_v4().to_string();
        let prompt_length = request.token_ids.len();
        let sampling_params = request.sampling_params();

        let remote = if !self.config.remote_prefill {
            false
        } else {
            match &self.router {
                Some(router) => {
                    let queue_depth = self
                        .queue
                        .queue_size()
                        .await
                        .context("failed to sample prefill queue depth")?;
                    // Prefix hit rate is not yet reported by the ingress router.
                    router.prefill_remote(prompt_length, 0.0, queue_depth)
                }
                None => true,
            }
        };

        let remote_prefill_params = if remote {
            tracing::info!(
                request_id = %request_id,
                prompt_length,
                "prefilling remotely"
            );
            Some(RemotePrefillParams {
                is_remote_prefill: true,
                remote_prefill_request_callback: Some(self.remote_prefill_callback(
                    request_id.clone(),
                    request.token_ids.clone(),
                    sampling_params.clone(),
                    request.multimodal_data_source.clone(),
                )),
                ..Default::default()
            })
        } else {
            tracing::info!(
                request_id = %request_id,
                prompt_length,
                "prefilling locally"
            );
            None
        };

        let engine_stream = self
            .engine
            .generate(EngineRequest {
                request_id,
                token_ids: request.token_ids,
                sampling_params,
                remote_prefill_params,
                kv_staging: None,
            })
            .await?;

        Ok(map_engine_stream(engine_stream))
    }

    /// Build the callback the engine invokes with the reserved KV blocks.
    fn remote_prefill_callback(
        &self,
        request_id: String,
        token_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
        multimodal_data_source: Option<MultimodalDataSource>,
    ) -> RemotePrefillCallback {
        let engine_id = self.engine.engine_id().to_string();
        let queue = self.queue.clone();
        let connector = self.connector.clone();
        let descriptor = self.kv_descriptor.clone();
        let transfer_timeout = self.config.transfer_timeout;

        Arc::new(move |assignment| {
            let request_id = request_id.clone();
            let engine_id = engine_id.clone();
            let token_ids = token_ids.clone();
            let sampling_params = sampling_params.clone();
            let multimodal_data_source = multimodal_data_source.clone();
            let queue = queue.clone();
            let connector = connector.clone();
            let descriptor = descriptor.clone();

            async move {
                // The writable scope spans the enqueue and the completion
                // wait; dropping it on any exit path releases the transport
                // resources.
                let writable = connector.create_writable(&descriptor)?;
                let request = RemotePrefillRequest {
                    request_id: request_id.clone(),
                    engine_id,
                    token_ids,
                    block_ids: assignment.block_ids,
                    computed_block_ids: assignment.computed_block_ids,
                    sampling_params,
                    multimodal_data_source,
                    transfer_descriptor: writable.to_serialized()?,
                };

                queue.enqueue_prefill_request(&request).await?;

                tokio::time::timeout(transfer_timeout, writable.wait_for_completion())
                    .await
                    .map_err(|_| {
                        error!(
                            "remote prefill transfer for request {request_id} did not complete within {transfer_timeout:?}"
                        )
                    })??;
                Ok(())
            }
            .boxed()
        })
    }
}

/// Map engine increments onto response deltas.
///
/// A finished result closes the stream with `stop` and no tokens; a result
/// with no outputs is a terminal failure and closes the stream with `error`.
fn map_engine_stream(
    mut stream: crate::engine::EngineStream,
) -> impl Stream<Item = ResponseDelta> + Send + 'static {
    async_stream::stream! {
        while let Some(response) = stream.next().await {
            if response.finished {
                yield ResponseDelta::stopped();
                break;
            }
            let Some(output) = response.outputs.into_iter().next() else {
                yield ResponseDelta::errored();
                break;
            };
            yield ResponseDelta {
                token_ids: output.token_ids,
                finish_reason: output.finish_reason,
                stop_reason: output.stop_reason,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::protocols::FinishReason;
    use futures::stream;

    async fn collect(outputs: Vec<EngineOutput>) -> Vec<ResponseDelta> {
        map_engine_stream(Box::pin(stream::iter(outputs)))
            .collect()
            .await
    }

    #[tokio::test]
    async fn finished_result_maps_to_stop_with_empty_tokens() {
        let deltas = collect(vec![
            EngineOutput::delta(vec![1]),
            EngineOutput::delta(vec![2]),
            EngineOutput::finished(),
        ])
        .await;

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].token_ids, vec![1]);
        assert_eq!(deltas[0].finish_reason, None);
        assert_eq!(deltas[1].finish_reason, None);
        assert_eq!(
            deltas[2],
            ResponseDelta {
                token_ids: vec![],
                finish_reason: Some(FinishReason::Stop),
                stop_reason: None,
            }
        );
    }

    #[tokio::test]
    async fn outputless_result_maps_to_error_and_closes() {
        let deltas = collect(vec![
            EngineOutput::delta(vec![1]),
            EngineOutput::failed(),
            // Anything after the failure marker must not be surfaced.
            EngineOutput::delta(vec![2]),
        ])
        .await;

        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[1],
            ResponseDelta {
                token_ids: vec![],
                finish_reason: Some(FinishReason::Error),
                stop_reason: None,
            }
        );
    }

    #[tokio::test]
    async fn intermediate_deltas_never_carry_finish_reason() {
        let deltas = collect(vec![
            EngineOutput::delta(vec![1]),
            EngineOutput::delta(vec![2]),
            EngineOutput::delta(vec![3]),
            EngineOutput::finished(),
        ])
        .await;

        let (terminal, intermediate) = deltas.split_last().unwrap();
        assert!(intermediate.iter().all(|d| d.finish_reason.is_none()));
        assert!(terminal.is_terminal());
    }
}
