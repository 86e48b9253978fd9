// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mock inference engine.
//!
//! Implements the [`InferenceEngine`] contract without a model: deltas are
//! synthetic tokens, prefill "compute" fills the staging buffer with a
//! deterministic function of the prompt, and the remote-prefill injection
//! points behave like the real thing. Block reservations and metadata
//! imports are instrumented so coordination tests can assert on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use anyhow::Result;

use crate::connect::Buffer;
use crate::engine::{
    EngineOutput, EngineRequest, EngineStream, InferenceEngine, KvBlockAssignment,
};
use crate::protocols::{EngineTransferMetadata, TokenId};

/// First synthetic token id emitted by the mock decoder.
const TOKEN_BASE: TokenId = 1000;

#[derive(Debug, Clone)]
pub struct MockEngineArgs {
    pub engine_id: String,
    /// Tokens emitted when the request does not cap `max_tokens`.
    pub num_decode_tokens: usize,
    /// Prompt tokens per reserved KV block.
    pub block_size: usize,
    /// Delay between emitted deltas.
    pub token_delay: Duration,
    /// Emit a failure marker after this many deltas.
    pub fail_after: Option<usize>,
}

impl MockEngineArgs {
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            num_decode_tokens: 8,
            block_size: 16,
            token_delay: Duration::ZERO,
            fail_after: None,
        }
    }
}

pub struct MockEngine {
    args: MockEngineArgs,
    next_block_id: AtomicU64,
    metadata_imports: AtomicUsize,
    imported_engines: parking_lot::Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockEngine {
    pub fn new(args: MockEngineArgs) -> Arc<Self> {
        Arc::new(Self {
            args,
            next_block_id: AtomicU64::new(0),
            metadata_imports: AtomicUsize::new(0),
            imported_engines: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of times [`InferenceEngine::import_transfer_metadata`] ran.
    pub fn metadata_import_count(&self) -> usize {
        self.metadata_imports.load(Ordering::SeqCst)
    }

    pub fn imported_engines(&self) -> Vec<String> {
        self.imported_engines.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reserve_blocks(&self, num_tokens: usize) -> KvBlockAssignment {
        let num_blocks = num_tokens.div_ceil(self.args.block_size).max(1);
        let first = self
            .next_block_id
            .fetch_add(num_blocks as u64, Ordering::SeqCst);
        KvBlockAssignment {
            block_ids: (first..first + num_blocks as u64).collect(),
            computed_block_ids: vec![],
        }
    }

    /// Deterministic stand-in for prefill compute.
    pub fn expected_kv_bytes(token_ids: &[TokenId], len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let token = token_ids
                    .get(i % token_ids.len().max(1))
                    .copied()
                    .unwrap_or_default();
                (token as usize + i / token_ids.len().max(1)) as u8
            })
            .collect()
    }

    fn fill_staging(&self, token_ids: &[TokenId], staging: &Buffer) -> Result<()> {
        staging.copy_from_slice(&Self::expected_kv_bytes(token_ids, staging.len()))
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    fn engine_id(&self) -> &str {
        &self.args.engine_id
    }

    fn transfer_metadata(&self) -> EngineTransferMetadata {
        EngineTransferMetadata {
            engine_id: self.args.engine_id.clone(),
            payload: format!("mock-agent:{}", self.args.engine_id).into_bytes(),
        }
    }

    async fn import_transfer_metadata(&self, metadata: EngineTransferMetadata) -> Result<()> {
        self.metadata_imports.fetch_add(1, Ordering::SeqCst);
        self.imported_engines.lock().push(metadata.engine_id);
        Ok(())
    }

    async fn generate(&self, request: EngineRequest) -> Result<EngineStream> {
        let params = request.remote_prefill_params.clone().unwrap_or_default();

        if params.is_remote_prefill {
            let Some(callback) = params.remote_prefill_request_callback.clone() else {
                return Err(disagg_runtime::error!(
                    "remote prefill requested without a callback"
                ));
            };
            let assignment = self.reserve_blocks(request.token_ids.len());
            if let Err(e) = callback(assignment).await {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "remote prefill handoff failed"
                );
                return Ok(Box::pin(stream! {
                    yield EngineOutput::failed();
                }));
            }
        }

        if params.is_remote_decode {
            if let Some(staging) = &request.kv_staging {
                self.fill_staging(&request.token_ids, staging)?;
            }
        }

        let num_tokens = request
            .sampling_params
            .max_tokens
            .map(|n| n as usize)
            .unwrap_or(self.args.num_decode_tokens);
        let fail_after = self.args.fail_after;
        let token_delay = self.args.token_delay;

        Ok(Box::pin(stream! {
            for step in 0..num_tokens {
                if fail_after.is_some_and(|limit| step >= limit) {
                    yield EngineOutput::failed();
                    return;
                }
                if token_delay > Duration::ZERO {
                    tokio::time::sleep(token_delay).await;
                }
                yield EngineOutput::delta(vec![TOKEN_BASE + step as TokenId]);
            }
            yield EngineOutput::finished();
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::SamplingParams;
    use futures::StreamExt;

    fn request(token_ids: Vec<TokenId>) -> EngineRequest {
        EngineRequest {
            request_id: "req".to_string(),
            token_ids,
            sampling_params: SamplingParams::default(),
            remote_prefill_params: None,
            kv_staging: None,
        }
    }

    #[tokio::test]
    async fn emits_deltas_then_finished() {
        let engine = MockEngine::new(MockEngineArgs {
            num_decode_tokens: 3,
            ..MockEngineArgs::new("e")
        });

        let outputs: Vec<_> = engine
            .generate(request(vec![1, 2]))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(outputs.len(), 4);
        assert!(outputs[..3].iter().all(|o| !o.finished && o.outputs.len() == 1));
        assert!(outputs[3].finished);
        assert!(outputs[3].outputs.is_empty());
    }

    #[tokio::test]
    async fn max_tokens_caps_the_stream() {
        let engine = MockEngine::new(MockEngineArgs::new("e"));
        let outputs: Vec<_> = engine
            .generate(EngineRequest {
                sampling_params: SamplingParams {
                    max_tokens: Some(1),
                    ..Default::default()
                },
                ..request(vec![1])
            })
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn fail_after_yields_failure_marker() {
        let engine = MockEngine::new(MockEngineArgs {
            num_decode_tokens: 5,
            fail_after: Some(2),
            ..MockEngineArgs::new("e")
        });

        let outputs: Vec<_> = engine
            .generate(request(vec![1]))
            .await
            .unwrap()
            .collect()
            .await;

        let last = outputs.last().unwrap();
        assert!(!last.finished);
        assert!(last.outputs.is_empty());
    }

    #[tokio::test]
    async fn metadata_imports_are_counted() {
        let engine = MockEngine::new(MockEngineArgs::new("e"));
        assert_eq!(engine.metadata_import_count(), 0);
        engine
            .import_transfer_metadata(EngineTransferMetadata {
                engine_id: "peer".to_string(),
                payload: vec![],
            })
            .await
            .unwrap();
        assert_eq!(engine.metadata_import_count(), 1);
        assert_eq!(engine.imported_engines(), vec!["peer".to_string()]);
    }

    #[tokio::test]
    async fn block_reservations_are_disjoint() {
        let engine = MockEngine::new(MockEngineArgs {
            block_size: 4,
            ..MockEngineArgs::new("e")
        });
        let first = engine.reserve_blocks(8);
        let second = engine.reserve_blocks(8);
        assert_eq!(first.block_ids.len(), 2);
        assert!(first.block_ids.iter().all(|b| !second.block_ids.contains(b)));
    }
}
