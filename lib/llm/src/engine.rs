// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The inference engine collaborator contract.
//!
//! The engine is opaque to the coordinator: token sampling, batching and
//! attention live behind [`InferenceEngine`]. The coordinator only needs the
//! remote-prefill injection points — a callback invoked with the reserved
//! block ids on the decode side, and an import operation for a peer engine's
//! transfer metadata on the prefill side.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use anyhow::Result;

use crate::connect::Buffer;
use crate::protocols::{BlockId, EngineTransferMetadata, FinishReason, SamplingParams, TokenId};

/// KV blocks the engine reserved for a request that will prefill remotely.
#[derive(Debug, Clone, Default)]
pub struct KvBlockAssignment {
    pub block_ids: Vec<BlockId>,
    pub computed_block_ids: Vec<BlockId>,
}

/// Callback the decode worker injects into the engine's generation call. The
/// engine invokes it once with the reserved blocks; the returned future
/// resolves when the remote handoff is complete and the transferred state is
/// in place.
pub type RemotePrefillCallback =
    Arc<dyn Fn(KvBlockAssignment) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Remote prefill/decode controls threaded through [`EngineRequest`].
#[derive(Clone, Default)]
pub struct RemotePrefillParams {
    /// Decode side: this request's prefill runs on a remote worker.
    pub is_remote_prefill: bool,
    /// Prefill side: this request decodes on a remote engine.
    pub is_remote_decode: bool,
    pub decode_block_ids: Vec<BlockId>,
    pub decode_computed_block_ids: Vec<BlockId>,
    pub decode_engine_id: Option<String>,
    pub remote_prefill_request_callback: Option<RemotePrefillCallback>,
}

impl std::fmt::Debug for RemotePrefillParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePrefillParams")
            .field("is_remote_prefill", &self.is_remote_prefill)
            .field("is_remote_decode", &self.is_remote_decode)
            .field("decode_block_ids", &self.decode_block_ids)
            .field("decode_computed_block_ids", &self.decode_computed_block_ids)
            .field("decode_engine_id", &self.decode_engine_id)
            .field(
                "remote_prefill_request_callback",
                &self.remote_prefill_request_callback.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

/// One generation call into the engine.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub request_id: String,
    pub token_ids: Vec<TokenId>,
    pub sampling_params: SamplingParams,
    pub remote_prefill_params: Option<RemotePrefillParams>,
    /// Prefill side: staging buffer the engine fills with the computed state.
    pub kv_staging: Option<Buffer>,
}

/// One sequence's incremental output.
#[derive(Debug, Clone, Default)]
pub struct CompletionOutput {
    pub token_ids: Vec<TokenId>,
    pub finish_reason: Option<FinishReason>,
    pub stop_reason: Option<String>,
}

/// One step of engine output. `finished` marks the end of the request;
/// a step that is not finished and carries no outputs signals failure.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub finished: bool,
    pub outputs: Vec<CompletionOutput>,
}

impl EngineOutput {
    pub fn delta(token_ids: Vec<TokenId>) -> Self {
        Self {
            finished: false,
            outputs: vec![CompletionOutput {
                token_ids,
                ..Default::default()
            }],
        }
    }

    pub fn finished() -> Self {
        Self {
            finished: true,
            outputs: vec![],
        }
    }

    /// Failure marker: not finished, no outputs.
    pub fn failed() -> Self {
        Self {
            finished: false,
            outputs: vec![],
        }
    }
}

pub type EngineStream = BoxStream<'static, EngineOutput>;

/// The opaque inference engine.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Unique identity of this engine process instance.
    fn engine_id(&self) -> &str;

    /// This engine's transfer-capability blob for peers to import.
    fn transfer_metadata(&self) -> EngineTransferMetadata;

    /// Import a peer engine's transfer metadata.
    ///
    /// Not idempotent and costly; callers cache loaded engine ids and call
    /// this once per peer engine lifetime.
    async fn import_transfer_metadata(&self, metadata: EngineTransferMetadata) -> Result<()>;

    /// Produce incremental outputs for a request.
    async fn generate(&self, request: EngineRequest) -> Result<EngineStream>;

    /// Close the engine client; part of orderly shutdown.
    async fn close(&self) -> Result<()>;
}
