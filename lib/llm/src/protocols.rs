// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed boundary records.
//!
//! Payloads are validated once when they cross a process boundary (queue
//! dequeue, store fetch) and used as strongly-typed values everywhere else.

use serde::{Deserialize, Serialize};

pub type TokenId = u32;
pub type BlockId = u64;

/// Engine sampling controls carried with a prefill handoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<u32>,
    #[serde(default)]
    pub ignore_eos: bool,
}

/// Reference to multimodal input fetched by the prefill side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultimodalDataSource {
    pub image_url: String,
}

/// One remote-prefill work item.
///
/// Created once by the decode worker when the router picks remote prefill,
/// consumed exactly once by a prefill worker, immutable after creation. The
/// `transfer_descriptor` is the opaque serialized handle of the decode-side
/// target buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePrefillRequest {
    pub request_id: String,
    pub engine_id: String,
    pub token_ids: Vec<TokenId>,
    pub block_ids: Vec<BlockId>,
    pub computed_block_ids: Vec<BlockId>,
    pub sampling_params: SamplingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal_data_source: Option<MultimodalDataSource>,
    pub transfer_descriptor: Vec<u8>,
}

/// Why a response stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

/// One streamed increment of a generation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseDelta {
    pub token_ids: Vec<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl ResponseDelta {
    /// Terminal delta for a stream that finished normally.
    pub fn stopped() -> Self {
        Self {
            token_ids: vec![],
            finish_reason: Some(FinishReason::Stop),
            stop_reason: None,
        }
    }

    /// Terminal delta for a stream that failed.
    pub fn errored() -> Self {
        Self {
            token_ids: vec![],
            finish_reason: Some(FinishReason::Error),
            stop_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Caller-facing sampling knobs on the decode ingress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub ignore_eos: bool,
}

/// Tokenized generation request arriving at the decode worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedRequest {
    pub token_ids: Vec<TokenId>,
    #[serde(default)]
    pub sampling_options: SamplingOptions,
    #[serde(default)]
    pub stop_conditions: StopConditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal_data_source: Option<MultimodalDataSource>,
}

impl PreprocessedRequest {
    /// Fold the ingress options into engine sampling parameters.
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.sampling_options.temperature,
            top_p: self.sampling_options.top_p,
            top_k: self.sampling_options.top_k,
            max_tokens: self.stop_conditions.max_tokens,
            min_tokens: None,
            ignore_eos: self.stop_conditions.ignore_eos,
        }
    }
}

/// Per-engine transfer-capability blob.
///
/// Written once per engine process lifetime (a restart produces a new
/// `engine_id`); the payload is opaque and must round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTransferMetadata {
    pub engine_id: String,
    pub payload: Vec<u8>,
}
