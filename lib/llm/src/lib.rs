// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Disaggregated prefill/decode serving.
//!
//! A decode worker decides per request whether prompt processing runs
//! co-located or is offloaded to the prefill pool, and manages the handoff:
//! the durable [`queue`], the [`metadata`] exchange, the zero-copy
//! [`connect`] transfer session, and the completion synchronization that
//! reunites remotely computed state with the decoder.

pub mod connect;
pub mod engine;
pub mod metadata;
pub mod metrics;
pub mod mocker;
pub mod protocols;
pub mod queue;
pub mod router;
pub mod workers;

pub use router::{DisaggregatedRouter, DisaggregatedRouterConfig};
pub use workers::decode::{DecodeWorker, DecodeWorkerConfig};
pub use workers::prefill::{PrefillWorker, PrefillWorkerConfig, WorkerState};
