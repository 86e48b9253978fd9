// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local-vs-remote prefill decision policy.
//!
//! Pure and stateless; safe under unbounded concurrent calls. Short prompts
//! stay local, and a congested prefill queue overrides the size-based
//! preference for remote.

#[derive(Debug, Clone)]
pub struct DisaggregatedRouterConfig {
    /// Prompts at or below this length always prefill locally.
    pub max_local_prefill_length: usize,
    /// Queue depths above this force local prefill (backpressure).
    pub max_prefill_queue_size: usize,
}

pub struct DisaggregatedRouter {
    config: DisaggregatedRouterConfig,
}

impl DisaggregatedRouter {
    pub fn new(config: DisaggregatedRouterConfig) -> Self {
        Self { config }
    }

    /// `true` means prefill remotely.
    ///
    /// `prefix_hit_rate` is accepted but advisory; it does not participate in
    /// the decision yet and callers must not assume it does.
    pub fn prefill_remote(
        &self,
        prompt_length: usize,
        prefix_hit_rate: f64,
        queue_depth: usize,
    ) -> bool {
        let _ = prefix_hit_rate;
        if prompt_length <= self.config.max_local_prefill_length {
            return false;
        }
        if queue_depth > self.config.max_prefill_queue_size {
            return false;
        }
        true
    }

    pub fn config(&self) -> &DisaggregatedRouterConfig {
        &self.config
    }
}
