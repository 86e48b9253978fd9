// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Settings are resolved once at startup (serde defaults overlaid with
//! `DISAGG_`-prefixed environment variables) and handed to constructors by
//! value. There is no global configuration singleton.

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Environment variable names shared across the workspace.
pub mod environment {
    /// NATS server address, e.g. `nats://localhost:4222`.
    pub const NATS_SERVER: &str = "NATS_SERVER";
    /// Comma-separated etcd endpoints, e.g. `http://localhost:2379`.
    pub const ETCD_ENDPOINTS: &str = "ETCD_ENDPOINTS";
    /// Log filter directive set, see [`crate::logging`].
    pub const LOG_FILTER: &str = "DISAGG_LOG";
    /// Set to `1` to emit JSONL log records.
    pub const LOG_JSONL: &str = "DISAGG_LOGGING_JSONL";
}

/// Thread-pool sizing for the [`crate::Runtime`].
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker threads for the primary pool; `None` uses the tokio default.
    pub num_worker_threads: Option<usize>,
    /// Upper bound on blocking threads.
    pub max_blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: None,
            max_blocking_threads: 16,
        }
    }
}

impl RuntimeConfig {
    /// Resolve the configuration from defaults + `DISAGG_` environment overrides.
    pub fn from_settings() -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("DISAGG_"))
            .extract()?;
        Ok(config)
    }

    /// Configuration for a single-threaded runtime.
    pub fn single_threaded() -> Self {
        Self {
            num_worker_threads: Some(1),
            max_blocking_threads: 1,
        }
    }

    /// Build a tokio runtime from this configuration.
    pub fn create_runtime(&self) -> Result<tokio::runtime::Runtime> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = self.num_worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder
            .max_blocking_threads(self.max_blocking_threads)
            .enable_all()
            .build()?;
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_a_runtime() {
        let config = RuntimeConfig::single_threaded();
        let runtime = config.create_runtime().unwrap();
        runtime.block_on(async {});
    }
}
