// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Two output forms: `READABLE` (default) and `JSONL`, selected with the
//! `DISAGG_LOGGING_JSONL=1` environment variable. Filters come from the
//! `DISAGG_LOG` environment variable as comma-separated directives; the
//! default level is `info` with the noisier transport crates capped at
//! `error`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::config::environment;

/// Default directive set; transport internals stay quiet unless asked for.
const DEFAULT_FILTER: &str =
    "info,async_nats=error,h2=error,tower=error,hyper_util=error,rustls=error";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(environment::LOG_FILTER)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let jsonl = std::env::var(environment::LOG_JSONL)
            .map(|v| v == "1")
            .unwrap_or(false);

        if jsonl {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
