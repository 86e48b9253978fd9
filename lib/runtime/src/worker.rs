// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application entrypoint wrapper.
//!
//! [`Worker::execute_async`] runs the application future with OS termination
//! signals wired to the root [`CancellationToken`]. The signal handler only
//! requests cancellation; teardown happens on the tasks that own the
//! resources, never inside the handler itself.

use std::future::Future;

use crate::{Result, Runtime};
use tokio_util::sync::CancellationToken;

pub struct Worker {
    runtime: Runtime,
}

impl Worker {
    /// Wrap the ambient tokio runtime.
    pub fn from_current() -> Result<Worker> {
        Ok(Worker {
            runtime: Runtime::from_current()?,
        })
    }

    /// Wrap a runtime built from settings.
    pub fn from_settings() -> Result<Worker> {
        Ok(Worker {
            runtime: Runtime::from_settings()?,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Run `app` to completion, cancelling the root token on SIGINT/SIGTERM.
    pub async fn execute_async<F, Fut>(self, app: F) -> Result<()>
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let runtime = self.runtime;
        tokio::spawn(cancel_on_signal(runtime.primary_token()));

        let result = app(runtime.clone()).await;
        runtime.shutdown();
        result
    }
}

#[cfg(unix)]
async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, requesting shutdown"),
        _ = sigint.recv() => tracing::info!("received SIGINT, requesting shutdown"),
    }
    token.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for ctrl-c");
        return;
    }
    tracing::info!("received ctrl-c, requesting shutdown");
    token.cancel();
}
