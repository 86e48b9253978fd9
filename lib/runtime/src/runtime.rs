// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [`Runtime`] is how components access shared process resources: the
//! primary thread pool for the request path, a secondary pool for background
//! transport tasks, and the root [`CancellationToken`] that drives orderly
//! shutdown. Cancelling the token requests shutdown; the owning tasks perform
//! the actual teardown.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::{Result, Runtime, RuntimeType};

pub use tokio_util::sync::CancellationToken;

impl Runtime {
    fn new(primary: RuntimeType, secondary: Option<RuntimeType>) -> Result<Runtime> {
        let id = Arc::new(uuid::Uuid::new_v4().to_string());
        let cancellation_token = CancellationToken::new();

        // Background etcd/nats chores get their own single thread unless the
        // caller supplies a handle.
        let secondary = match secondary {
            Some(secondary) => secondary,
            None => {
                tracing::debug!("created secondary runtime with a single thread");
                RuntimeType::Shared(Arc::new(RuntimeConfig::single_threaded().create_runtime()?))
            }
        };

        Ok(Runtime {
            id,
            primary,
            secondary,
            cancellation_token,
        })
    }

    /// Borrow the ambient tokio runtime (e.g. inside `#[tokio::main]`).
    pub fn from_current() -> Result<Runtime> {
        Runtime::from_handle(tokio::runtime::Handle::current())
    }

    /// Borrow an explicit tokio handle for both pools.
    pub fn from_handle(handle: tokio::runtime::Handle) -> Result<Runtime> {
        let primary = RuntimeType::External(handle.clone());
        let secondary = RuntimeType::External(handle);
        Runtime::new(primary, Some(secondary))
    }

    /// Create an owned runtime from [`RuntimeConfig::from_settings`].
    pub fn from_settings() -> Result<Runtime> {
        let config = RuntimeConfig::from_settings()?;
        let runtime = Arc::new(config.create_runtime()?);
        let primary = RuntimeType::Shared(runtime.clone());
        let secondary = RuntimeType::External(runtime.handle().clone());
        Runtime::new(primary, Some(secondary))
    }

    /// Unique identifier of this runtime instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for the primary/application thread pool.
    pub fn primary(&self) -> tokio::runtime::Handle {
        self.primary.handle()
    }

    /// Handle for the secondary/background thread pool.
    pub fn secondary(&self) -> tokio::runtime::Handle {
        self.secondary.handle()
    }

    /// The root [`CancellationToken`].
    pub fn primary_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// A child token tied to the runtime's life-cycle.
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Request shutdown of everything attached to this runtime.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

impl RuntimeType {
    /// Get a [`tokio::runtime::Handle`] to the underlying runtime.
    pub fn handle(&self) -> tokio::runtime::Handle {
        match self {
            RuntimeType::External(handle) => handle.clone(),
            RuntimeType::Shared(runtime) => runtime.handle().clone(),
        }
    }
}

impl std::fmt::Debug for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::External(_) => write!(f, "RuntimeType::External"),
            RuntimeType::Shared(_) => write!(f, "RuntimeType::Shared"),
        }
    }
}
