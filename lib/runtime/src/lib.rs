// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process and distributed runtime for the disaggregated serving workers.
//!
//! The [`Runtime`] owns the tokio handles and the root [`CancellationToken`];
//! the [`DistributedRuntime`] layers the shared transports (NATS, etcd) and
//! the key/value store on top. Components never open their own connections,
//! they borrow them from the runtime that was passed into their constructor.

use std::sync::Arc;

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod component;
pub mod config;
pub mod distributed;
pub mod logging;
pub mod runtime;
pub mod storage;
pub mod transports;
pub mod worker;

pub use config::RuntimeConfig;
pub use storage::key_value_store::KeyValueStore;
pub use tokio_util::sync::CancellationToken;
pub use worker::Worker;

/// Local process runtime: thread pools plus the root cancellation token.
///
/// The secondary handle is reserved for background transport chores
/// (lease keep-alive, metrics mirroring) so they never compete with the
/// request path for the primary pool.
#[derive(Clone)]
pub struct Runtime {
    id: Arc<String>,
    primary: RuntimeType,
    secondary: RuntimeType,
    cancellation_token: CancellationToken,
}

/// How a tokio runtime handle is owned by the [`Runtime`].
#[derive(Clone)]
pub enum RuntimeType {
    /// Borrowed from an externally driven runtime (e.g. `#[tokio::main]`).
    External(tokio::runtime::Handle),
    /// Owned and shared.
    Shared(Arc<tokio::runtime::Runtime>),
}

/// Distributed runtime: shared cluster resources for one process.
///
/// Connections are opened once per process lifetime and reused by every
/// component. A store-only variant ([`DistributedRuntime::new_local`]) backs
/// single-process deployments and tests.
#[derive(Clone)]
pub struct DistributedRuntime {
    runtime: Runtime,
    etcd_client: Option<transports::etcd::Client>,
    nats_client: Option<transports::nats::Client>,
    store: Arc<dyn KeyValueStore>,
}
