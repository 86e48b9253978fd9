// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transfer backend.
//!
//! Transfer targets live in a hub shared by every connector that should be
//! able to reach each other; the "remote" read or write is a memcpy plus a
//! state-change notification. Single-host deployments use this directly, and
//! tests use it to stand in for an RDMA-capable backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use anyhow::Result;

use super::{
    Buffer, OperationId, OperationState, RegionId, SerializedRequest, TransferBackend,
    TransferError,
};

/// Shared registry of open write targets.
#[derive(Default)]
pub struct LoopbackHub {
    operations: Mutex<HashMap<OperationId, TransferTarget>>,
}

#[derive(Clone)]
struct TransferTarget {
    buffer: Buffer,
    state: watch::Sender<OperationState>,
}

pub struct LoopbackBackend {
    hub: Arc<LoopbackHub>,
}

impl LoopbackBackend {
    /// Backend with a private hub; only connectors sharing this backend (or
    /// its hub) can complete each other's writes.
    pub fn new() -> Self {
        Self {
            hub: Arc::new(LoopbackHub::default()),
        }
    }

    /// Backend over an existing hub, pairing it with other backends.
    pub fn with_hub(hub: Arc<LoopbackHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> Arc<LoopbackHub> {
        self.hub.clone()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferBackend for LoopbackBackend {
    async fn initialize(&self, namespace: &str) -> Result<()> {
        tracing::debug!(namespace, "loopback transfer backend initialized");
        Ok(())
    }

    fn register_region(&self, buffer: &Buffer) -> Result<RegionId> {
        let region_id = Uuid::new_v4();
        tracing::trace!(%region_id, size = buffer.len(), "registered loopback region");
        Ok(region_id)
    }

    fn create_write_target(
        &self,
        _region_id: RegionId,
        buffer: &Buffer,
    ) -> Result<(OperationId, watch::Receiver<OperationState>)> {
        let operation_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(OperationState::Created);
        self.hub.operations.lock().insert(
            operation_id,
            TransferTarget {
                buffer: buffer.clone(),
                state: state_tx,
            },
        );
        Ok((operation_id, state_rx))
    }

    fn create_read_source(
        &self,
        _region_id: RegionId,
        buffer: &Buffer,
    ) -> Result<(OperationId, watch::Receiver<OperationState>)> {
        let operation_id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(OperationState::Created);
        self.hub.operations.lock().insert(
            operation_id,
            TransferTarget {
                buffer: buffer.clone(),
                state: state_tx,
            },
        );
        Ok((operation_id, state_rx))
    }

    async fn write(&self, target: &SerializedRequest, payload: &[u8]) -> Result<()> {
        let target_entry = self
            .hub
            .operations
            .lock()
            .get(&target.operation_id)
            .cloned()
            .ok_or(TransferError::UnknownTarget(target.operation_id))?;

        target_entry.state.send_replace(OperationState::InProgress);

        if let Err(e) = target_entry.buffer.copy_from_slice(payload) {
            target_entry.state.send_replace(OperationState::Failed);
            return Err(e);
        }

        target_entry.state.send_replace(OperationState::Completed);
        tracing::trace!(operation_id = %target.operation_id, bytes = payload.len(), "loopback write complete");
        Ok(())
    }

    async fn read(&self, target: &SerializedRequest) -> Result<Vec<u8>> {
        let source_entry = self
            .hub
            .operations
            .lock()
            .get(&target.operation_id)
            .cloned()
            .ok_or(TransferError::UnknownTarget(target.operation_id))?;

        source_entry.state.send_replace(OperationState::InProgress);
        let data = source_entry.buffer.to_vec();
        source_entry.state.send_replace(OperationState::Completed);
        tracing::trace!(operation_id = %target.operation_id, bytes = data.len(), "loopback read complete");
        Ok(data)
    }

    fn release_operation(&self, operation_id: OperationId) {
        self.hub.operations.lock().remove(&operation_id);
    }
}
