// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory transfer session.
//!
//! A [`Connector`] binds a transfer backend to a namespace and hands out
//! [`Descriptor`]s over registered buffers. A decode worker creates a
//! [`WritableOperation`] from a descriptor, ships its serialized handle to
//! the remote peer, and awaits completion; the peer targets the handle with
//! [`Connector::write`]. Descriptors are long-lived and reused sequentially;
//! at most one write is in flight per descriptor at a time.
//!
//! The backend trait works at the operation level only (register / write /
//! release / completion watch). The wire protocol underneath is a backend
//! concern; [`loopback::LoopbackBackend`] is the in-process implementation.

pub mod loopback;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use anyhow::Result;

pub type RegionId = Uuid;
pub type OperationId = Uuid;

/// Errors the transfer session can produce. Callers branch on these to
/// separate misuse from transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connector is not initialized")]
    NotInitialized,

    #[error("descriptor already has a write in flight")]
    WriterBusy,

    #[error("write target {0} is unknown or already released")]
    UnknownTarget(OperationId),

    #[error("payload size {payload} does not match target buffer size {buffer}")]
    SizeMismatch { payload: usize, buffer: usize },

    #[error("transfer {0} failed")]
    Failed(OperationId),

    #[error("transfer backend dropped before operation {0} completed")]
    BackendGone(OperationId),
}

/// Life-cycle of one transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Created,
    InProgress,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    F16,
    Bf16,
    F32,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

/// A transfer buffer with its shape, dtype and device recorded.
///
/// Cloned handles share the same storage.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    shape: Vec<usize>,
    dtype: DataType,
    device: Device,
    data: parking_lot::Mutex<Vec<u8>>,
}

impl Buffer {
    pub fn zeroed(shape: &[usize], dtype: DataType, device: Device) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            inner: Arc::new(BufferInner {
                shape: shape.to_vec(),
                dtype,
                device,
                data: parking_lot::Mutex::new(vec![0; len]),
            }),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the whole buffer; `src` must match the buffer length.
    pub fn copy_from_slice(&self, src: &[u8]) -> Result<()> {
        let mut data = self.inner.data.lock();
        if src.len() != data.len() {
            return Err(TransferError::SizeMismatch {
                payload: src.len(),
                buffer: data.len(),
            }
            .into());
        }
        data.copy_from_slice(src);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("shape", &self.inner.shape)
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device)
            .finish()
    }
}

/// Serialized handle a remote peer uses to target a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedRequest {
    pub namespace: String,
    pub operation_id: OperationId,
    pub region_id: RegionId,
    /// Target buffer size in bytes; lets the writer validate before moving data.
    pub size: usize,
}

impl SerializedRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Operation-level transfer backend: register memory, expose write targets,
/// move bytes, release resources.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Bind the backend to a namespace. Called once, before any registration.
    async fn initialize(&self, namespace: &str) -> Result<()>;

    /// Register a buffer for transfers, amortized across many operations.
    fn register_region(&self, buffer: &Buffer) -> Result<RegionId>;

    /// Expose `buffer` as the target of one remote write.
    fn create_write_target(
        &self,
        region_id: RegionId,
        buffer: &Buffer,
    ) -> Result<(OperationId, watch::Receiver<OperationState>)>;

    /// Expose `buffer` as the source of one remote read.
    fn create_read_source(
        &self,
        region_id: RegionId,
        buffer: &Buffer,
    ) -> Result<(OperationId, watch::Receiver<OperationState>)>;

    /// Perform a remote write against a serialized target.
    async fn write(&self, target: &SerializedRequest, payload: &[u8]) -> Result<()>;

    /// Perform a remote read against a serialized source.
    async fn read(&self, target: &SerializedRequest) -> Result<Vec<u8>>;

    /// Release every resource held for an operation. Idempotent.
    fn release_operation(&self, operation_id: OperationId);
}

/// Transfer session bound to a namespace.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    namespace: String,
    backend: Arc<dyn TransferBackend>,
    initialized: AtomicBool,
}

impl Connector {
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn TransferBackend>) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                namespace: namespace.into(),
                backend,
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Establish the local transfer context. Required once before any
    /// registration; repeated calls are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.backend.initialize(&self.inner.namespace).await?;
        self.inner.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(TransferError::NotInitialized.into());
        }
        Ok(())
    }

    /// Wrap a buffer in a [`Descriptor`]. Backend registration is lazy; use
    /// [`Descriptor::register_memory`] to pay the cost eagerly.
    pub fn register(&self, buffer: Buffer) -> Result<Descriptor> {
        self.ensure_initialized()?;
        Ok(Descriptor {
            inner: Arc::new(DescriptorInner {
                buffer,
                region: OnceLock::new(),
                writer_busy: AtomicBool::new(false),
            }),
        })
    }

    /// Grant the remote peer write access to the descriptor's buffer for the
    /// scope of the returned operation.
    pub fn create_writable(&self, descriptor: &Descriptor) -> Result<WritableOperation> {
        self.ensure_initialized()?;
        let region_id = descriptor.ensure_registered(self.inner.backend.as_ref())?;
        descriptor.acquire_writer()?;

        let (operation_id, state) = match self
            .inner
            .backend
            .create_write_target(region_id, descriptor.buffer())
        {
            Ok(pair) => pair,
            Err(e) => {
                descriptor.release_writer();
                return Err(e);
            }
        };

        Ok(WritableOperation {
            backend: self.inner.backend.clone(),
            descriptor: descriptor.clone(),
            namespace: self.inner.namespace.clone(),
            operation_id,
            region_id,
            state,
        })
    }

    /// Grant the remote peer read access to the descriptor's buffer for the
    /// scope of the returned operation. Reads do not exclude a concurrent
    /// writer; sequencing is the caller's protocol.
    pub fn create_readable(&self, descriptor: &Descriptor) -> Result<ReadableOperation> {
        self.ensure_initialized()?;
        let region_id = descriptor.ensure_registered(self.inner.backend.as_ref())?;
        let (operation_id, state) = self
            .inner
            .backend
            .create_read_source(region_id, descriptor.buffer())?;

        Ok(ReadableOperation {
            backend: self.inner.backend.clone(),
            namespace: self.inner.namespace.clone(),
            buffer_len: descriptor.buffer().len(),
            operation_id,
            region_id,
            state,
        })
    }

    /// Remote-peer side: write `payload` into the buffer described by a
    /// serialized handle.
    pub async fn write(&self, target: &SerializedRequest, payload: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        self.inner.backend.write(target, payload).await
    }

    /// Remote-peer side: read the buffer described by a serialized handle.
    pub async fn read(&self, target: &SerializedRequest) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.inner.backend.read(target).await
    }
}

/// Registered transfer buffer; long-lived, reused across many operations.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    buffer: Buffer,
    region: OnceLock<RegionId>,
    writer_busy: AtomicBool,
}

impl Descriptor {
    pub fn buffer(&self) -> &Buffer {
        &self.inner.buffer
    }

    /// Register with the backend eagerly instead of on first use.
    pub fn register_memory(&self, connector: &Connector) -> Result<RegionId> {
        connector.ensure_initialized()?;
        self.ensure_registered(connector.inner.backend.as_ref())
    }

    fn ensure_registered(&self, backend: &dyn TransferBackend) -> Result<RegionId> {
        if let Some(region_id) = self.inner.region.get() {
            return Ok(*region_id);
        }
        let region_id = backend.register_region(&self.inner.buffer)?;
        Ok(*self.inner.region.get_or_init(|| region_id))
    }

    fn acquire_writer(&self) -> Result<()> {
        self.inner
            .writer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TransferError::WriterBusy)?;
        Ok(())
    }

    fn release_writer(&self) {
        self.inner.writer_busy.store(false, Ordering::Release);
    }
}

/// One in-flight remote write into a descriptor's buffer.
///
/// Dropping the operation releases all transport resources, including on
/// error paths; the descriptor then accepts the next writer.
pub struct WritableOperation {
    backend: Arc<dyn TransferBackend>,
    descriptor: Descriptor,
    namespace: String,
    operation_id: OperationId,
    region_id: RegionId,
    state: watch::Receiver<OperationState>,
}

impl WritableOperation {
    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// The opaque handle the remote peer uses to target this operation.
    pub fn to_serialized(&self) -> Result<Vec<u8>> {
        SerializedRequest {
            namespace: self.namespace.clone(),
            operation_id: self.operation_id,
            region_id: self.region_id,
            size: self.descriptor.buffer().len(),
        }
        .to_bytes()
    }

    /// Current operation state.
    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Suspend until the remote write reaches a terminal state.
    ///
    /// Idempotent: calling again after completion returns immediately. The
    /// wait itself is unbounded; callers enforce their own ceiling (e.g.
    /// `tokio::time::timeout`).
    pub async fn wait_for_completion(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                OperationState::Completed => return Ok(()),
                OperationState::Failed => {
                    return Err(TransferError::Failed(self.operation_id).into());
                }
                OperationState::Created | OperationState::InProgress => {}
            }
            state
                .changed()
                .await
                .map_err(|_| TransferError::BackendGone(self.operation_id))?;
        }
    }
}

impl Drop for WritableOperation {
    fn drop(&mut self) {
        self.backend.release_operation(self.operation_id);
        self.descriptor.release_writer();
    }
}

/// One grant of remote read access to a descriptor's buffer.
pub struct ReadableOperation {
    backend: Arc<dyn TransferBackend>,
    namespace: String,
    buffer_len: usize,
    operation_id: OperationId,
    region_id: RegionId,
    state: watch::Receiver<OperationState>,
}

impl ReadableOperation {
    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// The opaque handle the remote peer uses to target this operation.
    pub fn to_serialized(&self) -> Result<Vec<u8>> {
        SerializedRequest {
            namespace: self.namespace.clone(),
            operation_id: self.operation_id,
            region_id: self.region_id,
            size: self.buffer_len,
        }
        .to_bytes()
    }

    /// Suspend until the remote read reaches a terminal state. Idempotent.
    pub async fn wait_for_completion(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                OperationState::Completed => return Ok(()),
                OperationState::Failed => {
                    return Err(TransferError::Failed(self.operation_id).into());
                }
                OperationState::Created | OperationState::InProgress => {}
            }
            state
                .changed()
                .await
                .map_err(|_| TransferError::BackendGone(self.operation_id))?;
        }
    }
}

impl Drop for ReadableOperation {
    fn drop(&mut self) {
        self.backend.release_operation(self.operation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackBackend;
    use super::*;

    async fn connector() -> Connector {
        let connector = Connector::new("test", Arc::new(LoopbackBackend::new()));
        connector.initialize().await.unwrap();
        connector
    }

    #[tokio::test]
    async fn register_requires_initialization() {
        let connector = Connector::new("test", Arc::new(LoopbackBackend::new()));
        let buffer = Buffer::zeroed(&[4], DataType::U8, Device::Cpu);
        assert!(connector.register(buffer).is_err());
    }

    #[tokio::test]
    async fn write_completes_waiting_operation() {
        let connector = connector().await;
        let descriptor = connector
            .register(Buffer::zeroed(&[4], DataType::U8, Device::Cpu))
            .unwrap();

        let writable = connector.create_writable(&descriptor).unwrap();
        let target = SerializedRequest::from_bytes(&writable.to_serialized().unwrap()).unwrap();

        connector.write(&target, &[1, 2, 3, 4]).await.unwrap();
        writable.wait_for_completion().await.unwrap();
        assert_eq!(descriptor.buffer().to_vec(), vec![1, 2, 3, 4]);

        // A second wait is a fast no-op.
        writable.wait_for_completion().await.unwrap();
    }

    #[tokio::test]
    async fn single_writer_per_descriptor() {
        let connector = connector().await;
        let descriptor = connector
            .register(Buffer::zeroed(&[4], DataType::U8, Device::Cpu))
            .unwrap();

        let first = connector.create_writable(&descriptor).unwrap();
        let second = connector.create_writable(&descriptor);
        assert!(second.is_err());

        // Releasing the first operation frees the descriptor again.
        drop(first);
        connector.create_writable(&descriptor).unwrap();
    }

    #[tokio::test]
    async fn size_mismatch_fails_the_operation() {
        let connector = connector().await;
        let descriptor = connector
            .register(Buffer::zeroed(&[4], DataType::U8, Device::Cpu))
            .unwrap();

        let writable = connector.create_writable(&descriptor).unwrap();
        let target = SerializedRequest::from_bytes(&writable.to_serialized().unwrap()).unwrap();

        assert!(connector.write(&target, &[1, 2]).await.is_err());
        assert!(writable.wait_for_completion().await.is_err());
    }

    #[tokio::test]
    async fn released_operation_is_an_unknown_target() {
        let connector = connector().await;
        let descriptor = connector
            .register(Buffer::zeroed(&[4], DataType::U8, Device::Cpu))
            .unwrap();

        let writable = connector.create_writable(&descriptor).unwrap();
        let target = SerializedRequest::from_bytes(&writable.to_serialized().unwrap()).unwrap();
        drop(writable);

        let result = connector.write(&target, &[1, 2, 3, 4]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn eager_registration_is_stable() {
        let connector = connector().await;
        let descriptor = connector
            .register(Buffer::zeroed(&[4], DataType::U8, Device::Cpu))
            .unwrap();
        let first = descriptor.register_memory(&connector).unwrap();
        let second = descriptor.register_memory(&connector).unwrap();
        assert_eq!(first, second);
    }
}
