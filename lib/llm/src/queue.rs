// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Durable queue of pending remote-prefill requests.
//!
//! Multi-producer (decode workers) / multi-consumer (prefill workers), with
//! at-least-once delivery: a message is acknowledged only after it parses and
//! is handed to the consumer, so a crash in between re-delivers it. Consumers
//! dedupe by `request_id`.
//!
//! [`PrefillQueue`] holds the retry policy and the typed boundary; the broker
//! underneath is a seam with a JetStream implementation ([`NatsBroker`]) and
//! an in-process one ([`MemoryBroker`]).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use disagg_runtime::transports::nats;
use disagg_runtime::{ErrorContext, Result};

use crate::protocols::RemotePrefillRequest;

/// Default pull timeout; dequeue returns `None` when it expires.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Enqueue retry budget for transient broker errors.
const ENQUEUE_MAX_ATTEMPTS: u32 = 4;
const ENQUEUE_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const ENQUEUE_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Stream name for a deployment's prefill queue: `{namespace}_prefill_queue`,
/// falling back to the served model name.
pub fn prefill_stream_name(namespace: Option<&str>, served_model_name: Option<&str>) -> String {
    match (namespace, served_model_name) {
        (Some(namespace), _) => format!("{namespace}_prefill_queue"),
        (None, Some(model)) => model.to_string(),
        (None, None) => "prefill_queue".to_string(),
    }
}

/// One undelivered message pulled from the broker.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// Acknowledge the message so the broker stops redelivering it.
    async fn ack(&mut self) -> Result<()>;
}

/// Broker seam under [`PrefillQueue`].
#[async_trait]
pub trait PrefillBroker: Send + Sync {
    async fn enqueue(&self, payload: Bytes) -> Result<()>;

    /// Pull one message, `None` on timeout.
    async fn dequeue(&self) -> Result<Option<Box<dyn Delivery>>>;

    /// Approximate pending depth; eventual consistency is acceptable.
    async fn depth(&self) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

/// Typed prefill queue over a broker.
pub struct PrefillQueue {
    broker: Arc<dyn PrefillBroker>,
}

impl PrefillQueue {
    pub fn new(broker: Arc<dyn PrefillBroker>) -> Self {
        Self { broker }
    }

    /// Append a prefill request to the stream.
    ///
    /// Transient broker errors are retried with exponential backoff and
    /// jitter; exhausting the budget surfaces the error to the caller rather
    /// than dropping the request silently.
    pub async fn enqueue_prefill_request(&self, request: &RemotePrefillRequest) -> Result<()> {
        let payload = Bytes::from(
            serde_json::to_vec(request).context("failed to serialize prefill request")?,
        );

        let mut backoff = ENQUEUE_INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.broker.enqueue(payload.clone()).await {
                Ok(()) => {
                    tracing::debug!(request_id = %request.request_id, "enqueued prefill request");
                    return Ok(());
                }
                Err(e) if attempt < ENQUEUE_MAX_ATTEMPTS => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        attempt,
                        error = %e,
                        "prefill enqueue failed, retrying"
                    );
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(ENQUEUE_MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "prefill enqueue for request {} failed after {attempt} attempts",
                            request.request_id
                        )
                    });
                }
            }
        }
    }

    /// Pull and parse one prefill request.
    ///
    /// `None` on timeout; callers loop. A malformed payload is logged and
    /// discarded without terminating the consumer loop — the next call pulls
    /// the next message.
    pub async fn dequeue_prefill_request(&self) -> Result<Option<RemotePrefillRequest>> {
        let Some(mut delivery) = self.broker.dequeue().await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<RemotePrefillRequest>(delivery.payload()) {
            Ok(request) => {
                delivery.ack().await?;
                Ok(Some(request))
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed prefill payload");
                delivery.ack().await?;
                Ok(None)
            }
        }
    }

    /// Approximate queue depth, the router's backpressure signal.
    pub async fn queue_size(&self) -> Result<usize> {
        self.broker.depth().await
    }

    pub async fn close(&self) -> Result<()> {
        self.broker.close().await
    }
}

fn jittered(delay: Duration) -> Duration {
    let base_ms = delay.as_millis() as u64;
    delay + Duration::from_millis(rand::rng().random_range(0..=base_ms.max(1)))
}

// -------------------------------------------------------------------------
// JetStream broker
// -------------------------------------------------------------------------

/// Broker over a durable JetStream work queue.
pub struct NatsBroker {
    queue: nats::NatsQueue,
}

impl NatsBroker {
    /// Open (or idempotently create) the queue stream.
    pub async fn connect(
        client: nats::Client,
        stream_name: impl Into<String>,
        dequeue_timeout: Duration,
    ) -> Result<Self> {
        let queue = nats::NatsQueue::new(client, stream_name, dequeue_timeout).await?;
        Ok(Self { queue })
    }
}

struct NatsDelivery {
    message: async_nats::jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&mut self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| disagg_runtime::error!("failed to ack queue message: {e}"))
    }
}

#[async_trait]
impl PrefillBroker for NatsBroker {
    async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.queue.enqueue(payload).await
    }

    async fn dequeue(&self) -> Result<Option<Box<dyn Delivery>>> {
        Ok(self
            .queue
            .dequeue()
            .await?
            .map(|message| Box::new(NatsDelivery { message }) as Box<dyn Delivery>))
    }

    async fn depth(&self) -> Result<usize> {
        self.queue.len().await
    }

    async fn close(&self) -> Result<()> {
        self.queue.close().await
    }
}

// -------------------------------------------------------------------------
// In-memory broker
// -------------------------------------------------------------------------

/// In-process broker for loopback deployments and tests. Cloned handles share
/// the same queue.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<MemoryBrokerState>,
    dequeue_timeout: Duration,
}

struct MemoryBrokerState {
    messages: parking_lot::Mutex<VecDeque<Bytes>>,
    notify: tokio::sync::Notify,
}

impl MemoryBroker {
    pub fn new(dequeue_timeout: Duration) -> Self {
        Self {
            state: Arc::new(MemoryBrokerState {
                messages: parking_lot::Mutex::new(VecDeque::new()),
                notify: tokio::sync::Notify::new(),
            }),
            dequeue_timeout,
        }
    }
}

struct MemoryDelivery {
    payload: Bytes,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PrefillBroker for MemoryBroker {
    async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.state.messages.lock().push_back(payload);
        self.state.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Box<dyn Delivery>>> {
        let deadline = tokio::time::Instant::now() + self.dequeue_timeout;
        loop {
            // Arm the notification before checking so an enqueue between the
            // check and the wait is not lost.
            let notified = self.state.notify.notified();
            if let Some(payload) = self.state.messages.lock().pop_front() {
                return Ok(Some(Box::new(MemoryDelivery { payload })));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.state.messages.lock().len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::SamplingParams;

    fn request(request_id: &str) -> RemotePrefillRequest {
        RemotePrefillRequest {
            request_id: request_id.to_string(),
            engine_id: "engine-a".to_string(),
            token_ids: vec![1, 2, 3],
            block_ids: vec![7],
            computed_block_ids: vec![],
            sampling_params: SamplingParams::default(),
            multimodal_data_source: None,
            transfer_descriptor: vec![9, 9],
        }
    }

    fn queue() -> PrefillQueue {
        PrefillQueue::new(Arc::new(MemoryBroker::new(Duration::from_millis(50))))
    }

    #[test]
    fn stream_name_prefers_namespace() {
        assert_eq!(
            prefill_stream_name(Some("dynamo"), Some("llama")),
            "dynamo_prefill_queue"
        );
        assert_eq!(prefill_stream_name(None, Some("llama")), "llama");
        assert_eq!(prefill_stream_name(None, None), "prefill_queue");
    }

    #[tokio::test]
    async fn round_trip_preserves_all_fields() {
        let queue = queue();
        let original = request("req-1");
        queue.enqueue_prefill_request(&original).await.unwrap();

        let dequeued = queue.dequeue_prefill_request().await.unwrap().unwrap();
        assert_eq!(dequeued, original);
    }

    #[tokio::test]
    async fn dequeue_times_out_with_none() {
        let queue = queue();
        assert!(queue.dequeue_prefill_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded_and_consumer_survives() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_millis(50)));
        let queue = PrefillQueue::new(broker.clone());

        broker
            .enqueue(Bytes::from_static(b"{\"engine_id\": \"no request id\"}"))
            .await
            .unwrap();
        queue.enqueue_prefill_request(&request("req-2")).await.unwrap();

        // Malformed message is dropped, not an error.
        assert!(queue.dequeue_prefill_request().await.unwrap().is_none());
        // The next valid dequeue still succeeds.
        let dequeued = queue.dequeue_prefill_request().await.unwrap().unwrap();
        assert_eq!(dequeued.request_id, "req-2");
    }

    #[tokio::test]
    async fn queue_size_tracks_pending_depth() {
        let queue = queue();
        assert_eq!(queue.queue_size().await.unwrap(), 0);
        queue.enqueue_prefill_request(&request("req-3")).await.unwrap();
        queue.enqueue_prefill_request(&request("req-4")).await.unwrap();
        assert_eq!(queue.queue_size().await.unwrap(), 2);
        queue.dequeue_prefill_request().await.unwrap().unwrap();
        assert_eq!(queue.queue_size().await.unwrap(), 1);
    }

    /// Broker that fails a configured number of times before accepting.
    struct FlakyBroker {
        inner: MemoryBroker,
        failures_left: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl PrefillBroker for FlakyBroker {
        async fn enqueue(&self, payload: Bytes) -> Result<()> {
            {
                let mut failures = self.failures_left.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(disagg_runtime::error!("broker unavailable"));
                }
            }
            self.inner.enqueue(payload).await
        }

        async fn dequeue(&self) -> Result<Option<Box<dyn Delivery>>> {
            self.inner.dequeue().await
        }

        async fn depth(&self) -> Result<usize> {
            self.inner.depth().await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_retries_transient_broker_errors() {
        let broker = Arc::new(FlakyBroker {
            inner: MemoryBroker::new(Duration::from_millis(50)),
            failures_left: parking_lot::Mutex::new(2),
        });
        let queue = PrefillQueue::new(broker);

        queue.enqueue_prefill_request(&request("req-5")).await.unwrap();
        assert_eq!(queue.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_surfaces_exhausted_retries() {
        let broker = Arc::new(FlakyBroker {
            inner: MemoryBroker::new(Duration::from_millis(50)),
            failures_left: parking_lot::Mutex::new(u32::MAX),
        });
        let queue = PrefillQueue::new(broker);

        assert!(queue.enqueue_prefill_request(&request("req-6")).await.is_err());
    }
}
