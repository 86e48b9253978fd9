// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! NATS transport.
//!
//! [`Client`] wraps one core connection plus its JetStream context, opened
//! once per process and shared. [`NatsQueue`] is a durable work-queue stream:
//! created idempotently on first use, pulled with a timeout, acknowledged
//! message by message.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::PullConsumer,
    stream::{DiscardPolicy, RetentionPolicy},
};
use bytes::Bytes;
use futures::StreamExt;

use crate::config::environment;
use crate::{ErrorContext, Result, error};

/// Durable consumer shared by all workers pulling from a queue stream.
const QUEUE_CONSUMER_NAME: &str = "worker";

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub server: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: std::env::var(environment::NATS_SERVER)
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Client {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl Client {
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let client = async_nats::connect(&options.server)
            .await
            .with_context(|| format!("unable to connect to NATS server at {}", options.server))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

/// A durable multi-producer/multi-consumer work queue over JetStream.
pub struct NatsQueue {
    stream_name: String,
    subject: String,
    client: Client,
    consumer: PullConsumer,
    dequeue_timeout: Duration,
}

impl NatsQueue {
    /// Open (or create) the queue stream and its durable pull consumer.
    pub async fn new(
        client: Client,
        stream_name: impl Into<String>,
        dequeue_timeout: Duration,
    ) -> Result<Self> {
        let stream_name = stream_name.into();
        let subject = format!("{stream_name}.queue");

        let stream = client
            .jetstream()
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.clone(),
                subjects: vec![subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                discard: DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(|e| error!("failed to create queue stream {stream_name}: {e}"))?;

        let consumer = stream
            .get_or_create_consumer(
                QUEUE_CONSUMER_NAME,
                jetstream::consumer::pull::Config {
                    durable_name: Some(QUEUE_CONSUMER_NAME.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| error!("failed to create queue consumer on {stream_name}: {e}"))?;

        Ok(Self {
            stream_name,
            subject,
            client,
            consumer,
            dequeue_timeout,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Publish one message and wait for the broker acknowledgement.
    pub async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.client
            .jetstream()
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| error!("queue publish to {} failed: {e}", self.stream_name))?
            .await
            .map_err(|e| error!("queue publish to {} was not acknowledged: {e}", self.stream_name))?;
        Ok(())
    }

    /// Pull one message, waiting at most the configured timeout.
    ///
    /// `None` means the timeout expired with nothing pending; callers loop.
    /// The returned message must be acknowledged by the caller once it has
    /// been handed off.
    pub async fn dequeue(&self) -> Result<Option<jetstream::Message>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(self.dequeue_timeout)
            .messages()
            .await
            .map_err(|e| error!("queue pull from {} failed: {e}", self.stream_name))?;

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(error!("queue pull from {} errored: {e}", self.stream_name)),
            None => Ok(None),
        }
    }

    /// Approximate number of pending messages. Eventually consistent.
    pub async fn len(&self) -> Result<usize> {
        let mut stream = self
            .client
            .jetstream()
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| error!("failed to look up queue stream {}: {e}", self.stream_name))?;
        let info = stream
            .info()
            .await
            .map_err(|e| error!("failed to read queue stream info for {}: {e}", self.stream_name))?;
        Ok(info.state.messages as usize)
    }

    /// Flush outstanding traffic before the connection is dropped.
    pub async fn close(&self) -> Result<()> {
        self.client
            .client()
            .flush()
            .await
            .map_err(|e| error!("failed to flush NATS connection: {e}"))?;
        Ok(())
    }
}
