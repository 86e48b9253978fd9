// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Decode / prefill worker entrypoint.
//!
//! One binary, two modes. Decode mode registers a `generate` endpoint and
//! serves requests over the NATS request plane; prefill mode consumes the
//! shared prefill queue. Configuration conflicts are fatal before any
//! connection is opened, and a failed consumer loop exits the process for an
//! external supervisor to restart.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use uuid::Uuid;

use disagg_llm::connect::loopback::LoopbackBackend;
use disagg_llm::connect::Connector;
use disagg_llm::metadata::MetadataStore;
use disagg_llm::metrics::WorkerMetricsPublisher;
use disagg_llm::mocker::{MockEngine, MockEngineArgs};
use disagg_llm::protocols::{PreprocessedRequest, ResponseDelta};
use disagg_llm::queue::{
    DEFAULT_DEQUEUE_TIMEOUT, MemoryBroker, NatsBroker, PrefillBroker, PrefillQueue,
    prefill_stream_name,
};
use disagg_llm::router::{DisaggregatedRouter, DisaggregatedRouterConfig};
use disagg_llm::workers::decode::{DecodeWorker, DecodeWorkerConfig};
use disagg_llm::workers::prefill::{PeerQuorum, PrefillWorker, PrefillWorkerConfig};
use disagg_runtime::transports::nats;
use disagg_runtime::{
    CancellationToken, DistributedRuntime, Result, Runtime, Worker, error, logging,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Decode,
    Prefill,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Role of this worker
    #[arg(long, value_enum, default_value_t = Mode::Decode)]
    mode: Mode,

    /// Namespace for the distributed components
    #[arg(long, default_value = "disagg")]
    namespace: String,

    /// Component name; defaults to the mode name
    #[arg(long)]
    component: Option<String>,

    /// Served model name, used as the queue-stream fallback name
    #[arg(long)]
    served_model_name: Option<String>,

    /// Offload eligible prefills to the remote pool (decode mode)
    #[arg(long, default_value_t = false)]
    remote_prefill: bool,

    /// Route per request through the disaggregated router instead of always
    /// prefilling remotely (decode mode)
    #[arg(long, default_value_t = false)]
    conditional_disagg: bool,

    /// Prompts at or below this length always prefill locally
    #[arg(long, default_value_t = 512)]
    max_local_prefill_length: usize,

    /// Queue depths above this force local prefill
    #[arg(long, default_value_t = 2)]
    max_prefill_queue_size: usize,

    /// Decode workers that must be visible before a prefill worker goes
    /// ready; 0 skips the quorum wait
    #[arg(long, default_value_t = 1)]
    min_decode_workers: usize,

    /// Bound on the quorum wait in seconds
    #[arg(long, default_value_t = 300)]
    quorum_timeout_secs: u64,

    /// Ceiling on a remote transfer completion wait in seconds
    #[arg(long, default_value_t = 30)]
    transfer_timeout_secs: u64,

    /// Size of the KV transfer buffer in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    kv_buffer_bytes: usize,

    /// Run store-only with an in-process broker; no NATS/etcd required
    #[arg(long, default_value_t = false)]
    local: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let worker = Worker::from_current()?;
    worker.execute_async(app).await
}

async fn app(runtime: Runtime) -> Result<()> {
    let args = Args::parse();
    validate_args(&args)?;

    let drt = if args.local {
        DistributedRuntime::new_local(runtime.clone())
    } else {
        DistributedRuntime::from_settings(runtime.clone()).await?
    };

    let component_name = args
        .component
        .clone()
        .unwrap_or_else(|| match args.mode {
            Mode::Decode => "decode".to_string(),
            Mode::Prefill => "prefill".to_string(),
        });

    let namespace = drt.namespace(&args.namespace)?;
    let component = namespace.component(&component_name)?;
    let endpoint = component.endpoint("generate");
    endpoint.register_instance().await?;

    let stream_name = prefill_stream_name(Some(&args.namespace), args.served_model_name.as_deref());
    tracing::info!(stream_name, "prefill queue stream");

    let broker: Arc<dyn PrefillBroker> = if args.local {
        Arc::new(MemoryBroker::new(DEFAULT_DEQUEUE_TIMEOUT))
    } else {
        let nats_client = drt
            .nats_client()
            .ok_or_else(|| error!("NATS client unavailable; remote queue requires it"))?;
        Arc::new(NatsBroker::connect(nats_client, &stream_name, DEFAULT_DEQUEUE_TIMEOUT).await?)
    };
    let queue = Arc::new(PrefillQueue::new(broker));

    let connector = Connector::new(args.namespace.clone(), Arc::new(LoopbackBackend::new()));
    connector.initialize().await?;

    let metadata_store = MetadataStore::new(drt.store(), &args.namespace);
    let engine = MockEngine::new(MockEngineArgs::new(format!(
        "{component_name}-{}",
        Uuid::new_v4()
    )));

    match args.mode {
        Mode::Decode => {
            let router = args.conditional_disagg.then(|| {
                DisaggregatedRouter::new(DisaggregatedRouterConfig {
                    max_local_prefill_length: args.max_local_prefill_length,
                    max_prefill_queue_size: args.max_prefill_queue_size,
                })
            });

            let metrics = Arc::new(WorkerMetricsPublisher::new());
            let worker = DecodeWorker::new(
                engine,
                router,
                queue,
                connector,
                &metadata_store,
                metrics.clone(),
                DecodeWorkerConfig {
                    remote_prefill: args.remote_prefill,
                    transfer_timeout: Duration::from_secs(args.transfer_timeout_secs),
                    kv_buffer_bytes: args.kv_buffer_bytes,
                },
            )
            .await?;
            metrics.create_endpoint(&component).await?;

            serve_generate(
                drt.nats_client(),
                endpoint.subject(),
                Arc::new(worker),
                runtime.child_token(),
            )
            .await
        }
        Mode::Prefill => {
            let peer_quorum = if args.min_decode_workers > 0 {
                Some(PeerQuorum {
                    client: namespace.component("decode")?.endpoint("generate").client(),
                    min_instances: args.min_decode_workers,
                    timeout: Duration::from_secs(args.quorum_timeout_secs),
                })
            } else {
                None
            };

            let worker = PrefillWorker::new(
                engine,
                queue,
                metadata_store,
                connector,
                peer_quorum,
                PrefillWorkerConfig {
                    staging_buffer_bytes: args.kv_buffer_bytes,
                    ..Default::default()
                },
            );
            worker.run(runtime.child_token()).await
        }
    }
}

/// Serve `generate` over the NATS request plane until cancelled. Each request
/// streams its deltas to the caller's reply subject.
async fn serve_generate(
    nats_client: Option<nats::Client>,
    subject: String,
    worker: Arc<DecodeWorker>,
    token: CancellationToken,
) -> Result<()> {
    let Some(nats_client) = nats_client else {
        tracing::info!("no request plane configured; idling until termination");
        token.cancelled().await;
        return Ok(());
    };

    let mut subscription = nats_client
        .client()
        .subscribe(subject.clone())
        .await
        .map_err(|e| error!("failed to subscribe to {subject}: {e}"))?;
    tracing::info!(subject, "serving generate requests");

    let result = loop {
        let message = tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("termination requested, unsubscribing");
                break Ok(());
            }
            message = subscription.next() => match message {
                Some(message) => message,
                None => break Err(error!("request-plane subscription closed unexpectedly")),
            },
        };

        let Some(reply) = message.reply else {
            tracing::warn!("dropping generate request without a reply subject");
            continue;
        };
        tokio::spawn(handle_generate(
            worker.clone(),
            nats_client.client().clone(),
            message.payload,
            reply,
        ));
    };

    let _ = subscription.unsubscribe().await;
    result
}

async fn handle_generate(
    worker: Arc<DecodeWorker>,
    client: async_nats::Client,
    payload: bytes::Bytes,
    reply: async_nats::Subject,
) {
    let stream = match serde_json::from_slice::<PreprocessedRequest>(&payload) {
        Ok(request) => worker.generate(request).await,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed generate request");
            publish_delta(&client, &reply, &ResponseDelta::errored()).await;
            return;
        }
    };

    // Callers always see a terminal finish reason, never a hang.
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "generate failed");
            publish_delta(&client, &reply, &ResponseDelta::errored()).await;
            return;
        }
    };

    let mut stream = std::pin::pin!(stream);
    while let Some(delta) = stream.next().await {
        publish_delta(&client, &reply, &delta).await;
    }
}

async fn publish_delta(client: &async_nats::Client, reply: &async_nats::Subject, delta: &ResponseDelta) {
    let payload = match serde_json::to_vec(delta) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response delta");
            return;
        }
    };
    if let Err(e) = client.publish(reply.clone(), payload.into()).await {
        tracing::warn!(error = %e, "failed to publish response delta");
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.conditional_disagg && !args.remote_prefill {
        return Err(error!(
            "--conditional-disagg requires --remote-prefill; a router decision without remote prefill cannot be honored"
        ));
    }
    if args.conditional_disagg && args.max_local_prefill_length == 0 {
        return Err(error!("--max-local-prefill-length must be greater than 0"));
    }
    if args.kv_buffer_bytes == 0 {
        return Err(error!("--kv-buffer-bytes must be greater than 0"));
    }
    if args.transfer_timeout_secs == 0 {
        return Err(error!("--transfer-timeout-secs must be greater than 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("disagg-worker").chain(argv.iter().copied()))
    }

    #[test]
    fn defaults_are_valid() {
        let args = parse(&[]);
        assert!(validate_args(&args).is_ok());
        assert_eq!(args.mode, Mode::Decode);
    }

    #[test]
    fn conditional_disagg_requires_remote_prefill() {
        let args = parse(&["--conditional-disagg"]);
        assert!(validate_args(&args).is_err());

        let args = parse(&["--conditional-disagg", "--remote-prefill"]);
        assert!(validate_args(&args).is_ok());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let args = parse(&["--kv-buffer-bytes", "0"]);
        assert!(validate_args(&args).is_err());
    }
}
