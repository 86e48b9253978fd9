// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end disaggregated handoff over the in-process seams: memory broker,
//! memory store, loopback transfer backend, mock engines.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use disagg_llm::connect::loopback::LoopbackBackend;
use disagg_llm::connect::Connector;
use disagg_llm::metadata::MetadataStore;
use disagg_llm::metrics::WorkerMetricsPublisher;
use disagg_llm::mocker::{MockEngine, MockEngineArgs};
use disagg_llm::protocols::{
    FinishReason, PreprocessedRequest, RemotePrefillRequest, SamplingParams, StopConditions,
};
use disagg_llm::queue::{MemoryBroker, PrefillBroker, PrefillQueue};
use disagg_llm::router::{DisaggregatedRouter, DisaggregatedRouterConfig};
use disagg_llm::workers::decode::{DecodeWorker, DecodeWorkerConfig};
use disagg_llm::workers::prefill::{PrefillWorker, PrefillWorkerConfig, WorkerState};
use disagg_runtime::storage::MemoryStore;
use disagg_runtime::{KeyValueStore, Result};

const KV_BYTES: usize = 1024;

struct World {
    decode: DecodeWorker,
    decode_engine: Arc<MockEngine>,
    prefill_engine: Arc<MockEngine>,
    prefill_worker: Arc<PrefillWorker>,
    broker: Arc<MemoryBroker>,
    decode_connector: Connector,
    cancel: CancellationToken,
    prefill_task: tokio::task::JoinHandle<Result<()>>,
}

impl World {
    async fn start() -> World {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new(Duration::from_millis(50)));

        let decode_backend = LoopbackBackend::new();
        let hub = decode_backend.hub();
        let decode_connector = Connector::new("test", Arc::new(decode_backend));
        let prefill_connector = Connector::new("test", Arc::new(LoopbackBackend::with_hub(hub)));
        decode_connector.initialize().await.unwrap();
        prefill_connector.initialize().await.unwrap();

        let decode_engine = MockEngine::new(MockEngineArgs {
            num_decode_tokens: 4,
            ..MockEngineArgs::new("decode-engine")
        });
        let prefill_engine = MockEngine::new(MockEngineArgs::new("prefill-engine"));

        let decode = DecodeWorker::new(
            decode_engine.clone(),
            Some(DisaggregatedRouter::new(DisaggregatedRouterConfig {
                max_local_prefill_length: 50,
                max_prefill_queue_size: 4,
            })),
            Arc::new(PrefillQueue::new(broker.clone())),
            decode_connector.clone(),
            &MetadataStore::new(store.clone(), "test"),
            Arc::new(WorkerMetricsPublisher::new()),
            DecodeWorkerConfig {
                remote_prefill: true,
                transfer_timeout: Duration::from_secs(5),
                kv_buffer_bytes: KV_BYTES,
            },
        )
        .await
        .unwrap();

        let prefill_worker = Arc::new(PrefillWorker::new(
            prefill_engine.clone(),
            Arc::new(PrefillQueue::new(broker.clone())),
            MetadataStore::new(store, "test"),
            prefill_connector,
            None,
            PrefillWorkerConfig {
                staging_buffer_bytes: KV_BYTES,
                ..Default::default()
            },
        ));

        let cancel = CancellationToken::new();
        let prefill_task = tokio::spawn({
            let worker = prefill_worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        // The consumer loop has to be up before requests are routed remotely.
        let mut state = prefill_worker.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != WorkerState::Ready {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("prefill worker did not become ready");

        World {
            decode,
            decode_engine,
            prefill_engine,
            prefill_worker,
            broker,
            decode_connector,
            cancel,
            prefill_task,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.prefill_task)
            .await
            .expect("prefill worker did not stop")
            .unwrap();
        result.unwrap();
        assert_eq!(self.prefill_worker.state(), WorkerState::Stopped);
        assert!(self.prefill_engine.is_closed());
        // Draining closes the prefill side's engine client only.
        assert!(!self.decode_engine.is_closed());
    }

    fn long_prompt() -> PreprocessedRequest {
        PreprocessedRequest {
            token_ids: (0..200).collect(),
            stop_conditions: StopConditions {
                max_tokens: Some(4),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_prompt_goes_remote_and_state_is_transferred() {
    let world = World::start().await;

    let deltas: Vec<_> = world
        .decode
        .generate(World::long_prompt())
        .await
        .unwrap()
        .collect()
        .await;

    // Stream shape: deltas then a clean stop.
    let terminal = deltas.last().unwrap();
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert!(terminal.token_ids.is_empty());
    assert!(deltas[..deltas.len() - 1]
        .iter()
        .all(|d| d.finish_reason.is_none()));

    // The remotely computed state landed in the decode worker's KV buffer.
    let expected = MockEngine::expected_kv_bytes(&World::long_prompt().token_ids, KV_BYTES);
    assert_eq!(world.decode.kv_descriptor().buffer().to_vec(), expected);

    // The queue was drained.
    assert_eq!(world.broker.depth().await.unwrap(), 0);

    world.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metadata_is_imported_once_across_sequential_requests() {
    let world = World::start().await;

    for _ in 0..2 {
        let deltas: Vec<_> = world
            .decode
            .generate(World::long_prompt())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(deltas.last().unwrap().finish_reason, Some(FinishReason::Stop));
    }

    // Two requests from the same decode engine, one import.
    assert_eq!(world.prefill_engine.metadata_import_count(), 1);
    assert_eq!(
        world.prefill_engine.imported_engines(),
        vec!["decode-engine".to_string()]
    );

    world.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_prompt_stays_local() {
    let world = World::start().await;

    let deltas: Vec<_> = world
        .decode
        .generate(PreprocessedRequest {
            token_ids: (0..10).collect(),
            stop_conditions: StopConditions {
                max_tokens: Some(2),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(deltas.last().unwrap().finish_reason, Some(FinishReason::Stop));
    // Nothing was handed off.
    assert_eq!(world.broker.depth().await.unwrap(), 0);
    assert_eq!(world.prefill_engine.metadata_import_count(), 0);

    world.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_is_dropped_and_consumer_survives() {
    let world = World::start().await;

    // Payload missing request_id: logged and discarded by the consumer.
    world
        .broker
        .enqueue(bytes::Bytes::from_static(b"{\"engine_id\":\"x\"}"))
        .await
        .unwrap();

    // A valid request enqueued by hand still completes: build its transfer
    // descriptor from the decode worker's own KV descriptor.
    let writable = world
        .decode_connector
        .create_writable(world.decode.kv_descriptor())
        .unwrap();
    let request = RemotePrefillRequest {
        request_id: "manual-1".to_string(),
        engine_id: "decode-engine".to_string(),
        token_ids: vec![1, 2, 3, 4],
        block_ids: vec![0],
        computed_block_ids: vec![],
        sampling_params: SamplingParams::default(),
        multimodal_data_source: None,
        transfer_descriptor: writable.to_serialized().unwrap(),
    };
    world
        .broker
        .enqueue(serde_json::to_vec(&request).unwrap().into())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), writable.wait_for_completion())
        .await
        .expect("valid request was not processed after the malformed one")
        .unwrap();

    assert!(world.prefill_worker.is_ready());
    world.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_delivery_is_executed_once() {
    let world = World::start().await;

    let writable = world
        .decode_connector
        .create_writable(world.decode.kv_descriptor())
        .unwrap();
    let request = RemotePrefillRequest {
        request_id: "dup-1".to_string(),
        engine_id: "decode-engine".to_string(),
        token_ids: vec![5, 6, 7],
        block_ids: vec![1],
        computed_block_ids: vec![],
        sampling_params: SamplingParams::default(),
        multimodal_data_source: None,
        transfer_descriptor: writable.to_serialized().unwrap(),
    };
    let payload = bytes::Bytes::from(serde_json::to_vec(&request).unwrap());

    // The broker is at-least-once; deliver the same message twice.
    world.broker.enqueue(payload.clone()).await.unwrap();
    world.broker.enqueue(payload).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), writable.wait_for_completion())
        .await
        .expect("request was not processed")
        .unwrap();

    // Give the duplicate a chance to (not) execute, then check the worker is
    // still consuming and imported metadata exactly once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(world.prefill_worker.is_ready());
    assert_eq!(world.prefill_engine.metadata_import_count(), 1);

    world.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmet_peer_quorum_is_fatal() {
    use disagg_llm::workers::prefill::PeerQuorum;
    use disagg_runtime::{DistributedRuntime, Runtime};

    let drt = DistributedRuntime::new_local(Runtime::from_current().unwrap());
    let client = drt
        .namespace("test")
        .unwrap()
        .component("decode")
        .unwrap()
        .endpoint("generate")
        .client();

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new(Duration::from_millis(50)));
    let connector = Connector::new("test", Arc::new(LoopbackBackend::new()));
    connector.initialize().await.unwrap();

    let worker = PrefillWorker::new(
        MockEngine::new(MockEngineArgs::new("prefill-engine")),
        Arc::new(PrefillQueue::new(broker)),
        MetadataStore::new(store, "test"),
        connector,
        Some(PeerQuorum {
            client,
            min_instances: 1,
            timeout: Duration::from_millis(100),
        }),
        PrefillWorkerConfig::default(),
    );

    let result = worker.run(CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(worker.state(), WorkerState::Stopped);
}
