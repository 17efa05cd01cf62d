//! Fan-in end-of-stream accounting and pipeline lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use rill_core::buffer::BufferManager;
use rill_core::config::PoolMode;
use rill_core::reconfig::{
    PipelineMessage, ReconfigurationKind, ReconfigurationMessage, ReconfigurationPayload,
};
use rill_runtime::{
    spawn_pipeline_driver, ExecutablePipeline, PassthroughStage, PipelineStatus, QueryManager,
};

async fn data_buffer(pool: &BufferManager, origin: u64, seq: u64) -> PipelineMessage {
    let mut buffer = pool.acquire().await;
    buffer.set_number_of_tuples(1);
    buffer.set_origin_id(origin);
    buffer.set_sequence_number(seq);
    PipelineMessage::Data(buffer.seal())
}

fn soft_eos() -> PipelineMessage {
    PipelineMessage::Control(ReconfigurationMessage::new(
        ReconfigurationKind::SoftEndOfStream,
        1,
        1,
    ))
}

#[tokio::test]
async fn two_predecessors_one_soft_eos_to_successor() {
    let pool = BufferManager::new(64, 8);
    // One worker keeps the edge order deterministic; local hand-offs make no
    // ordering promise with a wider pool.
    let manager = QueryManager::new(1, PoolMode::Dynamic, pool.clone());
    manager.register_query(1, 1);

    let (successor_tx, mut successor_rx) = mpsc::channel(16);
    let (input_tx, input_rx) = mpsc::channel(16);

    let pipeline = Arc::new(ExecutablePipeline::new(
        7,
        1,
        1,
        Box::new(PassthroughStage::new("fan-in")),
        2,
        vec![successor_tx],
        manager.completion_sender(),
    ));
    spawn_pipeline_driver(manager.clone(), pipeline.clone(), input_rx);

    // Initialize announces the producer count and starts the pipeline.
    input_tx
        .send(PipelineMessage::Control(
            ReconfigurationMessage::new(ReconfigurationKind::Initialize, 1, 1)
                .with_payload(ReconfigurationPayload::ActiveProducers(2)),
        ))
        .await
        .unwrap();

    // P1: buf, SoftEoS; P2: buf, SoftEoS.
    input_tx.send(data_buffer(&pool, 1, 1).await).await.unwrap();
    input_tx.send(soft_eos()).await.unwrap();
    input_tx.send(data_buffer(&pool, 2, 1).await).await.unwrap();
    input_tx.send(soft_eos()).await.unwrap();

    let mut data_seen = 0;
    let mut eos_seen = 0;
    for _ in 0..3 {
        match timeout(Duration::from_secs(2), successor_rx.recv()).await {
            Ok(Some(PipelineMessage::Data(_))) => data_seen += 1,
            Ok(Some(PipelineMessage::Control(msg))) => {
                assert_eq!(msg.kind, ReconfigurationKind::SoftEndOfStream);
                eos_seen += 1;
            }
            other => panic!("missing successor message: {other:?}"),
        }
    }
    assert_eq!(data_seen, 2);
    assert_eq!(eos_seen, 1, "exactly one SoftEoS after the second producer");

    // The counter reached zero exactly once and nothing else arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(successor_rx.try_recv().is_err());
    assert_eq!(pipeline.status(), PipelineStatus::Stopped);
    assert_eq!(pipeline.active_producers(), 0);
}

#[tokio::test]
async fn buffers_after_teardown_are_ignored() {
    let pool = BufferManager::new(64, 8);
    let manager = QueryManager::new(1, PoolMode::Static, pool.clone());
    manager.register_query(2, 1);

    let (successor_tx, mut successor_rx) = mpsc::channel(16);
    let (input_tx, input_rx) = mpsc::channel(16);
    let pipeline = Arc::new(ExecutablePipeline::new(
        8,
        2,
        3,
        Box::new(PassthroughStage::new("short-lived")),
        1,
        vec![successor_tx],
        manager.completion_sender(),
    ));
    spawn_pipeline_driver(manager.clone(), pipeline.clone(), input_rx);

    input_tx
        .send(PipelineMessage::Control(
            ReconfigurationMessage::new(ReconfigurationKind::Initialize, 2, 3)
                .with_payload(ReconfigurationPayload::ActiveProducers(1)),
        ))
        .await
        .unwrap();
    input_tx
        .send(PipelineMessage::Control(ReconfigurationMessage::new(
            ReconfigurationKind::SoftEndOfStream,
            2,
            3,
        )))
        .await
        .unwrap();
    input_tx.send(data_buffer(&pool, 1, 1).await).await.unwrap();

    match timeout(Duration::from_secs(2), successor_rx.recv()).await {
        Ok(Some(PipelineMessage::Control(msg))) => {
            assert_eq!(msg.kind, ReconfigurationKind::SoftEndOfStream)
        }
        other => panic!("expected SoftEoS, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        successor_rx.try_recv().is_err(),
        "stopped pipeline must not forward buffers"
    );
}

#[tokio::test]
async fn fail_eos_marks_pipeline_failed() {
    let pool = BufferManager::new(64, 8);
    let manager = QueryManager::new(1, PoolMode::Dynamic, pool.clone());
    manager.register_query(3, 1);

    let (successor_tx, mut successor_rx) = mpsc::channel(16);
    let (input_tx, input_rx) = mpsc::channel(16);
    let pipeline = Arc::new(ExecutablePipeline::new(
        9,
        3,
        1,
        Box::new(PassthroughStage::new("failing")),
        1,
        vec![successor_tx],
        manager.completion_sender(),
    ));
    spawn_pipeline_driver(manager.clone(), pipeline.clone(), input_rx);

    input_tx
        .send(PipelineMessage::Control(
            ReconfigurationMessage::new(ReconfigurationKind::Initialize, 3, 1)
                .with_payload(ReconfigurationPayload::ActiveProducers(1)),
        ))
        .await
        .unwrap();
    input_tx
        .send(PipelineMessage::Control(ReconfigurationMessage::new(
            ReconfigurationKind::FailEndOfStream,
            3,
            1,
        )))
        .await
        .unwrap();

    match timeout(Duration::from_secs(2), successor_rx.recv()).await {
        Ok(Some(PipelineMessage::Control(msg))) => {
            assert_eq!(msg.kind, ReconfigurationKind::FailEndOfStream)
        }
        other => panic!("expected FailEoS, got {other:?}"),
    }
    for _ in 0..100 {
        if pipeline.status() == PipelineStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pipeline.status(), PipelineStatus::Failed);
    for _ in 0..100 {
        if matches!(
            manager.query_status(3),
            Some(rill_runtime::QueryStatus::Failed(_))
        ) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(
        manager.query_status(3),
        Some(rill_runtime::QueryStatus::Failed(_))
    ));
}
