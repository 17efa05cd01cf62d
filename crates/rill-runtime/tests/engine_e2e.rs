//! End-to-end engine behavior: deployed queries and join pipelines running
//! over the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use rill_core::buffer::BufferManager;
use rill_core::config::{
    CsvSourceSpec, PipelineSpec, PoolMode, RuntimeSpec, SinkFormat, SinkSpec, SourceSpec,
};
use rill_core::reconfig::{
    PipelineMessage, ReconfigurationKind, ReconfigurationMessage, ReconfigurationPayload,
};
use rill_core::schema::{Field, PhysicalType, Schema};
use rill_core::window::{TimeCharacteristic, WindowMeasure};
use rill_runtime::{
    spawn_pipeline_driver, AggregationBuildStage, ExecutablePipeline, JoinBuildStage, NodeEngine,
    QueryManager, QueryStatus,
};
use rill_win::{
    AggregateFunction, AggregationDefinition, JoinDefinition, JoinHandler, JoinKind, JoinSide,
    WindowAggregationHandler,
};

#[tokio::test]
async fn csv_to_file_query_completes() {
    let dir = std::env::temp_dir();
    let input = dir.join(format!("rill-e2e-in-{}.csv", std::process::id()));
    let output = dir.join(format!("rill-e2e-out-{}.csv", std::process::id()));
    std::fs::write(&input, "1,10\n2,20\n3,30\n").unwrap();

    let spec = PipelineSpec {
        name: "csv-copy".into(),
        runtime: RuntimeSpec::default(),
        schema: vec![
            Field::new("id", PhysicalType::U64),
            Field::new("value", PhysicalType::I64),
        ],
        sources: vec![SourceSpec::Csv(CsvSourceSpec {
            id: "in".into(),
            file_path: input.display().to_string(),
            tuples_per_buffer: 128,
            buffers_to_produce: None,
            gathering_interval_ms: 1,
            skip_header: false,
        })],
        sinks: vec![SinkSpec::File {
            id: "out".into(),
            path: output.display().to_string(),
            format: SinkFormat::Csv,
            append: false,
        }],
        edges: vec![("in".into(), "out".into())],
    };

    let engine = NodeEngine::new(&spec.runtime);
    let query = engine.deploy(1, &spec).await.unwrap();
    let status = timeout(Duration::from_secs(5), query.join())
        .await
        .expect("query should drain");
    assert_eq!(status, QueryStatus::Completed);

    let content = std::fs::read_to_string(&output).unwrap();
    assert_eq!(content, "1,10\n2,20\n3,30\n");
    std::fs::remove_file(input).ok();
    std::fs::remove_file(output).ok();
}

fn side_schema() -> Arc<Schema> {
    Schema::new(vec![
        Field::new("key", PhysicalType::U64),
        Field::new("value", PhysicalType::U64),
        Field::new("ts", PhysicalType::U64),
    ])
}

async fn side_buffer(
    pool: &BufferManager,
    origin: u64,
    rows: &[(u64, u64, u64)],
    watermark: u64,
) -> PipelineMessage {
    let mut buffer = pool.acquire().await;
    {
        let slice = buffer.as_mut_slice();
        for (i, (key, value, ts)) in rows.iter().enumerate() {
            let base = i * 24;
            slice[base..base + 8].copy_from_slice(&key.to_ne_bytes());
            slice[base + 8..base + 16].copy_from_slice(&value.to_ne_bytes());
            slice[base + 16..base + 24].copy_from_slice(&ts.to_ne_bytes());
        }
    }
    buffer.set_number_of_tuples(rows.len() as u64);
    buffer.set_origin_id(origin);
    buffer.set_sequence_number(1);
    buffer.set_watermark(watermark);
    PipelineMessage::Data(buffer.seal())
}

#[tokio::test]
async fn join_build_pipelines_trigger_over_the_worker_pool() {
    let pool = BufferManager::new(4096, 16);
    let manager = QueryManager::new(2, PoolMode::Dynamic, pool.clone());
    manager.register_query(1, 2);

    let (join_out_tx, mut join_out_rx) = mpsc::channel(16);
    let definition = JoinDefinition::new(
        JoinKind::Inner,
        WindowMeasure::Tumbling { size_ms: 1000 },
        side_schema(),
        side_schema(),
        0,
        0,
    );
    let handler = JoinHandler::new(
        definition,
        1,
        vec![1],
        vec![2],
        2,
        9,
        pool.clone(),
        join_out_tx,
    );

    let mut inputs = Vec::new();
    for side in [JoinSide::Left, JoinSide::Right] {
        let (input_tx, input_rx) = mpsc::channel(16);
        let stage = JoinBuildStage::new(
            format!("{side:?}-build"),
            handler.clone(),
            side,
            side_schema(),
            0,
            TimeCharacteristic::EventTime { field: "ts".into() },
        )
        .unwrap();
        let pipeline = Arc::new(ExecutablePipeline::new(
            match side {
                JoinSide::Left => 1,
                JoinSide::Right => 2,
            },
            1,
            1,
            Box::new(stage),
            1,
            Vec::new(),
            manager.completion_sender(),
        ));
        spawn_pipeline_driver(manager.clone(), pipeline, input_rx);
        input_tx
            .send(PipelineMessage::Control(
                ReconfigurationMessage::new(ReconfigurationKind::Initialize, 1, 1)
                    .with_payload(ReconfigurationPayload::ActiveProducers(1)),
            ))
            .await
            .unwrap();
        inputs.push(input_tx);
    }

    inputs[0]
        .send(side_buffer(&pool, 1, &[(1, 10, 100), (1, 11, 200)], 1000).await)
        .await
        .unwrap();
    inputs[1]
        .send(side_buffer(&pool, 2, &[(1, 20, 150), (1, 21, 250)], 1000).await)
        .await
        .unwrap();

    let buffer = match timeout(Duration::from_secs(2), join_out_rx.recv()).await {
        Ok(Some(PipelineMessage::Data(buffer))) => buffer,
        other => panic!("expected join output, got {other:?}"),
    };
    assert_eq!(buffer.number_of_tuples(), 4);
    assert_eq!(buffer.watermark(), 1000);
    assert_eq!(buffer.origin_id(), 9);
    assert_eq!(buffer.sequence_number(), 1);
}

#[tokio::test]
async fn aggregation_pipeline_sums_a_window() {
    let pool = BufferManager::new(4096, 16);
    let manager = QueryManager::new(1, PoolMode::Dynamic, pool.clone());
    manager.register_query(2, 1);

    let (agg_out_tx, mut agg_out_rx) = mpsc::channel(16);
    let definition = AggregationDefinition::new(
        AggregateFunction::Sum,
        WindowMeasure::Tumbling { size_ms: 1000 },
        side_schema(),
        0,
        1,
    );
    let handler =
        WindowAggregationHandler::new(definition, 2, vec![1], 1, 11, pool.clone(), agg_out_tx);

    let stage = AggregationBuildStage::new(
        "agg-build",
        handler.clone(),
        side_schema(),
        0,
        TimeCharacteristic::EventTime { field: "ts".into() },
    )
    .unwrap();
    let (input_tx, input_rx) = mpsc::channel(16);
    let pipeline = Arc::new(ExecutablePipeline::new(
        3,
        2,
        1,
        Box::new(stage),
        1,
        Vec::new(),
        manager.completion_sender(),
    ));
    spawn_pipeline_driver(manager.clone(), pipeline, input_rx);

    input_tx
        .send(PipelineMessage::Control(
            ReconfigurationMessage::new(ReconfigurationKind::Initialize, 2, 1)
                .with_payload(ReconfigurationPayload::ActiveProducers(1)),
        ))
        .await
        .unwrap();
    input_tx
        .send(side_buffer(&pool, 1, &[(1, 10, 100), (1, 32, 200)], 1000).await)
        .await
        .unwrap();

    let buffer = match timeout(Duration::from_secs(2), agg_out_rx.recv()).await {
        Ok(Some(PipelineMessage::Data(buffer))) => buffer,
        other => panic!("expected aggregation output, got {other:?}"),
    };
    assert_eq!(buffer.number_of_tuples(), 1);
    assert_eq!(buffer.watermark(), 1000);
    assert_eq!(buffer.origin_id(), 11);
}
