//! End-to-end trigger behavior of the windowed nested-loop join.

use std::sync::Arc;

use tokio::sync::mpsc;

use rill_core::buffer::BufferManager;
use rill_core::reconfig::PipelineMessage;
use rill_core::schema::{read_field_as_i64, Field, PhysicalType, RowLayout, RowReader, Schema};
use rill_core::window::WindowMeasure;
use rill_win::{JoinDefinition, JoinHandler, JoinKind, JoinSide};

const ORIGIN_LEFT: u64 = 1;
const ORIGIN_RIGHT: u64 = 2;

fn side_schema() -> Arc<Schema> {
    Schema::new(vec![
        Field::new("key", PhysicalType::U64),
        Field::new("value", PhysicalType::U64),
        Field::new("ts", PhysicalType::U64),
    ])
}

fn record(key: u64, value: u64, ts: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&key.to_ne_bytes());
    bytes.extend_from_slice(&value.to_ne_bytes());
    bytes.extend_from_slice(&ts.to_ne_bytes());
    bytes
}

fn tumbling_handler(tx: mpsc::Sender<PipelineMessage>) -> Arc<JoinHandler> {
    let definition = JoinDefinition::new(
        JoinKind::Inner,
        WindowMeasure::Tumbling { size_ms: 1000 },
        side_schema(),
        side_schema(),
        0,
        0,
    );
    JoinHandler::new(
        definition,
        1,
        vec![ORIGIN_LEFT],
        vec![ORIGIN_RIGHT],
        2,
        9,
        BufferManager::new(4096, 8),
        tx,
    )
}

/// Rows of the join output buffer as `(start, end, key, left_value, right_value)`.
fn decode(handler: &JoinHandler, buffer: &rill_core::SealedBuffer) -> Vec<(u64, u64, i64, u64, u64)> {
    let layout = RowLayout::new(handler.definition().output_schema.clone());
    let reader = RowReader::new(&layout, buffer.bytes());
    let mut rows = Vec::new();
    for i in 0..buffer.number_of_tuples() {
        let rec = reader.record_bytes(i).unwrap();
        rows.push((
            reader.read_u64(i, 0).unwrap(),
            reader.read_u64(i, 1).unwrap(),
            read_field_as_i64(&layout, rec, 2).unwrap(),
            reader.read_u64(i, 4).unwrap(), // left_value
            reader.read_u64(i, 7).unwrap(), // right_value
        ));
    }
    rows
}

#[tokio::test]
async fn tumbling_inner_join_single_key_synced_watermarks() {
    let (tx, mut rx) = mpsc::channel(16);
    let handler = tumbling_handler(tx);

    handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
    handler.insert(JoinSide::Left, 1, 200, record(1, 11, 200));
    handler.insert(JoinSide::Right, 1, 150, record(1, 20, 150));
    handler.insert(JoinSide::Right, 1, 250, record(1, 21, 250));

    handler
        .update_watermark(1000, 1, ORIGIN_LEFT, JoinSide::Left)
        .await
        .unwrap();
    // Only the left side advanced; the join watermark is still the right
    // side's zero, so nothing closes yet.
    assert!(rx.try_recv().is_err());

    handler
        .update_watermark(1000, 1, ORIGIN_RIGHT, JoinSide::Right)
        .await
        .unwrap();

    let PipelineMessage::Data(buffer) = rx.try_recv().unwrap() else {
        panic!("expected a data buffer");
    };
    assert_eq!(buffer.number_of_tuples(), 4);
    assert_eq!(buffer.watermark(), 1000);
    assert_eq!(buffer.sequence_number(), 1);
    assert_eq!(buffer.origin_id(), 9);

    // Canonical (slice, left position, right position) order.
    assert_eq!(
        decode(&handler, &buffer),
        vec![
            (0, 1000, 1, 10, 20),
            (0, 1000, 1, 10, 21),
            (0, 1000, 1, 11, 20),
            (0, 1000, 1, 11, 21),
        ]
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn inner_join_skips_mismatched_keys() {
    let (tx, mut rx) = mpsc::channel(16);
    let handler = tumbling_handler(tx);

    handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
    handler.insert(JoinSide::Right, 2, 150, record(2, 20, 150));

    handler
        .update_watermark(1000, 1, ORIGIN_LEFT, JoinSide::Left)
        .await
        .unwrap();
    handler
        .update_watermark(1000, 1, ORIGIN_RIGHT, JoinSide::Right)
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn retention_trims_slices_behind_the_slide() {
    let (tx, mut rx) = mpsc::channel(16);
    let handler = tumbling_handler(tx);

    handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
    handler.insert(JoinSide::Right, 1, 150, record(1, 20, 150));
    handler.insert(JoinSide::Left, 1, 1100, record(1, 11, 1100));
    handler.insert(JoinSide::Right, 1, 1150, record(1, 21, 1150));

    handler
        .update_watermark(1000, 1, ORIGIN_LEFT, JoinSide::Left)
        .await
        .unwrap();
    handler
        .update_watermark(1000, 1, ORIGIN_RIGHT, JoinSide::Right)
        .await
        .unwrap();
    // Window [0, 1000) closed; cutoff is 1000 - 1000 = 0, so the first
    // slices survive this advance.
    let PipelineMessage::Data(first) = rx.try_recv().unwrap() else {
        panic!("expected first window output");
    };
    assert_eq!(decode(&handler, &first), vec![(0, 1000, 1, 10, 20)]);

    handler
        .update_watermark(2000, 2, ORIGIN_LEFT, JoinSide::Left)
        .await
        .unwrap();
    handler
        .update_watermark(2000, 2, ORIGIN_RIGHT, JoinSide::Right)
        .await
        .unwrap();
    // Window [1000, 2000) closes; the cutoff of 1000 drops the first slices,
    // so only the second-slice pair joins.
    let PipelineMessage::Data(second) = rx.try_recv().unwrap() else {
        panic!("expected second window output");
    };
    assert_eq!(decode(&handler, &second), vec![(1000, 2000, 1, 11, 21)]);
    assert_eq!(second.sequence_number(), 2);
}

#[tokio::test]
async fn cartesian_product_joins_across_keys() {
    let (tx, mut rx) = mpsc::channel(16);
    let definition = JoinDefinition::new(
        JoinKind::CartesianProduct,
        WindowMeasure::Tumbling { size_ms: 1000 },
        side_schema(),
        side_schema(),
        0,
        0,
    );
    let handler = JoinHandler::new(
        definition,
        2,
        vec![ORIGIN_LEFT],
        vec![ORIGIN_RIGHT],
        2,
        9,
        BufferManager::new(4096, 8),
        tx,
    );

    handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
    handler.insert(JoinSide::Right, 2, 150, record(2, 20, 150));
    handler
        .update_watermark(1000, 1, ORIGIN_LEFT, JoinSide::Left)
        .await
        .unwrap();
    handler
        .update_watermark(1000, 1, ORIGIN_RIGHT, JoinSide::Right)
        .await
        .unwrap();

    let PipelineMessage::Data(buffer) = rx.try_recv().unwrap() else {
        panic!("expected cartesian output");
    };
    // Output key carries the left key.
    assert_eq!(decode(&handler, &buffer), vec![(0, 1000, 1, 10, 20)]);
}
