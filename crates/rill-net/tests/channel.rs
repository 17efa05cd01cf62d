//! Inter-worker channel behavior over real sockets on the loopback device.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use rill_core::buffer::BufferManager;
use rill_core::reconfig::{PipelineMessage, ReconfigurationKind, TerminationKind};
use rill_core::sink::DataSink;
use rill_core::SealedBuffer;
use rill_net::{ChannelPartition, NetworkManager, NetworkSink, NodeLocation};

const RECORD_SIZE: usize = 8;

async fn bind_manager() -> std::sync::Arc<NetworkManager> {
    NetworkManager::bind(NodeLocation::new("127.0.0.1", 0))
        .await
        .expect("bind loopback")
}

fn partition(manager: &NetworkManager, operator_id: u64) -> ChannelPartition {
    ChannelPartition {
        operator_id,
        subplan_id: 5,
        sender: NodeLocation::new("127.0.0.1", 0),
        receiver: manager.local_location().clone(),
    }
}

fn sink_for(partition: &ChannelPartition) -> NetworkSink {
    NetworkSink::new(
        "net-sink",
        partition.clone(),
        1,
        RECORD_SIZE,
        Duration::from_millis(30),
        10,
    )
}

async fn make_buffer(pool: &BufferManager, seq: u64, value: u64) -> SealedBuffer {
    let mut buffer = pool.acquire().await;
    buffer.as_mut_slice()[..8].copy_from_slice(&value.to_ne_bytes());
    buffer.set_number_of_tuples(1);
    buffer.set_origin_id(3);
    buffer.set_sequence_number(seq);
    buffer.set_watermark(seq * 100);
    buffer.seal()
}

async fn recv_data(rx: &mut mpsc::Receiver<PipelineMessage>) -> SealedBuffer {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(PipelineMessage::Data(buffer))) => buffer,
        other => panic!("expected data buffer, got {other:?}"),
    }
}

#[tokio::test]
async fn buffers_flow_and_acks_trim_the_backup() {
    let manager = bind_manager().await;
    let partition = partition(&manager, 1);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);
    assert!(manager.register_consumer(&partition, 1, 5, pool.clone(), tx));

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    for seq in 1..=3u64 {
        sink.write_buffer(make_buffer(&pool, seq, seq * 10).await)
            .await
            .unwrap();
    }
    for seq in 1..=3u64 {
        let buffer = recv_data(&mut rx).await;
        assert_eq!(buffer.origin_id(), 3);
        assert_eq!(buffer.sequence_number(), seq);
        assert_eq!(buffer.watermark(), seq * 100);
        assert_eq!(buffer.number_of_tuples(), 1);
    }

    // Acks flow back asynchronously and eventually cover every frame.
    for _ in 0..100 {
        if sink.acked_epoch() == 3 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.acked_epoch(), 3);
}

#[tokio::test]
async fn reconnect_replays_only_unacknowledged_frames() {
    let manager = bind_manager().await;
    let partition = partition(&manager, 2);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);
    manager.register_consumer(&partition, 1, 5, pool.clone(), tx);

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    for seq in 1..=3u64 {
        sink.write_buffer(make_buffer(&pool, seq, 0).await)
            .await
            .unwrap();
        recv_data(&mut rx).await;
    }
    for _ in 0..100 {
        if sink.acked_epoch() == 3 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.acked_epoch(), 3);

    // The transport dies; frames 4 and 5 are written afterwards. The sink
    // must reconnect and deliver exactly [4, 5]: not the acknowledged
    // prefix, and nothing skipped.
    sink.release_channel(TerminationKind::Failure);
    sink.write_buffer(make_buffer(&pool, 4, 0).await)
        .await
        .unwrap();
    sink.write_buffer(make_buffer(&pool, 5, 0).await)
        .await
        .unwrap();

    assert_eq!(recv_data(&mut rx).await.sequence_number(), 4);
    assert_eq!(recv_data(&mut rx).await.sequence_number(), 5);
    assert!(rx.try_recv().is_err(), "no duplicate deliveries");
}

#[tokio::test]
async fn duplicate_sequence_numbers_are_delivered_once() {
    let manager = bind_manager().await;
    let partition = partition(&manager, 3);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);
    manager.register_consumer(&partition, 1, 5, pool.clone(), tx);

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    sink.write_buffer(make_buffer(&pool, 1, 7).await).await.unwrap();
    sink.write_buffer(make_buffer(&pool, 1, 7).await).await.unwrap();
    sink.write_buffer(make_buffer(&pool, 2, 8).await).await.unwrap();

    assert_eq!(recv_data(&mut rx).await.sequence_number(), 1);
    assert_eq!(recv_data(&mut rx).await.sequence_number(), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn deleted_partition_makes_the_sender_give_up() {
    let manager = bind_manager().await;
    let partition = partition(&manager, 4);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);
    manager.register_consumer(&partition, 1, 5, pool.clone(), tx);
    manager.unregister_consumer(partition.key());

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    sink.write_buffer(make_buffer(&pool, 1, 1).await).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "nothing may reach a deleted partition");
    assert_eq!(sink.acked_epoch(), 0);
}

#[tokio::test]
async fn graceful_eos_reaches_local_successors_but_forceful_does_not() {
    let manager = bind_manager().await;
    let pool = BufferManager::new(64, 16);

    let soft = partition(&manager, 5);
    let (tx, mut rx) = mpsc::channel(16);
    manager.register_consumer(&soft, 1, 5, pool.clone(), tx);
    let mut sink = sink_for(&soft);
    sink.setup().await.unwrap();
    sink.shutdown(TerminationKind::Graceful).await.unwrap();
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(PipelineMessage::Control(msg))) => {
            assert_eq!(msg.kind, ReconfigurationKind::SoftEndOfStream);
        }
        other => panic!("expected SoftEoS, got {other:?}"),
    }

    let hard = partition(&manager, 6);
    let (tx, mut rx) = mpsc::channel(16);
    manager.register_consumer(&hard, 1, 5, pool.clone(), tx);
    let mut sink = sink_for(&hard);
    sink.setup().await.unwrap();
    sink.shutdown(TerminationKind::HardStop).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "forceful EoS must be swallowed");
}

#[tokio::test]
async fn network_source_lifecycle_drives_the_event_channel() {
    use rill_core::source::SourceEvent;
    use rill_net::NetworkSource;

    let manager = bind_manager().await;
    let partition = partition(&manager, 8);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);

    let source = NetworkSource::new(manager.clone(), partition.clone(), 1, 5, pool.clone(), tx);
    assert!(source.bind());
    assert!(source.bind(), "bind is idempotent");
    assert!(source.start());

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    sink.write_buffer(make_buffer(&pool, 1, 1).await).await.unwrap();
    assert_eq!(recv_data(&mut rx).await.sequence_number(), 1);

    // The lazy Initialize picks up the live connection's reverse channel;
    // events sent on it reach the sender as epoch acknowledgments.
    source.reconfigure(ReconfigurationKind::Initialize);
    source
        .send_event(SourceEvent::PropagateEpoch {
            query_id: 1,
            epoch_ts: 99,
        })
        .await
        .unwrap();
    for _ in 0..100 {
        if sink.acked_epoch() == 99 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.acked_epoch(), 99);

    // Graceful teardown releases the event channel and tombstones the
    // partition, so a reconnecting sender gives up.
    source.reconfigure(ReconfigurationKind::SoftEndOfStream);
    assert!(!source.is_running());
    assert_eq!(
        manager.partition_status(partition.key()),
        rill_net::PartitionStatus::Deleted
    );
    let mut late_sink = sink_for(&partition);
    late_sink.setup().await.unwrap();
    late_sink
        .write_buffer(make_buffer(&pool, 2, 2).await)
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn connect_retries_until_the_partition_registers() {
    let manager = bind_manager().await;
    let partition = partition(&manager, 7);
    let (tx, mut rx) = mpsc::channel(16);
    let pool = BufferManager::new(64, 16);

    let register_manager = manager.clone();
    let register_partition = partition.clone();
    let register_pool = pool.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(120)).await;
        register_manager.register_consumer(&register_partition, 1, 5, register_pool, tx);
    });

    let mut sink = sink_for(&partition);
    sink.setup().await.unwrap();
    sink.write_buffer(make_buffer(&pool, 1, 9).await).await.unwrap();
    assert_eq!(recv_data(&mut rx).await.sequence_number(), 1);
}
