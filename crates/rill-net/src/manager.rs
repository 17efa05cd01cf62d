//! The receiving side of inter-worker channels.
//!
//! A worker binds one [`NetworkManager`] listener. Local network sources
//! register a consumer per partition; inbound connections handshake with the
//! partition key, then stream data frames which are deduplicated on
//! `(origin, seq)` and forwarded to the registered emitter. Every processed
//! frame is acknowledged upstream with a `PropagateEpochEvent` so the sender
//! can discard its upstream backup. End-of-stream markers propagate to local
//! successors only for graceful termination; forceful ones are swallowed
//! with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use rill_core::buffer::BufferManager;
use rill_core::error::Result;
use rill_core::reconfig::{
    PipelineMessage, ReconfigurationKind, ReconfigurationMessage, TerminationKind,
};
use rill_core::{QueryId, SubplanId};

use crate::partition::{ChannelPartition, NodeLocation, PartitionKey};
use crate::wire::{ChannelFrame, DataFrameCodec, EventFrame, EventFrameCodec};

/// Handshake ack codes written back to a connecting sender.
pub(crate) const ACK_OK: u8 = 0;
pub(crate) const ACK_DELETED: u8 = 1;
pub(crate) const ACK_UNKNOWN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Registered,
    Deleted,
    NotFound,
}

struct Consumer {
    query_id: QueryId,
    subplan_id: SubplanId,
    emitter: mpsc::Sender<PipelineMessage>,
    pool: BufferManager,
    /// Highest sequence number forwarded per origin; replayed duplicates are
    /// acknowledged but not forwarded again.
    last_seq: Mutex<HashMap<u64, u64>>,
    /// Count of distinct data frames processed on this partition. Survives
    /// reconnects and equals the sender-side epoch of the last processed
    /// frame.
    frames_processed: AtomicU64,
    /// Reverse event channel of the live connection, if any.
    event_tx: Mutex<Option<mpsc::Sender<EventFrame>>>,
}

enum Entry {
    Active(Arc<Consumer>),
    Deleted,
}

pub struct NetworkManager {
    local: NodeLocation,
    registry: DashMap<PartitionKey, Entry>,
}

impl NetworkManager {
    /// Binds the listener and starts accepting channel connections. A port
    /// of zero picks a free port; the effective location is reported by
    /// [`local_location`](Self::local_location).
    pub async fn bind(local: NodeLocation) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(local.addr()).await?;
        let port = listener.local_addr()?.port();
        let manager = Arc::new(Self {
            local: NodeLocation::new(local.host, port),
            registry: DashMap::new(),
        });
        info!(location = %manager.local, "network manager listening");
        let accept = manager.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted channel connection");
                        let manager = accept.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.handle_connection(stream).await {
                                warn!(error = %e, "channel connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(manager)
    }

    pub fn local_location(&self) -> &NodeLocation {
        &self.local
    }

    /// Registers the consumer of a partition. Idempotent: re-registering an
    /// active partition keeps the existing consumer.
    pub fn register_consumer(
        &self,
        partition: &ChannelPartition,
        query_id: QueryId,
        subplan_id: SubplanId,
        pool: BufferManager,
        emitter: mpsc::Sender<PipelineMessage>,
    ) -> bool {
        let key = partition.key();
        match self.registry.get(&key) {
            Some(entry) => match entry.value() {
                Entry::Active(_) => true,
                Entry::Deleted => false,
            },
            None => {
                self.registry.insert(
                    key,
                    Entry::Active(Arc::new(Consumer {
                        query_id,
                        subplan_id,
                        emitter,
                        pool,
                        last_seq: Mutex::new(HashMap::new()),
                        frames_processed: AtomicU64::new(0),
                        event_tx: Mutex::new(None),
                    })),
                );
                debug!(%partition, "registered partition consumer");
                true
            }
        }
    }

    /// Tombstones the partition so reconnecting senders give up gracefully.
    pub fn unregister_consumer(&self, key: PartitionKey) {
        self.registry.insert(key, Entry::Deleted);
        debug!(%key, "unregistered partition consumer");
    }

    pub fn partition_status(&self, key: PartitionKey) -> PartitionStatus {
        match self.registry.get(&key) {
            Some(entry) => match entry.value() {
                Entry::Active(_) => PartitionStatus::Registered,
                Entry::Deleted => PartitionStatus::Deleted,
            },
            None => PartitionStatus::NotFound,
        }
    }

    /// The reverse event channel of the partition's live connection, used by
    /// the local network source to send events upstream.
    pub fn event_sender(&self, key: PartitionKey) -> Option<mpsc::Sender<EventFrame>> {
        match self.registry.get(&key)?.value() {
            Entry::Active(consumer) => consumer.event_tx.lock().clone(),
            Entry::Deleted => None,
        }
    }

    fn consumer(&self, key: PartitionKey) -> Option<Arc<Consumer>> {
        match self.registry.get(&key)?.value() {
            Entry::Active(consumer) => Some(consumer.clone()),
            Entry::Deleted => None,
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let operator_id = stream.read_u64().await?;
        let subplan_id = stream.read_u64().await?;
        let key = PartitionKey {
            operator_id,
            subplan_id,
        };

        let consumer = match self.partition_status(key) {
            PartitionStatus::Registered => match self.consumer(key) {
                Some(consumer) => {
                    stream.write_u8(ACK_OK).await?;
                    consumer
                }
                None => {
                    stream.write_u8(ACK_DELETED).await?;
                    return Ok(());
                }
            },
            PartitionStatus::Deleted => {
                debug!(%key, "rejecting sender of deleted partition");
                stream.write_u8(ACK_DELETED).await?;
                return Ok(());
            }
            PartitionStatus::NotFound => {
                debug!(%key, "rejecting sender of unknown partition");
                stream.write_u8(ACK_UNKNOWN).await?;
                return Ok(());
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, DataFrameCodec);
        let mut events_out = FramedWrite::new(write_half, EventFrameCodec);

        // The reverse event pump: acknowledgments and source events share it.
        let (event_tx, mut event_rx) = mpsc::channel::<EventFrame>(64);
        *consumer.event_tx.lock() = Some(event_tx.clone());
        let writer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if events_out.send(event).await.is_err() {
                    break;
                }
            }
        });

        let result = self.pump_frames(&consumer, key, &mut frames, &event_tx).await;

        // A reconnect may already have installed its own event channel;
        // only clear the slot if it is still ours.
        {
            let mut slot = consumer.event_tx.lock();
            if slot
                .as_ref()
                .map(|tx| tx.same_channel(&event_tx))
                .unwrap_or(false)
            {
                *slot = None;
            }
        }
        drop(event_tx);
        let _ = writer.await;
        result
    }

    async fn pump_frames(
        &self,
        consumer: &Consumer,
        key: PartitionKey,
        frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, DataFrameCodec>,
        event_tx: &mpsc::Sender<EventFrame>,
    ) -> Result<()> {
        while let Some(frame) = frames.next().await {
            match frame? {
                ChannelFrame::Data(frame) => {
                    let duplicate = {
                        let mut last_seq = consumer.last_seq.lock();
                        let entry = last_seq.entry(frame.origin).or_insert(0);
                        if frame.seq <= *entry {
                            true
                        } else {
                            *entry = frame.seq;
                            false
                        }
                    };
                    let epoch = if duplicate {
                        consumer.frames_processed.load(Ordering::Acquire)
                    } else {
                        let mut buffer = if frame.payload.len() <= consumer.pool.buffer_size() {
                            consumer.pool.acquire().await
                        } else {
                            consumer.pool.acquire_unpooled(frame.payload.len())
                        };
                        buffer.as_mut_slice()[..frame.payload.len()]
                            .copy_from_slice(&frame.payload);
                        buffer.set_number_of_tuples(frame.tuple_count as u64);
                        buffer.set_origin_id(frame.origin);
                        buffer.set_sequence_number(frame.seq);
                        buffer.set_watermark(frame.watermark);
                        if consumer
                            .emitter
                            .send(PipelineMessage::Data(buffer.seal()))
                            .await
                            .is_err()
                        {
                            warn!(%key, "partition emitter closed, dropping connection");
                            break;
                        }
                        consumer.frames_processed.fetch_add(1, Ordering::AcqRel) + 1
                    };
                    // Acknowledge so the sender can trim its upstream backup.
                    let _ = event_tx
                        .send(EventFrame::PropagateEpoch {
                            query_id: consumer.query_id,
                            epoch_ts: epoch,
                        })
                        .await;
                }
                ChannelFrame::EndOfStream(kind) => {
                    if kind == TerminationKind::Graceful {
                        debug!(%key, "propagating graceful end-of-stream to local successors");
                        let msg = ReconfigurationMessage::new(
                            ReconfigurationKind::SoftEndOfStream,
                            consumer.query_id,
                            consumer.subplan_id,
                        );
                        let _ = consumer.emitter.send(PipelineMessage::Control(msg)).await;
                    } else {
                        warn!(%key, ?kind, "ignoring forceful end-of-stream from the wire");
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}
