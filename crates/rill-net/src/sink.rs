//! The sending side of an inter-worker channel.
//!
//! Preserves per-partition ordering across reconnects with an upstream
//! backup: every outgoing data frame is tagged with a monotone epoch and
//! retained until the receiver acknowledges it via `PropagateEpochEvent`.
//! After a reconnect the sink replays every retained frame with an epoch
//! beyond the last acknowledged one; the receiver deduplicates on
//! `(origin, seq)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use rill_core::buffer::SealedBuffer;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::TerminationKind;
use rill_core::sink::DataSink;
use rill_core::QueryId;

use crate::manager::{ACK_DELETED, ACK_OK, ACK_UNKNOWN};
use crate::partition::ChannelPartition;
use crate::wire::{ChannelFrame, DataFrame, DataFrameCodec, EventFrame, EventFrameCodec};

struct Connection {
    frames: FramedWrite<tokio::net::tcp::OwnedWriteHalf, DataFrameCodec>,
    ack_task: tokio::task::JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.ack_task.abort();
    }
}

/// Outcome of one channel-establishment attempt.
enum Open {
    Connected(Connection),
    /// The receiver deleted the partition; give up gracefully.
    PartitionGone,
}

pub struct NetworkSink {
    name: String,
    partition: ChannelPartition,
    query_id: QueryId,
    record_size: usize,
    wait_time: Duration,
    retry_times: u32,
    epoch: u64,
    last_acked: Arc<AtomicU64>,
    retained: VecDeque<(u64, DataFrame)>,
    conn: Option<Connection>,
    gave_up: bool,
}

impl NetworkSink {
    pub fn new(
        name: impl Into<String>,
        partition: ChannelPartition,
        query_id: QueryId,
        record_size: usize,
        wait_time: Duration,
        retry_times: u32,
    ) -> Self {
        Self {
            name: name.into(),
            partition,
            query_id,
            record_size,
            wait_time,
            retry_times,
            epoch: 0,
            last_acked: Arc::new(AtomicU64::new(0)),
            retained: VecDeque::new(),
            conn: None,
            gave_up: false,
        }
    }

    /// Epoch of the last frame the receiver confirmed.
    pub fn acked_epoch(&self) -> u64 {
        self.last_acked.load(Ordering::Acquire)
    }

    /// Frames currently held for possible replay.
    pub fn retained_frames(&self) -> usize {
        self.retained.len()
    }

    /// Closes the underlying transport without tearing down the sink; the
    /// next write reconnects and replays unacknowledged frames.
    pub fn release_channel(&mut self, kind: TerminationKind) {
        if let Some(conn) = self.conn.take() {
            debug!(sink = %self.name, partition = %self.partition, ?kind, "releasing channel");
            conn.close();
        }
    }

    /// Connects with bounded retries and performs the partition handshake.
    async fn open_channel(&self) -> Result<Open> {
        let addr = self.partition.receiver.addr();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_connect(&addr).await {
                Ok(Some(conn)) => return Ok(Open::Connected(conn)),
                Ok(None) => return Ok(Open::PartitionGone),
                Err(e) => {
                    if attempt > self.retry_times {
                        warn!(
                            sink = %self.name,
                            partition = %self.partition,
                            attempts = attempt,
                            error = %e,
                            "channel establishment exhausted retries"
                        );
                        return Err(e);
                    }
                    debug!(
                        sink = %self.name,
                        partition = %self.partition,
                        attempt,
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(self.wait_time).await;
                }
            }
        }
    }

    async fn try_connect(&self, addr: &str) -> Result<Option<Connection>> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u64(self.partition.operator_id).await?;
        stream.write_u64(self.partition.subplan_id).await?;
        match stream.read_u8().await? {
            ACK_OK => {}
            ACK_DELETED => return Ok(None),
            ACK_UNKNOWN => {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "partition not yet registered on receiver",
                )))
            }
            other => {
                return Err(EngineError::protocol(format!(
                    "unexpected handshake ack {other}"
                )))
            }
        }
        let (read_half, write_half) = stream.into_split();
        let frames = FramedWrite::new(write_half, DataFrameCodec);
        let last_acked = self.last_acked.clone();
        let name = self.name.clone();
        let ack_task = tokio::spawn(async move {
            let mut events = FramedRead::new(read_half, EventFrameCodec);
            while let Some(event) = events.next().await {
                match event {
                    Ok(EventFrame::PropagateEpoch { epoch_ts, .. }) => {
                        last_acked.fetch_max(epoch_ts, Ordering::AcqRel);
                    }
                    Ok(EventFrame::StartSource) => {
                        debug!(sink = %name, "received start-source event");
                    }
                    Err(e) => {
                        warn!(sink = %name, error = %e, "event channel error");
                        break;
                    }
                }
            }
        });
        Ok(Some(Connection { frames, ack_task }))
    }

    fn prune_acked(&mut self) {
        let acked = self.last_acked.load(Ordering::Acquire);
        while self
            .retained
            .front()
            .map(|(epoch, _)| *epoch <= acked)
            .unwrap_or(false)
        {
            self.retained.pop_front();
        }
    }

    /// Ensures a live connection, replaying the upstream backup after a
    /// reconnect.
    async fn ensure_connected(&mut self) -> Result<bool> {
        if self.conn.is_some() {
            return Ok(true);
        }
        match self.open_channel().await? {
            Open::PartitionGone => {
                warn!(
                    sink = %self.name,
                    partition = %self.partition,
                    "partition deleted on receiver, giving up"
                );
                self.gave_up = true;
                Ok(false)
            }
            Open::Connected(mut conn) => {
                self.prune_acked();
                let acked = self.last_acked.load(Ordering::Acquire);
                for (epoch, frame) in self.retained.iter() {
                    debug!(
                        sink = %self.name,
                        epoch,
                        acked,
                        "replaying unacknowledged frame"
                    );
                    conn.frames
                        .send(ChannelFrame::Data(frame.clone()))
                        .await?;
                }
                self.conn = Some(conn);
                Ok(true)
            }
        }
    }

    /// Sends a frame on the live connection if there is one. On failure the
    /// transport is released so the caller can reconnect-and-replay.
    async fn send_on_live(&mut self, frame: ChannelFrame) -> Result<bool> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(false);
        };
        match conn.frames.send(frame).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(sink = %self.name, error = %e, "send failed, releasing channel");
                self.release_channel(TerminationKind::Failure);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl DataSink for NetworkSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<()> {
        if self.ensure_connected().await? {
            info!(
                sink = %self.name,
                query = self.query_id,
                partition = %self.partition,
                "network sink connected"
            );
        }
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        if self.gave_up {
            debug!(sink = %self.name, "partition gone, dropping buffer");
            return Ok(());
        }
        let used = buffer.used_bytes(self.record_size);
        let frame = DataFrame {
            origin: buffer.origin_id(),
            seq: buffer.sequence_number(),
            watermark: buffer.watermark(),
            tuple_count: buffer.number_of_tuples() as u32,
            payload: bytes::Bytes::copy_from_slice(&buffer.bytes()[..used]),
        };
        self.epoch += 1;
        self.retained.push_back((self.epoch, frame.clone()));
        self.prune_acked();
        if self.send_on_live(ChannelFrame::Data(frame)).await? {
            return Ok(());
        }
        // Not connected: establishing the channel replays every retained
        // frame, including the one just queued.
        self.ensure_connected().await?;
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        if !self.gave_up && self.conn.is_some() {
            if !self.send_on_live(ChannelFrame::EndOfStream(kind)).await? {
                warn!(sink = %self.name, "failed to send end-of-stream marker");
            }
            if let Some(conn) = self.conn.as_mut() {
                let _ = conn.frames.flush().await;
            }
        }
        self.release_channel(kind);
        info!(sink = %self.name, ?kind, "network sink shut down");
        Ok(())
    }
}
