//! The shared source runtime.
//!
//! Concrete sources implement [`SourceConnector`] and only know how to fill
//! one buffer at a time. The [`DataSource`] runner owns everything they have
//! in common: the origin id, the gap-free sequence counter, the gathering
//! cadence, stop handling from any task, and end-of-stream emission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferManager, SealedBuffer};
use crate::error::{EngineError, Result};
use crate::reconfig::{PipelineMessage, ReconfigurationMessage, TerminationKind};
use crate::schema::{RowLayout, RowWriter, Schema};
use crate::{OriginId, QueryId, SequenceNumber, SubplanId};

/// Events delivered to a source from downstream, carried on the reverse
/// event-only channel of an inter-worker edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    StartSource,
    PropagateEpoch { query_id: QueryId, epoch_ts: u64 },
}

/// Outcome of one fill pass over a buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceFill {
    /// Tuples written into the buffer.
    pub tuples: u64,
    /// The connector will never produce data again.
    pub end_of_stream: bool,
}

/// One concrete ingestion mechanism (CSV file, memory area, TCP socket, ...).
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> Arc<Schema>;

    /// Establish the external connection. An error here terminates the
    /// source with a failure end-of-stream.
    async fn open(&mut self) -> Result<()>;

    /// Fill row slots of the given buffer, returning how many tuples were
    /// written and whether the stream is exhausted.
    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill>;

    async fn close(&mut self) -> Result<()>;

    /// React to a downstream event. Most sources ignore these.
    fn on_event(&mut self, _event: SourceEvent) {}
}

/// When the gathering loop wakes up to fill the next buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringMode {
    /// Wake every period, fill one buffer, emit, sleep.
    Interval(Duration),
    /// Emit a target number of buffers per second.
    IngestionRate(u32),
    /// Start from a default period and adapt it to the observed fill ratio.
    Adaptive,
}

#[derive(Default)]
struct StopCell {
    kind: Mutex<Option<TerminationKind>>,
}

/// Remote control for a running source, safe to use from any task.
#[derive(Clone)]
pub struct SourceHandle {
    cancel: CancellationToken,
    stop: Arc<StopCell>,
}

impl SourceHandle {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            stop: Arc::new(StopCell::default()),
        }
    }

    /// Requests the source to stop. The first caller wins.
    pub fn stop(&self, kind: TerminationKind) {
        let mut slot = self.stop.kind.lock();
        if slot.is_none() {
            *slot = Some(kind);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn requested_kind(&self) -> Option<TerminationKind> {
        *self.stop.kind.lock()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for SourceHandle {
    fn default() -> Self {
        Self::new()
    }
}

enum Receive {
    Buffer(SealedBuffer),
    Empty,
    End,
}

/// Runs a [`SourceConnector`] against a buffer pool and an outgoing edge.
pub struct DataSource {
    connector: Box<dyn SourceConnector>,
    layout: RowLayout,
    origin_id: OriginId,
    sequence: SequenceNumber,
    gathering: GatheringMode,
    buffers_to_produce: Option<u64>,
    pool: BufferManager,
    out: mpsc::Sender<PipelineMessage>,
    query_id: QueryId,
    subplan_id: SubplanId,
    handle: SourceHandle,
}

impl DataSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Box<dyn SourceConnector>,
        origin_id: OriginId,
        gathering: GatheringMode,
        buffers_to_produce: Option<u64>,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
        query_id: QueryId,
        subplan_id: SubplanId,
    ) -> Self {
        let layout = RowLayout::new(connector.schema());
        Self {
            connector,
            layout,
            origin_id,
            sequence: 0,
            gathering,
            buffers_to_produce,
            pool,
            out,
            query_id,
            subplan_id,
            handle: SourceHandle::new(),
        }
    }

    pub fn handle(&self) -> SourceHandle {
        self.handle.clone()
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    /// Acquires a buffer, lets the connector fill it and tags it with the
    /// origin id and the next sequence number.
    async fn receive_data(&mut self) -> Result<Receive> {
        let mut buffer = tokio::select! {
            buffer = self.pool.acquire() => buffer,
            _ = self.handle.cancel.cancelled() => return Err(EngineError::Cancelled("source stop during acquire")),
        };
        let fill = {
            let mut writer = RowWriter::new(&self.layout, &mut buffer);
            self.connector.fill_buffer(&mut writer).await?
        };
        if fill.tuples == 0 {
            return Ok(if fill.end_of_stream {
                Receive::End
            } else {
                Receive::Empty
            });
        }
        self.sequence += 1;
        buffer.set_number_of_tuples(fill.tuples);
        buffer.set_origin_id(self.origin_id);
        buffer.set_sequence_number(self.sequence);
        let sealed = buffer.seal();
        if fill.end_of_stream {
            // Deliver the final partial buffer, then report exhaustion on the
            // next pass.
            self.buffers_to_produce = Some(0);
        }
        Ok(Receive::Buffer(sealed))
    }

    async fn emit_eos(&self, kind: TerminationKind) {
        let msg = ReconfigurationMessage::new(kind.eos_kind(), self.query_id, self.subplan_id);
        if self.out.send(PipelineMessage::Control(msg)).await.is_err() {
            warn!(
                source = self.connector.name(),
                origin = self.origin_id,
                "successor gone before end-of-stream"
            );
        }
    }

    /// The gathering loop. Returns once the source terminated and its
    /// end-of-stream was emitted.
    pub async fn run(mut self) -> Result<()> {
        info!(
            source = self.connector.name(),
            origin = self.origin_id,
            "source starting"
        );

        if self.buffers_to_produce == Some(0) {
            debug!(
                source = self.connector.name(),
                "nothing to produce, emitting soft end-of-stream"
            );
            self.emit_eos(TerminationKind::Graceful).await;
            return Ok(());
        }

        if let Err(e) = self.connector.open().await {
            error!(
                source = self.connector.name(),
                origin = self.origin_id,
                error = %e,
                "source connect failed"
            );
            self.emit_eos(TerminationKind::Failure).await;
            return Err(e);
        }

        let mut period = match self.gathering {
            GatheringMode::Interval(period) => period,
            GatheringMode::IngestionRate(per_sec) => {
                Duration::from_secs_f64(1.0 / per_sec.max(1) as f64)
            }
            GatheringMode::Adaptive => Duration::from_millis(100),
        };
        let mut produced = 0u64;
        let mut termination = TerminationKind::Graceful;

        loop {
            if let Some(kind) = self.handle.requested_kind() {
                termination = kind;
                break;
            }
            match self.receive_data().await {
                Ok(Receive::Buffer(sealed)) => {
                    if let Some(kind) = self.handle.requested_kind() {
                        // A hard stop or failure discards the partial buffer;
                        // a graceful stop still delivers it.
                        termination = kind;
                        if kind != TerminationKind::Graceful {
                            break;
                        }
                    }
                    let tuples = sealed.number_of_tuples();
                    if self.out.send(PipelineMessage::Data(sealed)).await.is_err() {
                        warn!(
                            source = self.connector.name(),
                            origin = self.origin_id,
                            "successor channel closed, stopping source"
                        );
                        termination = TerminationKind::HardStop;
                        break;
                    }
                    produced += 1;
                    if self.gathering == GatheringMode::Adaptive {
                        let capacity = self.layout.capacity_tuples(self.pool.buffer_size());
                        period = adapt_period(period, tuples, capacity);
                    }
                    if termination != TerminationKind::Graceful {
                        break;
                    }
                    if let Some(limit) = self.buffers_to_produce {
                        if produced >= limit {
                            break;
                        }
                    }
                }
                Ok(Receive::Empty) => {}
                Ok(Receive::End) => break,
                Err(EngineError::Cancelled(_)) => {
                    termination = self
                        .handle
                        .requested_kind()
                        .unwrap_or(TerminationKind::HardStop);
                    break;
                }
                Err(EngineError::Io(e)) => {
                    // Receive-side I/O errors are transient; keep gathering.
                    warn!(
                        source = self.connector.name(),
                        origin = self.origin_id,
                        error = %e,
                        "receive error, continuing"
                    );
                }
                Err(e) => {
                    error!(
                        source = self.connector.name(),
                        origin = self.origin_id,
                        error = %e,
                        "source failed"
                    );
                    termination = TerminationKind::Failure;
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.handle.cancel.cancelled() => {}
            }
        }

        if let Err(e) = self.connector.close().await {
            warn!(source = self.connector.name(), error = %e, "source close failed");
        }
        info!(
            source = self.connector.name(),
            origin = self.origin_id,
            buffers = produced,
            ?termination,
            "source finished"
        );
        self.emit_eos(termination).await;
        Ok(())
    }
}

/// Shrinks the period while buffers come back full, grows it while they come
/// back mostly empty. Bounded to keep sub-second tails responsive.
fn adapt_period(period: Duration, tuples: u64, capacity: u64) -> Duration {
    const MIN: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_secs(1);
    if capacity == 0 {
        return period;
    }
    let next = if tuples >= capacity {
        period / 2
    } else if tuples < capacity / 4 {
        period.saturating_mul(2)
    } else {
        period
    };
    next.clamp(MIN, MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, PhysicalType};

    struct CountingConnector {
        schema: Arc<Schema>,
        per_buffer: u64,
        remaining: u64,
    }

    impl CountingConnector {
        fn new(per_buffer: u64, total: u64) -> Self {
            Self {
                schema: Schema::new(vec![Field::new("value", PhysicalType::U64)]),
                per_buffer,
                remaining: total,
            }
        }
    }

    #[async_trait]
    impl SourceConnector for CountingConnector {
        fn name(&self) -> &str {
            "counting"
        }

        fn schema(&self) -> Arc<Schema> {
            self.schema.clone()
        }

        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
            let n = self.per_buffer.min(self.remaining);
            for i in 0..n {
                writer.write_u64(i, 0, i)?;
            }
            self.remaining -= n;
            Ok(SourceFill {
                tuples: n,
                end_of_stream: self.remaining == 0,
            })
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn make_source(
        connector: CountingConnector,
        buffers_to_produce: Option<u64>,
        tx: mpsc::Sender<PipelineMessage>,
    ) -> DataSource {
        DataSource::new(
            Box::new(connector),
            1,
            GatheringMode::Interval(Duration::from_millis(1)),
            buffers_to_produce,
            BufferManager::new(256, 4),
            tx,
            1,
            1,
        )
    }

    #[tokio::test]
    async fn sequences_are_gap_free_and_soft_eos_follows() {
        let (tx, mut rx) = mpsc::channel(16);
        let source = make_source(CountingConnector::new(4, 12), None, tx);
        source.run().await.unwrap();

        let mut expected_seq = 1;
        loop {
            match rx.recv().await.unwrap() {
                PipelineMessage::Data(buffer) => {
                    assert_eq!(buffer.origin_id(), 1);
                    assert_eq!(buffer.sequence_number(), expected_seq);
                    assert_eq!(buffer.number_of_tuples(), 4);
                    expected_seq += 1;
                }
                PipelineMessage::Control(msg) => {
                    assert_eq!(msg.kind, crate::ReconfigurationKind::SoftEndOfStream);
                    break;
                }
            }
        }
        assert_eq!(expected_seq, 4);
    }

    #[tokio::test]
    async fn zero_buffers_to_produce_emits_immediate_soft_eos() {
        let (tx, mut rx) = mpsc::channel(4);
        let source = make_source(CountingConnector::new(4, 100), Some(0), tx);
        source.run().await.unwrap();
        match rx.recv().await.unwrap() {
            PipelineMessage::Control(msg) => {
                assert_eq!(msg.kind, crate::ReconfigurationKind::SoftEndOfStream)
            }
            other => panic!("expected immediate SoftEoS, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn hard_stop_emits_hard_eos() {
        let (tx, mut rx) = mpsc::channel(64);
        let source = make_source(CountingConnector::new(1, u64::MAX), None, tx);
        let handle = source.handle();
        let task = tokio::spawn(source.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop(TerminationKind::HardStop);
        task.await.unwrap().unwrap();

        let mut saw_eos = None;
        while let Some(msg) = rx.recv().await {
            if let PipelineMessage::Control(msg) = msg {
                saw_eos = Some(msg.kind);
            }
        }
        assert_eq!(saw_eos, Some(crate::ReconfigurationKind::HardEndOfStream));
    }
}
