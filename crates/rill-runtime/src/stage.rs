//! Compiled executable stages.
//!
//! A stage is the monomorphized body of a pipeline: it reads records out of
//! the input buffer, updates operator-handler state, and emits zero or more
//! output buffers through the pipeline's successors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use rill_core::buffer::SealedBuffer;
use rill_core::error::Result;
use rill_core::reconfig::{PipelineMessage, TerminationKind};
use rill_core::schema::{read_field_as_i64, RowLayout, RowReader, Schema};
use rill_core::window::TimeCharacteristic;
use rill_core::EngineError;
use rill_win::{JoinHandler, JoinSide, WindowAggregationHandler};

use crate::worker::WorkerContext;

/// Where a stage sends its output buffers.
pub struct StageOutput {
    successors: Vec<mpsc::Sender<PipelineMessage>>,
}

impl StageOutput {
    pub fn new(successors: Vec<mpsc::Sender<PipelineMessage>>) -> Self {
        Self { successors }
    }

    pub fn successors(&self) -> &[mpsc::Sender<PipelineMessage>] {
        &self.successors
    }

    pub async fn emit(&self, buffer: SealedBuffer) -> Result<()> {
        for successor in &self.successors {
            successor
                .send(PipelineMessage::Data(buffer.clone()))
                .await
                .map_err(|_| EngineError::ChannelClosed("pipeline successor"))?;
        }
        Ok(())
    }

    pub async fn control(&self, msg: rill_core::ReconfigurationMessage) {
        for successor in &self.successors {
            let _ = successor
                .send(PipelineMessage::Control(msg.clone()))
                .await;
        }
    }
}

#[async_trait]
pub trait ExecutableStage: Send + Sync {
    fn name(&self) -> &str;

    /// Start the stage's operator handlers. Runs once, on Initialize.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        buffer: &SealedBuffer,
        output: &StageOutput,
        worker: &WorkerContext,
    ) -> Result<()>;

    /// Stop and drain handler state per the termination kind.
    async fn stop(&self, kind: TerminationKind) -> Result<()>;
}

/// Forwards buffers untouched; the identity stage of a pipeline.
pub struct PassthroughStage {
    name: String,
}

impl PassthroughStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ExecutableStage for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        buffer: &SealedBuffer,
        output: &StageOutput,
        worker: &WorkerContext,
    ) -> Result<()> {
        trace!(
            stage = %self.name,
            worker = worker.worker_id(),
            tuples = buffer.number_of_tuples(),
            "passthrough"
        );
        output.emit(buffer.clone()).await
    }

    async fn stop(&self, _kind: TerminationKind) -> Result<()> {
        Ok(())
    }
}

/// How a build stage stamps each record with a timestamp. The event-time
/// field index is resolved once at stage construction.
enum TimeExtract {
    Field(usize),
    Ingestion,
}

impl TimeExtract {
    fn resolve(time: &TimeCharacteristic, schema: &Schema) -> Result<Self> {
        match time {
            TimeCharacteristic::EventTime { field } => {
                let idx = schema.field_index(field).ok_or_else(|| {
                    EngineError::config(format!("event-time field {field:?} not in schema"))
                })?;
                Ok(TimeExtract::Field(idx))
            }
            TimeCharacteristic::IngestionTime => Ok(TimeExtract::Ingestion),
        }
    }

    fn timestamp(&self, layout: &RowLayout, record: &[u8]) -> Result<u64> {
        match self {
            TimeExtract::Field(idx) => {
                Ok(read_field_as_i64(layout, record, *idx)?.max(0) as u64)
            }
            TimeExtract::Ingestion => Ok(chrono::Utc::now().timestamp_millis().max(0) as u64),
        }
    }
}

/// Feeds one side of a windowed nested-loop join: inserts records into the
/// handler's slice stores and folds the buffer watermark into the side's
/// watermark processor, which runs the trigger on advances.
pub struct JoinBuildStage {
    name: String,
    handler: Arc<JoinHandler>,
    side: JoinSide,
    layout: RowLayout,
    key_field: usize,
    time: TimeExtract,
}

impl JoinBuildStage {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<JoinHandler>,
        side: JoinSide,
        schema: Arc<Schema>,
        key_field: usize,
        time: TimeCharacteristic,
    ) -> Result<Self> {
        let time = TimeExtract::resolve(&time, &schema)?;
        Ok(Self {
            name: name.into(),
            handler,
            side,
            layout: RowLayout::new(schema),
            key_field,
            time,
        })
    }
}

#[async_trait]
impl ExecutableStage for JoinBuildStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.handler.start();
        Ok(())
    }

    async fn execute(
        &self,
        buffer: &SealedBuffer,
        _output: &StageOutput,
        _worker: &WorkerContext,
    ) -> Result<()> {
        let reader = RowReader::new(&self.layout, buffer.bytes());
        for index in 0..buffer.number_of_tuples() {
            let record = reader.record_bytes(index)?;
            let key = read_field_as_i64(&self.layout, record, self.key_field)?;
            let ts = self.time.timestamp(&self.layout, record)?;
            self.handler.insert(self.side, key, ts, record.to_vec());
        }
        self.handler
            .update_watermark(
                buffer.watermark(),
                buffer.sequence_number(),
                buffer.origin_id(),
                self.side,
            )
            .await
    }

    async fn stop(&self, kind: TerminationKind) -> Result<()> {
        self.handler.on_end_of_stream(kind).await?;
        Ok(())
    }
}

/// Feeds a keyed window aggregation.
pub struct AggregationBuildStage {
    name: String,
    handler: Arc<WindowAggregationHandler>,
    layout: RowLayout,
    key_field: usize,
    time: TimeExtract,
}

impl AggregationBuildStage {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<WindowAggregationHandler>,
        schema: Arc<Schema>,
        key_field: usize,
        time: TimeCharacteristic,
    ) -> Result<Self> {
        let time = TimeExtract::resolve(&time, &schema)?;
        Ok(Self {
            name: name.into(),
            handler,
            layout: RowLayout::new(schema),
            key_field,
            time,
        })
    }
}

#[async_trait]
impl ExecutableStage for AggregationBuildStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        buffer: &SealedBuffer,
        _output: &StageOutput,
        _worker: &WorkerContext,
    ) -> Result<()> {
        let reader = RowReader::new(&self.layout, buffer.bytes());
        for index in 0..buffer.number_of_tuples() {
            let record = reader.record_bytes(index)?;
            let key = read_field_as_i64(&self.layout, record, self.key_field)?;
            let ts = self.time.timestamp(&self.layout, record)?;
            self.handler.insert(key, ts, record.to_vec());
        }
        self.handler
            .update_watermark(
                buffer.watermark(),
                buffer.sequence_number(),
                buffer.origin_id(),
            )
            .await
    }

    async fn stop(&self, kind: TerminationKind) -> Result<()> {
        self.handler.on_end_of_stream(kind).await?;
        Ok(())
    }
}
