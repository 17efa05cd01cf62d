//! Packs trigger output records into pooled buffers and dispatches them
//! downstream, rolling over to a fresh buffer whenever the current one would
//! overflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use rill_core::buffer::BufferManager;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::PipelineMessage;
use rill_core::schema::{RowLayout, RowWriter, Schema};
use rill_core::{OriginId, WatermarkTs};

/// Shared by the trigger actions: owns the output origin and its strictly
/// increasing sequence counter, so no two emitters stamp the same sequence
/// number on the same origin.
pub struct RecordEmitter {
    layout: RowLayout,
    origin_id: OriginId,
    sequence: AtomicU64,
    pool: BufferManager,
    out: mpsc::Sender<PipelineMessage>,
}

impl RecordEmitter {
    pub fn new(
        output_schema: Arc<Schema>,
        origin_id: OriginId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        Self {
            layout: RowLayout::new(output_schema),
            origin_id,
            sequence: AtomicU64::new(0),
            pool,
            out,
        }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    /// Packs `records` into buffers tagged with `watermark` and sends them
    /// downstream. Returns the number of records dispatched.
    pub async fn emit_all(&self, records: &[Vec<u8>], watermark: WatermarkTs) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let capacity = self.layout.capacity_tuples(self.pool.buffer_size());
        if capacity == 0 {
            return Err(EngineError::invariant(format!(
                "output record of {} bytes does not fit a {}-byte buffer",
                self.layout.record_size(),
                self.pool.buffer_size()
            )));
        }
        let mut buffer = self.pool.acquire().await;
        let mut index = 0u64;
        let mut total = 0u64;
        for record in records {
            if index == capacity {
                self.dispatch(buffer, index, watermark).await?;
                buffer = self.pool.acquire().await;
                index = 0;
            }
            let mut writer = RowWriter::new(&self.layout, &mut buffer);
            writer.write_record_bytes(index, record)?;
            index += 1;
            total += 1;
        }
        if index > 0 {
            self.dispatch(buffer, index, watermark).await?;
        }
        Ok(total)
    }

    async fn dispatch(
        &self,
        mut buffer: rill_core::TupleBuffer,
        tuples: u64,
        watermark: WatermarkTs,
    ) -> Result<()> {
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        buffer.set_number_of_tuples(tuples);
        buffer.set_origin_id(self.origin_id);
        buffer.set_sequence_number(seq);
        buffer.set_watermark(watermark);
        trace!(
            origin = self.origin_id,
            seq,
            tuples,
            watermark,
            "dispatching trigger output buffer"
        );
        self.out
            .send(PipelineMessage::Data(buffer.seal()))
            .await
            .map_err(|_| EngineError::ChannelClosed("trigger output edge"))
    }
}
