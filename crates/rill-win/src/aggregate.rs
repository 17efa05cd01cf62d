//! Keyed window aggregation over the slice-store fabric.
//!
//! Shares the retention and trigger mechanics of the join handler but folds
//! one numeric field per window instead of enumerating cross products.
//! Output records are `{window_start, window_end, key, value}` with the
//! value widened to `f64`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use rill_core::buffer::BufferManager;
use rill_core::error::Result;
use rill_core::reconfig::{PipelineMessage, TerminationKind};
use rill_core::schema::{read_field_as_f64, Field, PhysicalType, RowLayout, Schema};
use rill_core::watermark::MultiOriginWatermarkProcessor;
use rill_core::window::WindowMeasure;
use rill_core::{OriginId, SequenceNumber, WatermarkTs};

use crate::emit::RecordEmitter;
use crate::state::SideState;
use crate::JoinKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone)]
pub struct AggregationDefinition {
    pub function: AggregateFunction,
    pub measure: WindowMeasure,
    pub input_schema: Arc<Schema>,
    pub key_field: usize,
    pub value_field: usize,
    pub output_schema: Arc<Schema>,
}

impl AggregationDefinition {
    pub fn new(
        function: AggregateFunction,
        measure: WindowMeasure,
        input_schema: Arc<Schema>,
        key_field: usize,
        value_field: usize,
    ) -> Self {
        let key = &input_schema.fields()[key_field];
        let output_schema = Schema::new(vec![
            Field::new("window_start", PhysicalType::U64),
            Field::new("window_end", PhysicalType::U64),
            Field::new("key", key.physical_type),
            Field::new("value", PhysicalType::F64),
        ]);
        Self {
            function,
            measure,
            input_schema,
            key_field,
            value_field,
            output_schema,
        }
    }
}

pub struct WindowAggregationHandler {
    id: u64,
    definition: AggregationDefinition,
    state: SideState,
    watermarks: MultiOriginWatermarkProcessor,
    input_layout: RowLayout,
    emitter: RecordEmitter,
    last_watermark: Mutex<WatermarkTs>,
    trigger_gate: tokio::sync::Mutex<()>,
    ref_cnt: AtomicU32,
}

impl WindowAggregationHandler {
    pub fn new(
        definition: AggregationDefinition,
        id: u64,
        origins: Vec<OriginId>,
        eos_fanin: u32,
        output_origin: OriginId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Arc<Self> {
        let input_layout = RowLayout::new(definition.input_schema.clone());
        let emitter = RecordEmitter::new(definition.output_schema.clone(), output_origin, pool, out);
        Arc::new(Self {
            id,
            definition,
            state: SideState::new(),
            watermarks: MultiOriginWatermarkProcessor::new(origins),
            input_layout,
            emitter,
            last_watermark: Mutex::new(0),
            trigger_gate: tokio::sync::Mutex::new(()),
            ref_cnt: AtomicU32::new(eos_fanin),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn output_schema(&self) -> &Arc<Schema> {
        &self.definition.output_schema
    }

    pub fn insert(&self, key: JoinKey, ts: WatermarkTs, record: Vec<u8>) {
        self.state
            .store(key)
            .append(&self.definition.measure, ts, record);
    }

    pub async fn update_watermark(
        &self,
        ts: WatermarkTs,
        seq: SequenceNumber,
        origin: OriginId,
    ) -> Result<()> {
        let before = self.watermarks.snapshot();
        let after = self.watermarks.update(ts, seq, origin)?;
        if after > before {
            self.trigger(after).await?;
        }
        Ok(())
    }

    async fn trigger(&self, current: WatermarkTs) -> Result<u64> {
        let _gate = self.trigger_gate.lock().await;
        let last = {
            let stored = *self.last_watermark.lock();
            if stored != 0 {
                stored
            } else {
                self.state.min_slice_start().unwrap_or(current)
            }
        };
        let windows = self.definition.measure.trigger_windows(last, current);
        if windows.is_empty() {
            return Ok(0);
        }
        let largest_closed = windows.last().map(|w| w.end).unwrap_or(0);
        let cutoff = largest_closed.saturating_sub(self.definition.measure.slide_ms());

        let mut total = 0u64;
        for key in self.state.keys() {
            let Some(store) = self.state.get(key) else {
                continue;
            };
            let records = {
                let guard = store.lock();
                let mut records = Vec::new();
                for window in &windows {
                    let mut sum = 0.0f64;
                    let mut count = 0u64;
                    let mut min = f64::INFINITY;
                    let mut max = f64::NEG_INFINITY;
                    for slice_idx in 0..guard.slices().len() {
                        let slice = guard.slices()[slice_idx];
                        if window.start > slice.start_ts || window.end < slice.end_ts {
                            continue;
                        }
                        for record in guard.records(slice_idx) {
                            let value = read_field_as_f64(
                                &self.input_layout,
                                record,
                                self.definition.value_field,
                            )?;
                            sum += value;
                            count += 1;
                            min = min.min(value);
                            max = max.max(value);
                        }
                    }
                    if count == 0 {
                        continue;
                    }
                    let value = match self.definition.function {
                        AggregateFunction::Sum => sum,
                        AggregateFunction::Count => count as f64,
                        AggregateFunction::Min => min,
                        AggregateFunction::Max => max,
                        AggregateFunction::Avg => sum / count as f64,
                    };
                    trace!(
                        handler_id = self.id,
                        key,
                        window_start = window.start,
                        window_end = window.end,
                        value,
                        "aggregated window"
                    );
                    records.push(self.pack_record(window.start, window.end, key, value));
                }
                records
            };
            total += self.emitter.emit_all(&records, current).await?;
            if cutoff > 0 {
                store.remove_slices_until(cutoff);
            }
        }

        let mut last_wm = self.last_watermark.lock();
        if current > *last_wm {
            *last_wm = current;
        }
        Ok(total)
    }

    pub async fn on_end_of_stream(&self, kind: TerminationKind) -> Result<bool> {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            return Ok(false);
        }
        if kind == TerminationKind::Graceful {
            if let Some(final_wm) = self.state.max_slice_end() {
                let flushed = self.trigger(final_wm).await?;
                debug!(
                    handler_id = self.id,
                    flushed, "graceful end-of-stream flushed aggregation windows"
                );
            }
        }
        Ok(true)
    }

    fn pack_record(&self, start: WatermarkTs, end: WatermarkTs, key: JoinKey, value: f64) -> Vec<u8> {
        let key_width = self.definition.input_schema.fields()[self.definition.key_field]
            .physical_type
            .size_bytes();
        let key_bytes = key.to_ne_bytes();
        let mut record = Vec::with_capacity(self.emitter.layout().record_size());
        record.extend_from_slice(&start.to_ne_bytes());
        record.extend_from_slice(&end.to_ne_bytes());
        record.extend_from_slice(&key_bytes[..key_width]);
        record.extend_from_slice(&value.to_ne_bytes());
        record
    }
}
