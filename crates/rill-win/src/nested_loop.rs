//! Nested-loop windowed join trigger action.
//!
//! Invoked on watermark advance. For every key pair it enumerates the
//! windows closed by the advance, joins the paired slices of both sides and
//! packs `{window_start, window_end, key, left, right}` output records,
//! dispatching a buffer downstream whenever the current one would overflow.
//! Retention is bounded: once a key's windows are emitted, both stores drop
//! every slice ending at or before `largest_closed - slide`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use rill_core::buffer::BufferManager;
use rill_core::error::Result;
use rill_core::reconfig::PipelineMessage;
use rill_core::schema::{Field, PhysicalType, RowLayout, Schema};
use rill_core::window::WindowMeasure;
use rill_core::{OriginId, WatermarkTs};

use crate::emit::RecordEmitter;
use crate::state::SideState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Match keys on both sides.
    Inner,
    /// Every key pair joins, keyed output carries the left key.
    CartesianProduct,
}

/// Static description of one windowed join.
#[derive(Debug, Clone)]
pub struct JoinDefinition {
    pub kind: JoinKind,
    pub measure: WindowMeasure,
    pub left_schema: Arc<Schema>,
    pub right_schema: Arc<Schema>,
    pub left_key_field: usize,
    pub right_key_field: usize,
    pub output_schema: Arc<Schema>,
}

impl JoinDefinition {
    pub fn new(
        kind: JoinKind,
        measure: WindowMeasure,
        left_schema: Arc<Schema>,
        right_schema: Arc<Schema>,
        left_key_field: usize,
        right_key_field: usize,
    ) -> Self {
        let output_schema = join_output_schema(&left_schema, &right_schema, left_key_field);
        Self {
            kind,
            measure,
            left_schema,
            right_schema,
            left_key_field,
            right_key_field,
            output_schema,
        }
    }
}

/// Output schema of a windowed join:
/// `window_start, window_end, key, <left fields>, <right fields>`.
pub fn join_output_schema(
    left: &Schema,
    right: &Schema,
    left_key_field: usize,
) -> Arc<Schema> {
    let key = &left.fields()[left_key_field];
    let mut fields = vec![
        Field::new("window_start", PhysicalType::U64),
        Field::new("window_end", PhysicalType::U64),
        Field::new("key", key.physical_type),
    ];
    fields.extend(
        left.fields()
            .iter()
            .map(|f| Field::new(format!("left_{}", f.name), f.physical_type)),
    );
    fields.extend(
        right
            .fields()
            .iter()
            .map(|f| Field::new(format!("right_{}", f.name), f.physical_type)),
    );
    Schema::new(fields)
}

/// Materializes closed windows into output buffers.
pub struct NestedLoopJoinAction {
    definition: Arc<JoinDefinition>,
    handler_id: u64,
    left_layout: RowLayout,
    emitter: RecordEmitter,
}

impl NestedLoopJoinAction {
    pub fn new(
        definition: Arc<JoinDefinition>,
        handler_id: u64,
        output_origin: OriginId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        let left_layout = RowLayout::new(definition.left_schema.clone());
        let emitter = RecordEmitter::new(definition.output_schema.clone(), output_origin, pool, out);
        Self {
            definition,
            handler_id,
            left_layout,
            emitter,
        }
    }

    pub fn output_schema(&self) -> &Arc<Schema> {
        &self.definition.output_schema
    }

    pub fn output_origin(&self) -> OriginId {
        self.emitter.origin_id()
    }

    /// Joins every key pair over the windows closed by the watermark advance
    /// and dispatches the packed results. Returns the number of emitted
    /// records.
    ///
    /// Nothing is mutated when `current_wm <= last_wm`. An allocation or
    /// dispatch failure aborts before the retention trim of the failing key;
    /// buffers already dispatched stay dispatched.
    pub async fn do_action(
        &self,
        left_state: &SideState,
        right_state: &SideState,
        current_wm: WatermarkTs,
        last_wm: WatermarkTs,
    ) -> Result<u64> {
        let windows = self.definition.measure.trigger_windows(last_wm, current_wm);
        if windows.is_empty() {
            trace!(
                handler_id = self.handler_id,
                current_wm,
                last_wm,
                "no windows closed by this advance"
            );
            return Ok(0);
        }
        let largest_closed = windows.last().map(|w| w.end).unwrap_or(0);
        let slide = self.definition.measure.slide_ms();
        let cutoff = largest_closed.saturating_sub(slide);

        let mut total = 0u64;
        for key in left_state.keys() {
            for right_key in right_state.keys() {
                if self.definition.kind == JoinKind::Inner && key != right_key {
                    continue;
                }
                let (Some(left_store), Some(right_store)) =
                    (left_state.get(key), right_state.get(right_key))
                else {
                    continue;
                };

                // Left lock before right lock, globally.
                let records = {
                    let left = left_store.lock();
                    let right = right_store.lock();
                    if left.is_empty() || right.is_empty() {
                        warn!(
                            handler_id = self.handler_id,
                            key,
                            right_key,
                            left_empty = left.is_empty(),
                            right_empty = right.is_empty(),
                            "skipping join of empty side"
                        );
                        continue;
                    }
                    let mut records = Vec::new();
                    for window in &windows {
                        for slice_idx in 0..left.slices().len() {
                            let left_slice = left.slices()[slice_idx];
                            if window.start > left_slice.start_ts
                                || window.end < left_slice.end_ts
                            {
                                continue;
                            }
                            let Some(&right_slice) = right.slices().get(slice_idx) else {
                                continue;
                            };
                            if left_slice != right_slice {
                                continue;
                            }
                            trace!(
                                handler_id = self.handler_id,
                                key,
                                slice_idx,
                                window_start = window.start,
                                window_end = window.end,
                                "joining paired slice"
                            );
                            for left_record in left.records(slice_idx) {
                                for right_record in right.records(slice_idx) {
                                    records.push(self.pack_record(
                                        window.start,
                                        window.end,
                                        left_record,
                                        right_record,
                                    ));
                                }
                            }
                        }
                    }
                    records
                };

                total += self.emitter.emit_all(&records, current_wm).await?;

                if cutoff > 0 {
                    let mut left = left_store.lock();
                    let mut right = right_store.lock();
                    left.remove_slices_until(cutoff);
                    right.remove_slices_until(cutoff);
                }
            }
        }
        trace!(
            handler_id = self.handler_id,
            total,
            current_wm,
            last_wm,
            "nested-loop trigger flushed records"
        );
        Ok(total)
    }

    /// `window_start ‖ window_end ‖ key ‖ left ‖ right`, the row layout of
    /// [`join_output_schema`]. The key bytes are copied out of the left
    /// record's key field.
    fn pack_record(
        &self,
        start: WatermarkTs,
        end: WatermarkTs,
        left_record: &[u8],
        right_record: &[u8],
    ) -> Vec<u8> {
        let key_field = self.definition.left_key_field;
        let key_offset = self.left_layout.offset_of(key_field);
        let key_width = self.definition.left_schema.fields()[key_field]
            .physical_type
            .size_bytes();
        let mut record = Vec::with_capacity(self.emitter.layout().record_size());
        record.extend_from_slice(&start.to_ne_bytes());
        record.extend_from_slice(&end.to_ne_bytes());
        record.extend_from_slice(&left_record[key_offset..key_offset + key_width]);
        record.extend_from_slice(left_record);
        record.extend_from_slice(right_record);
        record
    }
}
