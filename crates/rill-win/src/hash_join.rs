//! Partitioned stream hash join: per-window build tables and the probe
//! phase.
//!
//! A window owns two partitioned tables. Each partition is an append-only
//! sequence of fixed-size pages; pages carry their own tuple count and a
//! small Bloom filter over their keys so the probe can skip pages that
//! cannot match. Distinct partitions are probed by different workers; an
//! atomic partitions-finished counter makes window deletion happen exactly
//! once, and probing a deleted window is a state-invariant error, not a
//! silent no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use rill_core::buffer::BufferManager;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::PipelineMessage;
use rill_core::schema::{read_field_as_i64, RowLayout, Schema};
use rill_core::{OriginId, WatermarkTs};

use crate::emit::RecordEmitter;
use crate::nested_loop::join_output_schema;
use crate::{JoinKey, JoinSide};

/// Records per page. Pages are append-only and never reallocated once full.
const PAGE_CAPACITY: usize = 256;

/// Two-probe Bloom filter over the keys of one page.
#[derive(Debug)]
struct PageBloom {
    bits: [u64; 4],
}

impl PageBloom {
    fn new() -> Self {
        Self { bits: [0; 4] }
    }

    fn probes(key: JoinKey) -> (usize, usize) {
        // splitmix64 finalizer, two rotations for two probe positions.
        let mut x = key as u64;
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
        x ^= x >> 31;
        ((x & 0xff) as usize, ((x >> 8) & 0xff) as usize)
    }

    fn insert(&mut self, key: JoinKey) {
        let (a, b) = Self::probes(key);
        self.bits[a / 64] |= 1 << (a % 64);
        self.bits[b / 64] |= 1 << (b % 64);
    }

    fn maybe_contains(&self, key: JoinKey) -> bool {
        let (a, b) = Self::probes(key);
        self.bits[a / 64] & (1 << (a % 64)) != 0 && self.bits[b / 64] & (1 << (b % 64)) != 0
    }
}

struct Page {
    data: Vec<u8>,
    tuples: usize,
    record_size: usize,
    bloom: PageBloom,
}

impl Page {
    fn new(record_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(record_size * PAGE_CAPACITY),
            tuples: 0,
            record_size,
            bloom: PageBloom::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.tuples == PAGE_CAPACITY
    }

    fn push(&mut self, key: JoinKey, record: &[u8]) {
        self.data.extend_from_slice(record);
        self.tuples += 1;
        self.bloom.insert(key);
    }

    fn record(&self, pos: usize) -> &[u8] {
        &self.data[pos * self.record_size..(pos + 1) * self.record_size]
    }
}

#[derive(Default)]
struct PartitionStats {
    pages: usize,
    tuples: usize,
}

struct Partition {
    pages: Vec<Page>,
    record_size: usize,
}

impl Partition {
    fn push(&mut self, key: JoinKey, record: &[u8]) {
        match self.pages.last_mut() {
            Some(page) if !page.is_full() => page.push(key, record),
            _ => {
                let mut page = Page::new(self.record_size);
                page.push(key, record);
                self.pages.push(page);
            }
        }
    }
}

struct PartitionedTable {
    partitions: Vec<Mutex<Partition>>,
}

impl PartitionedTable {
    fn new(num_partitions: usize, record_size: usize) -> Self {
        let partitions = (0..num_partitions)
            .map(|_| {
                Mutex::new(Partition {
                    pages: Vec::new(),
                    record_size,
                })
            })
            .collect();
        Self { partitions }
    }

    fn stats(&self, partition_id: usize) -> PartitionStats {
        let partition = self.partitions[partition_id].lock();
        PartitionStats {
            pages: partition.pages.len(),
            tuples: partition.pages.iter().map(|p| p.tuples).sum(),
        }
    }
}

/// One in-flight window of a stream hash join.
pub struct HashJoinWindow {
    window_id: u64,
    start_ts: WatermarkTs,
    end_ts: WatermarkTs,
    left: PartitionedTable,
    right: PartitionedTable,
    num_partitions: usize,
    partitions_finished: AtomicUsize,
}

impl HashJoinWindow {
    pub fn new(
        window_id: u64,
        start_ts: WatermarkTs,
        end_ts: WatermarkTs,
        num_partitions: usize,
        left_record_size: usize,
        right_record_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            window_id,
            start_ts,
            end_ts,
            left: PartitionedTable::new(num_partitions, left_record_size),
            right: PartitionedTable::new(num_partitions, right_record_size),
            num_partitions,
            partitions_finished: AtomicUsize::new(0),
        })
    }

    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    pub fn bounds(&self) -> (WatermarkTs, WatermarkTs) {
        (self.start_ts, self.end_ts)
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn table(&self, side: JoinSide) -> &PartitionedTable {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    /// Appends a build-side record into the partition owning its key.
    pub fn insert(&self, side: JoinSide, key: JoinKey, record: &[u8]) {
        let partition_id = (key as u64 % self.num_partitions as u64) as usize;
        self.table(side).partitions[partition_id].lock().push(key, record);
    }

    /// Marks one partition probed; true exactly once, when the last
    /// partition finishes.
    pub fn mark_partition_finished(&self) -> bool {
        self.partitions_finished.fetch_add(1, Ordering::AcqRel) + 1 == self.num_partitions
    }
}

/// Owns the live windows of one hash join and runs the probe phase.
pub struct HashJoinHandler {
    handler_id: u64,
    left_layout: RowLayout,
    right_layout: RowLayout,
    left_key_field: usize,
    right_key_field: usize,
    windows: Mutex<HashMap<u64, Arc<HashJoinWindow>>>,
    emitter: RecordEmitter,
}

impl HashJoinHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_id: u64,
        left_schema: Arc<Schema>,
        right_schema: Arc<Schema>,
        left_key_field: usize,
        right_key_field: usize,
        output_origin: OriginId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        let output_schema = join_output_schema(&left_schema, &right_schema, left_key_field);
        Self {
            handler_id,
            left_layout: RowLayout::new(left_schema),
            right_layout: RowLayout::new(right_schema),
            left_key_field,
            right_key_field,
            windows: Mutex::new(HashMap::new()),
            emitter: RecordEmitter::new(output_schema, output_origin, pool, out),
        }
    }

    /// Creates (or returns) the window for `window_id`.
    pub fn window_or_create(
        &self,
        window_id: u64,
        start_ts: WatermarkTs,
        end_ts: WatermarkTs,
        num_partitions: usize,
    ) -> Arc<HashJoinWindow> {
        self.windows
            .lock()
            .entry(window_id)
            .or_insert_with(|| {
                debug!(
                    handler_id = self.handler_id,
                    window_id, start_ts, end_ts, "created hash-join window"
                );
                HashJoinWindow::new(
                    window_id,
                    start_ts,
                    end_ts,
                    num_partitions,
                    self.left_layout.record_size(),
                    self.right_layout.record_size(),
                )
            })
            .clone()
    }

    pub fn window(&self, window_id: u64) -> Result<Arc<HashJoinWindow>> {
        self.windows.lock().get(&window_id).cloned().ok_or_else(|| {
            EngineError::invariant(format!(
                "hash-join window {window_id} already deleted or never built"
            ))
        })
    }

    fn delete_window(&self, window_id: u64) -> Result<()> {
        match self.windows.lock().remove(&window_id) {
            Some(_) => {
                debug!(
                    handler_id = self.handler_id,
                    window_id, "deleted hash-join window after final partition"
                );
                Ok(())
            }
            None => Err(EngineError::invariant(format!(
                "hash-join window {window_id} deleted twice"
            ))),
        }
    }

    /// Probes one partition of a window: the cross product of its left and
    /// right pages, filtered by key equality, emitted downstream. When the
    /// last partition of a window finishes, the window is deleted.
    pub async fn probe(&self, partition_id: usize, window_id: u64) -> Result<u64> {
        let window = self.window(window_id)?;
        let (window_start, window_end) = window.bounds();
        if partition_id >= window.num_partitions() {
            return Err(EngineError::invariant(format!(
                "partition {partition_id} out of range for window {window_id}"
            )));
        }

        let left_stats = window.left.stats(partition_id);
        let right_stats = window.right.stats(partition_id);
        if left_stats.pages == 0 || right_stats.pages == 0 {
            trace!(
                handler_id = self.handler_id,
                window_id,
                partition_id,
                left_pages = left_stats.pages,
                left_tuples = left_stats.tuples,
                right_pages = right_stats.pages,
                right_tuples = right_stats.tuples,
                "empty side, marking partition finished"
            );
            if window.mark_partition_finished() {
                self.delete_window(window_id)?;
            }
            return Ok(0);
        }

        let records = {
            let left = window.left.partitions[partition_id].lock();
            let right = window.right.partitions[partition_id].lock();
            let mut records = Vec::new();
            for left_page in &left.pages {
                for left_pos in 0..left_page.tuples {
                    let left_record = left_page.record(left_pos);
                    let left_key =
                        read_field_as_i64(&self.left_layout, left_record, self.left_key_field)?;
                    for right_page in &right.pages {
                        if right_page.tuples == 0 {
                            continue;
                        }
                        if !right_page.bloom.maybe_contains(left_key) {
                            continue;
                        }
                        for right_pos in 0..right_page.tuples {
                            let right_record = right_page.record(right_pos);
                            let right_key = read_field_as_i64(
                                &self.right_layout,
                                right_record,
                                self.right_key_field,
                            )?;
                            if left_key == right_key {
                                records.push(pack_probe_record(
                                    window_start,
                                    window_end,
                                    left_record,
                                    right_record,
                                    &self.left_layout,
                                    self.left_key_field,
                                ));
                            }
                        }
                    }
                }
            }
            records
        };

        let emitted = self.emitter.emit_all(&records, window_end).await?;
        trace!(
            handler_id = self.handler_id,
            window_id,
            partition_id,
            emitted,
            "probe finished"
        );
        if window.mark_partition_finished() {
            self.delete_window(window_id)?;
        }
        Ok(emitted)
    }
}

fn pack_probe_record(
    start: WatermarkTs,
    end: WatermarkTs,
    left_record: &[u8],
    right_record: &[u8],
    left_layout: &RowLayout,
    left_key_field: usize,
) -> Vec<u8> {
    let key_offset = left_layout.offset_of(left_key_field);
    let key_width = left_layout.schema().fields()[left_key_field]
        .physical_type
        .size_bytes();
    let mut record =
        Vec::with_capacity(16 + key_width + left_record.len() + right_record.len());
    record.extend_from_slice(&start.to_ne_bytes());
    record.extend_from_slice(&end.to_ne_bytes());
    record.extend_from_slice(&left_record[key_offset..key_offset + key_width]);
    record.extend_from_slice(left_record);
    record.extend_from_slice(right_record);
    record
}
