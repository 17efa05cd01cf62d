//! The join operator handler.
//!
//! Coordinates both sides of a windowed join: slice-store state, one
//! watermark processor per side, the trigger action, and end-of-stream
//! reference counting. Public operations serialize on the handler's trigger
//! gate; slice stores keep their own inner locks so concurrent build-side
//! inserts proceed while a trigger scans.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use rill_core::buffer::BufferManager;
use rill_core::error::Result;
use rill_core::reconfig::{PipelineMessage, TerminationKind};
use rill_core::watermark::MultiOriginWatermarkProcessor;
use rill_core::{OriginId, SequenceNumber, WatermarkTs};

use crate::nested_loop::{JoinDefinition, NestedLoopJoinAction};
use crate::state::SideState;
use crate::{JoinKey, JoinSide};

pub struct JoinHandler {
    id: u64,
    definition: Arc<JoinDefinition>,
    left: SideState,
    right: SideState,
    wm_left: MultiOriginWatermarkProcessor,
    wm_right: MultiOriginWatermarkProcessor,
    action: NestedLoopJoinAction,
    /// Zero means "not yet seeded"; the first trigger seeds it from the
    /// earliest slice so early windows are not enumerated from time zero.
    last_watermark: Mutex<WatermarkTs>,
    trigger_gate: tokio::sync::Mutex<()>,
    ref_cnt: AtomicU32,
    running: AtomicBool,
}

impl JoinHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definition: JoinDefinition,
        id: u64,
        origins_left: Vec<OriginId>,
        origins_right: Vec<OriginId>,
        eos_fanin: u32,
        output_origin: OriginId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Arc<Self> {
        let definition = Arc::new(definition);
        let action = NestedLoopJoinAction::new(definition.clone(), id, output_origin, pool, out);
        debug!(handler_id = id, "created join handler");
        Arc::new(Self {
            id,
            definition: definition.clone(),
            left: SideState::new(),
            right: SideState::new(),
            wm_left: MultiOriginWatermarkProcessor::new(origins_left),
            wm_right: MultiOriginWatermarkProcessor::new(origins_right),
            action,
            last_watermark: Mutex::new(0),
            trigger_gate: tokio::sync::Mutex::new(()),
            ref_cnt: AtomicU32::new(eos_fanin),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn definition(&self) -> &Arc<JoinDefinition> {
        &self.definition
    }

    pub fn output_origin(&self) -> OriginId {
        self.action.output_origin()
    }

    pub fn start(&self) -> bool {
        let started = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if started {
            debug!(handler_id = self.id, "join handler started");
        }
        started
    }

    pub fn stop(&self) -> bool {
        let stopped = self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if stopped {
            debug!(handler_id = self.id, "join handler stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn side_state(&self, side: JoinSide) -> &SideState {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    /// Appends one build-side record into the key's slice store, creating
    /// the store on first use.
    pub fn insert(&self, side: JoinSide, key: JoinKey, ts: WatermarkTs, record: Vec<u8>) {
        self.side_state(side)
            .store(key)
            .append(&self.definition.measure, ts, record);
    }

    /// Folds a watermark observation into the side's processor and runs the
    /// trigger when the side minimum advanced.
    pub async fn update_watermark(
        &self,
        ts: WatermarkTs,
        seq: SequenceNumber,
        origin: OriginId,
        side: JoinSide,
    ) -> Result<()> {
        let processor = match side {
            JoinSide::Left => &self.wm_left,
            JoinSide::Right => &self.wm_right,
        };
        let before = processor.snapshot();
        let after = processor.update(ts, seq, origin)?;
        trace!(
            handler_id = self.id,
            ?side,
            ts,
            seq,
            origin,
            before,
            after,
            "watermark update on join side"
        );
        if after > before {
            self.trigger().await?;
        }
        Ok(())
    }

    /// Runs the trigger action over all windows closed since the last run.
    pub async fn trigger(&self) -> Result<u64> {
        let _gate = self.trigger_gate.lock().await;
        let current = self.wm_left.snapshot().min(self.wm_right.snapshot());
        let last = self.seed_last_watermark(current);
        trace!(
            handler_id = self.id,
            current,
            last,
            "running join trigger action"
        );
        let flushed = self
            .action
            .do_action(&self.left, &self.right, current, last)
            .await?;
        self.store_last_watermark(current);
        Ok(flushed)
    }

    /// On the final graceful end-of-stream, closes every window that the
    /// buffered slices can still produce: the flush watermark is the largest
    /// slice end held on either side.
    async fn flush_inflight_windows(&self) -> Result<u64> {
        let _gate = self.trigger_gate.lock().await;
        let final_wm = match (self.left.max_slice_end(), self.right.max_slice_end()) {
            (Some(l), Some(r)) => l.max(r),
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (None, None) => return Ok(0),
        };
        let last = self.seed_last_watermark(final_wm);
        debug!(
            handler_id = self.id,
            final_wm, last, "flushing in-flight windows before teardown"
        );
        let flushed = self
            .action
            .do_action(&self.left, &self.right, final_wm, last)
            .await?;
        self.store_last_watermark(final_wm);
        Ok(flushed)
    }

    /// One producing predecessor finished. When the last one does, a
    /// graceful termination flushes the remaining windows; any kind then
    /// stops the handler. Returns whether this call tore the handler down.
    pub async fn on_end_of_stream(&self, kind: TerminationKind) -> Result<bool> {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            debug!(
                handler_id = self.id,
                remaining = prev.saturating_sub(1),
                ?kind,
                "end-of-stream on join handler, waiting for remaining producers"
            );
            return Ok(false);
        }
        match kind {
            TerminationKind::Graceful => {
                let flushed = self.flush_inflight_windows().await?;
                debug!(
                    handler_id = self.id,
                    flushed, "graceful end-of-stream flushed in-flight windows"
                );
            }
            TerminationKind::HardStop | TerminationKind::Failure => {
                warn!(
                    handler_id = self.id,
                    ?kind,
                    "forceful end-of-stream drops in-flight join state"
                );
            }
        }
        self.stop();
        Ok(true)
    }

    fn seed_last_watermark(&self, fallback: WatermarkTs) -> WatermarkTs {
        let stored = *self.last_watermark.lock();
        if stored != 0 {
            return stored;
        }
        let seeded = self
            .left
            .min_slice_start()
            .into_iter()
            .chain(self.right.min_slice_start())
            .min()
            .unwrap_or(fallback);
        trace!(
            handler_id = self.id,
            seeded, "seeded last watermark from earliest slice"
        );
        seeded
    }

    fn store_last_watermark(&self, current: WatermarkTs) {
        let mut last = self.last_watermark.lock();
        if current > *last {
            *last = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nested_loop::JoinKind;
    use rill_core::schema::{Field, PhysicalType, Schema};
    use rill_core::window::WindowMeasure;

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

    fn handler(tx: mpsc::Sender<PipelineMessage>) -> Arc<JoinHandler> {
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
            42,
            vec![10],
            vec![20],
            2,
            99,
            BufferManager::new(4096, 8),
            tx,
        )
    }

    #[tokio::test]
    async fn trigger_without_advance_closes_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let handler = handler(tx);
        handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
        handler.insert(JoinSide::Right, 1, 150, record(1, 20, 150));
        assert_eq!(handler.trigger().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn eos_refcount_tears_down_once() {
        let (tx, _rx) = mpsc::channel(8);
        let handler = handler(tx);
        handler.start();
        assert!(!handler
            .on_end_of_stream(TerminationKind::Graceful)
            .await
            .unwrap());
        assert!(handler.is_running());
        assert!(handler
            .on_end_of_stream(TerminationKind::Graceful)
            .await
            .unwrap());
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn graceful_eos_flushes_remaining_windows() {
        let (tx, mut rx) = mpsc::channel(8);
        let handler = handler(tx);
        handler.start();
        handler.insert(JoinSide::Left, 1, 100, record(1, 10, 100));
        handler.insert(JoinSide::Right, 1, 150, record(1, 20, 150));
        // No watermark ever advanced, yet the final SoftEoS must flush the
        // window [0, 1000).
        handler
            .on_end_of_stream(TerminationKind::Graceful)
            .await
            .unwrap();
        handler
            .on_end_of_stream(TerminationKind::Graceful)
            .await
            .unwrap();
        let msg = rx.try_recv().expect("flush should have emitted a buffer");
        match msg {
            PipelineMessage::Data(buffer) => {
                assert_eq!(buffer.number_of_tuples(), 1);
                assert_eq!(buffer.watermark(), 1000);
            }
            other => panic!("expected data buffer, got {other:?}"),
        }
    }
}
