//! Multi-origin watermark processing.
//!
//! Each origin advances its own contiguous watermark by merging consecutive
//! sequence numbers; the global watermark is the minimum across origins and
//! is monotone non-decreasing. Updates for different origins never contend
//! on the same lock.

use std::collections::BTreeMap;
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::{OriginId, SequenceNumber, WatermarkTs};

#[derive(Debug, Default)]
struct OriginClock {
    /// Highest sequence number merged into the contiguous prefix.
    last_seq: SequenceNumber,
    /// Watermark of the contiguous prefix.
    watermark_ts: WatermarkTs,
    /// Observations above the contiguous prefix, keyed by sequence number.
    pending: BTreeMap<SequenceNumber, WatermarkTs>,
}

impl OriginClock {
    fn update(&mut self, ts: WatermarkTs, seq: SequenceNumber) -> WatermarkTs {
        if seq <= self.last_seq {
            // Duplicate or late observation; advances nothing.
            return self.watermark_ts;
        }
        self.pending.insert(seq, ts);
        while let Some(ts) = self.pending.remove(&(self.last_seq + 1)) {
            self.last_seq += 1;
            if ts > self.watermark_ts {
                self.watermark_ts = ts;
            }
        }
        self.watermark_ts
    }
}

/// Combines per-origin watermarks into a monotone global watermark.
///
/// The origin set is fixed at creation; updates are sharded so that callers
/// on distinct origins proceed in parallel.
pub struct MultiOriginWatermarkProcessor {
    clocks: Vec<Mutex<OriginClock>>,
    index: HashMap<OriginId, usize>,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: impl IntoIterator<Item = OriginId>) -> Self {
        let index: HashMap<OriginId, usize> = origins
            .into_iter()
            .enumerate()
            .map(|(idx, origin)| (origin, idx))
            .collect();
        let clocks = (0..index.len())
            .map(|_| Mutex::new(OriginClock::default()))
            .collect();
        Self { clocks, index }
    }

    pub fn num_origins(&self) -> usize {
        self.clocks.len()
    }

    /// Incorporates one observation and returns the new global watermark.
    ///
    /// Idempotent in `seq`: replays of an already-merged sequence number do
    /// not change any watermark.
    pub fn update(
        &self,
        ts: WatermarkTs,
        seq: SequenceNumber,
        origin: OriginId,
    ) -> Result<WatermarkTs> {
        let idx = *self.index.get(&origin).ok_or_else(|| {
            EngineError::invariant(format!("watermark update for unknown origin {origin}"))
        })?;
        let origin_wm = self.clocks[idx].lock().update(ts, seq);
        let global = self.snapshot();
        trace!(origin, seq, ts, origin_wm, global, "watermark update");
        Ok(global)
    }

    /// Minimum contiguous watermark across all origins.
    pub fn snapshot(&self) -> WatermarkTs {
        self.clocks
            .iter()
            .map(|clock| clock.lock().watermark_ts)
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_out_of_order_sequences_per_origin() {
        // Arrival order: (100, 1, A), (200, 3, A), (150, 2, A), (50, 1, B).
        let wm = MultiOriginWatermarkProcessor::new([b'A' as u64, b'B' as u64]);
        assert_eq!(wm.update(100, 1, b'A' as u64).unwrap(), 0); // B absent
        assert_eq!(wm.update(200, 3, b'A' as u64).unwrap(), 0); // A gap at 2
        assert_eq!(wm.update(150, 2, b'A' as u64).unwrap(), 0); // A=200, B=0
        assert_eq!(wm.update(50, 1, b'B' as u64).unwrap(), 50); // min(200, 50)
    }

    #[test]
    fn duplicate_updates_are_idempotent() {
        let wm = MultiOriginWatermarkProcessor::new([1]);
        assert_eq!(wm.update(100, 1, 1).unwrap(), 100);
        assert_eq!(wm.update(100, 1, 1).unwrap(), 100);
        assert_eq!(wm.update(90, 1, 1).unwrap(), 100);
        assert_eq!(wm.snapshot(), 100);
    }

    #[test]
    fn global_watermark_is_monotone() {
        let wm = MultiOriginWatermarkProcessor::new([1, 2]);
        let mut last = 0;
        let updates = [
            (100, 1, 1),
            (40, 1, 2),
            (20, 2, 2), // late timestamp, still merges seq 2
            (300, 2, 1),
            (500, 3, 2),
        ];
        for (ts, seq, origin) in updates {
            let now = wm.update(ts, seq, origin).unwrap();
            assert!(now >= last, "watermark went backwards: {last} -> {now}");
            last = now;
        }
    }

    #[test]
    fn unknown_origin_is_rejected() {
        let wm = MultiOriginWatermarkProcessor::new([1]);
        assert!(matches!(
            wm.update(1, 1, 9),
            Err(EngineError::StateInvariant(_))
        ));
    }
}
