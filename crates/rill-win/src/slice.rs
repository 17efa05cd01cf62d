//! Per-key slice stores.
//!
//! A slice is a half-open interval `[start, end)` with an append list of
//! packed records. Slices in a store never overlap and stay ordered by start
//! time. Stores carry their own mutex; trigger code locks left before right
//! to keep the global lock order consistent.

use parking_lot::{Mutex, MutexGuard};
use rill_core::window::WindowMeasure;
use rill_core::WatermarkTs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceMeta {
    pub start_ts: WatermarkTs,
    pub end_ts: WatermarkTs,
}

#[derive(Debug, Default)]
pub struct SliceStoreInner {
    slices: Vec<SliceMeta>,
    records: Vec<Vec<Vec<u8>>>,
}

impl SliceStoreInner {
    pub fn slices(&self) -> &[SliceMeta] {
        &self.slices
    }

    pub fn records(&self, slice_idx: usize) -> &[Vec<u8>] {
        &self.records[slice_idx]
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn first_slice_start(&self) -> Option<WatermarkTs> {
        self.slices.first().map(|s| s.start_ts)
    }

    fn append(&mut self, measure: &WindowMeasure, ts: WatermarkTs, record: Vec<u8>) {
        let bounds = measure.slice_bounds(ts);
        // Slices are ordered by start; records usually land in the newest
        // slice, so search from the back.
        let pos = self
            .slices
            .iter()
            .rposition(|s| s.start_ts <= bounds.start);
        match pos {
            Some(idx) if self.slices[idx].start_ts == bounds.start => {
                self.records[idx].push(record);
            }
            Some(idx) => {
                self.slices.insert(
                    idx + 1,
                    SliceMeta {
                        start_ts: bounds.start,
                        end_ts: bounds.end,
                    },
                );
                self.records.insert(idx + 1, vec![record]);
            }
            None => {
                self.slices.insert(
                    0,
                    SliceMeta {
                        start_ts: bounds.start,
                        end_ts: bounds.end,
                    },
                );
                self.records.insert(0, vec![record]);
            }
        }
    }

    /// Deletes every slice with `end_ts <= cutoff`. A cutoff of zero is a
    /// no-op because slice ends are strictly positive.
    pub fn remove_slices_until(&mut self, cutoff: WatermarkTs) {
        if cutoff == 0 {
            return;
        }
        let keep_from = self
            .slices
            .iter()
            .position(|s| s.end_ts > cutoff)
            .unwrap_or(self.slices.len());
        if keep_from > 0 {
            self.slices.drain(..keep_from);
            self.records.drain(..keep_from);
        }
    }
}

/// A mutex-guarded append list of slices for one key on one join side.
#[derive(Debug, Default)]
pub struct SliceStore {
    inner: Mutex<SliceStoreInner>,
}

impl SliceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SliceStoreInner> {
        self.inner.lock()
    }

    pub fn append(&self, measure: &WindowMeasure, ts: WatermarkTs, record: Vec<u8>) {
        self.inner.lock().append(measure, ts, record);
    }

    pub fn remove_slices_until(&self, cutoff: WatermarkTs) {
        self.inner.lock().remove_slices_until(cutoff);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn first_slice_start(&self) -> Option<WatermarkTs> {
        self.inner.lock().first_slice_start()
    }

    /// Largest slice end currently held, used when flushing in-flight
    /// windows at graceful shutdown.
    pub fn last_slice_end(&self) -> Option<WatermarkTs> {
        self.inner.lock().slices.last().map(|s| s.end_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUMBLING: WindowMeasure = WindowMeasure::Tumbling { size_ms: 1000 };

    #[test]
    fn appends_keep_slices_ordered_and_disjoint() {
        let store = SliceStore::new();
        store.append(&TUMBLING, 2500, vec![1]);
        store.append(&TUMBLING, 100, vec![2]);
        store.append(&TUMBLING, 900, vec![3]);
        store.append(&TUMBLING, 1500, vec![4]);

        let inner = store.lock();
        let starts: Vec<_> = inner.slices().iter().map(|s| s.start_ts).collect();
        assert_eq!(starts, vec![0, 1000, 2000]);
        assert_eq!(inner.records(0), &[vec![2], vec![3]]);
        assert_eq!(inner.records(1), &[vec![4]]);
        assert_eq!(inner.records(2), &[vec![1]]);
    }

    #[test]
    fn remove_until_drops_closed_slices() {
        let store = SliceStore::new();
        store.append(&TUMBLING, 500, vec![1]);
        store.append(&TUMBLING, 1500, vec![2]);
        store.append(&TUMBLING, 2500, vec![3]);

        store.remove_slices_until(2000);
        let inner = store.lock();
        assert_eq!(inner.slices().len(), 1);
        assert_eq!(inner.slices()[0].start_ts, 2000);
    }

    #[test]
    fn remove_until_zero_is_a_no_op() {
        let store = SliceStore::new();
        store.append(&TUMBLING, 500, vec![1]);
        store.remove_slices_until(0);
        assert!(!store.is_empty());
    }
}
