//! Window descriptors: tumbling and sliding measures over event or
//! ingestion time.

use serde::{Deserialize, Serialize};

use crate::WatermarkTs;

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowBounds {
    pub start: WatermarkTs,
    pub end: WatermarkTs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowMeasure {
    Tumbling { size_ms: u64 },
    Sliding { size_ms: u64, slide_ms: u64 },
}

impl WindowMeasure {
    pub fn size_ms(&self) -> u64 {
        match self {
            WindowMeasure::Tumbling { size_ms } => *size_ms,
            WindowMeasure::Sliding { size_ms, .. } => *size_ms,
        }
    }

    /// Slide of the measure; equals the size for tumbling windows.
    pub fn slide_ms(&self) -> u64 {
        match self {
            WindowMeasure::Tumbling { size_ms } => *size_ms,
            WindowMeasure::Sliding { slide_ms, .. } => *slide_ms,
        }
    }

    /// The slice owning `ts`. Slices are `slide_ms` wide so that every
    /// window is a whole number of consecutive slices.
    pub fn slice_bounds(&self, ts: WatermarkTs) -> WindowBounds {
        let slide = self.slide_ms().max(1);
        let start = (ts / slide) * slide;
        WindowBounds {
            start,
            end: start + slide,
        }
    }

    /// Windows closed by a watermark advance: every window whose end lies in
    /// `(last_wm, current_wm]`, in end order.
    pub fn trigger_windows(
        &self,
        last_wm: WatermarkTs,
        current_wm: WatermarkTs,
    ) -> Vec<WindowBounds> {
        let mut windows = Vec::new();
        if current_wm <= last_wm {
            return windows;
        }
        let size = self.size_ms();
        let slide = self.slide_ms();
        if size == 0 || slide == 0 {
            return windows;
        }
        // First window end strictly greater than last_wm. Window ends sit at
        // k * slide + size for k >= 0.
        let mut end = if last_wm < size {
            size
        } else {
            let k = (last_wm - size) / slide + 1;
            k * slide + size
        };
        while end <= current_wm {
            windows.push(WindowBounds {
                start: end - size,
                end,
            });
            end += slide;
        }
        windows
    }
}

/// Whether windows measure the event time carried by a record field or the
/// wall-clock time of ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeCharacteristic {
    EventTime { field: String },
    IngestionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub measure: WindowMeasure,
    pub time: TimeCharacteristic,
    #[serde(default)]
    pub allowed_lateness_ms: u64,
}
