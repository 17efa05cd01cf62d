//! The data-sink seam and the shared sink runner.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::SealedBuffer;
use crate::error::Result;
use crate::reconfig::{PipelineMessage, TerminationKind};
use crate::{OriginId, WatermarkTs};

/// Serializes sealed buffers to an external medium.
#[async_trait]
pub trait DataSink: Send {
    fn name(&self) -> &str;

    async fn setup(&mut self) -> Result<()>;

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()>;

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()>;
}

/// Tracks the last watermark seen per origin; the exported barrier is the
/// minimum across origins and thus monotone. Sinks use it to decide which
/// epoch is safe to report upstream.
#[derive(Debug, Default)]
pub struct WatermarkBarrier {
    per_origin: HashMap<OriginId, WatermarkTs>,
    barrier: WatermarkTs,
}

impl WatermarkBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporates a buffer's watermark and returns the current barrier.
    pub fn update(&mut self, buffer: &SealedBuffer) -> WatermarkTs {
        let entry = self.per_origin.entry(buffer.origin_id()).or_insert(0);
        if buffer.watermark() > *entry {
            *entry = buffer.watermark();
        }
        let min = self.per_origin.values().copied().min().unwrap_or(0);
        if min > self.barrier {
            self.barrier = min;
        }
        self.barrier
    }

    pub fn current_barrier(&self) -> WatermarkTs {
        self.barrier
    }
}

/// Drives a sink from an incoming edge until end-of-stream or cancellation.
pub async fn run_sink(
    mut sink: Box<dyn DataSink>,
    mut rx: mpsc::Receiver<PipelineMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    sink.setup().await?;
    info!(sink = sink.name(), "sink started");
    let mut barrier = WatermarkBarrier::new();
    let mut termination = TerminationKind::Graceful;
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            _ = cancel.cancelled() => {
                termination = TerminationKind::HardStop;
                break;
            }
        };
        match msg {
            Some(PipelineMessage::Data(buffer)) => {
                barrier.update(&buffer);
                if let Err(e) = sink.write_buffer(buffer).await {
                    warn!(sink = sink.name(), error = %e, "sink write failed");
                    termination = TerminationKind::Failure;
                    break;
                }
            }
            Some(PipelineMessage::Control(msg)) => {
                if let Some(kind) = msg.kind.termination_kind() {
                    debug!(sink = sink.name(), ?kind, "sink received end-of-stream");
                    termination = kind;
                    break;
                }
            }
            None => break,
        }
    }
    sink.shutdown(termination).await?;
    info!(sink = sink.name(), ?termination, barrier = barrier.current_barrier(), "sink finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;

    #[tokio::test]
    async fn barrier_is_min_across_origins() {
        let pool = BufferManager::new(32, 8);
        let mut barrier = WatermarkBarrier::new();

        let mut a = pool.acquire().await;
        a.set_origin_id(0);
        a.set_watermark(1000);
        assert_eq!(barrier.update(&a.seal()), 1000);

        // A late-registering origin cannot drag the exported barrier back.
        let mut b = pool.acquire().await;
        b.set_origin_id(1);
        b.set_watermark(400);
        assert_eq!(barrier.update(&b.seal()), 1000);

        let mut c = pool.acquire().await;
        c.set_origin_id(1);
        c.set_watermark(1500);
        assert_eq!(barrier.update(&c.seal()), 1000);

        let mut d = pool.acquire().await;
        d.set_origin_id(0);
        d.set_watermark(2000);
        assert_eq!(barrier.update(&d.seal()), 1500);
    }
}
