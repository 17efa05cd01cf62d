//! Null sink: counts and discards.

use async_trait::async_trait;
use tracing::debug;

use rill_core::buffer::SealedBuffer;
use rill_core::error::Result;
use rill_core::reconfig::TerminationKind;
use rill_core::sink::DataSink;

pub struct NullSink {
    id: String,
    buffers_seen: u64,
    tuples_seen: u64,
}

impl NullSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            buffers_seen: 0,
            tuples_seen: 0,
        }
    }

    pub fn tuples_seen(&self) -> u64 {
        self.tuples_seen
    }
}

#[async_trait]
impl DataSink for NullSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        self.buffers_seen += 1;
        self.tuples_seen += buffer.number_of_tuples();
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        debug!(
            sink = %self.id,
            ?kind,
            buffers = self.buffers_seen,
            tuples = self.tuples_seen,
            "null sink closed"
        );
        Ok(())
    }
}
