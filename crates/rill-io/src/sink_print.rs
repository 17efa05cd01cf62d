//! Print sink for debugging pipelines.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use rill_core::buffer::SealedBuffer;
use rill_core::error::Result;
use rill_core::reconfig::TerminationKind;
use rill_core::schema::{RowLayout, RowReader, Schema};
use rill_core::sink::DataSink;

use crate::render::render_csv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStream {
    Stdout,
    Stderr,
}

pub struct PrintSink {
    id: String,
    stream: PrintStream,
    layout: RowLayout,
}

impl PrintSink {
    pub fn new(id: impl Into<String>, stream: PrintStream, schema: Arc<Schema>) -> Self {
        Self {
            id: id.into(),
            stream,
            layout: RowLayout::new(schema),
        }
    }
}

#[async_trait]
impl DataSink for PrintSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        let reader = RowReader::new(&self.layout, buffer.bytes());
        for index in 0..buffer.number_of_tuples() {
            let line = render_csv(&self.layout, reader.record_bytes(index)?)?;
            match self.stream {
                PrintStream::Stdout => println!("{line}"),
                PrintStream::Stderr => eprintln!("{line}"),
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        info!(sink = %self.id, ?kind, "print sink closed");
        Ok(())
    }
}
