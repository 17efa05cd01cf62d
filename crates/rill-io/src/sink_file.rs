//! File sink: CSV, JSON lines, or raw row-layout bytes.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use rill_core::buffer::SealedBuffer;
use rill_core::config::SinkFormat;
use rill_core::error::Result;
use rill_core::reconfig::TerminationKind;
use rill_core::schema::{RowLayout, RowReader, Schema};
use rill_core::sink::DataSink;

use crate::render::{render_csv, render_json};

pub struct FileSink {
    id: String,
    path: String,
    format: SinkFormat,
    append: bool,
    layout: RowLayout,
    file: Option<std::fs::File>,
    buffers_written: u64,
}

impl FileSink {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        format: SinkFormat,
        append: bool,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            format,
            append,
            layout: RowLayout::new(schema),
            file: None,
            buffers_written: 0,
        }
    }
}

#[async_trait]
impl DataSink for FileSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)?;
        info!(sink = %self.id, path = %self.path, append = self.append, "file sink opened");
        self.file = Some(file);
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        match self.format {
            SinkFormat::BinaryNative => {
                let used = buffer.used_bytes(self.layout.record_size());
                file.write_all(&buffer.bytes()[..used])?;
            }
            SinkFormat::Csv | SinkFormat::Json => {
                let reader = RowReader::new(&self.layout, buffer.bytes());
                for index in 0..buffer.number_of_tuples() {
                    let record = reader.record_bytes(index)?;
                    let line = match self.format {
                        SinkFormat::Csv => render_csv(&self.layout, record)?,
                        _ => render_json(&self.layout, record)?,
                    };
                    writeln!(file, "{line}")?;
                }
            }
        }
        self.buffers_written += 1;
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        debug!(sink = %self.id, ?kind, buffers = self.buffers_written, "file sink closed");
        Ok(())
    }
}
