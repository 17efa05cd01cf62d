//! TCP source connector.
//!
//! Connects to a remote gateway, accumulates the byte stream in a framing
//! ring buffer and cuts it into tuples per the configured framing mode. A
//! flush interval bounds the tail latency of partially filled buffers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rill_core::config::TcpSourceSpec;
use rill_core::error::Result;
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

use crate::framing::FrameBuffer;
use crate::parser::InputParser;

pub struct TcpConnector {
    spec: TcpSourceSpec,
    schema: Arc<Schema>,
    parser: InputParser,
    frames: FrameBuffer,
    stream: Option<TcpStream>,
    read_chunk: Vec<u8>,
    eof: bool,
}

impl TcpConnector {
    pub fn new(spec: TcpSourceSpec, schema: Arc<Schema>) -> Self {
        let parser = InputParser::for_format(spec.input_format);
        let frames = FrameBuffer::new(spec.framing);
        Self {
            spec,
            schema,
            parser,
            frames,
            stream: None,
            read_chunk: vec![0u8; 4096],
            eof: false,
        }
    }

    /// Writes buffered complete tuples into row slots. Bad tuples are logged
    /// and skipped; an empty-tuple framing violation aborts the fill.
    fn drain_frames(
        &mut self,
        writer: &mut RowWriter<'_>,
        tuples: &mut u64,
        limit: u64,
    ) -> Result<()> {
        while *tuples < limit {
            match self.frames.next_tuple() {
                Ok(Some(tuple)) => {
                    let text = String::from_utf8_lossy(&tuple);
                    match self.parser.write_tuple(&text, *tuples, &self.schema, writer) {
                        Ok(()) => *tuples += 1,
                        Err(e) => {
                            warn!(source = %self.spec.id, error = %e, "skipping bad tuple");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for TcpConnector {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    async fn open(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.spec.host, self.spec.port);
        let stream = TcpStream::connect(&addr).await?;
        info!(source = %self.spec.id, addr = %addr, "tcp source connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
        let limit = writer.capacity_tuples();
        let deadline = Instant::now() + Duration::from_millis(self.spec.flush_interval_ms.max(1));
        let mut tuples = 0u64;

        loop {
            self.drain_frames(writer, &mut tuples, limit)?;
            if tuples >= limit || self.eof {
                break;
            }
            let Some(stream) = self.stream.as_mut() else {
                self.eof = true;
                break;
            };
            let n = tokio::select! {
                read = stream.read(&mut self.read_chunk) => read?,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(source = %self.spec.id, tuples, "flush interval reached");
                    break;
                }
            };
            if n == 0 {
                // Peer closed; any partial frame bytes are discarded.
                debug!(
                    source = %self.spec.id,
                    buffered = self.frames.buffered(),
                    "tcp stream ended"
                );
                self.eof = true;
            } else {
                let chunk = self.read_chunk[..n].to_vec();
                self.frames.push(&chunk);
            }
        }

        if self.eof {
            self.drain_frames(writer, &mut tuples, limit)?;
        }
        Ok(SourceFill {
            tuples,
            end_of_stream: self.eof,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!(source = %self.spec.id, "tcp source closed");
        }
        Ok(())
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        if self.frames.buffered() > 0 {
            debug!(
                source = %self.spec.id,
                bytes = self.frames.buffered(),
                "discarding buffered partial tuple"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::buffer::BufferManager;
    use rill_core::config::{InputFormat, TcpFraming};
    use rill_core::error::EngineError;
    use rill_core::schema::{Field, PhysicalType, RowLayout, RowReader};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn spec(port: u16) -> TcpSourceSpec {
        TcpSourceSpec {
            id: "tcp".into(),
            host: "127.0.0.1".into(),
            port,
            framing: TcpFraming::TupleSeparator { separator: b'\n' },
            input_format: InputFormat::Csv,
            flush_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn reads_separated_tuples_from_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"1,10\n2,20\n").await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let schema = Schema::new(vec![
            Field::new("id", PhysicalType::U64),
            Field::new("value", PhysicalType::U64),
        ]);
        let mut connector = TcpConnector::new(spec(port), schema.clone());
        connector.open().await.unwrap();

        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(256, 1);
        let mut buffer = pool.acquire().await;
        let fill = {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            connector.fill_buffer(&mut writer).await.unwrap()
        };
        assert_eq!(fill.tuples, 2);
        assert!(fill.end_of_stream);

        let sealed = buffer.seal();
        let reader = RowReader::new(&layout, sealed.bytes());
        assert_eq!(reader.read_u64(0, 1).unwrap(), 10);
        assert_eq!(reader.read_u64(1, 1).unwrap(), 20);
    }

    #[tokio::test]
    async fn connect_failure_is_io() {
        let schema = Schema::new(vec![Field::new("id", PhysicalType::U64)]);
        // Port 1 on loopback is virtually never listening.
        let mut connector = TcpConnector::new(spec(1), schema);
        match connector.open().await {
            Err(EngineError::Io(_)) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
