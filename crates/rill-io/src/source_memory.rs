//! Memory-area source connector: replays a pre-populated region of packed
//! records, for benchmarks and tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use rill_core::error::{EngineError, Result};
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

/// Whether the area is consumed once or cycled indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySourceMode {
    /// Copy through the area once, then end the stream.
    CopyBuffer,
    /// Wrap around to the start when the area is exhausted; production is
    /// bounded by the runner's `buffers_to_produce`.
    Wrap,
}

#[derive(Debug)]
pub struct MemoryConnector {
    id: String,
    schema: Arc<Schema>,
    area: Bytes,
    mode: MemorySourceMode,
    record_size: usize,
    cursor: usize,
}

impl MemoryConnector {
    pub fn new(
        id: impl Into<String>,
        schema: Arc<Schema>,
        area: Bytes,
        mode: MemorySourceMode,
    ) -> Result<Self> {
        let record_size = schema.record_size_bytes();
        if record_size == 0 || area.len() % record_size != 0 {
            return Err(EngineError::config(format!(
                "memory area of {} bytes is not a whole number of {}-byte records",
                area.len(),
                record_size
            )));
        }
        Ok(Self {
            id: id.into(),
            schema,
            area,
            mode,
            record_size,
            cursor: 0,
        })
    }
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
        let capacity = writer.capacity_tuples();
        let mut tuples = 0u64;
        while tuples < capacity {
            if self.cursor >= self.area.len() {
                match self.mode {
                    MemorySourceMode::CopyBuffer => {
                        return Ok(SourceFill {
                            tuples,
                            end_of_stream: true,
                        })
                    }
                    MemorySourceMode::Wrap => self.cursor = 0,
                }
            }
            let record = &self.area[self.cursor..self.cursor + self.record_size];
            writer.write_record_bytes(tuples, record)?;
            self.cursor += self.record_size;
            tuples += 1;
        }
        Ok(SourceFill {
            tuples,
            end_of_stream: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::buffer::BufferManager;
    use rill_core::schema::{Field, PhysicalType, RowLayout};

    fn schema() -> Arc<Schema> {
        Schema::new(vec![Field::new("v", PhysicalType::U64)])
    }

    fn area(values: &[u64]) -> Bytes {
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        Bytes::from(bytes)
    }

    #[tokio::test]
    async fn copy_mode_ends_after_one_pass() {
        let schema = schema();
        let mut connector = MemoryConnector::new(
            "mem",
            schema.clone(),
            area(&[1, 2, 3]),
            MemorySourceMode::CopyBuffer,
        )
        .unwrap();
        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(16, 2); // two records per buffer
        let mut buffer = pool.acquire().await;
        let fill = {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            connector.fill_buffer(&mut writer).await.unwrap()
        };
        assert_eq!(fill.tuples, 2);
        assert!(!fill.end_of_stream);
        let mut buffer = pool.acquire().await;
        let fill = {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            connector.fill_buffer(&mut writer).await.unwrap()
        };
        assert_eq!(fill.tuples, 1);
        assert!(fill.end_of_stream);
    }

    #[tokio::test]
    async fn wrap_mode_cycles_the_area() {
        let schema = schema();
        let mut connector =
            MemoryConnector::new("mem", schema.clone(), area(&[7]), MemorySourceMode::Wrap)
                .unwrap();
        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(24, 1); // three records per buffer
        let mut buffer = pool.acquire().await;
        let fill = {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            connector.fill_buffer(&mut writer).await.unwrap()
        };
        assert_eq!(fill.tuples, 3);
        assert!(!fill.end_of_stream);
    }

    #[test]
    fn misaligned_area_is_rejected() {
        let schema = schema();
        match MemoryConnector::new("mem", schema, Bytes::from_static(&[1, 2, 3]), MemorySourceMode::CopyBuffer) {
            Err(EngineError::ConfigInvalid(_)) => {}
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }
}
