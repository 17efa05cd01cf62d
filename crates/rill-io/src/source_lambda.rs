//! Lambda source connector: a user-provided closure fills each buffer.

use std::sync::Arc;

use async_trait::async_trait;

use rill_core::error::Result;
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

/// Closure filling up to `n_tuples` row slots; returns how many it wrote.
/// Returning fewer than asked does not end the stream; the runner's
/// `buffers_to_produce` bounds production.
pub type FillFn = Box<dyn FnMut(&mut RowWriter<'_>, u64) -> Result<u64> + Send + Sync>;

pub struct LambdaConnector {
    id: String,
    schema: Arc<Schema>,
    fill: FillFn,
}

impl LambdaConnector {
    pub fn new(id: impl Into<String>, schema: Arc<Schema>, fill: FillFn) -> Self {
        Self {
            id: id.into(),
            schema,
            fill,
        }
    }
}

#[async_trait]
impl SourceConnector for LambdaConnector {
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
        let tuples = (self.fill)(writer, capacity)?;
        Ok(SourceFill {
            tuples,
            end_of_stream: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
