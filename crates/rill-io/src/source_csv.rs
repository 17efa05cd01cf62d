//! File CSV source connector.

use std::io::{BufRead, BufReader};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use rill_core::config::CsvSourceSpec;
use rill_core::error::{EngineError, Result};
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

use crate::parser::InputParser;

pub struct CsvFileConnector {
    spec: CsvSourceSpec,
    schema: Arc<Schema>,
    parser: InputParser,
    paths: Vec<String>,
    current: Option<std::io::Lines<BufReader<std::fs::File>>>,
    next_path: usize,
}

impl CsvFileConnector {
    pub fn new(spec: CsvSourceSpec, schema: Arc<Schema>) -> Self {
        Self {
            spec,
            schema,
            parser: InputParser::for_format(rill_core::config::InputFormat::Csv),
            paths: Vec::new(),
            current: None,
            next_path: 0,
        }
    }

    fn advance_file(&mut self) -> Result<bool> {
        while self.next_path < self.paths.len() {
            let path = &self.paths[self.next_path];
            self.next_path += 1;
            let file = std::fs::File::open(path)?;
            info!(source = %self.spec.id, path = %path, "reading csv file");
            let mut lines = BufReader::new(file).lines();
            if self.spec.skip_header {
                let _ = lines.next();
            }
            self.current = Some(lines);
            return Ok(true);
        }
        self.current = None;
        Ok(false)
    }
}

#[async_trait]
impl SourceConnector for CsvFileConnector {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    async fn open(&mut self) -> Result<()> {
        for entry in glob::glob(&self.spec.file_path)
            .map_err(|e| EngineError::config(format!("bad csv glob: {e}")))?
        {
            let path = entry.map_err(|e| EngineError::Io(e.into_error()))?;
            self.paths.push(path.display().to_string());
        }
        if self.paths.is_empty() {
            return Err(EngineError::config(format!(
                "no files matched: {}",
                self.spec.file_path
            )));
        }
        self.advance_file()?;
        Ok(())
    }

    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
        let limit = self.spec.tuples_per_buffer.min(writer.capacity_tuples());
        let mut tuples = 0u64;
        while tuples < limit {
            let Some(lines) = self.current.as_mut() else {
                return Ok(SourceFill {
                    tuples,
                    end_of_stream: true,
                });
            };
            match lines.next() {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match self.parser.write_tuple(&line, tuples, &self.schema, writer) {
                        Ok(()) => tuples += 1,
                        Err(e) => {
                            warn!(source = %self.spec.id, error = %e, "skipping bad csv line");
                        }
                    }
                }
                Some(Err(e)) => return Err(EngineError::Io(e)),
                None => {
                    if !self.advance_file()? {
                        return Ok(SourceFill {
                            tuples,
                            end_of_stream: true,
                        });
                    }
                }
            }
        }
        Ok(SourceFill {
            tuples,
            end_of_stream: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}
