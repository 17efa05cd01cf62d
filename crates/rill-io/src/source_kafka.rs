//! Kafka source connector, compiled behind the `kafka` feature.
//!
//! The rdkafka consumer stream is forwarded by a background task into an
//! mpsc channel; the fill path drains that channel one payload per tuple.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use rill_core::config::{InputFormat, KafkaOffsetMode, KafkaSourceSpec};
use rill_core::error::{EngineError, Result};
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

use crate::parser::InputParser;

pub struct KafkaConnector {
    spec: KafkaSourceSpec,
    schema: Arc<Schema>,
    parser: InputParser,
    messages: Option<ReceiverStream<Vec<u8>>>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl KafkaConnector {
    pub fn new(spec: KafkaSourceSpec, schema: Arc<Schema>) -> Self {
        let parser = InputParser::for_format(spec.input_format);
        Self {
            spec,
            schema,
            parser,
            messages: None,
            driver: None,
        }
    }
}

#[async_trait]
impl SourceConnector for KafkaConnector {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    async fn open(&mut self) -> Result<()> {
        let offset_reset = match self.spec.offset_mode {
            KafkaOffsetMode::Earliest => "earliest",
            KafkaOffsetMode::Latest => "latest",
        };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.spec.brokers)
            .set("group.id", &self.spec.group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", offset_reset)
            .set(
                "session.timeout.ms",
                self.spec.connection_timeout_ms.to_string(),
            )
            .set(
                "enable.auto.commit",
                if self.spec.auto_commit { "true" } else { "false" },
            )
            .create()
            .map_err(|e| EngineError::config(format!("kafka consumer: {e}")))?;
        consumer
            .subscribe(&[&self.spec.topic])
            .map_err(|e| EngineError::config(format!("kafka subscribe: {e}")))?;
        info!(
            source = %self.spec.id,
            brokers = %self.spec.brokers,
            topic = %self.spec.topic,
            "kafka source subscribed"
        );

        let (tx, rx) = mpsc::channel(100);
        let source_id = self.spec.id.clone();
        // The consumer lives in the forwarding task; payloads flow through
        // the channel until the connector closes or the driver fails.
        self.driver = Some(tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(result) = stream.next().await {
                let payload = match result {
                    Ok(m) => m.payload().map(|p| p.to_vec()),
                    Err(e) => {
                        warn!(
                            source = %source_id,
                            error = %e,
                            "kafka error on consuming message from broker"
                        );
                        None
                    }
                };
                if let Some(payload) = payload {
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        }));
        self.messages = Some(ReceiverStream::new(rx));
        Ok(())
    }

    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
        let Some(messages) = self.messages.as_mut() else {
            return Ok(SourceFill {
                tuples: 0,
                end_of_stream: true,
            });
        };
        let limit = self.spec.batch_size.min(writer.capacity_tuples());
        let mut tuples = 0u64;
        while tuples < limit {
            let payload = tokio::select! {
                payload = messages.next() => payload,
                _ = tokio::time::sleep(Duration::from_millis(100)) => break,
            };
            let Some(payload) = payload else {
                // The forwarding task ended; the stream is exhausted.
                return Ok(SourceFill {
                    tuples,
                    end_of_stream: true,
                });
            };
            let text = String::from_utf8_lossy(&payload);
            match self.parser.write_tuple(&text, tuples, &self.schema, writer) {
                Ok(()) => tuples += 1,
                Err(e) => {
                    warn!(source = %self.spec.id, error = %e, "skipping bad kafka message");
                }
            }
        }
        Ok(SourceFill {
            tuples,
            end_of_stream: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.messages = None;
        Ok(())
    }
}
