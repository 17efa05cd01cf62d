//! Kafka sink, compiled behind the `kafka` feature. One Kafka record per
//! tuple row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{info, warn};

use rill_core::buffer::SealedBuffer;
use rill_core::config::SinkFormat;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::TerminationKind;
use rill_core::schema::{RowLayout, RowReader, Schema};
use rill_core::sink::DataSink;

use crate::render::{render_csv, render_json};

pub struct KafkaSink {
    id: String,
    brokers: String,
    topic: String,
    producer_timeout: Duration,
    format: SinkFormat,
    layout: RowLayout,
    producer: Option<FutureProducer>,
}

impl KafkaSink {
    pub fn new(
        id: impl Into<String>,
        brokers: impl Into<String>,
        topic: impl Into<String>,
        producer_timeout_ms: u64,
        format: SinkFormat,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            id: id.into(),
            brokers: brokers.into(),
            topic: topic.into(),
            producer_timeout: Duration::from_millis(producer_timeout_ms),
            format,
            layout: RowLayout::new(schema),
            producer: None,
        }
    }
}

#[async_trait]
impl DataSink for KafkaSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self) -> Result<()> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.id)
            .set(
                "message.timeout.ms",
                self.producer_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| EngineError::config(format!("kafka producer: {e}")))?;
        info!(sink = %self.id, brokers = %self.brokers, topic = %self.topic, "kafka sink ready");
        self.producer = Some(producer);
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        let Some(producer) = self.producer.as_ref() else {
            return Ok(());
        };
        let reader = RowReader::new(&self.layout, buffer.bytes());
        for index in 0..buffer.number_of_tuples() {
            let record = reader.record_bytes(index)?;
            let payload = match self.format {
                SinkFormat::Csv => render_csv(&self.layout, record)?,
                SinkFormat::Json => render_json(&self.layout, record)?,
                SinkFormat::BinaryNative => {
                    String::from_utf8_lossy(record).into_owned()
                }
            };
            let delivery = producer
                .send(
                    FutureRecord::<(), String>::to(&self.topic).payload(&payload),
                    self.producer_timeout,
                )
                .await;
            if let Err((e, _)) = delivery {
                warn!(sink = %self.id, error = %e, "kafka delivery failed");
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )));
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        self.producer = None;
        info!(sink = %self.id, ?kind, "kafka sink closed");
        Ok(())
    }
}
