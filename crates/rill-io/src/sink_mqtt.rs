//! MQTT sink, compiled behind the `mqtt` feature. Publishes one message per
//! tuple row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tracing::{info, warn};

use rill_core::buffer::SealedBuffer;
use rill_core::config::{MqttQos, SinkFormat};
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::TerminationKind;
use rill_core::schema::{RowLayout, RowReader, Schema};
use rill_core::sink::DataSink;

use crate::render::{render_csv, render_json};

pub struct MqttSink {
    id: String,
    url: String,
    client_id: String,
    topic: String,
    qos: QoS,
    format: SinkFormat,
    layout: RowLayout,
    client: Option<AsyncClient>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl MqttSink {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        client_id: impl Into<String>,
        topic: impl Into<String>,
        qos_spec: MqttQos,
        format: SinkFormat,
        schema: Arc<Schema>,
    ) -> Self {
        let qos = match qos_spec {
            MqttQos::AtMostOnce => QoS::AtMostOnce,
            MqttQos::AtLeastOnce => QoS::AtLeastOnce,
        };
        Self {
            id: id.into(),
            url: url.into(),
            client_id: client_id.into(),
            topic: topic.into(),
            qos,
            format,
            layout: RowLayout::new(schema),
            client: None,
            driver: None,
        }
    }

    fn drive(mut event_loop: EventLoop, id: String) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = event_loop.poll().await {
                    warn!(sink = %id, error = %e, "mqtt event loop ended");
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl DataSink for MqttSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn setup(&mut self) -> Result<()> {
        let trimmed = self
            .url
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");
        let (host, port) = trimmed.rsplit_once(':').ok_or_else(|| {
            EngineError::config(format!("mqtt url {:?} misses a port", self.url))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| EngineError::config(format!("mqtt url {:?} has a bad port", self.url)))?;
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(5));
        let (client, event_loop) = AsyncClient::new(options, 64);
        self.driver = Some(Self::drive(event_loop, self.id.clone()));
        self.client = Some(client);
        info!(sink = %self.id, url = %self.url, topic = %self.topic, "mqtt sink connected");
        Ok(())
    }

    async fn write_buffer(&mut self, buffer: SealedBuffer) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            return Ok(());
        };
        let reader = RowReader::new(&self.layout, buffer.bytes());
        for index in 0..buffer.number_of_tuples() {
            let record = reader.record_bytes(index)?;
            let payload = match self.format {
                SinkFormat::Csv => render_csv(&self.layout, record)?,
                SinkFormat::Json => render_json(&self.layout, record)?,
                SinkFormat::BinaryNative => String::from_utf8_lossy(record).into_owned(),
            };
            client
                .publish(&self.topic, self.qos, false, payload)
                .await
                .map_err(|e| {
                    EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    ))
                })?;
        }
        Ok(())
    }

    async fn shutdown(&mut self, kind: TerminationKind) -> Result<()> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        info!(sink = %self.id, ?kind, "mqtt sink closed");
        Ok(())
    }
}
