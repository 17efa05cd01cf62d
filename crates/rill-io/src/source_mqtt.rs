//! MQTT source connector, compiled behind the `mqtt` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use rill_core::config::{MqttQos, MqttSourceSpec};
use rill_core::error::{EngineError, Result};
use rill_core::schema::{RowWriter, Schema};
use rill_core::source::{SourceConnector, SourceFill};

use crate::parser::InputParser;

fn qos(spec: MqttQos) -> QoS {
    match spec {
        MqttQos::AtMostOnce => QoS::AtMostOnce,
        MqttQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// `host:port` out of the configured url, tolerating a scheme prefix.
fn parse_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://");
    let (host, port) = trimmed.rsplit_once(':').ok_or_else(|| {
        EngineError::config(format!("mqtt url {url:?} misses a port"))
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| EngineError::config(format!("mqtt url {url:?} has a bad port")))?;
    Ok((host.to_string(), port))
}

pub struct MqttConnector {
    spec: MqttSourceSpec,
    schema: Arc<Schema>,
    parser: InputParser,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttConnector {
    pub fn new(spec: MqttSourceSpec, schema: Arc<Schema>) -> Self {
        let parser = InputParser::for_format(spec.input_format);
        Self {
            spec,
            schema,
            parser,
            client: None,
            event_loop: None,
        }
    }
}

#[async_trait]
impl SourceConnector for MqttConnector {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    async fn open(&mut self) -> Result<()> {
        let (host, port) = parse_url(&self.spec.url)?;
        let mut options = MqttOptions::new(self.spec.client_id.clone(), host, port);
        options.set_clean_session(self.spec.clean_session);
        options.set_keep_alive(Duration::from_secs(5));
        if let Some(user) = &self.spec.user {
            options.set_credentials(user.clone(), String::new());
        }
        let (client, event_loop) = AsyncClient::new(options, 64);
        client
            .subscribe(&self.spec.topic, qos(self.spec.qos))
            .await
            .map_err(|e| EngineError::config(format!("mqtt subscribe: {e}")))?;
        info!(
            source = %self.spec.id,
            url = %self.spec.url,
            topic = %self.spec.topic,
            "mqtt source subscribed"
        );
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    async fn fill_buffer(&mut self, writer: &mut RowWriter<'_>) -> Result<SourceFill> {
        let Some(event_loop) = self.event_loop.as_mut() else {
            return Ok(SourceFill {
                tuples: 0,
                end_of_stream: true,
            });
        };
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.spec.flush_interval_ms.max(1));
        let limit = writer.capacity_tuples();
        let mut tuples = 0u64;
        while tuples < limit {
            let event = tokio::select! {
                event = event_loop.poll() => event,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let text = String::from_utf8_lossy(&publish.payload);
                    match self.parser.write_tuple(&text, tuples, &self.schema, writer) {
                        Ok(()) => tuples += 1,
                        Err(e) => {
                            warn!(source = %self.spec.id, error = %e, "skipping bad mqtt message");
                        }
                    }
                }
                Ok(event) => {
                    debug!(source = %self.spec.id, ?event, "mqtt control event");
                }
                Err(e) => {
                    warn!(source = %self.spec.id, error = %e, "mqtt connection error");
                    return Err(EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )));
                }
            }
        }
        Ok(SourceFill {
            tuples,
            end_of_stream: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.event_loop = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing_accepts_scheme_prefixes() {
        assert_eq!(
            parse_url("tcp://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_url("broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert!(matches!(
            parse_url("broker.local"),
            Err(EngineError::ConfigInvalid(_))
        ));
    }
}
