//! # Rill IO - External Sources and Sinks
//!
//! Connectors pulling live data into the engine (CSV files, memory areas,
//! lambda generators, TCP gateways, MQTT and Kafka feeds) and sinks
//! serializing result buffers back out (files, stdout, null, Kafka, MQTT).
//! Kafka and MQTT support compile behind the `kafka` and `mqtt` features;
//! without them the corresponding spec variants fail construction with a
//! configuration error.

use std::sync::Arc;

use rill_core::config::{SinkSpec, SourceSpec};
use rill_core::error::Result;
use rill_core::schema::Schema;
use rill_core::sink::DataSink;
use rill_core::source::SourceConnector;

pub mod framing;
pub mod parser;
pub mod render;
pub mod sink_file;
#[cfg(feature = "kafka")]
pub mod sink_kafka;
#[cfg(feature = "mqtt")]
pub mod sink_mqtt;
pub mod sink_null;
pub mod sink_print;
pub mod source_csv;
#[cfg(feature = "kafka")]
pub mod source_kafka;
pub mod source_lambda;
pub mod source_memory;
#[cfg(feature = "mqtt")]
pub mod source_mqtt;
pub mod source_tcp;

pub use framing::FrameBuffer;
pub use parser::InputParser;
pub use sink_file::FileSink;
pub use sink_null::NullSink;
pub use sink_print::{PrintSink, PrintStream};
pub use source_csv::CsvFileConnector;
pub use source_lambda::{FillFn, LambdaConnector};
pub use source_memory::{MemoryConnector, MemorySourceMode};
pub use source_tcp::TcpConnector;

#[cfg(not(feature = "kafka"))]
fn kafka_disabled<T>() -> Result<T> {
    Err(rill_core::EngineError::config(
        "built without kafka support".to_string(),
    ))
}

#[cfg(not(feature = "mqtt"))]
fn mqtt_disabled<T>() -> Result<T> {
    Err(rill_core::EngineError::config(
        "built without mqtt support".to_string(),
    ))
}

/// Builds the connector described by a source spec.
pub fn create_source_connector(
    spec: &SourceSpec,
    schema: Arc<Schema>,
) -> Result<Box<dyn SourceConnector>> {
    match spec {
        SourceSpec::Csv(csv) => Ok(Box::new(CsvFileConnector::new(csv.clone(), schema))),
        SourceSpec::Tcp(tcp) => Ok(Box::new(TcpConnector::new(tcp.clone(), schema))),
        #[cfg(feature = "kafka")]
        SourceSpec::Kafka(kafka) => Ok(Box::new(source_kafka::KafkaConnector::new(
            kafka.clone(),
            schema,
        ))),
        #[cfg(not(feature = "kafka"))]
        SourceSpec::Kafka(_) => kafka_disabled(),
        #[cfg(feature = "mqtt")]
        SourceSpec::Mqtt(mqtt) => Ok(Box::new(source_mqtt::MqttConnector::new(
            mqtt.clone(),
            schema,
        ))),
        #[cfg(not(feature = "mqtt"))]
        SourceSpec::Mqtt(_) => mqtt_disabled(),
    }
}

/// Builds the sink described by a sink spec. Network sinks are constructed
/// by the runtime, which owns the channel machinery.
pub fn create_sink(spec: &SinkSpec, schema: Arc<Schema>) -> Result<Option<Box<dyn DataSink>>> {
    match spec {
        SinkSpec::File {
            id,
            path,
            format,
            append,
        } => Ok(Some(Box::new(FileSink::new(
            id.clone(),
            path.clone(),
            *format,
            *append,
            schema,
        )))),
        SinkSpec::Print { id } => Ok(Some(Box::new(PrintSink::new(
            id.clone(),
            PrintStream::Stdout,
            schema,
        )))),
        SinkSpec::Null { id } => Ok(Some(Box::new(NullSink::new(id.clone())))),
        #[cfg(feature = "kafka")]
        SinkSpec::Kafka {
            id,
            brokers,
            topic,
            producer_timeout_ms,
            format,
        } => Ok(Some(Box::new(sink_kafka::KafkaSink::new(
            id.clone(),
            brokers.clone(),
            topic.clone(),
            *producer_timeout_ms,
            *format,
            schema,
        )))),
        #[cfg(not(feature = "kafka"))]
        SinkSpec::Kafka { .. } => kafka_disabled(),
        #[cfg(feature = "mqtt")]
        SinkSpec::Mqtt {
            id,
            url,
            client_id,
            topic,
            qos,
            format,
        } => Ok(Some(Box::new(sink_mqtt::MqttSink::new(
            id.clone(),
            url.clone(),
            client_id.clone(),
            topic.clone(),
            *qos,
            *format,
            schema,
        )))),
        #[cfg(not(feature = "mqtt"))]
        SinkSpec::Mqtt { .. } => mqtt_disabled(),
        SinkSpec::Network { .. } => Ok(None),
    }
}
