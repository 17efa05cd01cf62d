//! YAML-facing pipeline specification.
//!
//! A [`PipelineSpec`] describes one deployed subplan on a worker: sources,
//! sinks, the record schema and the runtime sizing. Memory and lambda
//! sources are constructed programmatically and therefore have no spec
//! variant here.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! name: "sensor-feed"
//! schema:
//!   - { name: key, physical_type: u64 }
//!   - { name: value, physical_type: i64 }
//!   - { name: ts, physical_type: u64 }
//! sources:
//!   - type: tcp
//!     id: "plant-gateway"
//!     host: "10.0.0.5"
//!     port: 9000
//!     framing: { mode: tuple_separator, separator: 10 }
//!     input_format: csv
//! sinks:
//!   - type: file
//!     id: "archive"
//!     path: "/data/out.csv"
//!     format: csv
//! edges:
//!   - ["plant-gateway", "archive"]
//! ```

use serde::{Deserialize, Serialize};

use crate::schema::Field;

/// How incoming payload bytes are parsed into tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Csv,
    Json,
}

/// How a TCP byte stream is cut into tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TcpFraming {
    /// All bytes up to the separator belong to the current tuple.
    TupleSeparator { separator: u8 },
    /// Every tuple occupies exactly `size` bytes.
    FixedSize { size: usize },
    /// Each tuple is preceded by an ASCII decimal length of `digits` bytes.
    SizePrefix { digits: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSourceSpec {
    pub id: String,
    /// File path or glob pattern.
    pub file_path: String,
    #[serde(default = "default_tuples_per_buffer")]
    pub tuples_per_buffer: u64,
    /// Bound on produced buffers; `None` reads every matched file to the end.
    #[serde(default)]
    pub buffers_to_produce: Option<u64>,
    #[serde(default = "default_gathering_interval_ms")]
    pub gathering_interval_ms: u64,
    #[serde(default)]
    pub skip_header: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSourceSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub framing: TcpFraming,
    pub input_format: InputFormat,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttQos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSourceSpec {
    pub id: String,
    pub url: String,
    pub client_id: String,
    #[serde(default)]
    pub user: Option<String>,
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: MqttQos,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    pub input_format: InputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KafkaOffsetMode {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceSpec {
    pub id: String,
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    #[serde(default = "default_offset_mode")]
    pub offset_mode: KafkaOffsetMode,
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    pub input_format: InputFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "file_csv")]
    Csv(CsvSourceSpec),
    #[serde(rename = "tcp")]
    Tcp(TcpSourceSpec),
    #[serde(rename = "mqtt")]
    Mqtt(MqttSourceSpec),
    #[serde(rename = "kafka")]
    Kafka(KafkaSourceSpec),
}

impl SourceSpec {
    pub fn id(&self) -> &str {
        match self {
            SourceSpec::Csv(s) => &s.id,
            SourceSpec::Tcp(s) => &s.id,
            SourceSpec::Mqtt(s) => &s.id,
            SourceSpec::Kafka(s) => &s.id,
        }
    }
}

/// Serialization format of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkFormat {
    Csv,
    Json,
    /// Raw row-layout bytes, host-native.
    BinaryNative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    #[serde(rename = "file")]
    File {
        id: String,
        path: String,
        format: SinkFormat,
        #[serde(default)]
        append: bool,
    },
    #[serde(rename = "print")]
    Print { id: String },
    #[serde(rename = "null")]
    Null { id: String },
    #[serde(rename = "kafka")]
    Kafka {
        id: String,
        brokers: String,
        topic: String,
        #[serde(default = "default_connection_timeout_ms")]
        producer_timeout_ms: u64,
        format: SinkFormat,
    },
    #[serde(rename = "mqtt")]
    Mqtt {
        id: String,
        url: String,
        client_id: String,
        topic: String,
        #[serde(default = "default_qos")]
        qos: MqttQos,
        format: SinkFormat,
    },
    #[serde(rename = "network")]
    Network {
        id: String,
        host: String,
        port: u16,
        operator_id: u64,
        subplan_id: u64,
        #[serde(default = "default_wait_time_ms")]
        wait_time_ms: u64,
        #[serde(default = "default_retry_times")]
        retry_times: u32,
    },
}

impl SinkSpec {
    pub fn id(&self) -> &str {
        match self {
            SinkSpec::File { id, .. } => id,
            SinkSpec::Print { id } => id,
            SinkSpec::Null { id } => id,
            SinkSpec::Kafka { id, .. } => id,
            SinkSpec::Mqtt { id, .. } => id,
            SinkSpec::Network { id, .. } => id,
        }
    }
}

/// Worker pool flavor: one shared queue, or one queue per worker subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default = "default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,
    #[serde(default = "default_num_buffers")]
    pub num_buffers: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_pool_mode")]
    pub pool_mode: PoolMode,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            buffer_size_bytes: default_buffer_size_bytes(),
            num_buffers: default_num_buffers(),
            workers: default_workers(),
            pool_mode: default_pool_mode(),
        }
    }
}

/// One deployed subplan: sources, sinks, the record schema, runtime sizing
/// and the edges wiring operator ids together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    pub schema: Vec<Field>,
    pub sources: Vec<SourceSpec>,
    pub sinks: Vec<SinkSpec>,
    pub edges: Vec<(String, String)>,
}

fn default_tuples_per_buffer() -> u64 {
    128
}

fn default_gathering_interval_ms() -> u64 {
    10
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_qos() -> MqttQos {
    MqttQos::AtLeastOnce
}

fn default_offset_mode() -> KafkaOffsetMode {
    KafkaOffsetMode::Earliest
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_batch_size() -> u64 {
    64
}

fn default_wait_time_ms() -> u64 {
    500
}

fn default_retry_times() -> u32 {
    5
}

fn default_buffer_size_bytes() -> usize {
    4096
}

fn default_num_buffers() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_pool_mode() -> PoolMode {
    PoolMode::Dynamic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_pipeline_spec() {
        let yaml = r#"
name: "sensor-feed"
schema:
  - { name: key, physical_type: u64 }
  - { name: value, physical_type: i64 }
sources:
  - type: tcp
    id: "gateway"
    host: "127.0.0.1"
    port: 9000
    framing: { mode: size_prefix, digits: 2 }
    input_format: csv
sinks:
  - type: "null"
    id: "drop"
edges:
  - ["gateway", "drop"]
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "sensor-feed");
        assert_eq!(spec.runtime.buffer_size_bytes, 4096);
        match &spec.sources[0] {
            SourceSpec::Tcp(tcp) => {
                assert_eq!(tcp.port, 9000);
                assert_eq!(tcp.framing, TcpFraming::SizePrefix { digits: 2 });
                assert_eq!(tcp.flush_interval_ms, 100);
            }
            other => panic!("expected tcp source, got {other:?}"),
        }
        assert!(matches!(spec.sinks[0], SinkSpec::Null { .. }));
    }

    #[test]
    fn missing_required_option_fails() {
        // A kafka source without a group id must not deserialize.
        let yaml = r#"
type: kafka
id: "k"
brokers: "localhost:9092"
topic: "t"
input_format: json
"#;
        assert!(serde_yaml::from_str::<SourceSpec>(yaml).is_err());
    }
}
