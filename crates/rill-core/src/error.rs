use thiserror::Error;

/// Error taxonomy of the engine core
///
/// Every recoverable failure in the runtime is mapped onto one of these kinds,
/// so that callers can decide between retry, skip, and query teardown without
/// string matching.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Socket or file error (TCP read, MQTT/Kafka driver, file sink write).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer pool drained under non-blocking acquisition.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed network frame or unknown reconfiguration kind.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Missing or contradictory source/sink option.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Detected impossibility, e.g. a probe on a deleted hash window. Unrecoverable.
    #[error("state invariant violated: {0}")]
    StateInvariant(String),

    /// Operation observed a stop signal.
    #[error("cancelled: {0}")]
    Cancelled(&'static str),

    /// A channel between operators closed unexpectedly, typically because a
    /// downstream task failed or was terminated.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl EngineError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::ProtocolViolation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::ConfigInvalid(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::StateInvariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
