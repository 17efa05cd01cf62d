//! In-band lifecycle messages flowing along the data topology.
//!
//! Reconfiguration messages travel the same edges as data buffers. End-of-
//! stream kinds are reference counted at fan-in points: a pipeline with N
//! producing predecessors tears down only after the N-th EoS arrives.

use crate::buffer::SealedBuffer;
use crate::{QueryId, SubplanId};

/// How a source, pipeline or sink is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// Drain partial state, then stop.
    Graceful,
    /// Discard partial work and stop now.
    HardStop,
    /// Stop because something went wrong.
    Failure,
}

impl TerminationKind {
    /// The end-of-stream message kind this termination propagates downstream.
    pub fn eos_kind(&self) -> ReconfigurationKind {
        match self {
            TerminationKind::Graceful => ReconfigurationKind::SoftEndOfStream,
            TerminationKind::HardStop => ReconfigurationKind::HardEndOfStream,
            TerminationKind::Failure => ReconfigurationKind::FailEndOfStream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigurationKind {
    Initialize,
    SoftEndOfStream,
    HardEndOfStream,
    FailEndOfStream,
    Destroy,
}

impl ReconfigurationKind {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            ReconfigurationKind::SoftEndOfStream
                | ReconfigurationKind::HardEndOfStream
                | ReconfigurationKind::FailEndOfStream
        )
    }

    /// The termination kind an EoS message carries; `None` for non-EoS kinds.
    pub fn termination_kind(&self) -> Option<TerminationKind> {
        match self {
            ReconfigurationKind::SoftEndOfStream => Some(TerminationKind::Graceful),
            ReconfigurationKind::HardEndOfStream => Some(TerminationKind::HardStop),
            ReconfigurationKind::FailEndOfStream => Some(TerminationKind::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconfigurationPayload {
    None,
    /// Initialize: the number of producing predecessors of the target.
    ActiveProducers(u32),
    /// FailEndOfStream: human-readable failure reason.
    Reason(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigurationMessage {
    pub kind: ReconfigurationKind,
    pub query_id: QueryId,
    pub subplan_id: SubplanId,
    pub payload: ReconfigurationPayload,
}

impl ReconfigurationMessage {
    pub fn new(kind: ReconfigurationKind, query_id: QueryId, subplan_id: SubplanId) -> Self {
        Self {
            kind,
            query_id,
            subplan_id,
            payload: ReconfigurationPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: ReconfigurationPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// What flows on an edge between stages: sealed data or control.
#[derive(Debug, Clone)]
pub enum PipelineMessage {
    Data(SealedBuffer),
    Control(ReconfigurationMessage),
}
