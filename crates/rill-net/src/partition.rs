//! Channel partition identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Network identity of a worker node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub host: String,
    pub port: u16,
}

impl NodeLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One logical channel across a worker boundary. The `(operator_id,
/// subplan_id)` pair keys the receiver's consumer registry; the locations
/// document the two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPartition {
    pub operator_id: u64,
    pub subplan_id: u64,
    pub sender: NodeLocation,
    pub receiver: NodeLocation,
}

impl ChannelPartition {
    pub fn key(&self) -> PartitionKey {
        PartitionKey {
            operator_id: self.operator_id,
            subplan_id: self.subplan_id,
        }
    }
}

impl fmt::Display for ChannelPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition(op={}, subplan={}, {} -> {})",
            self.operator_id, self.subplan_id, self.sender, self.receiver
        )
    }
}

/// Registry key of a partition on the receiving worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub operator_id: u64,
    pub subplan_id: u64,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op={}/subplan={}", self.operator_id, self.subplan_id)
    }
}
