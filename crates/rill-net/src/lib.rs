//! # Rill Net - Inter-Worker Channels
//!
//! The network source/sink pair that carries buffers across worker
//! boundaries while preserving per-partition ordering: a length-prefixed
//! big-endian wire format, a consumer registry with tombstones so stale
//! senders give up gracefully, bounded-retry channel establishment, and an
//! upstream backup keyed by monotone epochs that replays unacknowledged
//! frames after reconnects.

pub mod manager;
pub mod partition;
pub mod sink;
pub mod source;
pub mod wire;

pub use manager::{NetworkManager, PartitionStatus};
pub use partition::{ChannelPartition, NodeLocation, PartitionKey};
pub use sink::NetworkSink;
pub use source::NetworkSource;
pub use wire::{ChannelFrame, DataFrame, DataFrameCodec, EventFrame, EventFrameCodec};
