//! # Rill Core - Stream Engine Foundation
//!
//! This crate provides the foundational types and abstractions of the Rill
//! worker runtime: the pooled tuple-buffer fabric that carries records between
//! stages, the fixed-width schema and row layout, the multi-origin watermark
//! processor, window descriptors, and the source/sink traits the rest of the
//! engine is built on.
//!
//! ## Key Components
//!
//! - **Buffer Fabric**: Fixed-size [`TupleBuffer`]s handed out by a pooled
//!   [`BufferManager`], sealed into cheaply shareable [`SealedBuffer`]s
//! - **Schema & Row Layout**: Fixed-width field schemas with precomputed
//!   offsets for packing records into buffers
//! - **Watermarks**: [`MultiOriginWatermarkProcessor`] merging out-of-order
//!   per-origin updates into a monotone global watermark
//! - **Reconfiguration**: In-band lifecycle messages (Initialize, SoftEoS,
//!   HardEoS, FailEoS, Destroy) flowing along the data topology
//! - **Source Runtime**: The [`DataSource`] runner that tags buffers with
//!   gap-free per-origin sequence numbers and honors gathering modes
//!
//! ## Example Usage
//!
//! ```rust
//! use rill_core::{BufferManager, Schema, Field, PhysicalType};
//!
//! # async fn example() -> rill_core::Result<()> {
//! let pool = BufferManager::new(4096, 32);
//! let schema = Schema::new(vec![
//!     Field::new("key", PhysicalType::U64),
//!     Field::new("value", PhysicalType::I64),
//! ]);
//! let mut buffer = pool.acquire().await;
//! buffer.set_origin_id(1);
//! buffer.set_sequence_number(1);
//! let sealed = buffer.seal();
//! assert_eq!(sealed.origin_id(), 1);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod reconfig;
pub mod schema;
pub mod sink;
pub mod source;
pub mod watermark;
pub mod window;

pub use buffer::{BufferManager, SealedBuffer, TupleBuffer};
pub use error::{EngineError, Result};
pub use reconfig::{
    PipelineMessage, ReconfigurationKind, ReconfigurationMessage, ReconfigurationPayload,
    TerminationKind,
};
pub use schema::{Field, PhysicalType, RowLayout, RowReader, RowWriter, Schema};
pub use sink::{DataSink, WatermarkBarrier};
pub use source::{DataSource, GatheringMode, SourceConnector, SourceEvent, SourceFill, SourceHandle};
pub use watermark::MultiOriginWatermarkProcessor;
pub use window::{TimeCharacteristic, WindowBounds, WindowDescriptor, WindowMeasure};

/// Identity of a logical record producer. Sequence numbers are scoped per origin.
pub type OriginId = u64;

/// Gap-free per-origin counter stamped on emitted buffers.
pub type SequenceNumber = u64;

/// Millisecond event- or ingestion-time timestamp.
pub type WatermarkTs = u64;

/// Identifies a deployed query on this worker.
pub type QueryId = u64;

/// Identifies one deployed subplan of a query.
pub type SubplanId = u64;
