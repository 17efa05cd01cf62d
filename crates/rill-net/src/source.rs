//! The receiving side of an inter-worker channel, as seen by the local
//! subplan.
//!
//! Data frames are delivered by the network manager straight into the
//! registered emitter; this type owns the lifecycle around that: consumer
//! registration, the lazily-acquired reverse event channel, and the
//! reconfiguration semantics of the partition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rill_core::buffer::BufferManager;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::{
    PipelineMessage, ReconfigurationKind, ReconfigurationMessage, TerminationKind,
};
use rill_core::source::SourceEvent;
use rill_core::{QueryId, SubplanId};

use crate::manager::NetworkManager;
use crate::partition::ChannelPartition;
use crate::wire::EventFrame;

pub struct NetworkSource {
    manager: Arc<NetworkManager>,
    partition: ChannelPartition,
    query_id: QueryId,
    subplan_id: SubplanId,
    pool: BufferManager,
    out: mpsc::Sender<PipelineMessage>,
    event_channel: Mutex<Option<mpsc::Sender<EventFrame>>>,
    running: AtomicBool,
}

impl NetworkSource {
    pub fn new(
        manager: Arc<NetworkManager>,
        partition: ChannelPartition,
        query_id: QueryId,
        subplan_id: SubplanId,
        pool: BufferManager,
        out: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        Self {
            manager,
            partition,
            query_id,
            subplan_id,
            pool,
            out,
            event_channel: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Registers the partition consumer. Idempotent.
    pub fn bind(&self) -> bool {
        self.manager.register_consumer(
            &self.partition,
            self.query_id,
            self.subplan_id,
            self.pool.clone(),
            self.out.clone(),
        )
    }

    pub fn start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn partition(&self) -> &ChannelPartition {
        &self.partition
    }

    /// Partition lifecycle changes arriving on the reconfiguration bus.
    pub fn reconfigure(&self, kind: ReconfigurationKind) {
        match kind {
            ReconfigurationKind::Initialize => {
                // The query may have been torn down between start and this
                // reconfiguration.
                use crate::manager::PartitionStatus;
                if self.manager.partition_status(self.partition.key())
                    == PartitionStatus::Deleted
                {
                    debug!(partition = %self.partition, "skipping init of deleted partition");
                    return;
                }
                // Event channels are created lazily by the live connection;
                // none existing yet just means the sender has not connected.
                match self.manager.event_sender(self.partition.key()) {
                    Some(tx) => {
                        *self.event_channel.lock() = Some(tx);
                        debug!(partition = %self.partition, "stored event-only channel");
                    }
                    None => {
                        debug!(
                            partition = %self.partition,
                            "no event channel yet, sender not connected"
                        );
                    }
                }
            }
            ReconfigurationKind::SoftEndOfStream
            | ReconfigurationKind::HardEndOfStream
            | ReconfigurationKind::Destroy => {
                let kind = match kind {
                    ReconfigurationKind::HardEndOfStream => TerminationKind::HardStop,
                    _ => TerminationKind::Graceful,
                };
                debug!(partition = %self.partition, ?kind, "releasing event channel");
                *self.event_channel.lock() = None;
                self.manager.unregister_consumer(self.partition.key());
                self.running.store(false, Ordering::Release);
            }
            ReconfigurationKind::FailEndOfStream => {
                *self.event_channel.lock() = None;
                self.manager.unregister_consumer(self.partition.key());
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Termination observed on the wire. Only a graceful drain propagates to
    /// local successors; forceful kinds are swallowed.
    pub async fn on_end_of_stream(&self, kind: TerminationKind) {
        if kind == TerminationKind::Graceful {
            let msg = ReconfigurationMessage::new(
                ReconfigurationKind::SoftEndOfStream,
                self.query_id,
                self.subplan_id,
            );
            let _ = self.out.send(PipelineMessage::Control(msg)).await;
        } else {
            warn!(partition = %self.partition, ?kind, "ignoring forceful end-of-stream");
        }
    }

    /// Sends an event upstream on the reverse channel. Downstream operators
    /// use this to start lazy sources and to acknowledge epochs.
    pub async fn send_event(&self, event: SourceEvent) -> Result<()> {
        let frame = match event {
            SourceEvent::StartSource => EventFrame::StartSource,
            SourceEvent::PropagateEpoch { query_id, epoch_ts } => {
                EventFrame::PropagateEpoch { query_id, epoch_ts }
            }
        };
        let tx = self
            .event_channel
            .lock()
            .clone()
            .or_else(|| self.manager.event_sender(self.partition.key()));
        match tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| EngineError::ChannelClosed("event-only channel")),
            None => Err(EngineError::ChannelClosed("no event channel established")),
        }
    }
}
