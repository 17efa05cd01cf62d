//! Executable pipelines.
//!
//! A pipeline wraps one compiled stage, its successor edges and the fan-in
//! accounting that makes teardown exact: with N producing predecessors the
//! pipeline reacts to the N-th end-of-stream only, stopping its handlers
//! first and then emitting a single matching EoS to every successor.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use rill_core::buffer::SealedBuffer;
use rill_core::error::Result;
use rill_core::reconfig::{
    ReconfigurationKind, ReconfigurationMessage, ReconfigurationPayload, TerminationKind,
};
use rill_core::{QueryId, SubplanId};

use crate::stage::{ExecutableStage, StageOutput};
use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Created,
    Running,
    Stopped,
    Failed,
}

const STATUS_CREATED: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPED: u8 = 2;
const STATUS_FAILED: u8 = 3;

/// Completion reports sent to the query manager.
#[derive(Debug, Clone)]
pub struct PipelineCompletion {
    pub query_id: QueryId,
    pub subplan_id: SubplanId,
    pub pipeline_id: u64,
    pub termination: TerminationKind,
}

pub struct ExecutablePipeline {
    pipeline_id: u64,
    query_id: QueryId,
    subplan_id: SubplanId,
    stage: Box<dyn ExecutableStage>,
    output: StageOutput,
    status: AtomicU8,
    active_producers: AtomicU32,
    completions: mpsc::Sender<PipelineCompletion>,
}

impl ExecutablePipeline {
    pub fn new(
        pipeline_id: u64,
        query_id: QueryId,
        subplan_id: SubplanId,
        stage: Box<dyn ExecutableStage>,
        num_producers: u32,
        successors: Vec<mpsc::Sender<rill_core::PipelineMessage>>,
        completions: mpsc::Sender<PipelineCompletion>,
    ) -> Self {
        debug_assert!(num_producers > 0, "a pipeline needs at least one producer");
        Self {
            pipeline_id,
            query_id,
            subplan_id,
            stage,
            output: StageOutput::new(successors),
            status: AtomicU8::new(STATUS_CREATED),
            active_producers: AtomicU32::new(num_producers),
            completions,
        }
    }

    pub fn pipeline_id(&self) -> u64 {
        self.pipeline_id
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn subplan_id(&self) -> SubplanId {
        self.subplan_id
    }

    pub fn status(&self) -> PipelineStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_CREATED => PipelineStatus::Created,
            STATUS_RUNNING => PipelineStatus::Running,
            STATUS_STOPPED => PipelineStatus::Stopped,
            _ => PipelineStatus::Failed,
        }
    }

    pub fn active_producers(&self) -> u32 {
        self.active_producers.load(Ordering::Acquire)
    }

    pub fn start(&self) -> bool {
        self.status
            .compare_exchange(
                STATUS_CREATED,
                STATUS_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn stop_status(&self, status: u8) -> bool {
        self.status
            .compare_exchange(STATUS_RUNNING, status, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs the stage over one sealed buffer. Concurrent calls on distinct
    /// buffers are fine; handlers serialize their own state.
    pub async fn execute(&self, buffer: SealedBuffer, worker: &WorkerContext) -> Result<()> {
        match self.status() {
            PipelineStatus::Running => {
                if let Err(e) = self.stage.execute(&buffer, &self.output, worker).await {
                    error!(
                        pipeline = self.pipeline_id,
                        subplan = self.subplan_id,
                        origin = buffer.origin_id(),
                        error = %e,
                        "stage failed, failing pipeline"
                    );
                    self.fail().await;
                    return Err(e);
                }
                Ok(())
            }
            PipelineStatus::Stopped => Ok(()),
            status => {
                warn!(
                    pipeline = self.pipeline_id,
                    subplan = self.subplan_id,
                    origin = buffer.origin_id(),
                    ?status,
                    "cannot execute, pipeline is not running"
                );
                Ok(())
            }
        }
    }

    async fn fail(&self) {
        if self.stop_status(STATUS_FAILED) {
            if let Err(e) = self.stage.stop(TerminationKind::Failure).await {
                warn!(pipeline = self.pipeline_id, error = %e, "stage stop failed");
            }
            self.notify(TerminationKind::Failure).await;
            self.output
                .control(ReconfigurationMessage::new(
                    ReconfigurationKind::FailEndOfStream,
                    self.query_id,
                    self.subplan_id,
                ))
                .await;
        }
    }

    async fn notify(&self, termination: TerminationKind) {
        let _ = self
            .completions
            .send(PipelineCompletion {
                query_id: self.query_id,
                subplan_id: self.subplan_id,
                pipeline_id: self.pipeline_id,
                termination,
            })
            .await;
    }

    /// Reacts to an in-band reconfiguration message.
    pub async fn handle_reconfiguration(&self, message: ReconfigurationMessage) {
        match message.kind {
            ReconfigurationKind::Initialize => {
                if let ReconfigurationPayload::ActiveProducers(n) = message.payload {
                    self.active_producers.store(n, Ordering::Release);
                }
                if self.start() {
                    if let Err(e) = self.stage.start().await {
                        warn!(pipeline = self.pipeline_id, error = %e, "stage start failed");
                    }
                    debug!(
                        pipeline = self.pipeline_id,
                        subplan = self.subplan_id,
                        producers = self.active_producers(),
                        "pipeline initialized"
                    );
                }
            }
            ReconfigurationKind::SoftEndOfStream
            | ReconfigurationKind::HardEndOfStream
            | ReconfigurationKind::FailEndOfStream => {
                let prev = self.active_producers.fetch_sub(1, Ordering::AcqRel);
                if prev != 1 {
                    debug!(
                        pipeline = self.pipeline_id,
                        subplan = self.subplan_id,
                        remaining = prev.saturating_sub(1),
                        kind = ?message.kind,
                        "end-of-stream, waiting for remaining producers"
                    );
                    return;
                }
                // All producers finished. Stop and drain handlers first, then
                // propagate exactly one EoS per successor.
                let termination = message
                    .kind
                    .termination_kind()
                    .unwrap_or(TerminationKind::Graceful);
                if let Err(e) = self.stage.stop(termination).await {
                    warn!(pipeline = self.pipeline_id, error = %e, "stage stop failed");
                }
                let failed = message.kind == ReconfigurationKind::FailEndOfStream;
                self.stop_status(if failed { STATUS_FAILED } else { STATUS_STOPPED });
                self.notify(termination).await;
                self.output
                    .control(ReconfigurationMessage::new(
                        message.kind,
                        self.query_id,
                        self.subplan_id,
                    ))
                    .await;
                debug!(
                    pipeline = self.pipeline_id,
                    subplan = self.subplan_id,
                    kind = ?message.kind,
                    "pipeline torn down, end-of-stream forwarded"
                );
            }
            ReconfigurationKind::Destroy => {
                // Isolated cleanup, nothing flows downstream.
                self.stop_status(STATUS_STOPPED);
                debug!(pipeline = self.pipeline_id, "pipeline destroyed");
            }
        }
    }
}
