//! Query management: worker pools, task routing and terminal query states.
//!
//! Two pool flavors exist. `Dynamic` feeds every worker from one shared
//! MPMC queue; `Static` gives each worker its own queue and routes tasks by
//! subplan, so a subplan's buffers always run on the same worker.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rill_core::buffer::{BufferManager, SealedBuffer};
use rill_core::config::PoolMode;
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::{PipelineMessage, ReconfigurationMessage, TerminationKind};
use rill_core::QueryId;

use crate::pipeline::{ExecutablePipeline, PipelineCompletion};
use crate::worker::WorkerContext;

/// Unit of work on the worker pool.
pub enum Task {
    Deliver {
        pipeline: Arc<ExecutablePipeline>,
        buffer: SealedBuffer,
    },
    Reconfigure {
        pipeline: Arc<ExecutablePipeline>,
        message: ReconfigurationMessage,
    },
}

impl Task {
    fn subplan_id(&self) -> u64 {
        match self {
            Task::Deliver { pipeline, .. } => pipeline.subplan_id(),
            Task::Reconfigure { pipeline, .. } => pipeline.subplan_id(),
        }
    }

    fn query_id(&self) -> QueryId {
        match self {
            Task::Deliver { pipeline, .. } => pipeline.query_id(),
            Task::Reconfigure { pipeline, .. } => pipeline.query_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Running,
    Stopped,
    Completed,
    Failed(String),
}

struct QueryState {
    status: QueryStatus,
    expected_units: usize,
    completed_units: usize,
    accepting: bool,
}

pub struct QueryManager {
    queues: Vec<async_channel::Sender<Task>>,
    mode: PoolMode,
    queries: DashMap<QueryId, QueryState>,
    completions_tx: mpsc::Sender<PipelineCompletion>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl QueryManager {
    pub fn new(workers: usize, mode: PoolMode, pool: BufferManager) -> Arc<Self> {
        let workers = workers.max(1);
        let num_queues = match mode {
            PoolMode::Dynamic => 1,
            PoolMode::Static => workers,
        };
        let mut queues = Vec::with_capacity(num_queues);
        let mut receivers = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            let (tx, rx) = async_channel::bounded::<Task>(1024);
            queues.push(tx);
            receivers.push(rx);
        }
        let (completions_tx, completions_rx) = mpsc::channel(256);

        let manager = Arc::new(Self {
            queues,
            mode,
            queries: DashMap::new(),
            completions_tx,
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for worker_id in 0..workers {
            let rx = match mode {
                PoolMode::Dynamic => receivers[0].clone(),
                PoolMode::Static => receivers[worker_id].clone(),
            };
            let ctx = WorkerContext::new(worker_id, pool.clone());
            let me = manager.clone();
            handles.push(tokio::spawn(async move {
                me.worker_loop(rx, ctx).await;
            }));
        }
        let me = manager.clone();
        handles.push(tokio::spawn(async move {
            me.completion_loop(completions_rx).await;
        }));
        *manager.workers.lock() = handles;
        info!(workers, ?mode, "query manager started");
        manager
    }

    pub fn completion_sender(&self) -> mpsc::Sender<PipelineCompletion> {
        self.completions_tx.clone()
    }

    async fn worker_loop(&self, rx: async_channel::Receiver<Task>, ctx: WorkerContext) {
        while let Ok(task) = rx.recv().await {
            match task {
                Task::Deliver { pipeline, buffer } => {
                    if !self.is_accepting(pipeline.query_id()) {
                        debug!(
                            worker = ctx.worker_id(),
                            query = pipeline.query_id(),
                            "dropping buffer of stopped query"
                        );
                        continue;
                    }
                    // Failure propagation already ran inside execute.
                    let _ = pipeline.execute(buffer, &ctx).await;
                }
                Task::Reconfigure { pipeline, message } => {
                    pipeline.handle_reconfiguration(message).await;
                }
            }
        }
    }

    async fn completion_loop(&self, mut rx: mpsc::Receiver<PipelineCompletion>) {
        while let Some(completion) = rx.recv().await {
            self.note_completion(completion.query_id, completion.termination);
        }
    }

    /// Registers a query with the number of units (pipelines and sinks)
    /// whose completion marks the query terminal.
    pub fn register_query(&self, query_id: QueryId, expected_units: usize) {
        self.queries.insert(
            query_id,
            QueryState {
                status: QueryStatus::Running,
                expected_units,
                completed_units: 0,
                accepting: true,
            },
        );
        info!(query = query_id, units = expected_units, "query registered");
    }

    pub fn query_status(&self, query_id: QueryId) -> Option<QueryStatus> {
        self.queries.get(&query_id).map(|s| s.status.clone())
    }

    fn is_accepting(&self, query_id: QueryId) -> bool {
        self.queries
            .get(&query_id)
            .map(|s| s.accepting)
            .unwrap_or(true)
    }

    fn note_completion(&self, query_id: QueryId, termination: TerminationKind) {
        let Some(mut state) = self.queries.get_mut(&query_id) else {
            return;
        };
        state.completed_units += 1;
        match termination {
            TerminationKind::Failure => {
                state.status = QueryStatus::Failed("pipeline failed".to_string());
            }
            TerminationKind::HardStop => {
                if !matches!(state.status, QueryStatus::Failed(_)) {
                    state.status = QueryStatus::Stopped;
                }
            }
            TerminationKind::Graceful => {
                if state.completed_units >= state.expected_units
                    && state.status == QueryStatus::Running
                {
                    state.status = QueryStatus::Completed;
                }
            }
        }
        debug!(
            query = query_id,
            completed = state.completed_units,
            expected = state.expected_units,
            status = ?state.status,
            "unit completed"
        );
    }

    /// Source or sink completion uses the same accounting as pipelines.
    pub fn notify_unit_completion(&self, query_id: QueryId, termination: TerminationKind) {
        self.note_completion(query_id, termination);
    }

    pub fn fail_query(&self, query_id: QueryId, reason: impl Into<String>) {
        if let Some(mut state) = self.queries.get_mut(&query_id) {
            state.status = QueryStatus::Failed(reason.into());
            state.accepting = false;
        }
    }

    /// A hard stop prevents new buffer deliveries for the query; in-flight
    /// tasks complete.
    pub fn stop_accepting(&self, query_id: QueryId) {
        if let Some(mut state) = self.queries.get_mut(&query_id) {
            state.accepting = false;
        }
    }

    /// Enqueues a task on the pool. Static pools route by subplan so one
    /// subplan stays on one worker.
    pub async fn submit(&self, task: Task) -> Result<()> {
        if matches!(task, Task::Deliver { .. }) && !self.is_accepting(task.query_id()) {
            return Ok(());
        }
        let queue = match self.mode {
            PoolMode::Dynamic => &self.queues[0],
            PoolMode::Static => {
                let idx = (task.subplan_id() % self.queues.len() as u64) as usize;
                &self.queues[idx]
            }
        };
        queue
            .send(task)
            .await
            .map_err(|_| EngineError::ChannelClosed("worker pool queue"))
    }

    /// Closes the pool queues and aborts the worker tasks.
    pub fn shutdown(&self) {
        for queue in &self.queues {
            queue.close();
        }
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Forwards one input edge of a pipeline into the worker pool.
pub fn spawn_pipeline_driver(
    manager: Arc<QueryManager>,
    pipeline: Arc<ExecutablePipeline>,
    mut rx: mpsc::Receiver<PipelineMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let task = match message {
                PipelineMessage::Data(buffer) => Task::Deliver {
                    pipeline: pipeline.clone(),
                    buffer,
                },
                PipelineMessage::Control(message) => Task::Reconfigure {
                    pipeline: pipeline.clone(),
                    message,
                },
            };
            if manager.submit(task).await.is_err() {
                warn!(
                    pipeline = pipeline.pipeline_id(),
                    "worker pool gone, dropping edge"
                );
                break;
            }
        }
    })
}
