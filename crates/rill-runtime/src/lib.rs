//! # Rill Runtime - Pipelines and Query Management
//!
//! The worker-side execution layer: compiled pipeline stages, the
//! fan-in-counted executable pipeline, worker pools with dynamic or static
//! task queues, and the node engine that assembles buffer, query and
//! network managers into a deployable runtime. All managers are per-engine
//! objects handed around explicitly; there are no process-wide singletons.

pub mod engine;
pub mod pipeline;
pub mod query;
pub mod stage;
pub mod worker;

pub use engine::{NodeEngine, RunningQuery};
pub use pipeline::{ExecutablePipeline, PipelineCompletion, PipelineStatus};
pub use query::{spawn_pipeline_driver, QueryManager, QueryStatus, Task};
pub use stage::{
    AggregationBuildStage, ExecutableStage, JoinBuildStage, PassthroughStage, StageOutput,
};
pub use worker::WorkerContext;
