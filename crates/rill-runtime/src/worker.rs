//! Per-worker execution context.

use rill_core::buffer::BufferManager;

/// Handed to every stage execution; identifies the worker and gives access
/// to the local buffer pool.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: usize,
    pool: BufferManager,
}

impl WorkerContext {
    pub fn new(worker_id: usize, pool: BufferManager) -> Self {
        Self { worker_id, pool }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn pool(&self) -> &BufferManager {
        &self.pool
    }
}
