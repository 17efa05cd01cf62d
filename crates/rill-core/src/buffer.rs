//! Pooled tuple buffers, the sole unit of data exchange between stages.
//!
//! A [`TupleBuffer`] is a fixed-size contiguous byte region plus metadata
//! (tuple count, origin, sequence number, watermark). It is acquired from a
//! [`BufferManager`] pool, filled by exactly one writer, then [`sealed`]
//! into a read-only [`SealedBuffer`] that can be shared cheaply between any
//! number of readers. The backing bytes return to the pool when the last
//! handle drops, so steady-state allocation is O(1) and hand-off is
//! zero-copy.
//!
//! [`sealed`]: TupleBuffer::seal

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{EngineError, Result};
use crate::{OriginId, SequenceNumber, WatermarkTs};

/// Metadata carried by every buffer alongside its payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferMeta {
    pub number_of_tuples: u64,
    pub origin_id: OriginId,
    pub sequence_number: SequenceNumber,
    pub watermark_ts: WatermarkTs,
}

struct PoolInner {
    buffer_size: usize,
    num_buffers: usize,
    free: Mutex<Vec<BytesMut>>,
    available: AtomicUsize,
    returned: Notify,
}

impl PoolInner {
    fn pop(&self) -> Option<BytesMut> {
        let data = self.free.lock().pop();
        if data.is_some() {
            self.available.fetch_sub(1, Ordering::AcqRel);
        }
        data
    }

    fn release(&self, data: BytesMut) {
        let mut free = self.free.lock();
        // A free list longer than the pool means somebody released twice.
        debug_assert!(
            free.len() < self.num_buffers,
            "buffer released twice into pool of {} buffers",
            self.num_buffers
        );
        free.push(data);
        drop(free);
        self.available.fetch_add(1, Ordering::AcqRel);
        self.returned.notify_one();
    }
}

/// Hands out fixed-size buffers from a bounded pool and reclaims them
/// automatically when the last owning handle drops.
///
/// Cloning the manager is cheap; clones share the same pool.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<PoolInner>,
}

impl BufferManager {
    /// Creates a pool of `num_buffers` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, num_buffers: usize) -> Self {
        let free = (0..num_buffers)
            .map(|_| BytesMut::zeroed(buffer_size))
            .collect::<Vec<_>>();
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                num_buffers,
                free: Mutex::new(free),
                available: AtomicUsize::new(num_buffers),
                returned: Notify::new(),
            }),
        }
    }

    /// Acquires a buffer, waiting for one to be released if the pool is drained.
    pub async fn acquire(&self) -> TupleBuffer {
        loop {
            let returned = self.inner.returned.notified();
            if let Some(data) = self.inner.pop() {
                return self.wrap(data);
            }
            returned.await;
        }
    }

    /// Non-blocking acquisition. Fails with [`EngineError::ResourceExhausted`]
    /// when the pool is drained.
    pub fn try_acquire(&self) -> Result<TupleBuffer> {
        match self.inner.pop() {
            Some(data) => Ok(self.wrap(data)),
            None => Err(EngineError::ResourceExhausted(format!(
                "pool of {} buffers drained",
                self.inner.num_buffers
            ))),
        }
    }

    /// Allocates a variable-size buffer outside the pool accounting, for
    /// control messages whose size is not known up front.
    pub fn acquire_unpooled(&self, size: usize) -> TupleBuffer {
        TupleBuffer {
            data: BytesMut::zeroed(size),
            meta: BufferMeta::default(),
            pool: None,
        }
    }

    fn wrap(&self, mut data: BytesMut) -> TupleBuffer {
        if data.len() < self.inner.buffer_size {
            data.resize(self.inner.buffer_size, 0);
        }
        TupleBuffer {
            data,
            meta: BufferMeta::default(),
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Byte capacity of every pooled buffer; constant for the pool lifetime.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Total number of buffers owned by the pool.
    pub fn pool_size(&self) -> usize {
        self.inner.num_buffers
    }

    /// Number of buffers currently held by writers or readers.
    pub fn in_flight(&self) -> usize {
        self.pool_size() - self.available()
    }
}

/// A writable fixed-size buffer exclusively owned by one writer.
///
/// Dropping an unsealed buffer returns its bytes to the pool.
pub struct TupleBuffer {
    data: BytesMut,
    meta: BufferMeta,
    pool: Option<Arc<PoolInner>>,
}

impl TupleBuffer {
    pub fn capacity_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.meta.number_of_tuples
    }

    pub fn set_number_of_tuples(&mut self, n: u64) {
        self.meta.number_of_tuples = n;
    }

    pub fn origin_id(&self) -> OriginId {
        self.meta.origin_id
    }

    pub fn set_origin_id(&mut self, origin: OriginId) {
        self.meta.origin_id = origin;
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.meta.sequence_number
    }

    pub fn set_sequence_number(&mut self, seq: SequenceNumber) {
        self.meta.sequence_number = seq;
    }

    pub fn watermark(&self) -> WatermarkTs {
        self.meta.watermark_ts
    }

    pub fn set_watermark(&mut self, ts: WatermarkTs) {
        self.meta.watermark_ts = ts;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Seals the buffer: no further writes, readers may share it freely.
    pub fn seal(mut self) -> SealedBuffer {
        let data = std::mem::take(&mut self.data);
        let meta = self.meta.clone();
        let pool = self.pool.take();
        SealedBuffer {
            inner: Arc::new(SealedInner { data, meta, pool }),
        }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity_bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

struct SealedInner {
    data: BytesMut,
    meta: BufferMeta,
    pool: Option<Arc<PoolInner>>,
}

impl Drop for SealedInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

/// A sealed, read-only buffer shared between readers.
///
/// Clones share the same bytes; the last clone to drop returns them to the
/// pool.
#[derive(Clone)]
pub struct SealedBuffer {
    inner: Arc<SealedInner>,
}

impl SealedBuffer {
    pub fn bytes(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.data.len()
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.inner.meta.number_of_tuples
    }

    pub fn origin_id(&self) -> OriginId {
        self.inner.meta.origin_id
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.inner.meta.sequence_number
    }

    pub fn watermark(&self) -> WatermarkTs {
        self.inner.meta.watermark_ts
    }

    /// Bytes actually occupied by records, given the record width.
    pub fn used_bytes(&self, record_size: usize) -> usize {
        (self.inner.meta.number_of_tuples as usize * record_size).min(self.inner.data.len())
    }
}

impl std::fmt::Debug for SealedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBuffer")
            .field("capacity_bytes", &self.inner.data.len())
            .field("meta", &self.inner.meta)
            .finish()
    }
}
