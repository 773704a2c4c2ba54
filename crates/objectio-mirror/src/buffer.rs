//! Bounded pool of copy buffers
//!
//! The pool is carved into granularity-sized buffers once, when the job
//! starts. Copy operations take whole sets of buffers and hand them back on
//! completion; a request that cannot be fully satisfied waits until enough
//! buffers are released, which caps the number of concurrent copies.

use crate::error::{MirrorError, MirrorResult};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Granularity-sized buffer pool
#[derive(Debug)]
pub struct BufferPool {
    granularity: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
    released: Notify,
}

impl BufferPool {
    /// Create a pool of `buf_size / granularity` buffers
    pub fn new(buf_size: u64, granularity: u64) -> Self {
        let granularity = granularity as usize;
        let capacity = (buf_size as usize / granularity).max(1);
        let free = (0..capacity).map(|_| BytesMut::zeroed(granularity)).collect();
        Self {
            granularity,
            capacity,
            free: Mutex::new(free),
            released: Notify::new(),
        }
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of each buffer
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Number of buffers currently free
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Take `count` buffers if that many are free right now
    pub fn try_acquire(&self, count: usize) -> Option<Vec<BytesMut>> {
        let mut free = self.free.lock();
        if free.len() < count {
            return None;
        }
        let at = free.len() - count;
        Some(free.split_off(at))
    }

    /// Take `count` buffers, waiting until that many are free
    ///
    /// There is no partial acquisition: the caller gets all of them or keeps
    /// waiting.
    pub async fn acquire(&self, count: usize) -> MirrorResult<Vec<BytesMut>> {
        if count > self.capacity {
            return Err(MirrorError::Internal(format!(
                "requested {count} buffers from a pool of {}",
                self.capacity
            )));
        }

        loop {
            let released = self.released.notified();
            if let Some(buffers) = self.try_acquire(count) {
                return Ok(buffers);
            }
            trace!(count, free = self.free_count(), "waiting for buffers");
            released.await;
        }
    }

    /// Return buffers to the free list
    pub fn release(&self, buffers: Vec<BytesMut>) {
        if buffers.is_empty() {
            return;
        }
        {
            let mut free = self.free.lock();
            for mut buffer in buffers {
                // The last segment of a copy may have been shortened
                buffer.resize(self.granularity, 0);
                free.push(buffer);
            }
            debug_assert!(free.len() <= self.capacity);
        }
        self.released.notify_waiters();
    }
}
