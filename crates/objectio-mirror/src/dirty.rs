//! Dirty region tracking
//!
//! The engine consumes dirty state through [`DirtyTracker`]: a lockable,
//! chunk-granular set of regions where source and target may differ. The
//! on-disk representation (if any) belongs to the implementor.
//! [`DirtyBitmap`] is the in-memory implementation used by default.

use crate::bitmap::Bitmap;
use crate::chunk::ChunkMapper;

use parking_lot::{Mutex, MutexGuard};

/// Lockable dirty-region tracker
///
/// All offsets are in bytes; implementations round ranges outward to whole
/// chunks.
pub trait DirtyTracker: Send + Sync {
    /// Tracking granularity in bytes
    fn granularity(&self) -> u64;

    /// Number of chunks the tracker covers
    fn chunks(&self) -> u64;

    /// Take the tracker lock
    ///
    /// The guard must never be held across an `.await`.
    fn lock(&self) -> Box<dyn LockedDirtyTracker + '_>;

    /// Mark a byte range dirty
    fn mark(&self, offset: u64, bytes: u64) {
        self.lock().mark(offset, bytes);
    }

    /// Number of dirty chunks
    fn count(&self) -> u64 {
        self.lock().count()
    }

    /// Number of dirty bytes
    fn dirty_bytes(&self) -> u64 {
        self.count() * self.granularity()
    }
}

/// Operations available while the tracker lock is held
pub trait LockedDirtyTracker {
    /// Mark a byte range dirty
    fn mark(&mut self, offset: u64, bytes: u64);

    /// Clear a byte range
    fn clear(&mut self, offset: u64, bytes: u64);

    /// Whether the chunk containing `offset` is dirty
    fn is_dirty(&self, offset: u64) -> bool;

    /// Offset of the first dirty chunk at or after `offset`
    fn next_dirty(&self, offset: u64) -> Option<u64>;

    /// Number of dirty chunks
    fn count(&self) -> u64;
}

/// Restartable cursor over dirty chunks
///
/// The cursor itself is not protected; callers pass the locked tracker on
/// every step.
#[derive(Debug, Default, Clone)]
pub struct DirtyIter {
    cursor: u64,
}

impl DirtyIter {
    /// Create a cursor positioned at the start of the volume
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next dirty chunk offset and move past it
    pub fn next_offset(
        &mut self,
        tracker: &dyn LockedDirtyTracker,
        granularity: u64,
    ) -> Option<u64> {
        let offset = tracker.next_dirty(self.cursor)?;
        self.cursor = offset + granularity;
        Some(offset)
    }

    /// Reposition the cursor
    pub fn reset(&mut self, offset: u64) {
        self.cursor = offset;
    }
}

/// In-memory dirty bitmap
#[derive(Debug)]
pub struct DirtyBitmap {
    mapper: ChunkMapper,
    bits: Mutex<Bitmap>,
}

impl DirtyBitmap {
    /// Create a clean bitmap covering `length` bytes
    pub fn new(length: u64, granularity: u64) -> Self {
        let mapper = ChunkMapper::new(granularity);
        Self {
            bits: Mutex::new(Bitmap::new(mapper.chunks_for(length))),
            mapper,
        }
    }
}

impl DirtyTracker for DirtyBitmap {
    fn granularity(&self) -> u64 {
        self.mapper.granularity()
    }

    fn chunks(&self) -> u64 {
        self.bits.lock().len()
    }

    fn lock(&self) -> Box<dyn LockedDirtyTracker + '_> {
        Box::new(DirtyBitmapGuard {
            bits: self.bits.lock(),
            mapper: self.mapper,
        })
    }
}

struct DirtyBitmapGuard<'a> {
    bits: MutexGuard<'a, Bitmap>,
    mapper: ChunkMapper,
}

impl LockedDirtyTracker for DirtyBitmapGuard<'_> {
    fn mark(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let span = self.mapper.span(offset, bytes);
        self.bits.set_range(span.start, span.count);
    }

    fn clear(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let span = self.mapper.span(offset, bytes);
        self.bits.clear_range(span.start, span.count);
    }

    fn is_dirty(&self, offset: u64) -> bool {
        self.bits.get(self.mapper.chunk_of(offset))
    }

    fn next_dirty(&self, offset: u64) -> Option<u64> {
        let start = self.mapper.chunk_of(offset);
        let len = self.bits.len();
        self.bits
            .next_set(start, len)
            .map(|chunk| self.mapper.chunk_offset(chunk))
    }

    fn count(&self) -> u64 {
        self.bits.count_ones()
    }
}
