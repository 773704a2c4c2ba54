//! Chunk mapping for the mirror engine
//!
//! Maps byte ranges of a volume onto granularity-sized chunks. Chunks are the
//! atomic unit of dirty tracking and of range claims, so every conflict check
//! in the engine goes through this mapper.

/// Chunk identifier (index within a volume)
pub type ChunkId = u64;

/// A contiguous run of chunks covering a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// First chunk
    pub start: ChunkId,
    /// Number of chunks
    pub count: u64,
}

impl ChunkSpan {
    /// One past the last chunk
    pub fn end(&self) -> ChunkId {
        self.start + self.count
    }

    /// Whether two spans share at least one chunk
    pub fn overlaps(&self, other: &ChunkSpan) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Maps byte offsets to chunks
///
/// ```text
/// Volume (64MB, 1MB granularity)
/// ├── Chunk 0:  bytes 0 - 1MB
/// ├── Chunk 1:  bytes 1MB - 2MB
/// │   ...
/// └── Chunk 63: bytes 63MB - 64MB
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ChunkMapper {
    /// Chunk size in bytes
    granularity: u64,
}

impl ChunkMapper {
    /// Create a new chunk mapper with the specified granularity
    pub fn new(granularity: u64) -> Self {
        assert!(granularity > 0, "Granularity must be positive");
        assert!(
            granularity.is_power_of_two(),
            "Granularity should be a power of two"
        );
        Self { granularity }
    }

    /// Get the chunk size
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Convert a byte offset to a chunk ID
    pub fn chunk_of(&self, byte_offset: u64) -> ChunkId {
        byte_offset / self.granularity
    }

    /// Byte offset of the first byte of a chunk
    pub fn chunk_offset(&self, chunk_id: ChunkId) -> u64 {
        chunk_id * self.granularity
    }

    /// Chunks touched by `[offset, offset + bytes)`
    ///
    /// A partially covered trailing chunk counts as a whole chunk.
    pub fn span(&self, offset: u64, bytes: u64) -> ChunkSpan {
        let start = offset / self.granularity;
        let end = offset.saturating_add(bytes).div_ceil(self.granularity);
        ChunkSpan {
            start,
            count: end - start,
        }
    }

    /// Number of chunks needed for `bytes`
    pub fn chunks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.granularity)
    }
}

/// Clip `bytes` at `offset` so the range does not run past `length`
pub fn clip_bytes(length: u64, offset: u64, bytes: u64) -> u64 {
    bytes.min(length.saturating_sub(offset))
}

/// Expand `[offset, offset + bytes)` outward to `cluster`-aligned boundaries
///
/// Returns the aligned `(offset, bytes)`.
pub fn round_to_clusters(cluster: u64, offset: u64, bytes: u64) -> (u64, u64) {
    let start = offset - offset % cluster;
    let end = (offset + bytes).div_ceil(cluster) * cluster;
    (start, end - start)
}
