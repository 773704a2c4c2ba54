#![allow(clippy::result_large_err)]
//! ObjectIO Volume Mirroring
//!
//! This crate copies a live block volume onto a target device while the
//! volume keeps serving guest I/O. Writes made during the copy are tracked in
//! a dirty bitmap and copied again until source and target converge, at which
//! point the target can be spliced in place of the source.
//!
//! # Features
//!
//! - **Live copy**: Guest I/O continues through a mirror overlay
//! - **Sparse aware**: Zero and unallocated ranges become zero or discard requests
//! - **Bounded resources**: Fixed buffer pool, at most 16 operations in flight
//! - **Rate limiting**: Slice-based throughput cap, adjustable at runtime
//! - **Error policies**: Report, ignore or stop per transfer direction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Guest I/O     │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐      ┌─────────────────┐
//! │  MirrorOverlay  │─────►│  DirtyTracker   │
//! └────────┬────────┘      └────────┬────────┘
//!          │                        │
//! ┌────────▼────────┐      ┌────────▼────────┐
//! │     Source      │◄─────│  Job Controller │
//! └─────────────────┘      │  - Registry     │
//!                          │  - BufferPool   │
//!                          │  - RateLimiter  │
//!                          └────────┬────────┘
//!                                   │
//!                          ┌────────▼────────┐
//!                          │     Target      │
//!                          └─────────────────┘
//! ```

pub mod bitmap;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod device;
pub mod dirty;
pub mod error;
pub mod graph;
mod iteration;
pub mod job;
pub mod metrics;
mod operation;
pub mod overlay;
pub mod ratelimit;
pub mod registry;

pub use bitmap::Bitmap;
pub use buffer::BufferPool;
pub use chunk::{ChunkId, ChunkMapper, ChunkSpan};
pub use config::{ErrorAction, MirrorConfig, SyncMode};
pub use device::{AllocationScope, BlockDevice, BlockStatus, DeviceInfo, IoVec, MemoryDevice};
pub use dirty::{DirtyBitmap, DirtyIter, DirtyTracker, LockedDirtyTracker};
pub use error::{IoDirection, MirrorError, MirrorResult};
pub use graph::{GraphEvent, RecordingGraph, StorageGraph};
pub use job::{JobOutcome, JobStatus, Layout, MirrorJob, MirrorPhase};
pub use metrics::PrometheusExporter;
pub use overlay::MirrorOverlay;
pub use ratelimit::{RateLimiter, SLICE_TIME};
pub use registry::{Claim, InFlightRegistry, OpId, OpKind};

/// Maximum number of copy, zero and discard operations in flight
pub const MAX_IN_FLIGHT: usize = 16;

/// Lower bound of the data bytes handed to operations in one step
pub const MAX_IO_BYTES: u64 = 1024 * 1024;

/// Default buffer pool size
pub const DEFAULT_BUF_SIZE: u64 = 16 * 1024 * 1024;

/// Smallest accepted granularity
pub const MIN_GRANULARITY: u64 = 512;

/// Largest accepted granularity
pub const MAX_GRANULARITY: u64 = 64 * 1024 * 1024;
