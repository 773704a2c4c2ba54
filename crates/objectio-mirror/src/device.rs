//! Uniform block device interface
//!
//! Concrete backends (files, network block devices, physical disks) are
//! reached only through [`BlockDevice`]. [`MemoryDevice`] is an in-memory
//! backend with allocation tracking and fault injection.

use crate::bitmap::Bitmap;
use crate::error::{MirrorError, MirrorResult};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Static characteristics of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Allocation granularity in bytes (0 = unknown)
    pub cluster_size: u64,
    /// Freshly created device reads as zeroes
    pub zero_init: bool,
    /// Zeroes can be written without transferring data (may unmap)
    pub write_zeroes_unmap: bool,
    /// Device has a backing image that is not attached yet, so partial
    /// cluster writes would lose the backing data
    pub cow_backing: bool,
    /// Maximum number of segments in one vectored request
    pub max_iov: usize,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            cluster_size: 0,
            zero_init: false,
            write_zeroes_unmap: false,
            cow_backing: false,
            max_iov: 1024,
        }
    }
}

/// Allocation status of a range, as reported by [`BlockDevice::block_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    /// Range holds data in the device itself
    pub data: bool,
    /// Range is known to read as zeroes
    pub zero: bool,
    /// Number of bytes from the queried offset sharing this status
    pub length: u64,
}

/// Which layers count as allocated for [`BlockDevice::is_allocated`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationScope {
    /// Anything allocated anywhere in the backing chain
    Chain,
    /// Allocated above the base snapshot point
    AboveBase,
    /// Allocated in the top layer only
    TopLayer,
}

/// Scatter list of buffers for vectored I/O
///
/// Segments are filled in order; only the last one may be shorter than the
/// others.
#[derive(Debug, Default)]
pub struct IoVec {
    segments: Vec<BytesMut>,
}

impl IoVec {
    /// Wrap pool buffers
    pub fn new(segments: Vec<BytesMut>) -> Self {
        Self { segments }
    }

    /// Single-segment vector holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            segments: vec![BytesMut::from(data)],
        }
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Whether the vector carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segments in order
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| &s[..])
    }

    /// Mutable segments in order
    pub fn segments_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.segments.iter_mut().map(|s| &mut s[..])
    }

    /// Concatenate all segments
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Give the buffers back
    pub fn into_segments(self) -> Vec<BytesMut> {
        self.segments
    }
}

/// Read/write/flush/discard/zero interface of a storage backend
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Node name used in logs and graph requests
    fn name(&self) -> &str;

    /// Static device characteristics
    fn info(&self) -> DeviceInfo;

    /// Device length in bytes
    async fn length(&self) -> MirrorResult<u64>;

    /// Fill `iov` with data starting at `offset`
    async fn read(&self, offset: u64, iov: &mut IoVec) -> MirrorResult<()>;

    /// Write `iov` at `offset`
    async fn write(&self, offset: u64, iov: &IoVec) -> MirrorResult<()>;

    /// Write zeroes without a data buffer
    async fn write_zeroes(&self, offset: u64, bytes: u64, may_unmap: bool) -> MirrorResult<()>;

    /// Discard a range
    async fn discard(&self, offset: u64, bytes: u64) -> MirrorResult<()>;

    /// Make completed writes durable
    async fn flush(&self) -> MirrorResult<()>;

    /// Allocation status of the range starting at `offset`
    async fn block_status(&self, offset: u64, bytes: u64) -> MirrorResult<BlockStatus>;

    /// Whether the range starting at `offset` is allocated within `scope`
    ///
    /// Returns the answer and the number of bytes it applies to.
    async fn is_allocated(
        &self,
        offset: u64,
        bytes: u64,
        scope: AllocationScope,
    ) -> MirrorResult<(bool, u64)>;
}

/// Allocation state of one unit of a [`MemoryDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not allocated anywhere, reads as zeroes
    Unallocated,
    /// Holds data in the top layer
    Data,
    /// Allocated as zeroes in the top layer
    Zero,
    /// Not allocated in the top layer, data comes from a backing layer
    Backing,
}

struct MemoryState {
    data: Vec<u8>,
    units: Vec<UnitState>,
    written: Bitmap,
}

/// In-memory block device
///
/// Allocation is tracked per `unit` bytes (the cluster size, or 64 KiB when
/// the device reports none).
pub struct MemoryDevice {
    name: String,
    info: DeviceInfo,
    unit: u64,
    state: RwLock<MemoryState>,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
    fail_flushes: AtomicU32,
    detached: AtomicBool,
    writes: AtomicU64,
    zero_writes: AtomicU64,
    discards: AtomicU64,
    flushes: AtomicU64,
}

const DEFAULT_UNIT: u64 = 64 * 1024;

impl MemoryDevice {
    /// Create a zero-filled, unallocated device
    pub fn new(name: impl Into<String>, length: u64, info: DeviceInfo) -> Self {
        let unit = if info.cluster_size > 0 {
            info.cluster_size
        } else {
            DEFAULT_UNIT
        };
        let units = length.div_ceil(unit) as usize;
        Self {
            name: name.into(),
            info,
            unit,
            state: RwLock::new(MemoryState {
                data: vec![0; length as usize],
                units: vec![UnitState::Unallocated; units],
                written: Bitmap::new(units as u64),
            }),
            fail_reads: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
            fail_flushes: AtomicU32::new(0),
            detached: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            zero_writes: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Store `data` at `offset` without going through the async interface
    pub fn fill(&self, offset: u64, data: &[u8]) {
        let mut state = self.state.write();
        Self::store(&mut state, self.unit, offset, data, UnitState::Data);
    }

    /// Store `data` at `offset` as if it came from a backing layer
    pub fn fill_backing(&self, offset: u64, data: &[u8]) {
        let mut state = self.state.write();
        Self::store(&mut state, self.unit, offset, data, UnitState::Backing);
    }

    /// Copy of the whole device contents
    pub fn contents(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }

    /// Copy of a range of the device contents
    pub fn read_range(&self, offset: u64, bytes: u64) -> Vec<u8> {
        let state = self.state.read();
        state.data[offset as usize..(offset + bytes) as usize].to_vec()
    }

    /// Allocation state of the unit containing `offset`
    pub fn unit_state(&self, offset: u64) -> UnitState {
        self.state.read().units[(offset / self.unit) as usize]
    }

    /// Whether any write, zero or discard touched the unit containing `offset`
    pub fn was_written(&self, offset: u64) -> bool {
        self.state.read().written.get(offset / self.unit)
    }

    /// Fail the next `count` reads
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` writes (including zero and discard requests)
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` flushes
    pub fn fail_next_flushes(&self, count: u32) {
        self.fail_flushes.store(count, Ordering::SeqCst);
    }

    /// Make every further request fail as if the device went away
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Number of data writes served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of write-zeroes requests served
    pub fn zero_write_count(&self) -> u64 {
        self.zero_writes.load(Ordering::SeqCst)
    }

    /// Number of discards served
    pub fn discard_count(&self) -> u64 {
        self.discards.load(Ordering::SeqCst)
    }

    /// Number of flushes served
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn store(state: &mut MemoryState, unit: u64, offset: u64, data: &[u8], kind: UnitState) {
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        Self::set_units(state, unit, offset, data.len() as u64, kind);
    }

    fn set_units(state: &mut MemoryState, unit: u64, offset: u64, bytes: u64, kind: UnitState) {
        if bytes == 0 {
            return;
        }
        let first = offset / unit;
        let last = (offset + bytes).div_ceil(unit);
        for index in first..last {
            state.units[index as usize] = kind;
        }
        if kind != UnitState::Backing {
            state.written.set_range(first, last - first);
        }
    }

    fn check(&self, op: &'static str, offset: u64, bytes: u64) -> MirrorResult<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(MirrorError::DeviceDetached(self.name.clone()));
        }
        let length = self.state.read().data.len() as u64;
        if offset.saturating_add(bytes) > length {
            return Err(MirrorError::io(
                op,
                offset,
                bytes,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "request past end of device"),
            ));
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(op: &'static str, offset: u64, bytes: u64) -> MirrorError {
        MirrorError::io(
            op,
            offset,
            bytes,
            std::io::Error::other("injected I/O error"),
        )
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        self.info
    }

    async fn length(&self) -> MirrorResult<u64> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(MirrorError::DeviceDetached(self.name.clone()));
        }
        Ok(self.state.read().data.len() as u64)
    }

    async fn read(&self, offset: u64, iov: &mut IoVec) -> MirrorResult<()> {
        tokio::task::yield_now().await;
        let bytes = iov.len();
        self.check("read", offset, bytes)?;
        if Self::take_fault(&self.fail_reads) {
            return Err(Self::injected("read", offset, bytes));
        }

        let state = self.state.read();
        let mut pos = offset as usize;
        for segment in iov.segments_mut() {
            segment.copy_from_slice(&state.data[pos..pos + segment.len()]);
            pos += segment.len();
        }
        Ok(())
    }

    async fn write(&self, offset: u64, iov: &IoVec) -> MirrorResult<()> {
        tokio::task::yield_now().await;
        let bytes = iov.len();
        self.check("write", offset, bytes)?;
        if Self::take_fault(&self.fail_writes) {
            return Err(Self::injected("write", offset, bytes));
        }

        let mut state = self.state.write();
        let mut pos = offset;
        for segment in iov.segments() {
            Self::store(&mut state, self.unit, pos, segment, UnitState::Data);
            pos += segment.len() as u64;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, may_unmap: bool) -> MirrorResult<()> {
        tokio::task::yield_now().await;
        self.check("write_zeroes", offset, bytes)?;
        if Self::take_fault(&self.fail_writes) {
            return Err(Self::injected("write_zeroes", offset, bytes));
        }

        let mut state = self.state.write();
        let start = offset as usize;
        state.data[start..start + bytes as usize].fill(0);
        let kind = if may_unmap && self.info.zero_init {
            UnitState::Unallocated
        } else {
            UnitState::Zero
        };
        Self::set_units(&mut state, self.unit, offset, bytes, kind);
        self.zero_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(&self, offset: u64, bytes: u64) -> MirrorResult<()> {
        tokio::task::yield_now().await;
        self.check("discard", offset, bytes)?;
        if Self::take_fault(&self.fail_writes) {
            return Err(Self::injected("discard", offset, bytes));
        }

        let mut state = self.state.write();
        let start = offset as usize;
        state.data[start..start + bytes as usize].fill(0);
        Self::set_units(&mut state, self.unit, offset, bytes, UnitState::Unallocated);
        self.discards.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> MirrorResult<()> {
        tokio::task::yield_now().await;
        self.check("flush", 0, 0)?;
        if Self::take_fault(&self.fail_flushes) {
            return Err(Self::injected("flush", 0, 0));
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> MirrorResult<BlockStatus> {
        tokio::task::yield_now().await;
        self.check("block_status", offset, bytes)?;

        let state = self.state.read();
        let end = offset + bytes;
        let first = state.units[(offset / self.unit) as usize];
        let mut pos = (offset / self.unit + 1) * self.unit;
        while pos < end && state.units[(pos / self.unit) as usize] == first {
            pos += self.unit;
        }

        let (data, zero) = match first {
            UnitState::Data => (true, false),
            UnitState::Zero | UnitState::Unallocated => (false, true),
            UnitState::Backing => (false, false),
        };
        Ok(BlockStatus {
            data,
            zero,
            length: pos.min(end) - offset,
        })
    }

    async fn is_allocated(
        &self,
        offset: u64,
        bytes: u64,
        scope: AllocationScope,
    ) -> MirrorResult<(bool, u64)> {
        tokio::task::yield_now().await;
        self.check("is_allocated", offset, bytes)?;

        let allocated = |state: UnitState| match state {
            UnitState::Data | UnitState::Zero => true,
            UnitState::Backing => scope == AllocationScope::Chain,
            UnitState::Unallocated => false,
        };

        let state = self.state.read();
        let end = offset + bytes;
        let first = allocated(state.units[(offset / self.unit) as usize]);
        let mut pos = (offset / self.unit + 1) * self.unit;
        while pos < end && allocated(state.units[(pos / self.unit) as usize]) == first {
            pos += self.unit;
        }
        Ok((first, pos.min(end) - offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;

    fn device() -> MemoryDevice {
        MemoryDevice::new(
            "mem0",
            1024 * KB,
            DeviceInfo {
                cluster_size: 64 * KB,
                zero_init: true,
                write_zeroes_unmap: true,
                ..DeviceInfo::default()
            },
        )
    }

    #[tokio::test]
    async fn test_vectored_read_write() {
        let dev = device();
        let mut iov = IoVec::new(vec![BytesMut::zeroed(4), BytesMut::zeroed(2)]);
        for (i, segment) in iov.segments_mut().enumerate() {
            segment.fill(i as u8 + 1);
        }
        dev.write(10, &iov).await.unwrap();
        assert_eq!(dev.read_range(10, 6), vec![1, 1, 1, 1, 2, 2]);

        let mut out = IoVec::new(vec![BytesMut::zeroed(3), BytesMut::zeroed(3)]);
        dev.read(10, &mut out).await.unwrap();
        assert_eq!(out.to_vec(), vec![1, 1, 1, 1, 2, 2]);
        assert_eq!(dev.write_count(), 1);
    }

    #[tokio::test]
    async fn test_block_status_runs() {
        let dev = device();
        dev.fill(0, &vec![7u8; 128 * KB as usize]);

        let status = dev.block_status(0, 1024 * KB).await.unwrap();
        assert_eq!(
            status,
            BlockStatus {
                data: true,
                zero: false,
                length: 128 * KB
            }
        );

        let status = dev.block_status(128 * KB, 1024 * KB - 128 * KB).await.unwrap();
        assert!(!status.data);
        assert!(status.zero);
        assert_eq!(status.length, 896 * KB);
    }

    #[tokio::test]
    async fn test_allocation_scopes() {
        let dev = device();
        dev.fill_backing(0, &vec![1u8; 64 * KB as usize]);
        dev.fill(64 * KB, &vec![2u8; 64 * KB as usize]);

        let (alloc, len) = dev
            .is_allocated(0, 256 * KB, AllocationScope::Chain)
            .await
            .unwrap();
        assert!(alloc);
        assert_eq!(len, 128 * KB);

        let (alloc, len) = dev
            .is_allocated(0, 256 * KB, AllocationScope::TopLayer)
            .await
            .unwrap();
        assert!(!alloc);
        assert_eq!(len, 64 * KB);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let dev = device();
        dev.fail_next_writes(1);
        let iov = IoVec::from_slice(&[1, 2, 3]);
        assert!(dev.write(0, &iov).await.unwrap_err().is_transient());
        dev.write(0, &iov).await.unwrap();

        dev.detach();
        assert!(dev.flush().await.unwrap_err().is_fatal());
    }
}
