//! Mirror overlay
//!
//! Sits in front of the source while a job runs. Guest I/O is forwarded to
//! the source unchanged; every range a guest write, zero or discard touched
//! is marked dirty once the request returns, so the engine copies it again.
//!
//! The overlay also provides the drain gate used when the job converges:
//! holding the gate blocks new guest writes and waits out the ones already
//! running.

use crate::device::{AllocationScope, BlockDevice, BlockStatus, DeviceInfo, IoVec};
use crate::dirty::DirtyTracker;
use crate::error::MirrorResult;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, trace};

/// Guest-facing filter that records writes into the dirty tracker
pub struct MirrorOverlay {
    name: String,
    source: Arc<dyn BlockDevice>,
    tracker: Arc<dyn DirtyTracker>,
    gate: Arc<RwLock<()>>,
    detached: AtomicBool,
}

impl MirrorOverlay {
    pub fn new(source: Arc<dyn BlockDevice>, tracker: Arc<dyn DirtyTracker>) -> Self {
        Self {
            name: format!("{}-mirror-top", source.name()),
            source,
            tracker,
            gate: Arc::new(RwLock::new(())),
            detached: AtomicBool::new(false),
        }
    }

    /// Wait for in-flight guest writes and hold off new ones
    ///
    /// Writes resume once the returned guard is dropped.
    pub async fn drain(&self) -> OwnedRwLockWriteGuard<()> {
        let guard = Arc::clone(&self.gate).write_owned().await;
        trace!(overlay = %self.name, "guest writes drained");
        guard
    }

    /// Stop recording writes; requests keep being forwarded
    pub fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            debug!(overlay = %self.name, "overlay detached");
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Mark a finished guest request dirty
    ///
    /// Requests the source rejected as out of range never touched it.
    fn record(&self, offset: u64, bytes: u64, result: &MirrorResult<()>) {
        if self.is_detached() || matches!(result, Err(err) if err.is_out_of_range()) {
            return;
        }
        self.tracker.mark(offset, bytes);
    }
}

#[async_trait]
impl BlockDevice for MirrorOverlay {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        self.source.info()
    }

    async fn length(&self) -> MirrorResult<u64> {
        self.source.length().await
    }

    async fn read(&self, offset: u64, iov: &mut IoVec) -> MirrorResult<()> {
        self.source.read(offset, iov).await
    }

    async fn write(&self, offset: u64, iov: &IoVec) -> MirrorResult<()> {
        let _gate = self.gate.read().await;
        let result = self.source.write(offset, iov).await;
        // A failed write may still have changed part of the range
        self.record(offset, iov.len(), &result);
        result
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, may_unmap: bool) -> MirrorResult<()> {
        let _gate = self.gate.read().await;
        let result = self.source.write_zeroes(offset, bytes, may_unmap).await;
        self.record(offset, bytes, &result);
        result
    }

    async fn discard(&self, offset: u64, bytes: u64) -> MirrorResult<()> {
        let _gate = self.gate.read().await;
        let result = self.source.discard(offset, bytes).await;
        self.record(offset, bytes, &result);
        result
    }

    async fn flush(&self) -> MirrorResult<()> {
        self.source.flush().await
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> MirrorResult<BlockStatus> {
        self.source.block_status(offset, bytes).await
    }

    async fn is_allocated(
        &self,
        offset: u64,
        bytes: u64,
        scope: AllocationScope,
    ) -> MirrorResult<(bool, u64)> {
        self.source.is_allocated(offset, bytes, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::dirty::DirtyBitmap;
    use std::time::Duration;

    const KB: u64 = 1024;

    fn overlay() -> (Arc<MemoryDevice>, Arc<DirtyBitmap>, MirrorOverlay) {
        let source = Arc::new(MemoryDevice::new("src", 1024 * KB, DeviceInfo::default()));
        let tracker = Arc::new(DirtyBitmap::new(1024 * KB, 64 * KB));
        let overlay = MirrorOverlay::new(source.clone(), tracker.clone());
        (source, tracker, overlay)
    }

    #[tokio::test]
    async fn test_writes_are_forwarded_and_recorded() {
        let (source, tracker, overlay) = overlay();
        assert_eq!(overlay.name(), "src-mirror-top");

        overlay
            .write(70 * KB, &IoVec::from_slice(&[9u8; 16]))
            .await
            .unwrap();
        assert_eq!(source.read_range(70 * KB, 16), vec![9u8; 16]);
        assert!(tracker.lock().is_dirty(64 * KB));

        overlay.discard(512 * KB, 128 * KB).await.unwrap();
        assert_eq!(tracker.count(), 3);

        let mut iov = IoVec::from_slice(&[0u8; 16]);
        overlay.read(70 * KB, &mut iov).await.unwrap();
        assert_eq!(iov.to_vec(), vec![9u8; 16]);
    }

    #[tokio::test]
    async fn test_failed_write_is_still_recorded() {
        let (source, tracker, overlay) = overlay();
        source.fail_next_writes(1);
        assert!(overlay.write(0, &IoVec::from_slice(&[1u8; 4])).await.is_err());
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_write_is_not_recorded() {
        let (_source, tracker, overlay) = overlay();
        let err = overlay
            .write(u64::MAX - 2, &IoVec::from_slice(&[1u8; 4]))
            .await
            .unwrap_err();
        assert!(err.is_out_of_range());
        assert!(overlay.discard(u64::MAX - KB, 2 * KB).await.is_err());
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_detached_overlay_stops_recording() {
        let (source, tracker, overlay) = overlay();
        overlay.detach();
        overlay.write(0, &IoVec::from_slice(&[1u8; 4])).await.unwrap();
        assert_eq!(source.read_range(0, 4), vec![1u8; 4]);
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_blocks_writes() {
        let (source, _tracker, overlay) = overlay();
        let overlay = Arc::new(overlay);
        let guard = overlay.drain().await;

        let writer = {
            let overlay = Arc::clone(&overlay);
            tokio::spawn(async move { overlay.write(0, &IoVec::from_slice(&[5u8; 4])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(source.read_range(0, 4), vec![0u8; 4]);

        drop(guard);
        writer.await.unwrap().unwrap();
        assert_eq!(source.read_range(0, 4), vec![5u8; 4]);
    }
}
