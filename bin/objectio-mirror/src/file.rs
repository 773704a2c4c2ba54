//! File-backed block device
//!
//! Raw image files accessed with positioned reads and writes on the blocking
//! thread pool. Plain files carry no allocation information, so every range
//! reports as data.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use objectio_mirror::{
    AllocationScope, BlockDevice, BlockStatus, DeviceInfo, IoVec, MirrorError, MirrorResult,
};

/// Largest zero buffer written in one request
const ZERO_CHUNK: u64 = 1024 * 1024;

pub struct FileDevice {
    name: String,
    file: Arc<File>,
    length: u64,
}

impl FileDevice {
    /// Open an existing image
    pub fn open(path: &Path, writable: bool) -> MirrorResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| MirrorError::io("open", 0, 0, e))?;
        let length = file
            .metadata()
            .map_err(|e| MirrorError::io("stat", 0, 0, e))?
            .len();
        Ok(Self {
            name: path.display().to_string(),
            file: Arc::new(file),
            length,
        })
    }

    fn check(&self, op: &'static str, offset: u64, bytes: u64) -> MirrorResult<()> {
        if offset.saturating_add(bytes) > self.length {
            return Err(MirrorError::io(
                op,
                offset,
                bytes,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "request past end of image"),
            ));
        }
        Ok(())
    }

    async fn blocking<T, F>(
        &self,
        op: &'static str,
        offset: u64,
        bytes: u64,
        f: F,
    ) -> MirrorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || f(&file))
            .await
            .map_err(|e| MirrorError::Internal(format!("{op} task failed: {e}")))?
            .map_err(|e| MirrorError::io(op, offset, bytes, e))
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo::default()
    }

    async fn length(&self) -> MirrorResult<u64> {
        Ok(self.length)
    }

    async fn read(&self, offset: u64, iov: &mut IoVec) -> MirrorResult<()> {
        let bytes = iov.len();
        self.check("read", offset, bytes)?;
        let data = self
            .blocking("read", offset, bytes, move |file| {
                let mut buf = vec![0u8; bytes as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            })
            .await?;

        let mut pos = 0;
        for segment in iov.segments_mut() {
            segment.copy_from_slice(&data[pos..pos + segment.len()]);
            pos += segment.len();
        }
        Ok(())
    }

    async fn write(&self, offset: u64, iov: &IoVec) -> MirrorResult<()> {
        let bytes = iov.len();
        self.check("write", offset, bytes)?;
        let data = iov.to_vec();
        self.blocking("write", offset, bytes, move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, _may_unmap: bool) -> MirrorResult<()> {
        self.check("write_zeroes", offset, bytes)?;
        self.blocking("write_zeroes", offset, bytes, move |file| {
            let zeroes = vec![0u8; bytes.min(ZERO_CHUNK) as usize];
            let mut pos = offset;
            let end = offset + bytes;
            while pos < end {
                let len = (end - pos).min(ZERO_CHUNK) as usize;
                file.write_all_at(&zeroes[..len], pos)?;
                pos += len as u64;
            }
            Ok(())
        })
        .await
    }

    async fn discard(&self, offset: u64, bytes: u64) -> MirrorResult<()> {
        // Discarded ranges of a raw image read back as zeroes
        self.write_zeroes(offset, bytes, true).await
    }

    async fn flush(&self) -> MirrorResult<()> {
        self.blocking("flush", 0, 0, File::sync_data).await
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> MirrorResult<BlockStatus> {
        self.check("block_status", offset, bytes)?;
        Ok(BlockStatus {
            data: true,
            zero: false,
            length: bytes,
        })
    }

    async fn is_allocated(
        &self,
        offset: u64,
        bytes: u64,
        _scope: AllocationScope,
    ) -> MirrorResult<(bool, u64)> {
        self.check("is_allocated", offset, bytes)?;
        Ok((true, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectio_mirror::{JobOutcome, MirrorConfig, MirrorJob, RecordingGraph};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_write() {
        let file = image(&[0u8; 8192]);
        let device = FileDevice::open(file.path(), true).unwrap();
        assert_eq!(device.length().await.unwrap(), 8192);

        device
            .write(100, &IoVec::from_slice(&[7u8; 50]))
            .await
            .unwrap();
        let mut iov = IoVec::from_slice(&[0u8; 60]);
        device.read(95, &mut iov).await.unwrap();
        let data = iov.to_vec();
        assert_eq!(&data[..5], &[0u8; 5]);
        assert_eq!(&data[5..55], &[7u8; 50]);

        device.write_zeroes(100, 10, false).await.unwrap();
        let mut iov = IoVec::from_slice(&[1u8; 10]);
        device.read(100, &mut iov).await.unwrap();
        assert_eq!(iov.to_vec(), vec![0u8; 10]);
        device.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let file = image(&[0u8; 4096]);
        let device = FileDevice::open(file.path(), false).unwrap();
        let mut iov = IoVec::from_slice(&[0u8; 16]);
        assert!(device.read(4090, &mut iov).await.unwrap_err().is_transient());
        assert!(device.write(0, &IoVec::from_slice(&[1u8; 4])).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mirror_image() {
        let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let source_file = image(&data);
        let target_file = image(&vec![0xaau8; data.len()]);

        let source = Arc::new(FileDevice::open(source_file.path(), true).unwrap());
        let target = Arc::new(FileDevice::open(target_file.path(), true).unwrap());
        let job = MirrorJob::start(
            MirrorConfig {
                auto_complete: true,
                ..MirrorConfig::default()
            },
            source,
            target,
            Arc::new(RecordingGraph::new()),
        )
        .await
        .unwrap();

        assert!(matches!(job.wait().await, JobOutcome::Completed));
        assert_eq!(std::fs::read(target_file.path()).unwrap(), data);
    }
}
