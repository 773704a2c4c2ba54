//! Mirror engine error types

use std::sync::Arc;
use thiserror::Error;

/// Direction of a failed transfer, used to pick the error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Failure while reading the source
    Read,
    /// Failure while writing, zeroing, discarding or flushing the target
    Write,
}

/// Mirror engine error
#[derive(Error, Debug, Clone)]
pub enum MirrorError {
    /// Rejected configuration, the job is never created
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A read, write, zero, discard or flush request failed
    #[error("{op} failed at offset {offset} (+{length} bytes): {source}")]
    Io {
        op: &'static str,
        offset: u64,
        length: u64,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Source or target went away while the job was running
    #[error("Device detached: {0}")]
    DeviceDetached(String),

    /// Completion requested before the target is in sync
    #[error("Job {0} cannot be completed before it is ready")]
    NotReady(String),

    /// Replacing the source with the target in the storage graph failed
    #[error("Graph splice failed: {0}")]
    Splice(String),

    /// The job was cancelled
    #[error("Job {0} was cancelled")]
    Cancelled(String),

    /// Control request on a job that already reached a terminal state
    #[error("Job {0} has already finished")]
    AlreadyFinished(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Build an I/O error for `op` on the given byte range
    pub fn io(op: &'static str, offset: u64, length: u64, source: std::io::Error) -> Self {
        MirrorError::Io {
            op,
            offset,
            length,
            source: Arc::new(source),
        }
    }

    /// Errors governed by the per-direction error policy
    pub fn is_transient(&self) -> bool {
        matches!(self, MirrorError::Io { .. })
    }

    /// Errors that terminate the job regardless of policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirrorError::DeviceDetached(_) | MirrorError::Splice(_) | MirrorError::Internal(_)
        )
    }

    /// Request rejected because it reaches past the end of the device
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            MirrorError::Io { source, .. } if source.kind() == std::io::ErrorKind::InvalidInput
        )
    }

    /// Errors raised before a job exists
    pub fn is_config(&self) -> bool {
        matches!(self, MirrorError::InvalidConfig(_))
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::io("io", 0, 0, err)
    }
}

/// Result type for mirror operations
pub type MirrorResult<T> = Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let io = MirrorError::io("write", 4096, 512, std::io::Error::other("boom"));
        assert!(io.is_transient());
        assert!(!io.is_fatal());

        assert!(MirrorError::Splice("busy".into()).is_fatal());
        assert!(MirrorError::DeviceDetached("target".into()).is_fatal());
        assert!(MirrorError::InvalidConfig("granularity".into()).is_config());
        assert!(!MirrorError::Cancelled("job0".into()).is_fatal());

        let past_end = MirrorError::io(
            "write",
            u64::MAX - 1,
            4,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "past end"),
        );
        assert!(past_end.is_out_of_range());
        assert!(!io.is_out_of_range());
    }

    #[test]
    fn test_io_error_display() {
        let err = MirrorError::io("read", 1024, 64, std::io::Error::other("eio"));
        assert_eq!(err.to_string(), "read failed at offset 1024 (+64 bytes): eio");
    }
}
