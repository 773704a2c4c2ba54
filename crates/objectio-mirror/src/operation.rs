//! Copy, zero and discard operations
//!
//! An operation runs in its own task once its range is claimed. It owns its
//! buffers until it completes; completion hands them back to the pool,
//! releases the claim and wakes whoever is queued behind it. A failed
//! operation marks its range dirty again before the claim goes away, so the
//! controller never sees that range clean and idle.

use crate::config::ErrorAction;
use crate::device::IoVec;
use crate::error::{IoDirection, MirrorError};
use crate::job::JobShared;
use crate::registry::{Claim, OpKind};

use bytes::BytesMut;
use std::sync::Arc;
use tracing::{error, trace, warn};

type OpResult = Result<(), (IoDirection, MirrorError)>;

impl JobShared {
    /// Run a claimed operation in the background
    pub(crate) fn spawn_op(self: &Arc<Self>, claim: Claim, buffers: Vec<BytesMut>) {
        trace!(
            job = %self.job_id,
            id = claim.id,
            offset = claim.offset,
            bytes = claim.bytes,
            kind = claim.kind.as_str(),
            "dispatching operation"
        );
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let (buffers, result) = shared.perform(&claim, buffers).await;
            shared.complete(claim, buffers, result);
        });
    }

    async fn perform(&self, claim: &Claim, buffers: Vec<BytesMut>) -> (Vec<BytesMut>, OpResult) {
        let result = match claim.kind {
            OpKind::Copy => return self.copy(claim, buffers).await,
            OpKind::Zero => self
                .target
                .write_zeroes(claim.offset, claim.bytes, self.config.unmap)
                .await,
            OpKind::Discard => self.target.discard(claim.offset, claim.bytes).await,
            OpKind::Reservation => Ok(()),
        };
        (buffers, result.map_err(|e| (IoDirection::Write, e)))
    }

    async fn copy(&self, claim: &Claim, mut buffers: Vec<BytesMut>) -> (Vec<BytesMut>, OpResult) {
        // Only the last buffer can be partial, at the end of the volume
        let mut remaining = claim.bytes as usize;
        for buffer in &mut buffers {
            let len = remaining.min(buffer.len());
            buffer.truncate(len);
            remaining -= len;
        }

        let mut iov = IoVec::new(buffers);
        if let Err(err) = self.source.read(claim.offset, &mut iov).await {
            return (iov.into_segments(), Err((IoDirection::Read, err)));
        }
        let result = self
            .target
            .write(claim.offset, &iov)
            .await
            .map_err(|e| (IoDirection::Write, e));
        (iov.into_segments(), result)
    }

    fn complete(&self, claim: Claim, buffers: Vec<BytesMut>, result: OpResult) {
        match result {
            Ok(()) => {
                if let Some(cow) = &self.cow_bitmap {
                    cow.lock().set_range(claim.span.start, claim.span.count);
                }
                let mut state = self.state.lock();
                if !state.initial_zeroing {
                    state.bytes_done += claim.bytes;
                }
            }
            Err((direction, err)) => {
                self.tracker.mark(claim.offset, claim.bytes);
                self.handle_error(direction, err);
            }
        }

        self.pool.release(buffers);
        self.registry.release(claim.id);
        self.publish();
    }

    /// Apply the error policy for a failed transfer
    ///
    /// Fatal errors always end the job. Otherwise the policy for the failing
    /// direction decides.
    pub(crate) fn handle_error(&self, direction: IoDirection, err: MirrorError) -> ErrorAction {
        let action = if err.is_fatal() {
            ErrorAction::Report
        } else {
            match direction {
                IoDirection::Read => self.config.on_source_error,
                IoDirection::Write => self.config.on_target_error,
            }
        };

        {
            let mut state = self.state.lock();
            state.synced = false;
            state.last_error = Some(err.clone());
            match action {
                ErrorAction::Report => {
                    if state.fatal.is_none() {
                        state.fatal = Some(err.clone());
                    }
                }
                ErrorAction::Ignore => {}
                ErrorAction::Stop => state.pause_requested = true,
            }
        }

        match action {
            ErrorAction::Report => {
                error!(job = %self.job_id, ?direction, error = %err, "transfer failed")
            }
            ErrorAction::Ignore => {
                warn!(job = %self.job_id, ?direction, error = %err, "transfer failed, will retry")
            }
            ErrorAction::Stop => {
                warn!(job = %self.job_id, ?direction, error = %err, "transfer failed, pausing job")
            }
        }

        if action != ErrorAction::Ignore {
            self.wake.notify_one();
        }
        action
    }
}
