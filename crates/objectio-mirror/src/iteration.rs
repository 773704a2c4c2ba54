//! Copy rounds
//!
//! A round takes the next dirty chunk, grows it into a run of contiguous
//! dirty chunks that no operation holds, clears the run in the tracker and
//! dispatches operations over it. A reservation covers the run from before
//! the bits are cleared until the last operation for it has been claimed.

use crate::chunk::{clip_bytes, round_to_clusters};
use crate::config::SyncMode;
use crate::device::BlockStatus;
use crate::dirty::DirtyIter;
use crate::error::IoDirection;
use crate::job::{JobShared, Layout};
use crate::registry::{OpId, OpKind};
use crate::MAX_IN_FLIGHT;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Pick the operation for the range at `offset` and the bytes it covers
///
/// `status` is `None` when the allocation query failed; the range is then
/// copied. The result is a multiple of the granularity, at least one chunk.
pub(crate) fn classify(
    layout: &Layout,
    zero_ok: bool,
    discard_ok: bool,
    offset: u64,
    run_bytes: u64,
    status: Option<BlockStatus>,
) -> (u64, OpKind) {
    let granularity = layout.granularity;
    let mut io_bytes = match status {
        None => run_bytes.min(layout.max_io_bytes),
        Some(s) if s.data => s.length.min(layout.max_io_bytes),
        Some(s) => s.length,
    };
    io_bytes -= io_bytes % granularity;
    if io_bytes < granularity {
        return (granularity, OpKind::Copy);
    }

    let Some(status) = status.filter(|s| !s.data) else {
        return (io_bytes, OpKind::Copy);
    };
    // Zero and discard requests need whole target clusters
    if round_to_clusters(layout.target_cluster, offset, io_bytes) != (offset, io_bytes) {
        return (io_bytes, OpKind::Copy);
    }

    let kind = match (status.zero, zero_ok, discard_ok) {
        (true, true, _) => OpKind::Zero,
        (false, _, true) => OpKind::Discard,
        _ => OpKind::Copy,
    };
    (io_bytes, kind)
}

impl JobShared {
    /// Run one round and return how long the controller should sleep
    pub(crate) async fn iteration(self: &Arc<Self>, iter: &mut DirtyIter) -> Duration {
        let granularity = self.layout.granularity;

        let first = {
            let locked = self.tracker.lock();
            match iter.next_offset(&*locked, granularity) {
                Some(offset) => Some(offset),
                None => {
                    iter.reset(0);
                    debug!(job = %self.job_id, dirty = locked.count(), "dirty iteration wrapped");
                    iter.next_offset(&*locked, granularity)
                }
            }
        };
        let Some(mut offset) = first else {
            return Duration::ZERO;
        };

        self.registry.wait_until_clear(offset, granularity, None).await;
        self.pause_point().await;
        if self.should_abort() {
            return Duration::ZERO;
        }

        let (reservation, run_end) = {
            let mut locked = self.tracker.lock();
            if !locked.is_dirty(offset) {
                return Duration::ZERO;
            }

            let mut chunks = 1;
            while chunks * granularity < self.layout.buf_size {
                let next = offset + chunks * granularity;
                if next >= self.length || !locked.is_dirty(next) || self.registry.is_claimed(next)
                {
                    break;
                }
                chunks += 1;
            }

            let run_bytes = chunks * granularity;
            iter.reset(offset + run_bytes);
            let reservation = self.registry.claim(offset, run_bytes, OpKind::Reservation);
            locked.clear(offset, run_bytes);
            (reservation, (offset + run_bytes).min(self.length))
        };
        trace!(job = %self.job_id, offset, bytes = run_end - offset, "run reserved");

        let zero_ok = self.target_info.write_zeroes_unmap;
        let discard_ok = self.config.sync_mode != SyncMode::Full;
        let mut delay = Duration::ZERO;

        while offset < run_end {
            let status = self
                .source
                .block_status(offset, run_end - offset)
                .await
                .inspect_err(|err| {
                    debug!(job = %self.job_id, offset, error = %err, "block status failed");
                })
                .ok();
            let (io_bytes, kind) =
                classify(&self.layout, zero_ok, discard_ok, offset, run_end - offset, status);

            while self.registry.in_flight() >= MAX_IN_FLIGHT {
                self.registry.wait_for_any().await;
            }
            if self.should_abort() {
                break;
            }

            let io_bytes = clip_bytes(self.length, offset, io_bytes);
            let Some(handled) = self.start_op(offset, io_bytes, kind, reservation.id).await else {
                break;
            };

            let accounted = if kind != OpKind::Copy && zero_ok { 0 } else { handled };
            delay = delay.max(self.limiter.lock().account(accounted));
            offset += handled;
        }

        // Whatever was not dispatched has to be picked up again
        if offset < run_end {
            self.tracker.mark(offset, run_end - offset);
        }
        self.registry.release(reservation.id);
        delay
    }

    /// Claim and spawn one operation starting at `offset`
    ///
    /// Returns the bytes the operation moves the round forward by, or `None`
    /// when the job is stopping.
    async fn start_op(
        self: &Arc<Self>,
        offset: u64,
        bytes: u64,
        kind: OpKind,
        reservation: OpId,
    ) -> Option<u64> {
        let (op_offset, op_bytes) = match kind {
            OpKind::Copy => self.copy_extent(offset, bytes),
            _ => (offset, bytes),
        };
        let handled = op_offset + op_bytes - offset;

        let buffers = if kind == OpKind::Copy {
            let count = op_bytes.div_ceil(self.layout.granularity) as usize;
            match self.pool.acquire(count).await {
                Ok(buffers) => buffers,
                Err(err) => {
                    self.handle_error(IoDirection::Read, err);
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        let claim = self
            .registry
            .claim_when_clear(op_offset, op_bytes, kind, Some(reservation))
            .await;
        if self.should_abort() {
            self.pool.release(buffers);
            self.registry.release(claim.id);
            return None;
        }

        self.spawn_op(claim, buffers);
        Some(handled)
    }

    /// Extent of a copy starting at `offset`
    ///
    /// On a copy-on-write target the first copy into a cluster is widened to
    /// whole clusters.
    fn copy_extent(&self, offset: u64, bytes: u64) -> (u64, u64) {
        let max_copy = self.layout.max_copy;
        let bytes = bytes.min(max_copy);
        let Some(cow) = &self.cow_bitmap else {
            return (offset, bytes);
        };

        let granularity = self.layout.granularity;
        let cluster = self.layout.target_cluster;
        let need_cow = {
            let cow = cow.lock();
            !cow.get(offset / granularity) || !cow.get((offset + bytes - 1) / granularity)
        };

        let (align_offset, mut align_bytes) = if need_cow {
            round_to_clusters(cluster, offset, bytes)
        } else {
            (offset, bytes)
        };
        if align_bytes > max_copy {
            align_bytes = max_copy;
            if need_cow {
                // max_copy is at least one cluster on a copy-on-write target
                align_bytes -= align_bytes % cluster;
            }
        }
        (align_offset, clip_bytes(self.length, align_offset, align_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    fn layout() -> Layout {
        Layout {
            granularity: 64 * KB,
            buf_size: 16 * MB,
            target_cluster: 64 * KB,
            cow: false,
            max_copy: 16 * MB,
            max_io_bytes: MB,
        }
    }

    fn status(data: bool, zero: bool, length: u64) -> Option<BlockStatus> {
        Some(BlockStatus { data, zero, length })
    }

    #[test]
    fn test_data_is_copied_in_bounded_pieces() {
        let (bytes, kind) = classify(&layout(), true, true, 0, 4 * MB, status(true, false, 4 * MB));
        assert_eq!((bytes, kind), (MB, OpKind::Copy));

        let (bytes, kind) =
            classify(&layout(), true, true, 0, 4 * MB, status(true, false, 100 * KB));
        assert_eq!((bytes, kind), (64 * KB, OpKind::Copy));
    }

    #[test]
    fn test_failed_query_copies() {
        let (bytes, kind) = classify(&layout(), true, true, 0, 4 * MB, None);
        assert_eq!((bytes, kind), (MB, OpKind::Copy));
        let (bytes, kind) = classify(&layout(), true, true, 0, 192 * KB, None);
        assert_eq!((bytes, kind), (192 * KB, OpKind::Copy));
    }

    #[test]
    fn test_short_status_still_makes_progress() {
        let (bytes, kind) = classify(&layout(), true, true, 0, 4 * MB, status(false, true, 4 * KB));
        assert_eq!((bytes, kind), (64 * KB, OpKind::Copy));
    }

    #[test]
    fn test_zero_ranges() {
        // Not bounded by the per-operation data limit
        let (bytes, kind) =
            classify(&layout(), true, false, 0, 4 * MB, status(false, true, 4 * MB));
        assert_eq!((bytes, kind), (4 * MB, OpKind::Zero));

        let (_, kind) = classify(&layout(), false, false, 0, 4 * MB, status(false, true, 4 * MB));
        assert_eq!(kind, OpKind::Copy);
    }

    #[test]
    fn test_unallocated_ranges() {
        let (bytes, kind) =
            classify(&layout(), true, true, 128 * KB, MB, status(false, false, 256 * KB));
        assert_eq!((bytes, kind), (256 * KB, OpKind::Discard));

        let (_, kind) =
            classify(&layout(), true, false, 128 * KB, MB, status(false, false, 256 * KB));
        assert_eq!(kind, OpKind::Copy);
    }

    #[test]
    fn test_misaligned_ranges_are_copied() {
        let layout = Layout {
            target_cluster: 256 * KB,
            ..layout()
        };
        let (bytes, kind) =
            classify(&layout, true, true, 64 * KB, MB, status(false, true, 256 * KB));
        assert_eq!((bytes, kind), (256 * KB, OpKind::Copy));

        let (_, kind) = classify(&layout, true, true, 256 * KB, MB, status(false, true, 256 * KB));
        assert_eq!(kind, OpKind::Zero);
    }
}
