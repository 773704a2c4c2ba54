//! In-flight operation registry
//!
//! Every executing copy, zero or discard operation owns a claimed range of
//! chunks here for its whole lifetime. Operations whose chunk ranges overlap
//! are serialized: a later claimant waits on the earlier operation's queue and
//! re-scans after every wake-up, since new overlaps may have appeared while it
//! slept.
//!
//! Operation records live in an id-indexed map, so a waiter never holds a
//! reference into a record that may be freed while it sleeps; it only holds
//! the record's wake-up handle.

use crate::bitmap::Bitmap;
use crate::chunk::{ChunkMapper, ChunkSpan};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::futures::OwnedNotified;
use tracing::trace;

/// Stable handle of a registered operation
pub type OpId = u64;

/// What a registered operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Read from the source, write to the target
    Copy,
    /// Write zeroes to the target
    Zero,
    /// Discard on the target
    Discard,
    /// No I/O; holds a run of chunks while real operations are dispatched
    Reservation,
}

impl OpKind {
    /// Whether the operation performs I/O
    pub fn is_io(&self) -> bool {
        !matches!(self, OpKind::Reservation)
    }

    /// Short name for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Copy => "copy",
            OpKind::Zero => "zero",
            OpKind::Discard => "discard",
            OpKind::Reservation => "reservation",
        }
    }
}

/// A registered operation as seen from outside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: OpId,
    pub offset: u64,
    pub bytes: u64,
    pub kind: OpKind,
    pub span: ChunkSpan,
}

#[derive(Debug)]
struct OpRecord {
    claim: Claim,
    waiters: Arc<Notify>,
}

#[derive(Debug)]
struct RegistryState {
    claimed: Bitmap,
    ops: BTreeMap<OpId, OpRecord>,
    next_id: OpId,
    in_flight: usize,
    bytes_in_flight: u64,
}

impl RegistryState {
    /// Wake-up handle of the first operation (other than `exclude`) whose
    /// chunks overlap `span`
    fn conflict(&self, span: ChunkSpan, exclude: Option<OpId>) -> Option<Arc<Notify>> {
        if !self.claimed.any_in(span.start, span.end()) {
            return None;
        }
        self.ops
            .values()
            .find(|op| Some(op.claim.id) != exclude && op.claim.span.overlaps(&span))
            .map(|op| Arc::clone(&op.waiters))
    }

    fn insert(&mut self, offset: u64, bytes: u64, kind: OpKind, span: ChunkSpan) -> Claim {
        let id = self.next_id;
        self.next_id += 1;

        let claim = Claim {
            id,
            offset,
            bytes,
            kind,
            span,
        };
        self.claimed.set_range(span.start, span.count);
        if kind.is_io() {
            self.in_flight += 1;
            self.bytes_in_flight += bytes;
        }
        self.ops.insert(
            id,
            OpRecord {
                claim,
                waiters: Arc::new(Notify::new()),
            },
        );
        claim
    }
}

/// Registry of in-flight operations and their claimed chunks
#[derive(Debug)]
pub struct InFlightRegistry {
    mapper: ChunkMapper,
    state: Mutex<RegistryState>,
    finished: Notify,
}

impl InFlightRegistry {
    /// Create an empty registry for a volume of `length` bytes
    pub fn new(length: u64, granularity: u64) -> Self {
        let mapper = ChunkMapper::new(granularity);
        Self {
            state: Mutex::new(RegistryState {
                claimed: Bitmap::new(mapper.chunks_for(length)),
                ops: BTreeMap::new(),
                next_id: 1,
                in_flight: 0,
                bytes_in_flight: 0,
            }),
            mapper,
            finished: Notify::new(),
        }
    }

    /// Register an operation over `[offset, offset + bytes)` and mark its
    /// chunks as claimed
    ///
    /// Does not check for conflicts; callers either waited with
    /// [`wait_until_clear`](Self::wait_until_clear) without suspending since,
    /// or own the conflicting claim themselves.
    pub fn claim(&self, offset: u64, bytes: u64, kind: OpKind) -> Claim {
        let span = self.mapper.span(offset, bytes);
        let claim = self.state.lock().insert(offset, bytes, kind, span);
        trace!(id = claim.id, offset, bytes, kind = kind.as_str(), "claimed");
        claim
    }

    /// Wait until no operation other than `exclude` overlaps the range, then
    /// claim it, without a suspension point between the check and the claim
    pub async fn claim_when_clear(
        &self,
        offset: u64,
        bytes: u64,
        kind: OpKind,
        exclude: Option<OpId>,
    ) -> Claim {
        let span = self.mapper.span(offset, bytes);
        loop {
            let waiting = {
                let mut state = self.state.lock();
                match state.conflict(span, exclude) {
                    None => {
                        let claim = state.insert(offset, bytes, kind, span);
                        trace!(id = claim.id, offset, bytes, kind = kind.as_str(), "claimed");
                        return claim;
                    }
                    Some(waiters) => waiters.notified_owned(),
                }
            };
            waiting.await;
        }
    }

    /// Wait until no operation other than `exclude` overlaps the range
    ///
    /// Overlap is computed on chunk indices. Each wake-up triggers a full
    /// re-scan.
    pub async fn wait_until_clear(&self, offset: u64, bytes: u64, exclude: Option<OpId>) {
        let span = self.mapper.span(offset, bytes);
        while let Some(waiting) = self.conflict_waiter(span, exclude) {
            trace!(offset, bytes, "waiting on conflicting operation");
            waiting.await;
        }
    }

    fn conflict_waiter(&self, span: ChunkSpan, exclude: Option<OpId>) -> Option<OwnedNotified> {
        let state = self.state.lock();
        state.conflict(span, exclude).map(Notify::notified_owned)
    }

    /// Remove an operation, clear the chunks no other operation still claims
    /// and wake everyone waiting on it
    pub fn release(&self, id: OpId) -> Option<Claim> {
        let (record, io) = {
            let mut state = self.state.lock();
            let record = state.ops.remove(&id)?;
            let claim = record.claim;

            for chunk in claim.span.start..claim.span.end() {
                let still_claimed = state
                    .ops
                    .values()
                    .any(|op| op.claim.span.start <= chunk && chunk < op.claim.span.end());
                if !still_claimed {
                    state.claimed.clear_range(chunk, 1);
                }
            }
            if claim.kind.is_io() {
                state.in_flight -= 1;
                state.bytes_in_flight -= claim.bytes;
            }
            (record, claim.kind.is_io())
        };

        trace!(id, kind = record.claim.kind.as_str(), "released");
        record.waiters.notify_waiters();
        if io {
            self.finished.notify_waiters();
        }
        Some(record.claim)
    }

    /// Wait until at least one I/O operation finishes
    ///
    /// Returns immediately when none is in flight. Reservations are never
    /// waited on: the only reservation belongs to the caller's own round.
    pub async fn wait_for_any(&self) {
        let finished = self.finished.notified();
        if self.in_flight() == 0 {
            return;
        }
        finished.await;
    }

    /// Wait until every I/O operation has finished
    pub async fn wait_for_all(&self) {
        loop {
            let finished = self.finished.notified();
            if self.in_flight() == 0 {
                return;
            }
            finished.await;
        }
    }

    /// Whether the chunk containing `offset` is claimed
    pub fn is_claimed(&self, offset: u64) -> bool {
        self.state.lock().claimed.get(self.mapper.chunk_of(offset))
    }

    /// Number of I/O operations in flight
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Bytes covered by in-flight I/O operations
    pub fn bytes_in_flight(&self) -> u64 {
        self.state.lock().bytes_in_flight
    }

    /// Snapshot of all registered operations
    pub fn claims(&self) -> Vec<Claim> {
        self.state.lock().ops.values().map(|op| op.claim).collect()
    }
}
