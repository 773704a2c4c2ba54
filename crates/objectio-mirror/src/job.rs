//! Mirror job controller
//!
//! A [`MirrorJob`] copies a live source volume onto a target. The controller
//! task seeds the dirty tracker, then runs copy rounds until nothing is dirty
//! and nothing is in flight, flushes the target and reports the job ready.
//! From then on it keeps following guest writes until completion or
//! cancellation is requested, drains guest I/O, re-checks one last time and
//! asks the storage graph to splice the target in (or to restore the source).
//!
//! # Phases
//!
//! ```text
//! Initializing -> [BulkZeroing] -> [InitialScan] -> Iterating -> Flushing -> Ready
//!                                                                              |
//!                                     Completed / Cancelled <- Completing <----+
//! ```
//!
//! `Cancelled` and `Failed` can be reached from any non-terminal phase.

use crate::bitmap::Bitmap;
use crate::buffer::BufferPool;
use crate::chunk::ChunkMapper;
use crate::config::{MirrorConfig, SyncMode};
use crate::device::{AllocationScope, BlockDevice, DeviceInfo};
use crate::dirty::{DirtyBitmap, DirtyIter, DirtyTracker};
use crate::error::{IoDirection, MirrorError, MirrorResult};
use crate::graph::StorageGraph;
use crate::overlay::MirrorOverlay;
use crate::ratelimit::{RateLimiter, SLICE_TIME};
use crate::registry::{InFlightRegistry, OpKind};
use crate::{MAX_IN_FLIGHT, MAX_IO_BYTES};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedRwLockWriteGuard, watch};
use tracing::{debug, error, info, trace, warn};

/// Job lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorPhase {
    Initializing,
    BulkZeroing,
    InitialScan,
    Iterating,
    Flushing,
    /// Target is a live copy; new writes keep being mirrored
    Ready,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

impl MirrorPhase {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MirrorPhase::Completed | MirrorPhase::Cancelled | MirrorPhase::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorPhase::Initializing => "initializing",
            MirrorPhase::BulkZeroing => "bulk-zeroing",
            MirrorPhase::InitialScan => "initial-scan",
            MirrorPhase::Iterating => "iterating",
            MirrorPhase::Flushing => "flushing",
            MirrorPhase::Ready => "ready",
            MirrorPhase::Completing => "completing",
            MirrorPhase::Completed => "completed",
            MirrorPhase::Cancelled => "cancelled",
            MirrorPhase::Failed => "failed",
        }
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub phase: MirrorPhase,
    /// Bytes done plus bytes in flight plus dirty bytes
    pub bytes_total: u64,
    pub bytes_remaining: u64,
    pub bytes_done: u64,
    /// Copy, zero and discard operations currently executing
    pub in_flight: usize,
    pub synced: bool,
    pub paused: bool,
    /// Speed limit in bytes per second (0 = unlimited)
    pub speed: u64,
    /// Most recent error, including ones the error policy recovered from
    pub last_error: Option<MirrorError>,
}

/// How a job ended
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Target spliced in place of the source
    Completed,
    /// Source presentation restored
    Cancelled,
    Failed(MirrorError),
}

impl JobOutcome {
    pub fn phase(&self) -> MirrorPhase {
        match self {
            JobOutcome::Completed => MirrorPhase::Completed,
            JobOutcome::Cancelled => MirrorPhase::Cancelled,
            JobOutcome::Failed(_) => MirrorPhase::Failed,
        }
    }
}

/// Sizes derived from the configuration and the device characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Dirty tracking and claiming unit
    pub granularity: u64,
    /// Buffer pool size, a multiple of the granularity
    pub buf_size: u64,
    /// Alignment zero and discard requests must have on the target
    pub target_cluster: u64,
    /// First copies into a target cluster must cover the whole cluster
    pub cow: bool,
    /// Largest single copy
    pub max_copy: u64,
    /// Largest data run handed to one operation per round
    pub max_io_bytes: u64,
}

impl Layout {
    pub fn resolve(config: &MirrorConfig, source: &DeviceInfo, target: &DeviceInfo) -> Self {
        let granularity = config.effective_granularity(target);
        let mut buf_size = config.effective_buf_size(granularity);
        let target_cluster = target.cluster_size.max(granularity);

        // Without its backing file the target would lose the unwritten part
        // of a partially copied cluster
        let cow = target.cow_backing && granularity < target_cluster;
        if cow {
            buf_size = buf_size.max(target_cluster).div_ceil(granularity) * granularity;
        }

        let max_iov = source.max_iov.min(target.max_iov).max(1) as u64;
        let mut max_copy = buf_size.min(granularity.saturating_mul(max_iov));
        // A first copy into a cluster has to cover all of it, even past the
        // segment limit
        if cow {
            max_copy = max_copy.max(target_cluster);
        }
        Self {
            granularity,
            buf_size,
            target_cluster,
            cow,
            max_copy,
            max_io_bytes: (buf_size / MAX_IN_FLIGHT as u64).max(MAX_IO_BYTES),
        }
    }
}

#[derive(Debug)]
pub(crate) struct JobState {
    pub(crate) phase: MirrorPhase,
    /// Reached Ready at least once
    pub(crate) ready: bool,
    pub(crate) synced: bool,
    pub(crate) should_complete: bool,
    pub(crate) cancel_requested: bool,
    pub(crate) pause_requested: bool,
    pub(crate) paused: bool,
    pub(crate) initial_zeroing: bool,
    pub(crate) bytes_done: u64,
    /// Error that ends the job
    pub(crate) fatal: Option<MirrorError>,
    pub(crate) last_error: Option<MirrorError>,
    pub(crate) outcome: Option<JobOutcome>,
}

/// State shared by the controller task and the operation tasks
pub(crate) struct JobShared {
    pub(crate) job_id: String,
    pub(crate) config: MirrorConfig,
    pub(crate) layout: Layout,
    pub(crate) length: u64,
    pub(crate) source: Arc<dyn BlockDevice>,
    pub(crate) target: Arc<dyn BlockDevice>,
    pub(crate) target_info: DeviceInfo,
    pub(crate) graph: Arc<dyn StorageGraph>,
    pub(crate) tracker: Arc<dyn DirtyTracker>,
    pub(crate) overlay: Arc<MirrorOverlay>,
    pub(crate) pool: BufferPool,
    pub(crate) registry: InFlightRegistry,
    /// Chunks already copied once, only kept when `layout.cow` is set
    pub(crate) cow_bitmap: Option<Mutex<Bitmap>>,
    pub(crate) limiter: Mutex<RateLimiter>,
    pub(crate) state: Mutex<JobState>,
    /// Wakes the controller out of its sleeps on control requests
    pub(crate) wake: Notify,
    status_tx: watch::Sender<JobStatus>,
}

enum Exit {
    /// Nothing dirty, nothing in flight, target flushed, guest writes held
    Converged {
        guard: OwnedRwLockWriteGuard<()>,
        pivot: bool,
    },
    /// Cancelled before the target was ever in sync
    Aborted,
}

impl JobShared {
    pub(crate) fn snapshot(&self) -> JobStatus {
        let in_flight = self.registry.in_flight();
        let bytes_in_flight = self.registry.bytes_in_flight();
        let dirty = self.tracker.dirty_bytes().min(self.length);
        let speed = self.limiter.lock().speed();

        let state = self.state.lock();
        let bytes_total = state.bytes_done + bytes_in_flight + dirty;
        JobStatus {
            job_id: self.job_id.clone(),
            phase: state.phase,
            bytes_total,
            bytes_remaining: bytes_total - state.bytes_done,
            bytes_done: state.bytes_done,
            in_flight,
            synced: state.synced,
            paused: state.paused,
            speed,
            last_error: state.last_error.clone(),
        }
    }

    pub(crate) fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn set_phase(&self, phase: MirrorPhase) {
        let previous = std::mem::replace(&mut self.state.lock().phase, phase);
        if previous != phase {
            info!(
                job = %self.job_id,
                from = previous.as_str(),
                to = phase.as_str(),
                "phase change"
            );
        }
        self.publish();
    }

    fn mark_ready(&self) {
        let first = {
            let mut state = self.state.lock();
            state.synced = true;
            state.phase = MirrorPhase::Ready;
            !std::mem::replace(&mut state.ready, true)
        };
        self.publish();
        if first {
            info!(job = %self.job_id, "target in sync, job ready");
        } else {
            debug!(job = %self.job_id, "target back in sync");
        }
    }

    fn fatal(&self) -> Option<MirrorError> {
        self.state.lock().fatal.clone()
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn is_synced(&self) -> bool {
        self.state.lock().synced
    }

    fn cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    /// Cancelled before the target was ever in sync
    fn force_cancelled(&self) -> bool {
        let state = self.state.lock();
        state.cancel_requested && !state.ready
    }

    /// Whether dispatching must stop
    pub(crate) fn should_abort(&self) -> bool {
        let state = self.state.lock();
        state.fatal.is_some() || (state.cancel_requested && !state.ready)
    }

    /// Sleep for `duration`, cut short by control requests
    pub(crate) async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.wake.notified() => {}
        }
    }

    /// Park the job while a pause is requested
    ///
    /// Outstanding operations are drained before the job reports itself
    /// paused. Cancellation ends the pause.
    pub(crate) async fn pause_point(&self) {
        if !self.state.lock().pause_requested {
            return;
        }

        self.registry.wait_for_all().await;
        {
            let mut state = self.state.lock();
            if !state.pause_requested || state.cancel_requested {
                return;
            }
            state.paused = true;
        }
        self.publish();
        info!(job = %self.job_id, "job paused");

        loop {
            let wake = self.wake.notified();
            {
                let state = self.state.lock();
                if !state.pause_requested || state.cancel_requested {
                    break;
                }
            }
            wake.await;
        }

        self.state.lock().paused = false;
        self.publish();
        info!(job = %self.job_id, "job resumed");
    }

    /// Yield once per slice during long scans, and honour pauses
    async fn throttle(&self, last_yield: &mut Instant) {
        if last_yield.elapsed() > SLICE_TIME {
            *last_yield = Instant::now();
            tokio::task::yield_now().await;
        }
        self.pause_point().await;
    }

    /// Flush the target. A failed flush leaves the job unsynced and the
    /// caller retries it; only fatal errors end the job.
    async fn flush_target(&self) -> MirrorResult<()> {
        let result = self.target.flush().await;
        if let Err(err) = &result {
            if err.is_fatal() {
                self.handle_error(IoDirection::Write, err.clone());
            } else {
                warn!(job = %self.job_id, error = %err, "target flush failed, retrying");
                let mut state = self.state.lock();
                state.synced = false;
                state.last_error = Some(err.clone());
            }
            self.publish();
        }
        result
    }

    async fn run(self: Arc<Self>) {
        info!(
            job = %self.job_id,
            source = self.source.name(),
            target = self.target.name(),
            length = self.length,
            granularity = self.layout.granularity,
            buf_size = self.layout.buf_size,
            "mirror job running"
        );

        let result = self.drive().await;
        let outcome = self.exit(result).await;

        {
            let mut state = self.state.lock();
            state.phase = outcome.phase();
            if let JobOutcome::Failed(err) = &outcome {
                state.last_error = Some(err.clone());
            }
            state.outcome = Some(outcome.clone());
        }
        self.publish();

        match &outcome {
            JobOutcome::Completed => info!(job = %self.job_id, "mirror job completed"),
            JobOutcome::Cancelled => info!(job = %self.job_id, "mirror job cancelled"),
            JobOutcome::Failed(err) => {
                error!(job = %self.job_id, error = %err, "mirror job failed");
            }
        }
    }

    async fn drive(self: &Arc<Self>) -> MirrorResult<Exit> {
        if self.length == 0 {
            self.mark_ready();
            loop {
                let wake = self.wake.notified();
                let (complete, cancel) = {
                    let state = self.state.lock();
                    (state.should_complete, state.cancel_requested)
                };
                if complete || cancel {
                    let guard = self.overlay.drain().await;
                    return Ok(Exit::Converged {
                        guard,
                        pivot: !cancel,
                    });
                }
                wake.await;
            }
        }

        if self.config.sync_mode != SyncMode::None {
            self.dirty_init().await?;
        }

        self.set_phase(MirrorPhase::Iterating);
        let mut iter = DirtyIter::new();
        let mut last_pause = Instant::now();

        loop {
            if let Some(err) = self.fatal() {
                return Err(err);
            }
            self.pause_point().await;
            if self.force_cancelled() {
                return Ok(Exit::Aborted);
            }

            let mut cnt = self.tracker.count();
            self.publish();

            // Yield at least once per slice even when there is always work
            let mut delay = Duration::ZERO;
            if last_pause.elapsed() < SLICE_TIME {
                let in_flight = self.registry.in_flight();
                if in_flight >= MAX_IN_FLIGHT
                    || self.pool.free_count() == 0
                    || (cnt == 0 && in_flight > 0)
                {
                    trace!(job = %self.job_id, dirty = cnt, in_flight, "waiting for an operation");
                    self.registry.wait_for_any().await;
                    continue;
                } else if cnt != 0 {
                    delay = self.iteration(&mut iter).await;
                }
            }

            let mut should_complete = false;
            // In-flight first: a failing operation re-dirties its range before
            // it leaves the registry
            let in_flight = self.registry.in_flight();
            if in_flight == 0 {
                cnt = self.tracker.count();
            }
            if in_flight == 0 && cnt == 0 {
                if !self.is_synced() {
                    let ready = self.is_ready();
                    if !ready {
                        self.set_phase(MirrorPhase::Flushing);
                    }
                    if self.flush_target().await.is_err() {
                        if !ready {
                            self.set_phase(MirrorPhase::Iterating);
                        }
                        self.sleep(SLICE_TIME).await;
                        continue;
                    }
                    self.mark_ready();
                }
                {
                    let state = self.state.lock();
                    should_complete = state.should_complete || state.cancel_requested;
                }
                cnt = self.tracker.count();
            }

            if cnt == 0 && should_complete {
                self.set_phase(MirrorPhase::Completing);
                let guard = self.overlay.drain().await;
                // Guest writes are held off; anything dirty now was written
                // before the drain
                if self.tracker.count() > 0 {
                    drop(guard);
                    self.set_phase(MirrorPhase::Ready);
                    continue;
                }
                if self.flush_target().await.is_err() {
                    drop(guard);
                    self.set_phase(MirrorPhase::Ready);
                    self.sleep(SLICE_TIME).await;
                    continue;
                }
                let pivot = !self.cancel_requested();
                return Ok(Exit::Converged { guard, pivot });
            }

            if self.is_ready() && !should_complete && in_flight == 0 && cnt == 0 {
                self.sleep(SLICE_TIME).await;
            } else {
                self.sleep(delay).await;
            }
            last_pause = Instant::now();
        }
    }

    /// Seed the dirty tracker, zeroing the target first when it has to be
    async fn dirty_init(self: &Arc<Self>) -> MirrorResult<()> {
        let granularity = self.layout.granularity;
        let step = i32::MAX as u64 - i32::MAX as u64 % granularity;
        let mut last_yield = Instant::now();

        let zero_target = self.config.sync_mode == SyncMode::Full && !self.target_info.zero_init;
        if zero_target {
            if !self.target_info.write_zeroes_unmap {
                debug!(job = %self.job_id, "target cannot zero cheaply, copying everything");
                self.tracker.mark(0, self.length);
                return Ok(());
            }

            self.set_phase(MirrorPhase::BulkZeroing);
            self.state.lock().initial_zeroing = true;
            let mut offset = 0;
            while offset < self.length {
                self.throttle(&mut last_yield).await;
                if self.cancel_requested() {
                    self.state.lock().initial_zeroing = false;
                    return Ok(());
                }
                if self.registry.in_flight() >= MAX_IN_FLIGHT {
                    self.registry.wait_for_any().await;
                    continue;
                }

                let bytes = (self.length - offset).min(step);
                let claim = self.registry.claim(offset, bytes, OpKind::Zero);
                self.spawn_op(claim, Vec::new());
                offset += bytes;
            }
            self.registry.wait_for_all().await;
            self.state.lock().initial_zeroing = false;
        }

        let scope = match self.config.sync_mode {
            SyncMode::Full => AllocationScope::Chain,
            SyncMode::SinceBase => AllocationScope::AboveBase,
            SyncMode::TopLayerOnly => AllocationScope::TopLayer,
            SyncMode::None => return Ok(()),
        };

        self.set_phase(MirrorPhase::InitialScan);
        let mut offset = 0;
        while offset < self.length {
            self.throttle(&mut last_yield).await;
            if self.cancel_requested() {
                return Ok(());
            }

            let bytes = (self.length - offset).min(step);
            let (allocated, count) = self.source.is_allocated(offset, bytes, scope).await?;
            if count == 0 {
                return Err(MirrorError::Internal(format!(
                    "allocation query at offset {offset} made no progress"
                )));
            }
            if allocated {
                self.tracker.mark(offset, count);
            }
            offset += count;
        }

        debug!(job = %self.job_id, dirty = self.tracker.dirty_bytes(), "initial scan complete");
        Ok(())
    }

    async fn exit(&self, result: MirrorResult<Exit>) -> JobOutcome {
        let outcome = match result {
            Ok(Exit::Converged { guard, pivot }) => {
                let outcome = if pivot {
                    self.splice().await
                } else {
                    self.restore(JobOutcome::Cancelled).await
                };
                self.overlay.detach();
                drop(guard);
                return outcome;
            }
            Ok(Exit::Aborted) => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(err),
        };

        if self.registry.in_flight() > 0 {
            debug!(
                job = %self.job_id,
                in_flight = self.registry.in_flight(),
                "draining operations"
            );
            self.registry.wait_for_all().await;
        }
        let outcome = self.restore(outcome).await;
        self.overlay.detach();
        outcome
    }

    async fn splice(&self) -> JobOutcome {
        match self.graph.splice(self.source.name(), self.target.name()).await {
            Ok(()) => {
                info!(
                    job = %self.job_id,
                    source = self.source.name(),
                    target = self.target.name(),
                    "target spliced in place of source"
                );
                JobOutcome::Completed
            }
            Err(err) => {
                let err = match err {
                    MirrorError::Splice(_) => err,
                    other => MirrorError::Splice(other.to_string()),
                };
                error!(job = %self.job_id, error = %err, "splice failed");
                self.restore(JobOutcome::Failed(err)).await
            }
        }
    }

    /// Put the source presentation back; a failure replaces a clean outcome
    async fn restore(&self, outcome: JobOutcome) -> JobOutcome {
        match self.graph.restore(self.source.name()).await {
            Ok(()) => outcome,
            Err(err) => {
                warn!(job = %self.job_id, error = %err, "restoring source presentation failed");
                match outcome {
                    JobOutcome::Failed(_) => outcome,
                    _ => JobOutcome::Failed(err),
                }
            }
        }
    }
}

/// Handle to a running mirror job
pub struct MirrorJob {
    shared: Arc<JobShared>,
}

impl MirrorJob {
    /// Validate the configuration and start mirroring `source` onto `target`
    pub async fn start(
        config: MirrorConfig,
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        graph: Arc<dyn StorageGraph>,
    ) -> MirrorResult<Self> {
        config.validate()?;
        let layout = Layout::resolve(&config, &source.info(), &target.info());
        let length = Self::check_lengths(source.as_ref(), target.as_ref()).await?;
        let tracker: Arc<dyn DirtyTracker> =
            Arc::new(DirtyBitmap::new(length, layout.granularity));
        Ok(Self::launch(config, layout, length, source, target, graph, tracker))
    }

    /// Start with an existing dirty tracker
    ///
    /// The granularity defaults to the tracker's; an explicit one has to
    /// match it. Whatever the tracker already holds is copied as well.
    pub async fn start_with_tracker(
        mut config: MirrorConfig,
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        graph: Arc<dyn StorageGraph>,
        tracker: Arc<dyn DirtyTracker>,
    ) -> MirrorResult<Self> {
        let granularity = *config.granularity.get_or_insert(tracker.granularity());
        config.validate()?;
        if granularity != tracker.granularity() {
            return Err(MirrorError::InvalidConfig(format!(
                "granularity {granularity} does not match tracker granularity {}",
                tracker.granularity()
            )));
        }
        let layout = Layout::resolve(&config, &source.info(), &target.info());
        let length = Self::check_lengths(source.as_ref(), target.as_ref()).await?;
        let chunks = length.div_ceil(granularity);
        if tracker.chunks() != chunks {
            return Err(MirrorError::InvalidConfig(format!(
                "tracker covers {} chunks but the volume has {chunks}",
                tracker.chunks()
            )));
        }
        Ok(Self::launch(config, layout, length, source, target, graph, tracker))
    }

    async fn check_lengths(
        source: &dyn BlockDevice,
        target: &dyn BlockDevice,
    ) -> MirrorResult<u64> {
        let length = source.length().await?;
        let target_length = target.length().await?;
        if length != target_length {
            return Err(MirrorError::InvalidConfig(format!(
                "source is {length} bytes but target is {target_length} bytes"
            )));
        }
        Ok(length)
    }

    fn launch(
        config: MirrorConfig,
        layout: Layout,
        length: u64,
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        graph: Arc<dyn StorageGraph>,
        tracker: Arc<dyn DirtyTracker>,
    ) -> Self {
        let mapper = ChunkMapper::new(layout.granularity);
        let overlay = Arc::new(MirrorOverlay::new(Arc::clone(&source), Arc::clone(&tracker)));
        let state = JobState {
            phase: MirrorPhase::Initializing,
            ready: false,
            synced: false,
            should_complete: config.auto_complete,
            cancel_requested: false,
            pause_requested: false,
            paused: false,
            initial_zeroing: false,
            bytes_done: 0,
            fatal: None,
            last_error: None,
            outcome: None,
        };
        let initial = JobStatus {
            job_id: config.job_id.clone(),
            phase: MirrorPhase::Initializing,
            bytes_total: 0,
            bytes_remaining: 0,
            bytes_done: 0,
            in_flight: 0,
            synced: false,
            paused: false,
            speed: config.speed,
            last_error: None,
        };
        let (status_tx, _) = watch::channel(initial);

        let shared = Arc::new(JobShared {
            job_id: config.job_id.clone(),
            layout,
            length,
            target_info: target.info(),
            pool: BufferPool::new(layout.buf_size, layout.granularity),
            registry: InFlightRegistry::new(length, layout.granularity),
            cow_bitmap: layout
                .cow
                .then(|| Mutex::new(Bitmap::new(mapper.chunks_for(length)))),
            limiter: Mutex::new(RateLimiter::new(config.speed)),
            state: Mutex::new(state),
            wake: Notify::new(),
            status_tx,
            config,
            source,
            target,
            graph,
            tracker,
            overlay,
        });
        shared.publish();

        info!(
            job = %shared.job_id,
            sync_mode = ?shared.config.sync_mode,
            speed = shared.config.speed,
            cow = layout.cow,
            "mirror job started"
        );
        tokio::spawn(Arc::clone(&shared).run());
        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.job_id
    }

    /// Sizes the job runs with
    pub fn layout(&self) -> Layout {
        self.shared.layout
    }

    /// Guest-facing device; writes through it are mirrored
    pub fn overlay(&self) -> Arc<MirrorOverlay> {
        Arc::clone(&self.shared.overlay)
    }

    /// Current status
    pub fn status(&self) -> JobStatus {
        self.shared.snapshot()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.shared.status_tx.subscribe()
    }

    fn ensure_running(&self) -> MirrorResult<()> {
        if self.shared.state.lock().outcome.is_some() {
            return Err(MirrorError::AlreadyFinished(self.shared.job_id.clone()));
        }
        Ok(())
    }

    /// Change the speed limit; 0 removes it
    pub fn set_speed(&self, speed: u64) -> MirrorResult<()> {
        self.ensure_running()?;
        self.shared.limiter.lock().set_speed(speed);
        info!(job = %self.shared.job_id, speed, "speed limit changed");
        self.shared.wake.notify_one();
        self.shared.publish();
        Ok(())
    }

    /// Ask the job to splice the target in once it is in sync
    ///
    /// Fails with [`MirrorError::NotReady`] before the job first became
    /// ready. On a completed job this is a no-op.
    pub fn request_complete(&self) -> MirrorResult<()> {
        {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(JobOutcome::Completed) => return Ok(()),
                Some(_) => return Err(MirrorError::AlreadyFinished(self.shared.job_id.clone())),
                None => {}
            }
            if state.cancel_requested {
                return Err(MirrorError::Cancelled(self.shared.job_id.clone()));
            }
            if !state.ready {
                return Err(MirrorError::NotReady(self.shared.job_id.clone()));
            }
            state.should_complete = true;
        }
        info!(job = %self.shared.job_id, "completion requested");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel the job
    ///
    /// Operations already executing finish normally. A job that was in sync
    /// converges once more before restoring the source presentation.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() || state.cancel_requested {
                return;
            }
            state.cancel_requested = true;
        }
        info!(job = %self.shared.job_id, "cancellation requested");
        self.shared.wake.notify_one();
    }

    /// Drain in-flight operations and stop dispatching new ones
    pub fn pause(&self) -> MirrorResult<()> {
        self.ensure_running()?;
        self.shared.state.lock().pause_requested = true;
        debug!(job = %self.shared.job_id, "pause requested");
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn resume(&self) -> MirrorResult<()> {
        self.ensure_running()?;
        self.shared.state.lock().pause_requested = false;
        debug!(job = %self.shared.job_id, "resume requested");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait for the job to finish
    pub async fn wait(&self) -> JobOutcome {
        let mut status = self.shared.status_tx.subscribe();
        loop {
            let outcome = self.shared.state.lock().outcome.clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if status.changed().await.is_err() {
                return JobOutcome::Failed(MirrorError::Internal(
                    "status channel closed".to_string(),
                ));
            }
        }
    }
}
