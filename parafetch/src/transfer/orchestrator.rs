//! Transfer state machine and worker pool.
//!
//! A [`Transfer`] is a cheap, clonable handle. All clones share one state
//! table guarded by a short-held mutex; nothing holds that mutex across I/O.
//!
//! Each run (the initial start and every resume) gets its own cancellation
//! scope and generation number. Pausing or canceling revokes the scope; the
//! run's supervisor then joins its workers and settles the outcome for that
//! generation only.
//!
//! ```text
//! start/resume ──► plan (resolve, probe, chunk) ──► supervisor
//!                                                     │
//!                               ┌─────────────────────┼──────────────┐
//!                               ▼                     ▼              ▼
//!                           worker 0              worker 1   ...  worker N-1
//!                     (pull job, RangeFetcher)
//!                               │
//!                               └──► all joined ──► finalize | persist | release
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{FetchError, TransferError};
use crate::source::{DownloadSource, TransferId};

use super::checksum;
use super::chunk::{Chunk, ChunkJob, ChunkStatus};
use super::events::TransferEvent;
use super::fetcher::{FetchOutcome, RangeFetcher};
use super::planner::ChunkPlanner;
use super::progress::{ProgressAggregator, ProgressReporter, ProgressSnapshot};
use super::resume::ResumeRecord;
use super::sink::{ByteTransform, ChunkSink, FileSink, TransformSink};
use super::status::TransferStatus;
use super::transport::{ProbeInfo, RangeTransport};

// =============================================================================
// Requests
// =============================================================================

/// Everything needed to create a [`Transfer`].
#[derive(Clone)]
pub struct TransferRequest {
    pub source: DownloadSource,
    /// Destination file. Defaults to `download_dir/<file name>`.
    pub destination: Option<PathBuf>,
    /// Registry key. Defaults to the source's identity.
    pub id: Option<TransferId>,
    /// Known total size; skips the probe request.
    pub total_size: Option<u64>,
    /// Worker count. Defaults to the engine setting.
    pub workers: Option<usize>,
    /// Expected SHA-256 of the finished file (hex).
    pub checksum: Option<String>,
    /// Transform applied to every byte before it is written.
    pub transform: Option<Arc<dyn ByteTransform>>,
}

impl TransferRequest {
    pub fn new(source: DownloadSource) -> Self {
        Self {
            source,
            destination: None,
            id: None,
            total_size: None,
            workers: None,
            checksum: None,
            transform: None,
        }
    }

    /// Request for a plain URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(DownloadSource::direct(url))
    }

    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<TransferId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_checksum(mut self, sha256: impl Into<String>) -> Self {
        self.checksum = Some(sha256.into());
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn ByteTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// The identity the resulting transfer will be registered under.
    pub fn transfer_id(&self) -> TransferId {
        self.id.clone().unwrap_or_else(|| self.source.id())
    }
}

/// Point-in-time description of a transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: TransferId,
    pub source_url: String,
    pub destination: PathBuf,
    pub status: TransferStatus,
    pub total_size: Option<u64>,
    pub workers: usize,
    pub chunk_count: usize,
    pub chunks_done: usize,
    pub progress: ProgressSnapshot,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TransferError>,
}

impl TransferInfo {
    /// Time since start, up to the end for a finished transfer.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// Bytes per second averaged over the whole run so far.
    pub fn average_speed(&self) -> f64 {
        match self.elapsed().and_then(|d| d.to_std().ok()) {
            Some(elapsed) if !elapsed.is_zero() => {
                self.progress.downloaded as f64 / elapsed.as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct TransferState {
    status: TransferStatus,
    url: Option<Arc<str>>,
    total_size: Option<u64>,
    chunks: Vec<Chunk>,
    planned: bool,
    progress: Option<Arc<ProgressAggregator>>,
    scope: Option<CancellationToken>,
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<TransferError>,
    /// A chunk that exhausted its budget while the run was winding down for
    /// a pause. The transfer fails on the next resume instead of refetching.
    deferred_failure: Option<TransferError>,
}

impl TransferState {
    fn new(total_size: Option<u64>) -> Self {
        Self {
            status: TransferStatus::Queued,
            url: None,
            total_size,
            chunks: Vec::new(),
            planned: false,
            progress: None,
            scope: None,
            generation: 0,
            started_at: None,
            finished_at: None,
            error: None,
            deferred_failure: None,
        }
    }

    /// Copies the live counters into the chunk table.
    fn sync_chunk_bytes(&mut self) {
        if let Some(progress) = &self.progress {
            for chunk in &mut self.chunks {
                chunk.bytes_written = progress.chunk_bytes(chunk.index);
            }
        }
    }

    /// Syncs counters and marks bounded chunks whose bytes are all written
    /// as done.
    fn settle(&mut self) {
        self.sync_chunk_bytes();
        for chunk in &mut self.chunks {
            if chunk.is_fully_written() {
                chunk.status = ChunkStatus::Done;
            }
        }
    }

    fn all_done(&self) -> bool {
        self.chunks.iter().all(Chunk::is_done)
    }

    fn progress(&self) -> ProgressSnapshot {
        match &self.progress {
            Some(progress) => progress.snapshot(),
            None => ProgressSnapshot::new(0, self.total_size, 0.0),
        }
    }
}

struct TransferInner {
    id: TransferId,
    source: DownloadSource,
    destination: PathBuf,
    workers: usize,
    total_size_hint: Option<u64>,
    checksum: Option<String>,
    config: Arc<EngineConfig>,
    transport: Arc<dyn RangeTransport>,
    sink: Arc<dyn ChunkSink>,
    created_at: DateTime<Utc>,
    state: Mutex<TransferState>,
    status_tx: watch::Sender<TransferStatus>,
    events: broadcast::Sender<TransferEvent>,
    /// Supervisor of the current run. Also serialises start and resume.
    run: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Result of planning a run.
struct Plan {
    url: Arc<str>,
    total_size: Option<u64>,
    chunks: Vec<Chunk>,
}

/// Inputs of one supervisor run.
struct Run {
    jobs: Vec<ChunkJob>,
    url: Arc<str>,
    progress: Arc<ProgressAggregator>,
    scope: CancellationToken,
    generation: u64,
}

type JobQueue = Arc<Mutex<VecDeque<ChunkJob>>>;

// =============================================================================
// Transfer Handle
// =============================================================================

/// Handle to one download.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl Transfer {
    /// Creates a queued transfer writing to a [`FileSink`].
    ///
    /// # Arguments
    ///
    /// * `request` - Source, destination and per-transfer overrides
    /// * `config` - Engine settings shared with other transfers
    /// * `transport` - Network seam used for the probe and range requests
    pub fn new(
        request: TransferRequest,
        config: Arc<EngineConfig>,
        transport: Arc<dyn RangeTransport>,
    ) -> Self {
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| default_destination(&config, &request));
        let sink: Arc<dyn ChunkSink> = Arc::new(FileSink::new(&destination));
        Self::build(request, destination, sink, config, transport)
    }

    /// Creates a queued transfer writing to a caller-supplied sink.
    pub fn with_sink(
        request: TransferRequest,
        sink: Arc<dyn ChunkSink>,
        config: Arc<EngineConfig>,
        transport: Arc<dyn RangeTransport>,
    ) -> Self {
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| default_destination(&config, &request));
        Self::build(request, destination, sink, config, transport)
    }

    fn build(
        request: TransferRequest,
        destination: PathBuf,
        sink: Arc<dyn ChunkSink>,
        config: Arc<EngineConfig>,
        transport: Arc<dyn RangeTransport>,
    ) -> Self {
        let id = request.transfer_id();
        let sink = match request.transform {
            Some(transform) => Arc::new(TransformSink::new(sink, transform)) as Arc<dyn ChunkSink>,
            None => sink,
        };
        let (status_tx, _) = watch::channel(TransferStatus::Queued);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(TransferInner {
                id,
                source: request.source,
                destination,
                workers: request.workers.unwrap_or(config.workers),
                total_size_hint: request.total_size,
                checksum: request.checksum,
                transport,
                sink,
                created_at: Utc::now(),
                state: Mutex::new(TransferState::new(request.total_size)),
                status_tx,
                events,
                run: tokio::sync::Mutex::new(None),
                config,
            }),
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.inner.id
    }

    pub fn source(&self) -> &DownloadSource {
        &self.inner.source
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.state.lock().status
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.state.lock().progress()
    }

    /// Total size, once known.
    pub fn total_size(&self) -> Option<u64> {
        self.inner.state.lock().total_size
    }

    /// The chunk table with current byte counts.
    pub fn chunks(&self) -> Vec<Chunk> {
        let mut state = self.inner.state.lock();
        state.sync_chunk_bytes();
        state.chunks.clone()
    }

    /// The error that failed the transfer, if any.
    pub fn error(&self) -> Option<TransferError> {
        self.inner.state.lock().error.clone()
    }

    pub fn info(&self) -> TransferInfo {
        let mut state = self.inner.state.lock();
        state.sync_chunk_bytes();
        TransferInfo {
            id: self.inner.id.clone(),
            source_url: self.inner.source.display_url().to_string(),
            destination: self.inner.destination.clone(),
            status: state.status,
            total_size: state.total_size,
            workers: self.inner.workers,
            chunk_count: state.chunks.len(),
            chunks_done: state.chunks.iter().filter(|c| c.is_done()).count(),
            progress: state.progress(),
            created_at: self.inner.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
        }
    }

    /// Receives state changes and progress samples from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Plans the transfer and launches its worker pool.
    ///
    /// Valid only from `Queued`. Resolution, probing and planning happen
    /// before this returns; a failure there marks the transfer `Failed` and
    /// is returned. Fetching continues in the background.
    pub async fn start(&self) -> Result<(), TransferError> {
        let mut run = self.inner.run.lock().await;
        let scope = {
            let mut state = self.inner.state.lock();
            if state.status != TransferStatus::Queued {
                return Err(TransferError::InvalidState {
                    action: "start",
                    status: state.status,
                });
            }
            state.started_at = Some(Utc::now());
            self.open_scope(&mut state)
        };

        info!(
            transfer = %self.inner.id,
            url = %self.inner.source.display_url(),
            destination = %self.inner.destination.display(),
            workers = self.inner.workers,
            "Starting transfer"
        );
        *run = self.launch(scope).await?;
        Ok(())
    }

    /// Stops every in-flight fetch, keeping the bytes already written.
    ///
    /// Valid only from `Running`. Workers wind down in the background; a
    /// following [`resume`](Self::resume) waits for them.
    pub fn pause(&self) -> Result<(), TransferError> {
        let mut state = self.inner.state.lock();
        if state.status != TransferStatus::Running {
            return Err(TransferError::InvalidState {
                action: "pause",
                status: state.status,
            });
        }
        if let Some(scope) = state.scope.take() {
            scope.cancel();
        }
        self.transition(&mut state, TransferStatus::Paused);
        info!(
            transfer = %self.inner.id,
            downloaded = state.progress().downloaded,
            "Transfer paused"
        );
        Ok(())
    }

    /// Restarts workers for the chunks that are not done yet.
    ///
    /// Valid only from `Paused`. Each chunk resumes at its first unwritten
    /// byte. When nothing is left to fetch the transfer finalises without
    /// any request. A chunk that failed for good while the pause was taking
    /// effect fails the transfer here, with no further request.
    pub async fn resume(&self) -> Result<(), TransferError> {
        let mut run = self.inner.run.lock().await;
        self.expect_status("resume", TransferStatus::Paused)?;

        // The paused run must finish persisting before workers restart.
        if let Some(previous) = run.take() {
            previous.await.ok();
        }

        let opened = {
            let mut state = self.inner.state.lock();
            if state.status != TransferStatus::Paused {
                return Err(TransferError::InvalidState {
                    action: "resume",
                    status: state.status,
                });
            }
            match state.deferred_failure.take() {
                Some(err) => {
                    error!(transfer = %self.inner.id, error = %err, kind = %err.kind(), "Transfer failed while paused");
                    state.scope.take();
                    state.error = Some(err.clone());
                    self.transition(&mut state, TransferStatus::Failed);
                    Err(err)
                }
                None => {
                    if let Some(progress) = &state.progress {
                        progress.reset_rate();
                    }
                    Ok(self.open_scope(&mut state))
                }
            }
        };
        let scope = match opened {
            Ok(scope) => scope,
            Err(err) => {
                self.inner.sink.release();
                return Err(err);
            }
        };

        info!(transfer = %self.inner.id, "Resuming transfer");
        *run = self.launch(scope).await?;
        Ok(())
    }

    /// Aborts the transfer and releases the destination without finalising.
    ///
    /// Valid from any non-terminal status.
    pub fn cancel(&self) -> Result<(), TransferError> {
        {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return Err(TransferError::InvalidState {
                    action: "cancel",
                    status: state.status,
                });
            }
            if let Some(scope) = state.scope.take() {
                scope.cancel();
            }
            self.transition(&mut state, TransferStatus::Canceled);
        }
        self.inner.sink.release();
        info!(transfer = %self.inner.id, "Transfer canceled");
        Ok(())
    }

    /// Waits for a terminal status and for the last run to wind down.
    ///
    /// Returns `Ok` for `Completed`, [`TransferError::Canceled`] for
    /// `Canceled`, and the recorded error for `Failed`.
    pub async fn wait(&self) -> Result<(), TransferError> {
        let mut status_rx = self.inner.status_tx.subscribe();
        let status = match status_rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };

        {
            let mut run = self.inner.run.lock().await;
            if let Some(handle) = run.as_mut() {
                handle.await.ok();
            }
            *run = None;
        }

        match status {
            TransferStatus::Completed => Ok(()),
            TransferStatus::Canceled => Err(TransferError::Canceled),
            _ => Err(self
                .error()
                .unwrap_or(TransferError::Incomplete { pending: 0 })),
        }
    }

    fn expect_status(&self, action: &'static str, expected: TransferStatus) -> Result<(), TransferError> {
        let status = self.status();
        if status == expected {
            Ok(())
        } else {
            Err(TransferError::InvalidState { action, status })
        }
    }

    /// Installs a fresh cancellation scope for a new run and moves to
    /// `Running`.
    fn open_scope(&self, state: &mut TransferState) -> CancellationToken {
        let scope = CancellationToken::new();
        if let Some(previous) = state.scope.replace(scope.clone()) {
            previous.cancel();
        }
        state.generation += 1;
        self.transition(state, TransferStatus::Running);
        scope
    }

    fn transition(&self, state: &mut TransferState, to: TransferStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");

        state.status = to;
        if to.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        self.inner.status_tx.send_replace(to);
        // No subscribers is fine.
        let _ = self.inner.events.send(TransferEvent::StateChanged {
            id: self.inner.id.clone(),
            from,
            to,
        });
        debug!(transfer = %self.inner.id, %from, %to, "Transfer state changed");
    }

    fn publish_progress(&self, progress: ProgressSnapshot) {
        trace!(transfer = %self.inner.id, %progress, "Progress");
        let _ = self.inner.events.send(TransferEvent::Progress {
            id: self.inner.id.clone(),
            progress,
        });
    }

    /// Plans if needed, then spawns the supervisor for `scope`.
    async fn launch(&self, scope: CancellationToken) -> Result<Option<JoinHandle<()>>, TransferError> {
        let planned = self.inner.state.lock().planned;
        if !planned {
            let plan = tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    self.release_if_canceled();
                    return Ok(None);
                }
                plan = self.plan() => plan,
            };
            match plan {
                Ok(plan) => self.install_plan(plan),
                Err(err) => {
                    self.fail_planning(err.clone());
                    return Err(err);
                }
            }
            // A cancel that landed while the sink was being prepared released
            // it before the handle existed.
            if self.release_if_canceled() {
                return Ok(None);
            }
        }
        Ok(self.spawn_run(scope))
    }

    /// Releases the sink when the transfer was canceled. Returns whether it
    /// was.
    fn release_if_canceled(&self) -> bool {
        let canceled = self.status() == TransferStatus::Canceled;
        if canceled {
            self.inner.sink.release();
        }
        canceled
    }

    async fn plan(&self) -> Result<Plan, TransferError> {
        let inner = &self.inner;
        if inner.workers == 0 {
            return Err(TransferError::Planning(
                "worker count must be at least 1".to_string(),
            ));
        }

        let url: Arc<str> = inner.source.resolve().await?.into();
        let probe = match inner.total_size_hint {
            Some(total) => ProbeInfo {
                total_size: Some(total),
                accepts_ranges: true,
            },
            None => inner
                .transport
                .probe(&url)
                .await
                .map_err(|source| TransferError::Probe {
                    url: url.to_string(),
                    source,
                })?,
        };

        let restored = self.load_resume_record(probe.total_size).await;
        let resumed = restored.is_some();
        let chunks = match restored {
            Some(chunks) => chunks,
            None if probe.accepts_ranges => {
                ChunkPlanner::new(inner.config.min_chunk_size).plan(probe.total_size, inner.workers)?
            }
            None => ChunkPlanner::single(probe.total_size),
        };
        ChunkPlanner::validate(&chunks, probe.total_size)?;

        inner
            .sink
            .prepare(probe.total_size, resumed)
            .await
            .map_err(|e| TransferError::io(&inner.destination, &e))?;

        debug!(
            transfer = %inner.id,
            total_size = ?probe.total_size,
            accepts_ranges = probe.accepts_ranges,
            chunks = chunks.len(),
            resumed,
            "Transfer planned"
        );
        Ok(Plan {
            url,
            total_size: probe.total_size,
            chunks,
        })
    }

    /// Chunk table from a matching resume record next to the destination.
    async fn load_resume_record(&self, total_size: Option<u64>) -> Option<Vec<Chunk>> {
        if !self.inner.config.persist_resume_state {
            return None;
        }
        let destination = self.inner.destination.clone();
        let record = tokio::task::spawn_blocking(move || {
            // Written bytes only count if the destination still holds them.
            if !destination.exists() {
                return None;
            }
            ResumeRecord::load(&ResumeRecord::path_for(&destination)).ok()
        })
        .await
        .ok()
        .flatten()?;

        if !record.matches(&self.inner.id, total_size) {
            debug!(transfer = %self.inner.id, "Ignoring resume record for a different object");
            return None;
        }
        let chunks = record.restore();
        if let Err(e) = ChunkPlanner::validate(&chunks, total_size) {
            warn!(transfer = %self.inner.id, error = %e, "Ignoring inconsistent resume record");
            return None;
        }
        info!(
            transfer = %self.inner.id,
            bytes = record.bytes_written(),
            "Restored progress from resume record"
        );
        Some(chunks)
    }

    fn install_plan(&self, plan: Plan) {
        let initial: Vec<u64> = plan.chunks.iter().map(|c| c.bytes_written).collect();
        let progress = Arc::new(ProgressAggregator::with_initial(&initial, plan.total_size));

        let mut state = self.inner.state.lock();
        state.url = Some(plan.url);
        state.total_size = plan.total_size;
        state.chunks = plan.chunks;
        state.progress = Some(progress);
        state.planned = true;
    }

    fn fail_planning(&self, err: TransferError) {
        {
            let mut state = self.inner.state.lock();
            if state.status != TransferStatus::Running {
                return;
            }
            error!(transfer = %self.inner.id, error = %err, "Transfer planning failed");
            state.scope.take();
            state.error = Some(err);
            self.transition(&mut state, TransferStatus::Failed);
        }
        self.inner.sink.release();
    }

    fn spawn_run(&self, scope: CancellationToken) -> Option<JoinHandle<()>> {
        let run = {
            let mut state = self.inner.state.lock();
            if state.status != TransferStatus::Running || scope.is_cancelled() {
                return None;
            }
            state.settle();
            Run {
                jobs: ChunkPlanner::replan(&state.chunks),
                url: state.url.clone()?,
                progress: state.progress.clone()?,
                scope,
                generation: state.generation,
            }
        };
        Some(tokio::spawn(self.clone().supervise(run)))
    }

    /// Runs the worker pool for one generation and settles its outcome.
    async fn supervise(self, run: Run) {
        let Run {
            jobs,
            url,
            progress,
            scope,
            generation,
        } = run;
        let pool_size = jobs.len().min(self.inner.workers);
        debug!(
            transfer = %self.inner.id,
            generation,
            jobs = jobs.len(),
            workers = pool_size,
            "Starting worker pool"
        );

        let reporter = {
            let transfer = self.clone();
            ProgressReporter::start(
                Arc::clone(&progress),
                self.inner.config.progress_interval,
                move |snapshot| transfer.publish_progress(snapshot),
            )
        };

        let fetcher = Arc::new(
            RangeFetcher::new(
                Arc::clone(&self.inner.transport),
                Arc::clone(&self.inner.sink),
                Arc::clone(&progress),
            )
            .with_config(&self.inner.config),
        );
        let queue: JobQueue = Arc::new(Mutex::new(VecDeque::from(jobs)));

        let mut workers = JoinSet::new();
        for worker in 0..pool_size {
            workers.spawn(self.clone().work(
                worker,
                Arc::clone(&queue),
                Arc::clone(&fetcher),
                Arc::clone(&url),
                scope.clone(),
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(transfer = %self.inner.id, error = %e, "Fetch worker panicked");
            }
        }

        reporter.stop().await;
        self.finish(generation, &progress).await;
    }

    /// Pulls jobs until the queue is empty, the scope is revoked or the
    /// transfer stops running.
    async fn work(
        self,
        worker: usize,
        queue: JobQueue,
        fetcher: Arc<RangeFetcher>,
        url: Arc<str>,
        scope: CancellationToken,
    ) {
        loop {
            if scope.is_cancelled() || self.status() != TransferStatus::Running {
                break;
            }
            let Some(job) = queue.lock().pop_front() else {
                break;
            };

            self.update_chunk(job.index, |chunk| {
                if chunk.status == ChunkStatus::Failed {
                    chunk.transition(ChunkStatus::Pending);
                }
                chunk.transition(ChunkStatus::InFlight);
            });
            trace!(transfer = %self.inner.id, worker, chunk = job.index, start = job.start, "Fetching chunk");

            let outcome = fetcher
                .fetch(&url, job, &scope, |attempts, err| {
                    self.chunk_retrying(job.index, attempts, err)
                })
                .await;

            match outcome {
                FetchOutcome::Completed { .. } => self.update_chunk(job.index, |chunk| {
                    chunk.transition(ChunkStatus::Done);
                }),
                FetchOutcome::Canceled { .. } => self.update_chunk(job.index, |chunk| {
                    chunk.transition(ChunkStatus::Pending);
                }),
                FetchOutcome::Failed {
                    error, attempts, ..
                } => self.chunk_failed(job.index, error, attempts),
            }
        }
        trace!(transfer = %self.inner.id, worker, "Worker exiting");
    }

    fn update_chunk(&self, index: usize, f: impl FnOnce(&mut Chunk)) {
        let mut state = self.inner.state.lock();
        let written = state.progress.as_ref().map(|p| p.chunk_bytes(index));
        if let Some(chunk) = state.chunks.get_mut(index) {
            if let Some(written) = written {
                chunk.bytes_written = written;
            }
            f(chunk);
        }
    }

    /// A transient failure about to be retried: the chunk passes through
    /// `Failed` back to `Pending` and is immediately taken again.
    fn chunk_retrying(&self, index: usize, attempts: u32, err: &FetchError) {
        self.update_chunk(index, |chunk| {
            chunk.transition(ChunkStatus::Failed);
            chunk.last_error = Some(err.clone());
            chunk.retries = attempts;
            chunk.transition(ChunkStatus::Pending);
            chunk.transition(ChunkStatus::InFlight);
        });
    }

    /// Records a chunk that exhausted its budget. The first one fails the
    /// transfer and revokes the scope so sibling fetches stop. While paused
    /// the failure is held until the next resume.
    fn chunk_failed(&self, index: usize, source: FetchError, attempts: u32) {
        let mut state = self.inner.state.lock();
        let Some(chunk) = state.chunks.get_mut(index) else {
            return;
        };
        chunk.transition(ChunkStatus::Failed);
        chunk.last_error = Some(source.clone());
        chunk.retries = attempts.saturating_sub(1);
        let range = chunk.range.clone();

        if state.error.is_some() || state.deferred_failure.is_some() {
            return;
        }
        let err = TransferError::ChunkFailed {
            index,
            range,
            attempts,
            source,
        };
        match state.status {
            TransferStatus::Running => {}
            TransferStatus::Paused => {
                warn!(transfer = %self.inner.id, error = %err, "Chunk failed during pause");
                state.deferred_failure = Some(err);
                return;
            }
            _ => return,
        }
        error!(transfer = %self.inner.id, error = %err, kind = %err.kind(), "Transfer failed");
        if let Some(scope) = state.scope.take() {
            scope.cancel();
        }
        state.error = Some(err);
        self.transition(&mut state, TransferStatus::Failed);
    }

    /// Settles a run once its workers have joined.
    async fn finish(&self, generation: u64, progress: &ProgressAggregator) {
        let (status, complete, pending) = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.settle();
            let pending = state.chunks.iter().filter(|c| !c.is_done()).count();
            (state.status, state.all_done(), pending)
        };

        match status {
            TransferStatus::Running if complete => self.finalize(progress).await,
            TransferStatus::Running => {
                // Only reachable when a worker panicked.
                {
                    let mut state = self.inner.state.lock();
                    if state.status == TransferStatus::Running {
                        state.scope.take();
                        state.error = Some(TransferError::Incomplete { pending });
                        self.transition(&mut state, TransferStatus::Failed);
                    }
                }
                self.save_resume_record().await;
                self.inner.sink.release();
            }
            TransferStatus::Paused => self.save_resume_record().await,
            TransferStatus::Failed => {
                self.save_resume_record().await;
                self.inner.sink.release();
            }
            TransferStatus::Canceled => self.inner.sink.release(),
            TransferStatus::Queued | TransferStatus::Completed => {}
        }
    }

    /// Flushes the destination, then records per-chunk progress.
    async fn save_resume_record(&self) {
        if !self.inner.config.persist_resume_state {
            return;
        }
        // The record must never claim bytes that are not on disk yet.
        if let Err(e) = self.inner.sink.flush().await {
            warn!(transfer = %self.inner.id, error = %e, "Flush failed, resume record not saved");
            return;
        }

        let record = {
            let mut state = self.inner.state.lock();
            state.sync_chunk_bytes();
            ResumeRecord::new(&self.inner.id, state.total_size, &state.chunks)
        };
        let path = ResumeRecord::path_for(&self.inner.destination);
        let bytes = record.bytes_written();
        match tokio::task::spawn_blocking(move || record.save(&path)).await {
            Ok(Ok(())) => debug!(transfer = %self.inner.id, bytes, "Saved resume record"),
            Ok(Err(e)) => warn!(transfer = %self.inner.id, error = %e, "Failed to save resume record"),
            Err(e) => warn!(transfer = %self.inner.id, error = %e, "Resume record task failed"),
        }
    }

    async fn finalize(&self, progress: &ProgressAggregator) {
        let downloaded = progress.downloaded();
        let expected = {
            let mut state = self.inner.state.lock();
            if state.total_size.is_none() {
                // An open-ended stream is as long as what it delivered.
                state.total_size = Some(downloaded);
                if let Some(chunk) = state.chunks.first_mut() {
                    chunk.range.end = downloaded;
                }
                progress.set_total_size(downloaded);
            }
            state.total_size.unwrap_or(downloaded)
        };

        let verified = self.verify_output(expected).await;
        if self.inner.config.persist_resume_state {
            let path = ResumeRecord::path_for(&self.inner.destination);
            if let Err(e) = tokio::task::spawn_blocking(move || ResumeRecord::remove(&path)).await {
                warn!(transfer = %self.inner.id, error = %e, "Resume record cleanup failed");
            }
        }

        let mut state = self.inner.state.lock();
        if state.status != TransferStatus::Running {
            return;
        }
        state.scope.take();
        match verified {
            Ok(()) => {
                info!(transfer = %self.inner.id, bytes = expected, "Transfer completed");
                self.transition(&mut state, TransferStatus::Completed);
            }
            Err(err) => {
                error!(transfer = %self.inner.id, error = %err, "Transfer failed verification");
                state.error = Some(err);
                self.transition(&mut state, TransferStatus::Failed);
            }
        }
    }

    async fn verify_output(&self, expected: u64) -> Result<(), TransferError> {
        let actual = self
            .inner
            .sink
            .finalize()
            .await
            .map_err(|e| TransferError::io(&self.inner.destination, &e))?;
        if actual != expected {
            return Err(TransferError::SizeMismatch { expected, actual });
        }
        if let Some(sha256) = &self.inner.checksum {
            checksum::verify_file_async(self.inner.destination.clone(), sha256.clone()).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("destination", &self.inner.destination)
            .finish_non_exhaustive()
    }
}

/// `download_dir/<file name>`, where the file name comes from the URL or
/// falls back to `<id>.bin`.
fn default_destination(config: &EngineConfig, request: &TransferRequest) -> PathBuf {
    let file_name = request
        .source
        .file_name()
        .unwrap_or_else(|| format!("{}.bin", request.transfer_id()));
    config.download_dir.join(file_name)
}

// =============================================================================
// Tests
// =============================================================================
