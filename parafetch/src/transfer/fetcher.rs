//! Single-chunk range fetch with local retry.
//!
//! [`RangeFetcher::fetch`] drives one [`ChunkJob`] to completion: it issues
//! the range request, streams the body into the sink in bounded increments
//! and reports every increment to the progress counters. Transient failures
//! are retried from the first unwritten byte; cancellation ends the fetch
//! without touching the retry budget.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::FetchError;

use super::chunk::ChunkJob;
use super::policy::RetryPolicy;
use super::progress::ProgressAggregator;
use super::sink::ChunkSink;
use super::transport::{RangeRequest, RangeTransport};

/// Default read increment (32 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Default no-progress timeout per attempt.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Outcomes
// =============================================================================

/// How a fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every byte of the job was written.
    Completed { bytes: u64, attempts: u32 },
    /// The cancellation scope fired. Not a failure.
    Canceled { bytes: u64 },
    /// A permanent error, or the retry budget ran out.
    Failed {
        error: FetchError,
        attempts: u32,
        bytes: u64,
    },
}

impl FetchOutcome {
    /// Bytes written by this call across all attempts.
    pub fn bytes(&self) -> u64 {
        match self {
            FetchOutcome::Completed { bytes, .. }
            | FetchOutcome::Canceled { bytes }
            | FetchOutcome::Failed { bytes, .. } => *bytes,
        }
    }
}

enum Interrupt {
    Canceled,
    Failed(FetchError),
}

impl From<FetchError> for Interrupt {
    fn from(err: FetchError) -> Self {
        Interrupt::Failed(err)
    }
}

// =============================================================================
// Range Fetcher
// =============================================================================

/// Fetches chunk ranges into a shared sink.
pub struct RangeFetcher {
    transport: Arc<dyn RangeTransport>,
    sink: Arc<dyn ChunkSink>,
    progress: Arc<ProgressAggregator>,
    policy: RetryPolicy,
    read_buffer_size: usize,
    stall_timeout: Duration,
}

impl RangeFetcher {
    pub fn new(
        transport: Arc<dyn RangeTransport>,
        sink: Arc<dyn ChunkSink>,
        progress: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            transport,
            sink,
            progress,
            policy: RetryPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Applies retry, buffer and stall settings from `config`.
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_policy(config.retry.clone())
            .with_read_buffer_size(config.read_buffer_size)
            .with_stall_timeout(config.stall_timeout)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Fetches `job` from `url` until it completes, fails or `cancel` fires.
    ///
    /// # Arguments
    ///
    /// * `url` - Resolved download URL
    /// * `job` - Byte interval still missing for one chunk
    /// * `cancel` - Run scope; firing it ends the fetch as `Canceled`
    /// * `on_retry` - Runs before each backoff with the attempts made so far
    ///   and the error that ended the last one
    #[instrument(skip(self, url, cancel, on_retry), fields(chunk = job.index))]
    pub async fn fetch<F>(
        &self,
        url: &str,
        job: ChunkJob,
        cancel: &CancellationToken,
        on_retry: F,
    ) -> FetchOutcome
    where
        F: Fn(u32, &FetchError) + Send + Sync,
    {
        let mut offset = job.start;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self.attempt(url, &job, &mut offset, cancel).await;
            let bytes = offset - job.start;

            let error = match result {
                Ok(()) => {
                    debug!(bytes, attempts, "Chunk fetched");
                    return FetchOutcome::Completed { bytes, attempts };
                }
                Err(Interrupt::Canceled) => return FetchOutcome::Canceled { bytes },
                // A released sink after cancel is a consequence of the cancel.
                Err(Interrupt::Failed(_)) if cancel.is_cancelled() => {
                    return FetchOutcome::Canceled { bytes }
                }
                Err(Interrupt::Failed(error)) => error,
            };

            let delay = if error.is_transient() {
                self.policy.delay_for_attempt(attempts)
            } else {
                None
            };
            let Some(delay) = delay else {
                warn!(error = %error, attempts, offset, "Chunk fetch failed");
                return FetchOutcome::Failed {
                    error,
                    attempts,
                    bytes,
                };
            };

            warn!(
                error = %error,
                attempt = attempts,
                offset,
                delay_ms = delay.as_millis() as u64,
                "Chunk fetch attempt failed, retrying"
            );
            on_retry(attempts, &error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return FetchOutcome::Canceled { bytes },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One request. `offset` advances past every byte durably handed to the
    /// sink, so a retry picks up exactly where this attempt stopped.
    async fn attempt(
        &self,
        url: &str,
        job: &ChunkJob,
        offset: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let request = RangeRequest::new(*offset, job.end);

        let mut body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Canceled),
            response = timeout(self.stall_timeout, self.transport.get(url, request)) => {
                response.map_err(|_| self.stalled())??
            }
        };

        match body.status() {
            206 => {}
            // Whole-object answer: usable only when we want bytes from 0.
            200 if *offset == 0 => {}
            200..=299 => return Err(FetchError::RangeIgnored { offset: *offset }.into()),
            status => return Err(FetchError::from_status(status).into()),
        }

        loop {
            if job.end.is_some_and(|end| *offset >= end) {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Canceled),
                next = timeout(self.stall_timeout, body.next_chunk()) => {
                    next.map_err(|_| self.stalled())??
                }
            };
            let Some(mut data) = next else { break };

            if let Some(end) = job.end {
                let wanted = end - *offset;
                if data.len() as u64 > wanted {
                    data.truncate(wanted as usize);
                }
            }

            while !data.is_empty() {
                if cancel.is_cancelled() {
                    return Err(Interrupt::Canceled);
                }
                let take = data.len().min(self.read_buffer_size);
                let piece = data.split_to(take);
                self.write_piece(job.index, offset, piece).await?;
            }
        }

        match job.end {
            Some(end) if *offset < end => Err(FetchError::UnexpectedEof {
                expected: end - job.start,
                received: *offset - job.start,
            }
            .into()),
            _ => Ok(()),
        }
    }

    async fn write_piece(&self, index: usize, offset: &mut u64, piece: Bytes) -> Result<(), FetchError> {
        let len = piece.len() as u64;
        self.sink
            .write_at(*offset, piece)
            .await
            .map_err(|e| FetchError::Sink {
                offset: *offset,
                reason: e.to_string(),
            })?;
        *offset += len;
        self.progress.record(index, len);
        Ok(())
    }

    fn stalled(&self) -> FetchError {
        FetchError::Stalled {
            timeout: self.stall_timeout,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
