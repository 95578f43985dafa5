//! Progress aggregation for concurrent chunk fetches.
//!
//! Fetch workers report `(chunk index, delta)` with a single atomic add; the
//! per-chunk counters are the source of truth for bytes written. A separate
//! [`ProgressReporter`] task samples the counters on a fixed cadence to derive
//! speed and ETA, so workers never wait on telemetry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::format::{format_bytes, format_duration, format_speed};

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Shortest cadence the reporter accepts.
const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Point-in-time view of a transfer's progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total_size: Option<u64>,
    /// Bytes per second over the last sampling interval.
    pub speed: f64,
    /// Remaining time at the current speed. `None` when the speed is zero or
    /// the total size is unknown.
    pub eta: Option<Duration>,
    /// 0.0 to 100.0; 0.0 while the total size is unknown.
    pub percent: f64,
}

impl ProgressSnapshot {
    pub fn new(downloaded: u64, total_size: Option<u64>, speed: f64) -> Self {
        let percent = match total_size {
            Some(0) => 100.0,
            Some(total) => (downloaded as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        };
        // A crawl against a huge remainder can exceed what a Duration holds.
        let eta = match total_size {
            Some(total) if speed > 0.0 => {
                let remaining = total.saturating_sub(downloaded);
                Duration::try_from_secs_f64(remaining as f64 / speed).ok()
            }
            _ => None,
        };
        Self {
            downloaded,
            total_size,
            speed,
            eta,
            percent,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total_size {
            Some(total) => write!(
                f,
                "{:.1}% | {} / {}",
                self.percent,
                format_bytes(self.downloaded),
                format_bytes(total)
            )?,
            None => write!(f, "{}", format_bytes(self.downloaded))?,
        }
        write!(f, " | {}", format_speed(self.speed))?;
        if let Some(eta) = self.eta {
            write!(f, " | ETA {}", format_duration(eta))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RateSample {
    bytes: u64,
    at: Instant,
    speed: f64,
}

/// Thread-safe per-chunk byte counters with periodic rate sampling.
#[derive(Debug)]
pub struct ProgressAggregator {
    chunk_bytes: Vec<AtomicU64>,
    total_size: AtomicU64,
    high_water: AtomicU64,
    rate: Mutex<RateSample>,
}

impl ProgressAggregator {
    /// Creates counters for `chunk_count` chunks, all at zero.
    pub fn new(chunk_count: usize, total_size: Option<u64>) -> Self {
        Self::with_initial(&vec![0; chunk_count], total_size)
    }

    /// Creates counters seeded with bytes already written by an earlier run.
    pub fn with_initial(initial: &[u64], total_size: Option<u64>) -> Self {
        let downloaded = initial.iter().sum();
        Self {
            chunk_bytes: initial.iter().map(|&b| AtomicU64::new(b)).collect(),
            total_size: AtomicU64::new(total_size.unwrap_or(UNKNOWN_TOTAL)),
            high_water: AtomicU64::new(downloaded),
            rate: Mutex::new(RateSample {
                bytes: downloaded,
                at: Instant::now(),
                speed: 0.0,
            }),
        }
    }

    /// Records `delta` freshly written bytes for chunk `index`.
    pub fn record(&self, index: usize, delta: u64) {
        if let Some(counter) = self.chunk_bytes.get(index) {
            counter.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn chunk_bytes(&self, index: usize) -> u64 {
        self.chunk_bytes
            .get(index)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_bytes.len()
    }

    /// Sum of all chunk counters. Never decreases between calls.
    pub fn downloaded(&self) -> u64 {
        let sum: u64 = self
            .chunk_bytes
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();
        self.high_water.fetch_max(sum, Ordering::Relaxed).max(sum)
    }

    pub fn total_size(&self) -> Option<u64> {
        match self.total_size.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    /// Fixes the total once an open-ended stream has completed.
    pub fn set_total_size(&self, total_size: u64) {
        self.total_size.store(total_size, Ordering::Relaxed);
    }

    /// Takes a rate sample: speed is bytes since the previous sample divided
    /// by the time elapsed since it.
    pub fn sample(&self) -> ProgressSnapshot {
        let downloaded = self.downloaded();
        let now = Instant::now();
        let speed = {
            let mut rate = self.rate.lock();
            let elapsed = now.duration_since(rate.at).as_secs_f64();
            if elapsed > 0.0 {
                rate.speed = downloaded.saturating_sub(rate.bytes) as f64 / elapsed;
                rate.bytes = downloaded;
                rate.at = now;
            }
            rate.speed
        };
        ProgressSnapshot::new(downloaded, self.total_size(), speed)
    }

    /// Reads the current state without taking a rate sample.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let speed = self.rate.lock().speed;
        ProgressSnapshot::new(self.downloaded(), self.total_size(), speed)
    }

    /// Restarts rate measurement, e.g. after a pause, so idle time is not
    /// averaged into the next sample.
    pub fn reset_rate(&self) {
        let downloaded = self.downloaded();
        let mut rate = self.rate.lock();
        rate.bytes = downloaded;
        rate.at = Instant::now();
        rate.speed = 0.0;
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Background task sampling a [`ProgressAggregator`] on a fixed cadence.
///
/// Emits one final sample when stopped. Dropping the reporter stops the
/// task without waiting for it.
pub struct ProgressReporter {
    handle: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl ProgressReporter {
    /// Spawns the sampling task.
    ///
    /// # Arguments
    ///
    /// * `aggregator` - Counters to sample
    /// * `interval` - Sampling cadence, raised to 1 ms if shorter
    /// * `on_sample` - Called with every sample, including the final one
    pub fn start<F>(aggregator: Arc<ProgressAggregator>, interval: Duration, on_sample: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + 'static,
    {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let interval = interval.max(MIN_REPORT_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => on_sample(aggregator.sample()),
                }
            }

            on_sample(aggregator.sample());
        });

        Self {
            handle: Some(handle),
            stop,
        }
    }

    /// Stops sampling and waits for the final sample to be delivered.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
