//! In-memory transport and sink doubles for unit tests.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use std::{cmp, io};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::FetchError;

use super::sink::ChunkSink;
use super::transport::{BoxFuture, ProbeInfo, RangeBody, RangeRequest, RangeTransport};

/// Deterministic, non-repeating-looking test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

/// Serves one object from memory with scriptable misbehaviour.
pub struct MockTransport {
    data: Bytes,
    accepts_ranges: bool,
    reports_length: bool,
    piece_size: usize,
    piece_delay: Option<Duration>,
    failing_status: Option<u16>,
    truncations: AtomicUsize,
    truncate_after: usize,
    stall_after: Option<usize>,
    requests: Mutex<Vec<RangeRequest>>,
    probes: AtomicUsize,
}

impl MockTransport {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            accepts_ranges: true,
            reports_length: true,
            piece_size: 4096,
            piece_delay: None,
            failing_status: None,
            truncations: AtomicUsize::new(0),
            truncate_after: 0,
            stall_after: None,
            requests: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    /// Answers every request with 200 and the whole object.
    pub fn without_range_support(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    /// Probe reports no total size.
    pub fn without_length(mut self) -> Self {
        self.reports_length = false;
        self
    }

    pub fn with_piece_size(mut self, size: usize) -> Self {
        self.piece_size = size.max(1);
        self
    }

    /// Sleeps before delivering each body piece.
    pub fn with_piece_delay(mut self, delay: Duration) -> Self {
        self.piece_delay = Some(delay);
        self
    }

    /// Every GET answers with `status`.
    pub fn with_failing_status(mut self, status: u16) -> Self {
        self.failing_status = Some(status);
        self
    }

    /// The first `count` GETs deliver `after` bytes and then reset.
    pub fn with_truncated_responses(mut self, count: usize, after: usize) -> Self {
        self.truncations = AtomicUsize::new(count);
        self.truncate_after = after;
        self
    }

    /// Every body delivers `after` bytes and then never yields again.
    pub fn with_stall_after(mut self, after: usize) -> Self {
        self.stall_after = Some(after);
        self
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl RangeTransport for MockTransport {
    fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, FetchError>> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.failing_status {
                return Err(FetchError::from_status(status));
            }
            Ok(ProbeInfo {
                total_size: self.reports_length.then_some(self.data.len() as u64),
                accepts_ranges: self.accepts_ranges,
            })
        })
    }

    fn get<'a>(
        &'a self,
        _url: &'a str,
        range: RangeRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RangeBody>, FetchError>> {
        Box::pin(async move {
            self.requests.lock().push(range);

            let len = self.data.len() as u64;
            let (status, data) = if let Some(status) = self.failing_status {
                (status, Bytes::new())
            } else if !self.accepts_ranges || range.header_value().is_none() {
                (200, self.data.clone())
            } else if range.start >= len {
                (416, Bytes::new())
            } else {
                let end = range.end.map_or(len, |end| cmp::min(end, len));
                (206, self.data.slice(range.start as usize..end as usize))
            };

            let fail_after = self
                .truncations
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
                .then_some(self.truncate_after);

            Ok(Box::new(MockBody {
                status,
                data,
                pos: 0,
                piece_size: self.piece_size,
                piece_delay: self.piece_delay,
                fail_after,
                stall_after: self.stall_after,
            }) as Box<dyn RangeBody>)
        })
    }
}

struct MockBody {
    status: u16,
    data: Bytes,
    pos: usize,
    piece_size: usize,
    piece_delay: Option<Duration>,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
}

impl RangeBody for MockBody {
    fn status(&self) -> u16 {
        self.status
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>> {
        Box::pin(async move {
            if let Some(delay) = self.piece_delay {
                tokio::time::sleep(delay).await;
            }
            if self.stall_after.is_some_and(|limit| self.pos >= limit) {
                std::future::pending::<()>().await;
            }
            if self.fail_after.is_some_and(|limit| self.pos >= limit) {
                return Err(FetchError::Network("connection reset by peer".to_string()));
            }
            if self.pos >= self.data.len() {
                return Ok(None);
            }

            let mut end = cmp::min(self.pos + self.piece_size, self.data.len());
            for limit in [self.fail_after, self.stall_after].into_iter().flatten() {
                if limit > self.pos {
                    end = cmp::min(end, limit);
                }
            }
            let piece = self.data.slice(self.pos..end);
            self.pos = end;
            Ok(Some(piece))
        })
    }
}

/// Sink that keeps the destination in memory and records every write.
#[derive(Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Range<u64>>>,
    growable: bool,
    released: AtomicBool,
}

impl MemorySink {
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; len]),
            ..Self::default()
        }
    }

    /// Sink that grows to fit writes, for unknown-length streams.
    pub fn growable() -> Self {
        Self {
            growable: true,
            ..Self::default()
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn writes(&self) -> Vec<Range<u64>> {
        self.writes.lock().clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Panics if any two recorded writes overlap.
    pub fn assert_disjoint(&self) {
        let mut writes = self.writes();
        writes.sort_by_key(|w| w.start);
        for pair in writes.windows(2) {
            assert!(
                pair[0].end <= pair[1].start,
                "overlapping writes {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }
}

impl ChunkSink for MemorySink {
    fn prepare(&self, total_size: Option<u64>, resume: bool) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut data = self.data.lock();
            if !resume {
                data.clear();
            }
            if let Some(total) = total_size {
                data.resize(total as usize, 0);
            }
            self.released.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn write_at(&self, offset: u64, bytes: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.is_released() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "sink released"));
            }
            let start = offset as usize;
            let end = start + bytes.len();
            {
                let mut data = self.data.lock();
                if end > data.len() {
                    if !self.growable {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("write {start}..{end} past end {}", data.len()),
                        ));
                    }
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(&bytes);
            }
            self.writes.lock().push(offset..end as u64);
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn finalize(&self) -> BoxFuture<'_, io::Result<u64>> {
        Box::pin(async move {
            self.released.store(true, Ordering::SeqCst);
            Ok(self.data.lock().len() as u64)
        })
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
