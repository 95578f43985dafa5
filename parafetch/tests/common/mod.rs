//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use parafetch::transfer::{BoxFuture, ProbeInfo, RangeBody, RangeRequest, RangeTransport};
use parafetch::{EngineConfig, FetchError, RetryPolicy};

/// Random, incompressible payload.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    data
}

/// Engine settings tuned for fast tests.
pub fn test_config(workers: usize, min_chunk_size: u64) -> EngineConfig {
    EngineConfig::default()
        .with_workers(workers)
        .with_min_chunk_size(min_chunk_size)
        .with_read_buffer_size(4096)
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
        .with_progress_interval(Duration::from_millis(10))
}

/// In-memory server for one object that honours range requests.
pub struct ScriptedServer {
    data: Bytes,
    piece_size: usize,
    piece_delay: Option<Duration>,
    /// GETs that answer with `failure_status` before the server recovers.
    failures_left: AtomicUsize,
    failure_status: u16,
    requests: Mutex<Vec<RangeRequest>>,
}

impl ScriptedServer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            piece_size: 8192,
            piece_delay: None,
            failures_left: AtomicUsize::new(0),
            failure_status: 503,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Streams bodies slowly enough to pause or cancel mid-transfer.
    pub fn throttled(mut self, piece_size: usize, delay: Duration) -> Self {
        self.piece_size = piece_size;
        self.piece_delay = Some(delay);
        self
    }

    /// Answers the next `count` GETs with `status`.
    pub fn failing(self, count: usize, status: u16) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        Self {
            failure_status: status,
            ..self
        }
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Bytes asked for across every recorded GET.
    pub fn requested_bytes(&self) -> u64 {
        let len = self.data.len() as u64;
        self.requests()
            .iter()
            .map(|r| r.end.unwrap_or(len) - r.start)
            .sum()
    }
}

impl RangeTransport for ScriptedServer {
    fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, FetchError>> {
        Box::pin(async move {
            Ok(ProbeInfo {
                total_size: Some(self.data.len() as u64),
                accepts_ranges: true,
            })
        })
    }

    fn get<'a>(
        &'a self,
        _url: &'a str,
        range: RangeRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RangeBody>, FetchError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(range);

            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let len = self.data.len() as u64;
            let (status, data) = if failing {
                (self.failure_status, Bytes::new())
            } else {
                let end = range.end.map_or(len, |end| cmp::min(end, len));
                (206, self.data.slice(range.start as usize..end as usize))
            };

            Ok(Box::new(ScriptedBody {
                status,
                data,
                piece_size: self.piece_size,
                piece_delay: self.piece_delay,
            }) as Box<dyn RangeBody>)
        })
    }
}

struct ScriptedBody {
    status: u16,
    data: Bytes,
    piece_size: usize,
    piece_delay: Option<Duration>,
}

impl RangeBody for ScriptedBody {
    fn status(&self) -> u16 {
        self.status
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>> {
        Box::pin(async move {
            if self.data.is_empty() {
                return Ok(None);
            }
            if let Some(delay) = self.piece_delay {
                tokio::time::sleep(delay).await;
            }
            let take = cmp::min(self.piece_size, self.data.len());
            Ok(Some(self.data.split_to(take)))
        })
    }
}

/// Shares one server between the test and the engine.
pub fn shared(server: ScriptedServer) -> (Arc<ScriptedServer>, Arc<dyn RangeTransport>) {
    let server = Arc::new(server);
    let transport: Arc<dyn RangeTransport> = server.clone();
    (server, transport)
}
