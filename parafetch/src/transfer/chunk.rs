//! Chunk model.
//!
//! A chunk is a contiguous byte sub-range of the destination that is fetched
//! independently. The engine keeps one [`Chunk`] per planned range for the
//! lifetime of a transfer; workers receive owned [`ChunkJob`]s describing
//! what is left of a chunk.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Range end used for a stream whose length the server did not report.
pub const OPEN_END: u64 = u64::MAX;

/// Per-chunk status.
///
/// Moves forward through `Pending → InFlight → {Done | Failed}`. `Failed`
/// returns to `Pending` when the fetcher retries, and an `InFlight` chunk
/// returns to `Pending` when its run is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl ChunkStatus {
    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Done)
                | (InFlight, Failed)
                | (InFlight, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InFlight => "in-flight",
            ChunkStatus::Done => "done",
            ChunkStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One planned byte range of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Ordinal position; equals the chunk's position in byte order.
    pub index: usize,
    /// `[start, end)` within the destination. `end` is [`OPEN_END`] for an
    /// unknown-length stream until it completes.
    pub range: Range<u64>,
    pub bytes_written: u64,
    pub status: ChunkStatus,
    pub last_error: Option<FetchError>,
    /// Number of retries performed so far.
    pub retries: u32,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            bytes_written: 0,
            status: ChunkStatus::Pending,
            last_error: None,
            retries: 0,
        }
    }

    /// A single chunk covering a stream of unknown length.
    pub fn open_ended() -> Self {
        Self::new(0, 0..OPEN_END)
    }

    pub fn is_open_ended(&self) -> bool {
        self.range.end == OPEN_END
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Bytes still to fetch. Unbounded for an open-ended chunk.
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.bytes_written)
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }

    /// Whether every byte of a bounded chunk has been written.
    pub fn is_fully_written(&self) -> bool {
        !self.is_open_ended() && self.bytes_written >= self.len()
    }

    /// Moves to `next`, returning whether the transition was legal.
    ///
    /// An illegal transition leaves the chunk untouched.
    pub fn transition(&mut self, next: ChunkStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Owned work item for what is left of this chunk.
    pub fn job(&self) -> ChunkJob {
        ChunkJob {
            index: self.index,
            start: self.range.start + self.bytes_written,
            end: (!self.is_open_ended()).then_some(self.range.end),
        }
    }
}

/// Owned unit of work handed to a fetch worker.
///
/// `start` already accounts for bytes written by earlier runs. `end` is
/// `None` for an open-ended stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
}

impl ChunkJob {
    /// Bytes this job must deliver, when known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}
