//! Chunk planning.
//!
//! The planner splits `[0, total_size)` into at most `workers` contiguous
//! chunks, never smaller than the configured floor unless the whole object
//! is. Every positioned write relies on the plan being disjoint, so
//! [`ChunkPlanner::validate`] re-checks any plan that did not come straight
//! from [`ChunkPlanner::plan`] (for example one restored from disk).

use crate::error::TransferError;

use super::chunk::{Chunk, ChunkJob, OPEN_END};

/// Default floor for a chunk's size (4 MiB).
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    min_chunk_size: u64,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHUNK_SIZE)
    }
}

impl ChunkPlanner {
    /// Creates a planner with the given chunk size floor (at least 1 byte).
    pub fn new(min_chunk_size: u64) -> Self {
        Self {
            min_chunk_size: min_chunk_size.max(1),
        }
    }

    pub fn min_chunk_size(&self) -> u64 {
        self.min_chunk_size
    }

    /// `min(workers, ceil(total_size / min_chunk_size))`, or 0 for an empty
    /// object.
    pub fn chunk_count(&self, total_size: u64, workers: usize) -> usize {
        if total_size == 0 {
            return 0;
        }
        let by_size = total_size.div_ceil(self.min_chunk_size);
        by_size.min(workers as u64).max(1) as usize
    }

    /// Plans the chunk set for a fresh transfer.
    ///
    /// An unknown size yields a single open-ended chunk. A zero size yields
    /// no chunks at all.
    ///
    /// # Arguments
    ///
    /// * `total_size` - Object size from the probe, if the server reported one
    /// * `workers` - Upper bound on the number of chunks
    pub fn plan(&self, total_size: Option<u64>, workers: usize) -> Result<Vec<Chunk>, TransferError> {
        if workers == 0 {
            return Err(TransferError::Planning(
                "worker count must be at least 1".to_string(),
            ));
        }

        let Some(total_size) = total_size else {
            return Ok(vec![Chunk::open_ended()]);
        };
        if total_size == OPEN_END {
            return Err(TransferError::Planning(format!(
                "total size {total_size} is out of range"
            )));
        }

        let count = self.chunk_count(total_size, workers);
        if count == 0 {
            return Ok(Vec::new());
        }

        // Spread the remainder over the leading chunks so sizes differ by
        // at most one byte.
        let base = total_size / count as u64;
        let remainder = total_size % count as u64;
        let mut chunks = Vec::with_capacity(count);
        let mut start = 0;
        for index in 0..count {
            let len = base + u64::from((index as u64) < remainder);
            chunks.push(Chunk::new(index, start..start + len));
            start += len;
        }
        Ok(chunks)
    }

    /// Plans a single chunk for a server that does not honour range requests.
    pub fn single(total_size: Option<u64>) -> Vec<Chunk> {
        match total_size {
            None => vec![Chunk::open_ended()],
            Some(0) => Vec::new(),
            Some(total) => vec![Chunk::new(0, 0..total)],
        }
    }

    /// Remaining work for a partially downloaded chunk set.
    ///
    /// Each job covers the original range minus its written prefix and keeps
    /// the original index. Done and fully written chunks produce no job.
    pub fn replan(chunks: &[Chunk]) -> Vec<ChunkJob> {
        chunks
            .iter()
            .filter(|chunk| !chunk.is_done() && !chunk.is_fully_written())
            .map(Chunk::job)
            .collect()
    }

    /// Checks that `chunks` tile `[0, total_size)` exactly.
    pub fn validate(chunks: &[Chunk], total_size: Option<u64>) -> Result<(), TransferError> {
        let invalid = |msg: String| Err(TransferError::InvalidPlan(msg));

        let Some(total_size) = total_size else {
            return match chunks {
                [only] if only.is_open_ended() && only.range.start == 0 => Ok(()),
                _ => invalid("unknown-length plan must be one open-ended chunk".to_string()),
            };
        };

        let mut expected_start = 0;
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.index != position {
                return invalid(format!("chunk at position {position} has index {}", chunk.index));
            }
            if chunk.range.start != expected_start {
                return invalid(format!(
                    "chunk {} starts at {} instead of {expected_start}",
                    chunk.index, chunk.range.start
                ));
            }
            if chunk.range.is_empty() {
                return invalid(format!("chunk {} is empty", chunk.index));
            }
            if chunk.bytes_written > chunk.len() {
                return invalid(format!(
                    "chunk {} wrote {} of {} bytes",
                    chunk.index,
                    chunk.bytes_written,
                    chunk.len()
                ));
            }
            expected_start = chunk.range.end;
        }

        if expected_start != total_size {
            return invalid(format!("plan covers {expected_start} of {total_size} bytes"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
