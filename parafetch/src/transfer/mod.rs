//! Chunked, concurrent range download engine.
//!
//! A [`Transfer`] plans its destination into chunks, runs a bounded pool of
//! workers that each pull one chunk at a time and fetch it with a
//! [`RangeFetcher`](fetcher::RangeFetcher), and finalises the destination
//! once every chunk is done. Pause, resume and cancel act on a per-run
//! cancellation scope.
//!
//! # Module layout
//!
//! - [`chunk`] / [`planner`]: the byte-range model and how it is laid out
//! - [`transport`]: the HTTP seam and its reqwest implementation
//! - [`fetcher`] / [`policy`]: one chunk's request loop with retry
//! - [`sink`]: positioned writes into the destination
//! - [`progress`]: counters, speed and ETA
//! - [`resume`]: persisted chunk progress
//! - [`orchestrator`]: the transfer state machine and worker pool

pub mod checksum;
pub mod chunk;
pub mod events;
pub mod fetcher;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod progress;
pub mod resume;
pub mod sink;
pub mod status;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{Chunk, ChunkJob, ChunkStatus};
pub use events::TransferEvent;
pub use fetcher::{FetchOutcome, RangeFetcher};
pub use orchestrator::{Transfer, TransferInfo, TransferRequest};
pub use planner::ChunkPlanner;
pub use policy::RetryPolicy;
pub use progress::{ProgressAggregator, ProgressReporter, ProgressSnapshot};
pub use resume::ResumeRecord;
pub use sink::{ByteTransform, ChunkSink, FileSink, TransformSink};
pub use status::TransferStatus;
pub use transport::{
    BoxFuture, ProbeInfo, RangeBody, RangeRequest, RangeTransport, ReqwestTransport,
};
