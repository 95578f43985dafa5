//! Parafetch - resumable, multi-worker HTTP range downloads
//!
//! This library retrieves large remote objects by splitting them into byte
//! ranges, fetching the ranges concurrently over HTTP range requests and
//! writing each range straight to its offset in a pre-allocated output file.
//!
//! # Architecture
//!
//! ```text
//! TransferManager (registry)
//!         │
//!         └── Transfer (state machine, worker pool)
//!                 │
//!                 ├── ChunkPlanner     (byte range layout)
//!                 ├── RangeFetcher     (one range request, retry + backoff)
//!                 │       └── RangeTransport (HTTP seam, reqwest by default)
//!                 ├── ChunkSink        (positioned writes, finalisation)
//!                 └── ProgressAggregator (counters, speed, ETA)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parafetch::{EngineConfig, ReqwestTransport, TransferManager, TransferRequest};
//!
//! let config = EngineConfig::load_or_default(None)?;
//! let transport = Arc::new(ReqwestTransport::from_config(&config)?);
//! let manager = TransferManager::new(config, transport);
//!
//! let transfer = manager.create(TransferRequest::url("https://example.com/big.iso"))?;
//! transfer.start().await?;
//! transfer.wait().await?;
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod manager;
pub mod source;
pub mod transfer;

pub use config::{EngineConfig, ProxyConfig};
pub use error::{ConfigError, ErrorKind, FetchError, ManagerError, TransferError};
pub use manager::TransferManager;
pub use source::{DownloadSource, SourceLocator, TransferId, UrlResolver};
pub use transfer::{
    ByteTransform, Chunk, ChunkSink, ChunkStatus, FileSink, ProgressSnapshot, RangeTransport,
    ReqwestTransport, RetryPolicy, Transfer, TransferEvent, TransferInfo, TransferRequest,
    TransferStatus,
};

/// Crate version, recorded in persisted resume records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
