//! Positioned-write destination for chunk data.
//!
//! Chunks are disjoint by construction, so concurrent writers never need a
//! cross-chunk lock: each write goes straight to its own offset. The file
//! handle is shared behind an `Arc` and the short-lived mutex only guards
//! swapping it in and out.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use super::transport::BoxFuture;

/// Destination for fetched bytes.
pub trait ChunkSink: Send + Sync {
    /// Readies the destination before any chunk starts.
    ///
    /// With `resume` set, previously written bytes are kept. A known
    /// `total_size` pre-allocates the destination.
    fn prepare(&self, total_size: Option<u64>, resume: bool) -> BoxFuture<'_, io::Result<()>>;

    /// Writes `data` at `offset`. Safe to call concurrently for disjoint
    /// ranges.
    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Makes every completed write durable.
    fn flush(&self) -> BoxFuture<'_, io::Result<()>>;

    /// Flushes, closes and returns the final size of the destination.
    fn finalize(&self) -> BoxFuture<'_, io::Result<u64>>;

    /// Drops the destination handle without finalising it.
    fn release(&self);
}

/// Opaque transform applied to bytes before they reach the destination,
/// such as stream decryption keyed by absolute offset.
pub trait ByteTransform: Send + Sync {
    fn apply(&self, offset: u64, data: &mut [u8]);
}

/// [`ChunkSink`] writing into a pre-allocated file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> io::Result<Arc<File>> {
        self.file.lock().clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", self.path.display()),
            )
        })
    }
}

impl ChunkSink for FileSink {
    fn prepare(&self, total_size: Option<u64>, resume: bool) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let path = self.path.clone();
            let file = tokio::task::spawn_blocking(move || open_destination(&path, total_size, resume))
                .await
                .map_err(io::Error::other)??;

            debug!(
                path = %self.path.display(),
                total_size = ?total_size,
                resume,
                "Destination prepared"
            );
            *self.file.lock() = Some(Arc::new(file));
            Ok(())
        })
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let file = self.handle()?;
            tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
                .await
                .map_err(io::Error::other)?
        })
    }

    fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let Some(file) = self.file.lock().clone() else {
                return Ok(());
            };
            tokio::task::spawn_blocking(move || file.sync_data())
                .await
                .map_err(io::Error::other)?
        })
    }

    fn finalize(&self) -> BoxFuture<'_, io::Result<u64>> {
        Box::pin(async move {
            let file = self.file.lock().take();
            match file {
                Some(file) => tokio::task::spawn_blocking(move || {
                    file.sync_all()?;
                    Ok(file.metadata()?.len())
                })
                .await
                .map_err(io::Error::other)?,
                None => Ok(tokio::fs::metadata(&self.path).await?.len()),
            }
        })
    }

    fn release(&self) {
        if self.file.lock().take().is_some() {
            debug!(path = %self.path.display(), "Destination released");
        }
    }
}

fn open_destination(path: &Path, total_size: Option<u64>, resume: bool) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(!resume)
        .open(path)?;

    if let Some(total) = total_size {
        if file.metadata()?.len() != total {
            file.set_len(total)?;
        }
    }
    Ok(file)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sink adapter that runs every write through a [`ByteTransform`].
pub struct TransformSink {
    inner: Arc<dyn ChunkSink>,
    transform: Arc<dyn ByteTransform>,
}

impl TransformSink {
    pub fn new(inner: Arc<dyn ChunkSink>, transform: Arc<dyn ByteTransform>) -> Self {
        Self { inner, transform }
    }
}

impl ChunkSink for TransformSink {
    fn prepare(&self, total_size: Option<u64>, resume: bool) -> BoxFuture<'_, io::Result<()>> {
        self.inner.prepare(total_size, resume)
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let mut buf = BytesMut::from(&data[..]);
        self.transform.apply(offset, &mut buf);
        self.inner.write_at(offset, buf.freeze())
    }

    fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        self.inner.flush()
    }

    fn finalize(&self) -> BoxFuture<'_, io::Result<u64>> {
        self.inner.finalize()
    }

    fn release(&self) {
        self.inner.release()
    }
}
