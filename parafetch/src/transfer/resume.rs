//! Persisted resume state.
//!
//! A resume record maps each chunk to the bytes already written at its
//! offset. It is saved next to the destination as `<destination>.resume`,
//! only after the destination has been flushed, so every byte the record
//! claims is on disk. A record is used at start only when it describes the
//! same transfer and the same total size.

use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::source::TransferId;

use super::chunk::{Chunk, ChunkStatus};

/// Bumped whenever the on-disk layout changes.
pub const RESUME_FORMAT_VERSION: u32 = 2;

const RESUME_SUFFIX: &str = ".resume";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub format_version: u32,
    /// Version of the engine that wrote the record.
    pub engine_version: String,
    pub transfer_id: String,
    pub total_size: Option<u64>,
    pub chunks: Vec<ChunkProgress>,
    pub saved_at_secs: u64,
}

impl ResumeRecord {
    pub fn new(id: &TransferId, total_size: Option<u64>, chunks: &[Chunk]) -> Self {
        let saved_at_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            format_version: RESUME_FORMAT_VERSION,
            engine_version: crate::VERSION.to_string(),
            transfer_id: id.to_string(),
            total_size,
            chunks: chunks
                .iter()
                .map(|chunk| ChunkProgress {
                    index: chunk.index,
                    start: chunk.range.start,
                    end: chunk.range.end,
                    bytes_written: chunk.bytes_written,
                    done: chunk.is_done(),
                })
                .collect(),
            saved_at_secs,
        }
    }

    /// `<destination>.resume`
    pub fn path_for(destination: &Path) -> PathBuf {
        let mut name = OsString::from(destination.as_os_str());
        name.push(RESUME_SUFFIX);
        PathBuf::from(name)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to deserialize resume record: {}", e),
            )
        })
    }

    /// Writes to a sibling temp file, syncs it and renames it into place,
    /// so a crash leaves either the old record or the new one.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut temp_name = OsString::from(path.as_os_str());
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut writer = BufWriter::new(std::fs::File::create(&temp_path)?);
        bincode::serialize_into(&mut writer, self)
            .map_err(|e| io::Error::other(format!("Failed to serialize resume record: {}", e)))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, path)
    }

    /// Deletes the record at `path`. A missing record is not an error.
    pub fn remove(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Whether this record belongs to transfer `id` of size `total_size`.
    pub fn matches(&self, id: &TransferId, total_size: Option<u64>) -> bool {
        self.format_version == RESUME_FORMAT_VERSION
            && self.transfer_id == id.as_str()
            && self.total_size == total_size
    }

    /// Rebuilds the chunk table. Written counts are clamped to each range.
    pub fn restore(&self) -> Vec<Chunk> {
        self.chunks
            .iter()
            .map(|progress| {
                let mut chunk = Chunk::new(progress.index, progress.start..progress.end);
                chunk.bytes_written = progress.bytes_written.min(chunk.len());
                if progress.done {
                    chunk.status = ChunkStatus::Done;
                }
                chunk
            })
            .collect()
    }

    pub fn bytes_written(&self) -> u64 {
        self.chunks.iter().map(|c| c.bytes_written).sum()
    }
}
