//! SHA-256 verification of finished downloads.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::TransferError;

/// Read buffer for hashing (64 KiB).
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).map_err(|e| TransferError::io(path, &e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| TransferError::io(path, &e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compares a file against an expected hex digest (case-insensitive).
pub fn verify_file(path: &Path, expected: &str) -> Result<(), TransferError> {
    let actual = file_sha256(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(TransferError::ChecksumMismatch {
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// [`verify_file`] on the blocking pool.
pub async fn verify_file_async(path: PathBuf, expected: String) -> Result<(), TransferError> {
    let join_path = path.clone();
    tokio::task::spawn_blocking(move || verify_file(&path, &expected))
        .await
        .map_err(|e| TransferError::Io {
            path: join_path,
            reason: e.to_string(),
        })?
}
