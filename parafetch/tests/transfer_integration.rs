//! End-to-end transfers through `TransferManager` into real files.
//!
//! Run with: `cargo test --test transfer_integration`

mod common;

use std::path::Path;
use std::time::Duration;

use parafetch::transfer::checksum::sha256_hex;
use parafetch::transfer::ResumeRecord;
use parafetch::{
    ErrorKind, TransferError, TransferManager, TransferRequest, TransferStatus, Transfer,
};
use tempfile::TempDir;

use common::{random_payload, shared, test_config, ScriptedServer};

const URL: &str = "http://objects.test/data/archive.bin";

// ============================================================================
// Helpers
// ============================================================================

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn pause_at_percent(transfer: &Transfer, percent: f64) {
    wait_until("progress", || transfer.progress().percent >= percent).await;
    transfer.pause().unwrap();
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

// ============================================================================
// Pause / resume
// ============================================================================

#[tokio::test]
async fn test_pause_resume_produces_identical_file() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(512 * 1024);
    let (server, transport) =
        shared(ScriptedServer::new(data.clone()).throttled(4096, Duration::from_millis(1)));
    let manager = TransferManager::new(test_config(4, 64 * 1024).with_download_dir(temp.path()), transport);

    let transfer = manager.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    pause_at_percent(&transfer, 30.0).await;

    let record_path = ResumeRecord::path_for(transfer.destination());
    wait_until("resume record", || record_path.exists()).await;
    let record = ResumeRecord::load(&record_path).unwrap();
    assert!(record.bytes_written() > 0);
    assert!(record.bytes_written() < data.len() as u64);
    let before = server.requests().len();

    transfer.resume().await.unwrap();
    transfer.wait().await.unwrap();

    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(read(transfer.destination()), data);
    assert!(!record_path.exists());
    // Nothing written before the pause is fetched again.
    let refetched: u64 = server.requests()[before..]
        .iter()
        .map(|r| r.end.unwrap_or(data.len() as u64) - r.start)
        .sum();
    assert_eq!(refetched, data.len() as u64 - record.bytes_written());
}

#[tokio::test]
async fn test_resume_record_is_picked_up_by_new_transfer() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(384 * 1024);
    let config = test_config(3, 64 * 1024).with_download_dir(temp.path());

    let (_, slow) =
        shared(ScriptedServer::new(data.clone()).throttled(4096, Duration::from_millis(1)));
    let first = TransferManager::new(config.clone(), slow);
    let transfer = first.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    pause_at_percent(&transfer, 25.0).await;

    let record_path = ResumeRecord::path_for(transfer.destination());
    wait_until("resume record", || record_path.exists()).await;
    let saved = ResumeRecord::load(&record_path).unwrap().bytes_written();
    drop(first);

    let (server, fast) = shared(ScriptedServer::new(data.clone()));
    let second = TransferManager::new(config, fast);
    let again = second.create(TransferRequest::url(URL)).unwrap();
    again.start().await.unwrap();
    again.wait().await.unwrap();

    assert_eq!(read(again.destination()), data);
    assert_eq!(server.requested_bytes(), data.len() as u64 - saved);
    assert!(!record_path.exists());
}

#[tokio::test]
async fn test_resume_after_completion_is_rejected() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(100_000);
    let (server, transport) = shared(ScriptedServer::new(data.clone()));
    let manager = TransferManager::new(test_config(4, 10_000).with_download_dir(temp.path()), transport);

    let transfer = manager.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    transfer.wait().await.unwrap();
    let requests = server.requests().len();

    assert!(matches!(
        transfer.resume().await,
        Err(TransferError::InvalidState { .. })
    ));
    assert_eq!(server.requests().len(), requests);
    assert_eq!(read(transfer.destination()), data);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_stops_promptly_and_keeps_partial_file() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(4 * 1024 * 1024);
    let (_, transport) =
        shared(ScriptedServer::new(data).throttled(4096, Duration::from_millis(2)));
    let manager = TransferManager::new(test_config(4, 256 * 1024).with_download_dir(temp.path()), transport);

    let transfer = manager.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    wait_until("first bytes", || transfer.progress().downloaded > 0).await;

    let removed = manager.remove(transfer.id()).unwrap();
    assert_eq!(removed.status(), TransferStatus::Canceled);

    let outcome = tokio::time::timeout(Duration::from_millis(500), transfer.wait())
        .await
        .expect("workers outlived the cancel");
    assert_eq!(outcome, Err(TransferError::Canceled));
    assert!(transfer.destination().exists());
    assert!(manager.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_transient_failures_within_budget_recover() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(64 * 1024);
    let (server, transport) = shared(ScriptedServer::new(data.clone()).failing(2, 503));
    let manager = TransferManager::new(test_config(1, 1024 * 1024).with_download_dir(temp.path()), transport);

    let transfer = manager.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    transfer.wait().await.unwrap();

    assert_eq!(server.requests().len(), 3);
    assert_eq!(transfer.chunks()[0].retries, 2);
    assert_eq!(read(transfer.destination()), data);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_transfer() {
    let temp = TempDir::new().unwrap();
    let (server, transport) = shared(ScriptedServer::new(random_payload(8192)).failing(usize::MAX, 503));
    let manager = TransferManager::new(test_config(1, 1024 * 1024).with_download_dir(temp.path()), transport);

    let transfer = manager.create(TransferRequest::url(URL)).unwrap();
    transfer.start().await.unwrap();
    let err = transfer.wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(matches!(err, TransferError::ChunkFailed { attempts: 3, .. }));
    assert_eq!(server.requests().len(), 3);
    assert_eq!(transfer.status(), TransferStatus::Failed);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_checksum_is_verified() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(50_000);
    let (_, transport) = shared(ScriptedServer::new(data.clone()));
    let manager = TransferManager::new(test_config(2, 10_000).with_download_dir(temp.path()), transport);

    let good = manager
        .create(
            TransferRequest::url(URL)
                .with_id("good")
                .with_destination(temp.path().join("good.bin"))
                .with_checksum(sha256_hex(&data).to_uppercase()),
        )
        .unwrap();
    good.start().await.unwrap();
    good.wait().await.unwrap();

    let bad = manager
        .create(
            TransferRequest::url(URL)
                .with_id("bad")
                .with_destination(temp.path().join("bad.bin"))
                .with_checksum(sha256_hex(b"something else")),
        )
        .unwrap();
    bad.start().await.unwrap();
    let err = bad.wait().await.unwrap_err();

    assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(bad.status(), TransferStatus::Failed);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_manager_runs_transfers_concurrently() {
    let temp = TempDir::new().unwrap();
    let data = random_payload(96 * 1024);
    let (_, transport) = shared(ScriptedServer::new(data.clone()));
    let manager = TransferManager::new(test_config(3, 8 * 1024).with_download_dir(temp.path()), transport);

    let transfers: Vec<Transfer> = (0..4)
        .map(|i| {
            manager
                .create(
                    TransferRequest::url(URL)
                        .with_id(format!("copy-{i}"))
                        .with_destination(temp.path().join(format!("copy-{i}.bin"))),
                )
                .unwrap()
        })
        .collect();
    assert_eq!(manager.active_count(), 4);

    let started = futures::future::join_all(transfers.iter().map(|t| t.start())).await;
    assert!(started.iter().all(Result::is_ok));
    let finished = futures::future::join_all(transfers.iter().map(|t| t.wait())).await;
    assert!(finished.iter().all(Result::is_ok));

    assert_eq!(manager.active_count(), 0);
    for transfer in manager.list() {
        assert_eq!(transfer.status(), TransferStatus::Completed);
        assert_eq!(read(transfer.destination()), data);
    }
}
