//! Registry of transfers keyed by identity.
//!
//! The manager owns the shared transport and configuration and injects them
//! into every transfer it creates. Registry operations never touch a
//! transfer's internals beyond the calls its public API offers, so the map
//! lock and a transfer's state lock are never held together.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ConfigError, ManagerError};
use crate::source::{DownloadSource, SourceLocator, TransferId, UrlResolver};
use crate::transfer::{RangeTransport, ReqwestTransport, Transfer, TransferRequest};

pub struct TransferManager {
    config: Arc<EngineConfig>,
    transport: Arc<dyn RangeTransport>,
    transfers: DashMap<TransferId, Transfer>,
}

impl TransferManager {
    pub fn new(config: EngineConfig, transport: Arc<dyn RangeTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            transfers: DashMap::new(),
        }
    }

    /// Manager backed by a reqwest client built from `config`.
    pub fn with_reqwest(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::from_config(&config)?);
        Ok(Self::new(config, transport))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Builds a transfer with the manager's transport and configuration and
    /// registers it. The transfer starts out `Queued`.
    pub fn create(&self, request: TransferRequest) -> Result<Transfer, ManagerError> {
        let transfer = Transfer::new(
            request,
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
        );
        self.add(transfer.clone())?;
        Ok(transfer)
    }

    /// Parses a locator URL (`.../<object id>#<key>`) and creates a transfer
    /// whose download URL is produced by `resolver` at start.
    pub fn create_resolved(
        &self,
        locator: &str,
        resolver: Arc<dyn UrlResolver>,
    ) -> Result<Transfer, ManagerError> {
        let locator = SourceLocator::parse(locator)?;
        self.create(TransferRequest::new(DownloadSource::resolved(locator, resolver)))
    }

    /// Registers an existing transfer under its id.
    pub fn add(&self, transfer: Transfer) -> Result<(), ManagerError> {
        match self.transfers.entry(transfer.id().clone()) {
            Entry::Occupied(entry) => Err(ManagerError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(transfer = %transfer.id(), "Registered transfer");
                entry.insert(transfer);
                Ok(())
            }
        }
    }

    /// Unregisters a transfer, canceling it if it is still active.
    ///
    /// The map entry is taken before the cancel, so of several concurrent
    /// removals of one id exactly one succeeds, and a transfer added under
    /// the same id afterwards is never unregistered by a stale call.
    ///
    /// # Arguments
    ///
    /// * `id` - Identity the transfer was registered under
    pub fn remove(&self, id: &TransferId) -> Result<Transfer, ManagerError> {
        let (_, transfer) = self
            .transfers
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;

        if transfer.status().is_active() {
            // Losing a race with a natural finish is fine.
            let _ = transfer.cancel();
        }
        info!(transfer = %id, status = %transfer.status(), "Removed transfer");
        Ok(transfer)
    }

    pub fn get(&self, id: &TransferId) -> Option<Transfer> {
        self.transfers.get(id).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every registered transfer, in no particular
    /// order.
    pub fn list(&self) -> Vec<Transfer> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Transfers that are not in a terminal status.
    pub fn active_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|entry| entry.value().status().is_active())
            .count()
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("transfers", &self.transfers.len())
            .finish_non_exhaustive()
    }
}
