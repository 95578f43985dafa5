//! Events published by a running transfer.
//!
//! State changes and progress samples are the only things a transfer
//! announces. Observers subscribe through
//! [`Transfer::subscribe`](super::Transfer::subscribe) and receive them over
//! a broadcast channel; a slow observer lags and skips events rather than
//! holding back the workers.

use crate::source::TransferId;

use super::progress::ProgressSnapshot;
use super::status::TransferStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },
    Progress {
        id: TransferId,
        progress: ProgressSnapshot,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            TransferEvent::StateChanged { id, .. } | TransferEvent::Progress { id, .. } => id,
        }
    }

    /// Whether this event moved the transfer into a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::StateChanged { to, .. } if to.is_terminal())
    }
}
