//! Aggregate transfer status and its transition rules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Transfer`](super::Transfer).
///
/// ```text
/// Queued → Running ⇄ Paused
///             │         │
///             └────┬────┘
///                  ▼
///   Completed | Failed | Canceled
/// ```
///
/// `Canceled` is reachable from every non-terminal status. `Paused` reaches
/// `Failed` only when a chunk failed for good while the pause took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, Paused | Completed | Failed) => true,
            (Paused, Running | Failed) => true,
            (from, Canceled) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Running => "running",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}
