//! Transfer records and lifecycle states.
//!
//! A transfer moves through a small state machine:
//!
//! 1. `Queued` - accepted, waiting for a concurrency slot
//! 2. `Active` - the engine is moving bytes
//! 3. `Paused` - suspended with its progress intact, slot released
//! 4. `Completed` / `Failed` - the engine finished, or gave up
//! 5. `Removed` - stopped by the caller and purged
//!
//! `Paused` and `Failed` transfers re-enter the queue via resume. `Removed`
//! is terminal: the record disappears from the registry and the snapshot,
//! and the id reports not-found afterwards.

use crate::identity::TransferId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Accepted and waiting for a concurrency slot.
    Queued,
    /// Holding a slot; the engine is moving bytes.
    Active,
    /// Suspended by the caller; progress and resume state are kept.
    Paused,
    /// The engine gave up; an explicit resume retries.
    Failed,
    /// All bytes landed and the file is at its destination.
    Completed,
    /// Stopped by the caller and purged.
    Removed,
}

impl TransferState {
    /// True for states that hold or wait for a concurrency slot.
    pub fn is_live(self) -> bool {
        matches!(self, TransferState::Queued | TransferState::Active)
    }

    /// True once the engine is done with the transfer, either way.
    pub fn is_finished(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }

    /// True for states an explicit resume can restart.
    pub fn is_resumable(self) -> bool {
        matches!(self, TransferState::Paused | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Queued => "queued",
            TransferState::Active => "active",
            TransferState::Paused => "paused",
            TransferState::Failed => "failed",
            TransferState::Completed => "completed",
            TransferState::Removed => "removed",
        };
        f.pad(name)
    }
}

/// A point-in-time view of one transfer.
///
/// Values handed to callers and delegates are snapshots: they do not
/// update as the transfer progresses, and holding one does not keep the
/// transfer alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Stable identifier derived from the URL and discriminator.
    pub id: TransferId,

    /// Source URL.
    pub url: String,

    /// Final destination path for the downloaded file.
    pub destination: PathBuf,

    /// Caller-supplied tag separating transfers that share a URL.
    pub discriminator: Option<String>,

    /// Current lifecycle state.
    pub state: TransferState,

    /// Bytes staged or written so far.
    pub bytes_downloaded: u64,

    /// Total size, when the source reports one.
    pub total_bytes: Option<u64>,

    /// Message from the most recent failure, if any.
    pub error: Option<String>,
}

impl Transfer {
    /// Fraction of the transfer completed, when the total size is known.
    pub fn fraction_complete(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.bytes_downloaded as f64 / total as f64
            }
        })
    }
}
