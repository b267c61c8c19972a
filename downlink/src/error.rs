//! Error types for session operations.

use crate::engine::EngineError;
use crate::identity::TransferId;
use thiserror::Error;

/// Errors surfaced by [`DownloadSession`](crate::session::DownloadSession)
/// operations.
///
/// Every failure is attributable to a single transfer or to the session
/// itself; an error on one transfer never aborts its siblings.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The given id does not match any known transfer.
    #[error("no transfer with id {0}")]
    NotFound(TransferId),

    /// The engine reported an unrecoverable failure for a transfer.
    ///
    /// The transfer is parked in
    /// [`Failed`](crate::transfer::TransferState::Failed) and can be
    /// retried with an explicit resume.
    #[error("transfer {id} failed")]
    TransferFailed {
        id: TransferId,
        #[source]
        source: EngineError,
    },

    /// The session snapshot could not be written (or read at open).
    ///
    /// In-memory state remains authoritative; the next successful write
    /// restores consistency on disk.
    #[error("failed to persist session state: {0}")]
    PersistenceWriteFailed(#[source] std::io::Error),

    /// A configuration value was rejected; the previous value is retained.
    #[error("invalid configuration: {0}")]
    ConfigurationConflict(String),

    /// The session has been shut down and no longer accepts operations.
    #[error("session is shut down")]
    ShuttingDown,
}
