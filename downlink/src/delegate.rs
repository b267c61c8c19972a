//! Progress and completion callbacks.

use crate::error::SessionError;
use crate::transfer::Transfer;

/// Observer for transfer lifecycle events.
///
/// The session holds delegates weakly: dropping the last strong reference
/// silently unsubscribes, and a gone delegate never blocks or fails a
/// transfer. Callbacks run on the session's event pump after its internal
/// lock is released, so a delegate may call back into the session.
///
/// All methods default to no-ops; implement the ones you care about.
pub trait TransferDelegate: Send + Sync {
    /// Byte progress for an active transfer.
    fn transfer_progress(&self, _transfer: &Transfer) {}

    /// The transfer finished and the file is at its destination.
    fn transfer_completed(&self, _transfer: &Transfer) {}

    /// The engine gave up on the transfer.
    ///
    /// The transfer is parked in
    /// [`Failed`](crate::transfer::TransferState::Failed); an explicit
    /// [`resume`](crate::session::DownloadSession::resume) retries it.
    fn transfer_failed(&self, _transfer: &Transfer, _error: &SessionError) {}
}
