//! Download session facade.
//!
//! [`DownloadSession`] ties the pieces together:
//!
//! 1. a registry of transfer records keyed by [`TransferId`]
//! 2. the admission scheduler enforcing the concurrency ceiling
//! 3. the snapshot store persisting state across process restarts
//! 4. the completion ledger latching background wakeup handlers
//!
//! All four live behind one mutex. Public operations lock it, mutate, and
//! collect the delegate callbacks and completion handlers the mutation
//! produced; those run after the lock is released, so a delegate can call
//! back into the session without deadlocking.
//!
//! Engine events arrive on an unbounded channel drained by a single pump
//! task. Events are correlated by engine handle, and pausing or stopping
//! a transfer unmaps its handle first, so an event that was already in
//! flight when the caller acted is recognized as stale and dropped.

mod completion;

pub use completion::{CompletionHandler, WakeupId};

use crate::config::SessionConfig;
use crate::delegate::TransferDelegate;
use crate::engine::{
    EngineEvent, EngineEventKind, EngineEventSender, EngineHandle, TransferEngine, TransferRequest,
};
use crate::error::SessionError;
use crate::identity::TransferId;
use crate::persistence::{PersistedTransfer, SnapshotStore};
use crate::scheduler::{Admission, AdmissionScheduler};
use crate::transfer::{Transfer, TransferState};
use completion::CompletionLedger;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Buffered session events per subscriber before lagging.
const SESSION_EVENT_CAPACITY: usize = 32;

/// Coarse session-wide events, published on [`DownloadSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// No transfer holds or waits for a slot any more.
    ///
    /// Fires when the last live transfer reaches a terminal state; paused
    /// and failed transfers do not count as pending work.
    AllTransfersFinished,
}

/// Internal bookkeeping for one transfer.
struct TransferRecord {
    transfer: Transfer,
    delegate: Weak<dyn TransferDelegate>,
    /// Engine resume state captured at the most recent pause.
    token: Option<crate::engine::ResumeToken>,
    /// Live engine handle while the transfer is `Active`.
    handle: Option<EngineHandle>,
}

struct NoDelegate;

impl TransferDelegate for NoDelegate {}

/// A delegate reference that never upgrades. Restored transfers report to
/// nobody until a caller re-attaches one via `start`.
fn detached_delegate() -> Weak<dyn TransferDelegate> {
    Weak::<NoDelegate>::new()
}

/// One delegate callback, recorded under the lock and run after release.
enum DelegateCall {
    Progress(Transfer),
    Completed(Transfer),
    Failed(Transfer, SessionError),
}

/// Side effects collected while the session lock is held.
#[derive(Default)]
struct Notifications {
    calls: Vec<(Weak<dyn TransferDelegate>, DelegateCall)>,
    completion_handlers: Vec<CompletionHandler>,
    all_finished: bool,
}

impl Notifications {
    fn dispatch(self, session_events: &broadcast::Sender<SessionEvent>) {
        for (delegate, call) in self.calls {
            let Some(delegate) = delegate.upgrade() else {
                continue;
            };
            match call {
                DelegateCall::Progress(transfer) => delegate.transfer_progress(&transfer),
                DelegateCall::Completed(transfer) => delegate.transfer_completed(&transfer),
                DelegateCall::Failed(transfer, error) => delegate.transfer_failed(&transfer, &error),
            }
        }
        for handler in self.completion_handlers {
            handler();
        }
        if self.all_finished {
            let _ = session_events.send(SessionEvent::AllTransfersFinished);
        }
    }
}

struct SessionState {
    records: HashMap<TransferId, TransferRecord>,
    scheduler: AdmissionScheduler,
    /// Engine handle to transfer id, for live transfers only. An event
    /// whose handle is absent here is stale and gets dropped.
    handles: HashMap<EngineHandle, TransferId>,
    ledger: CompletionLedger,
    store: SnapshotStore,
    directory: PathBuf,
    allow_cellular: bool,
    wakeup_identifier: WakeupId,
    shut_down: bool,
}

impl SessionState {
    /// Rebuilds the registry from a persisted snapshot.
    fn restore(&mut self, entries: Vec<PersistedTransfer>) {
        for entry in entries {
            let state = match entry.state {
                // Live engine work did not survive the process exit; the
                // transfer goes back through admission.
                TransferState::Active => TransferState::Queued,
                other => other,
            };
            let transfer = Transfer {
                id: entry.id.clone(),
                url: entry.url,
                destination: entry.destination,
                discriminator: entry.discriminator,
                state,
                bytes_downloaded: entry.bytes_downloaded,
                total_bytes: entry.total_bytes,
                error: entry.error,
            };
            self.records.insert(
                entry.id,
                TransferRecord {
                    transfer,
                    delegate: detached_delegate(),
                    token: entry.resume_token,
                    handle: None,
                },
            );
        }
    }

    /// Starts engine work for transfers the scheduler just admitted.
    ///
    /// A transfer the engine refuses is parked as `Failed` and its slot is
    /// handed to the next waiting transfer, which is processed in turn.
    fn start_admitted(
        &mut self,
        admitted: Vec<TransferId>,
        engine: &Arc<dyn TransferEngine>,
        events: &EngineEventSender,
        notifications: &mut Notifications,
    ) {
        let mut pending = VecDeque::from(admitted);
        while let Some(id) = pending.pop_front() {
            let allow_cellular = self.allow_cellular;
            let Some(record) = self.records.get_mut(&id) else {
                pending.extend(self.scheduler.release(&id));
                continue;
            };
            let request = TransferRequest {
                url: record.transfer.url.clone(),
                destination: record.transfer.destination.clone(),
                allow_cellular,
            };
            let fresh = record.token.is_none() && record.transfer.bytes_downloaded == 0;
            let started = if fresh {
                engine.begin(request, events.clone())
            } else {
                engine.resume(record.token.clone(), request, events.clone())
            };
            match started {
                Ok(handle) => {
                    record.token = None;
                    record.handle = Some(handle);
                    record.transfer.state = TransferState::Active;
                    record.transfer.error = None;
                    tracing::debug!(id = %id, handle = %handle, "transfer active");
                    self.handles.insert(handle, id.clone());
                }
                Err(error) => {
                    tracing::warn!(id = %id, error = %error, "engine refused transfer");
                    record.transfer.state = TransferState::Failed;
                    record.transfer.error = Some(error.to_string());
                    let failure = SessionError::TransferFailed {
                        id: id.clone(),
                        source: error,
                    };
                    notifications.calls.push((
                        record.delegate.clone(),
                        DelegateCall::Failed(record.transfer.clone(), failure),
                    ));
                    pending.extend(self.scheduler.release(&id));
                }
            }
        }
    }

    /// Suspends one transfer. Returns whether anything changed.
    fn pause_transfer(
        &mut self,
        id: &TransferId,
        engine: &Arc<dyn TransferEngine>,
        events: &EngineEventSender,
        notifications: &mut Notifications,
    ) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        match record.transfer.state {
            TransferState::Active => {
                if let Some(handle) = record.handle.take() {
                    self.handles.remove(&handle);
                    match engine.pause(handle) {
                        Ok(token) => record.token = Some(token),
                        Err(error) => {
                            // The engine finished on its own just before
                            // the pause; its event is stale and will be
                            // dropped, so the transfer parks with the
                            // progress it had.
                            tracing::debug!(id = %id, error = %error, "no live engine transfer to pause");
                        }
                    }
                }
                record.transfer.state = TransferState::Paused;
                tracing::debug!(id = %id, "transfer paused");
                let admitted = self.scheduler.release(id);
                self.start_admitted(admitted, engine, events, notifications);
                true
            }
            TransferState::Queued => {
                record.transfer.state = TransferState::Paused;
                tracing::debug!(id = %id, "queued transfer paused");
                let admitted = self.scheduler.release(id);
                self.start_admitted(admitted, engine, events, notifications);
                true
            }
            _ => false,
        }
    }

    /// Re-queues a paused or failed transfer. Returns whether it did.
    fn resume_transfer(
        &mut self,
        id: &TransferId,
        engine: &Arc<dyn TransferEngine>,
        events: &EngineEventSender,
        notifications: &mut Notifications,
    ) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if !record.transfer.state.is_resumable() {
            return false;
        }
        record.transfer.state = TransferState::Queued;
        record.transfer.error = None;
        tracing::debug!(id = %id, "transfer queued for resume");
        if let Admission::Admitted = self.scheduler.request_admission(id.clone()) {
            self.start_admitted(vec![id.clone()], engine, events, notifications);
        }
        true
    }

    /// Cancels a transfer, purges its record and deletes its data.
    fn stop_transfer(
        &mut self,
        id: &TransferId,
        engine: &Arc<dyn TransferEngine>,
        events: &EngineEventSender,
        notifications: &mut Notifications,
    ) -> bool {
        let Some(mut record) = self.records.remove(id) else {
            tracing::debug!(id = %id, "stop for unknown transfer ignored");
            return false;
        };
        if let Some(handle) = record.handle.take() {
            self.handles.remove(&handle);
            engine.cancel(handle);
        }
        engine.discard(&record.transfer.destination);
        remove_file_quietly(&record.transfer.destination);
        tracing::info!(id = %id, "transfer removed");
        let admitted = self.scheduler.release(id);
        self.start_admitted(admitted, engine, events, notifications);
        true
    }

    /// Restarts an active transfer's engine work under the current network
    /// policy, keeping the slot and the observable state.
    fn reissue_transfer(
        &mut self,
        id: &TransferId,
        engine: &Arc<dyn TransferEngine>,
        events: &EngineEventSender,
        notifications: &mut Notifications,
    ) {
        let allow_cellular = self.allow_cellular;
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let Some(handle) = record.handle.take() else {
            return;
        };
        self.handles.remove(&handle);
        let token = match engine.pause(handle) {
            Ok(token) => Some(token),
            Err(error) => {
                tracing::debug!(id = %id, error = %error, "no live engine transfer to reissue");
                None
            }
        };
        let request = TransferRequest {
            url: record.transfer.url.clone(),
            destination: record.transfer.destination.clone(),
            allow_cellular,
        };
        match engine.resume(token.clone(), request, events.clone()) {
            Ok(new_handle) => {
                record.handle = Some(new_handle);
                self.handles.insert(new_handle, id.clone());
            }
            Err(error) => {
                // Park rather than fail: the staged data is intact and an
                // explicit resume picks it up.
                tracing::warn!(
                    id = %id,
                    error = %error,
                    "transfer cannot continue under new policy, pausing"
                );
                record.transfer.state = TransferState::Paused;
                record.token = token;
                let admitted = self.scheduler.release(id);
                self.start_admitted(admitted, engine, events, notifications);
            }
        }
    }

    /// Updates the wakeup ledger with the current amount of live work.
    fn settle_wakeups(&mut self, notifications: &mut Notifications) {
        let outstanding = self.scheduler.active_count() + self.scheduler.waiting_count();
        if let Some(handler) = self
            .ledger
            .set_outstanding(&self.wakeup_identifier, outstanding)
        {
            notifications.completion_handlers.push(handler);
        }
    }

    fn persisted(&self) -> Vec<PersistedTransfer> {
        let mut entries: Vec<PersistedTransfer> = self
            .records
            .values()
            .map(|record| PersistedTransfer {
                id: record.transfer.id.clone(),
                url: record.transfer.url.clone(),
                destination: record.transfer.destination.clone(),
                discriminator: record.transfer.discriminator.clone(),
                state: record.transfer.state,
                bytes_downloaded: record.transfer.bytes_downloaded,
                total_bytes: record.transfer.total_bytes,
                resume_token: record.token.clone(),
                error: record.transfer.error.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Writes the snapshot; failures are logged, in-memory state stays
    /// authoritative.
    fn persist(&self) {
        if let Err(error) = self.store.save(self.persisted()) {
            tracing::warn!(error = %error, "failed to persist session state");
        }
    }

    fn try_persist(&self) -> Result<(), SessionError> {
        self.store
            .save(self.persisted())
            .map_err(SessionError::PersistenceWriteFailed)
    }

    fn ids_in_state(&self, state: TransferState) -> Vec<TransferId> {
        let mut ids: Vec<TransferId> = self
            .records
            .values()
            .filter(|record| record.transfer.state == state)
            .map(|record| record.transfer.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Client-side download session.
///
/// Owns a set of transfers, runs at most `max_concurrent` of them at a
/// time through a [`TransferEngine`], persists their state across process
/// restarts and reports progress to per-transfer delegates.
///
/// The session is `Send + Sync`; clones of the surrounding `Arc` (or plain
/// references) can drive it from any task.
pub struct DownloadSession {
    state: Arc<Mutex<SessionState>>,
    engine: Arc<dyn TransferEngine>,
    events_tx: EngineEventSender,
    session_events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DownloadSession {
    /// Opens a session over `config.directory`, restoring any persisted
    /// transfers.
    ///
    /// Transfers that were active or queued when the previous process
    /// exited go back through admission immediately; paused, failed and
    /// completed ones are restored as they were. Restored transfers have
    /// no delegate until the caller re-attaches one via [`start`].
    ///
    /// # Errors
    ///
    /// [`SessionError::ConfigurationConflict`] for an invalid config and
    /// [`SessionError::PersistenceWriteFailed`] when the directory or the
    /// snapshot cannot be accessed.
    ///
    /// [`start`]: Self::start
    pub async fn open(
        config: SessionConfig,
        engine: Arc<dyn TransferEngine>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let ceiling = effective_ceiling(config.max_concurrent, engine.max_concurrency());

        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(SessionError::PersistenceWriteFailed)?;
        let store = SnapshotStore::new(&config.directory);
        let persisted = store.load().map_err(SessionError::PersistenceWriteFailed)?;

        let mut state = SessionState {
            records: HashMap::new(),
            scheduler: AdmissionScheduler::new(ceiling),
            handles: HashMap::new(),
            ledger: CompletionLedger::new(),
            store,
            directory: config.directory.clone(),
            allow_cellular: config.allow_cellular,
            wakeup_identifier: config.wakeup_identifier.clone(),
            shut_down: false,
        };
        if let Some(entries) = persisted {
            tracing::info!(count = entries.len(), "restoring persisted transfers");
            state.restore(entries);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let mut notifications = Notifications::default();

        let live = state.ids_in_state(TransferState::Queued);
        let mut admitted = Vec::new();
        for id in live {
            if let Admission::Admitted = state.scheduler.request_admission(id.clone()) {
                admitted.push(id);
            }
        }
        state.start_admitted(admitted, &engine, &events_tx, &mut notifications);
        state.settle_wakeups(&mut notifications);
        state.persist();

        let state = Arc::new(Mutex::new(state));
        let pump = EventPump {
            state: state.clone(),
            engine: engine.clone(),
            events_tx: events_tx.clone(),
            session_events: session_events.clone(),
        };
        let pump_task = tokio::spawn(pump.run(events_rx, shutdown.clone()));
        notifications.dispatch(&session_events);

        tracing::info!(
            directory = %config.directory.display(),
            max_concurrent = ceiling,
            "session open"
        );
        Ok(Self {
            state,
            engine,
            events_tx,
            session_events,
            shutdown,
            pump: Mutex::new(Some(pump_task)),
        })
    }

    /// Accepts a transfer for `url`, or returns the existing one.
    ///
    /// The transfer's identity is derived from `url` and `discriminator`.
    /// Handing in work the session already knows is idempotent: the stored
    /// transfer is returned unchanged (whatever its state) and only the
    /// delegate reference is refreshed, which is also how callers re-attach
    /// to transfers restored from a snapshot.
    ///
    /// The session keeps only a [`Weak`] reference to the delegate.
    ///
    /// # Errors
    ///
    /// [`SessionError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn start(
        &self,
        url: &str,
        discriminator: Option<&str>,
        delegate: &Arc<dyn TransferDelegate>,
    ) -> Result<Transfer, SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(SessionError::ShuttingDown);
            }
            let id = TransferId::compute(url, discriminator);
            if let Some(record) = state.records.get_mut(&id) {
                record.delegate = Arc::downgrade(delegate);
                tracing::debug!(id = %id, state = %record.transfer.state, "transfer already known");
                record.transfer.clone()
            } else {
                let destination = destination_for(&state.directory, &id, url);
                let transfer = Transfer {
                    id: id.clone(),
                    url: url.to_string(),
                    destination,
                    discriminator: discriminator.map(str::to_owned),
                    state: TransferState::Queued,
                    bytes_downloaded: 0,
                    total_bytes: None,
                    error: None,
                };
                tracing::info!(id = %id, url, "transfer accepted");
                let accepted = transfer.clone();
                state.records.insert(
                    id.clone(),
                    TransferRecord {
                        transfer,
                        delegate: Arc::downgrade(delegate),
                        token: None,
                        handle: None,
                    },
                );
                if let Admission::Admitted = state.scheduler.request_admission(id.clone()) {
                    state.start_admitted(
                        vec![id.clone()],
                        &self.engine,
                        &self.events_tx,
                        &mut notifications,
                    );
                }
                state.settle_wakeups(&mut notifications);
                state.persist();
                state
                    .records
                    .get(&id)
                    .map_or(accepted, |record| record.transfer.clone())
            }
        };
        notifications.dispatch(&self.session_events);
        Ok(result)
    }

    /// Suspends a transfer, keeping its progress.
    ///
    /// An `Active` transfer hands its resume state to the record and frees
    /// its slot; a `Queued` one leaves the wait line. Pausing a transfer
    /// that is already paused or finished is a no-op.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for an unknown id,
    /// [`SessionError::ShuttingDown`] after shutdown.
    pub fn pause(&self, id: &TransferId) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else if !state.records.contains_key(id) {
                Err(SessionError::NotFound(id.clone()))
            } else {
                if state.pause_transfer(id, &self.engine, &self.events_tx, &mut notifications) {
                    state.settle_wakeups(&mut notifications);
                    state.persist();
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Re-queues a `Paused` or `Failed` transfer.
    ///
    /// The transfer continues from its staged progress once a slot opens.
    /// Resuming an `Active`, `Queued` or `Completed` transfer is a no-op.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for an unknown id,
    /// [`SessionError::ShuttingDown`] after shutdown.
    pub fn resume(&self, id: &TransferId) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else if !state.records.contains_key(id) {
                Err(SessionError::NotFound(id.clone()))
            } else {
                if state.resume_transfer(id, &self.engine, &self.events_tx, &mut notifications) {
                    state.settle_wakeups(&mut notifications);
                    state.persist();
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Stops a transfer and deletes everything it produced: staged data,
    /// the destination file and the registry entry.
    ///
    /// After this the id reports [`SessionError::NotFound`]. Stopping an
    /// id the session does not know is logged and ignored.
    ///
    /// # Errors
    ///
    /// [`SessionError::ShuttingDown`] after shutdown.
    pub fn stop(&self, id: &TransferId) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else {
                if state.stop_transfer(id, &self.engine, &self.events_tx, &mut notifications) {
                    state.settle_wakeups(&mut notifications);
                    state.persist();
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Suspends every queued and active transfer.
    ///
    /// # Errors
    ///
    /// [`SessionError::ShuttingDown`] after shutdown.
    pub fn pause_all(&self) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else {
                // Queued first, so freed slots are not briefly handed to
                // transfers this sweep is about to pause anyway.
                let mut ids = state.ids_in_state(TransferState::Queued);
                ids.extend(state.ids_in_state(TransferState::Active));
                let mut changed = false;
                for id in &ids {
                    changed |=
                        state.pause_transfer(id, &self.engine, &self.events_tx, &mut notifications);
                }
                if changed {
                    tracing::info!(count = ids.len(), "all transfers paused");
                    state.settle_wakeups(&mut notifications);
                    state.persist();
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Re-queues every `Paused` transfer.
    ///
    /// `Failed` transfers stay parked; retrying those is an explicit
    /// per-transfer [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// [`SessionError::ShuttingDown`] after shutdown.
    pub fn resume_all(&self) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else {
                let ids = state.ids_in_state(TransferState::Paused);
                let mut changed = false;
                for id in &ids {
                    changed |=
                        state.resume_transfer(id, &self.engine, &self.events_tx, &mut notifications);
                }
                if changed {
                    tracing::info!(count = ids.len(), "paused transfers re-queued");
                    state.settle_wakeups(&mut notifications);
                    state.persist();
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Stops every transfer and deletes the snapshot file.
    ///
    /// # Errors
    ///
    /// [`SessionError::PersistenceWriteFailed`] when the snapshot file
    /// cannot be removed, [`SessionError::ShuttingDown`] after shutdown.
    pub fn remove_all_cache(&self) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else {
                // Non-active transfers first, so cancelling an active one
                // cannot admit a queued sibling in between.
                let mut ids: Vec<TransferId> = state
                    .records
                    .values()
                    .filter(|record| record.transfer.state != TransferState::Active)
                    .map(|record| record.transfer.id.clone())
                    .collect();
                ids.sort();
                ids.extend(state.ids_in_state(TransferState::Active));
                for id in &ids {
                    state.stop_transfer(id, &self.engine, &self.events_tx, &mut notifications);
                }
                state.settle_wakeups(&mut notifications);
                tracing::info!(count = ids.len(), "cache cleared");
                state
                    .store
                    .remove()
                    .map_err(SessionError::PersistenceWriteFailed)
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Changes the concurrency ceiling.
    ///
    /// Raising it admits waiting transfers immediately; lowering it lets
    /// excess active transfers run out without starting new ones. Values
    /// above the engine's own bound are clamped to it.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConfigurationConflict`] for `0` (the previous value
    /// is retained), [`SessionError::ShuttingDown`] after shutdown.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<(), SessionError> {
        let mut notifications = Notifications::default();
        let result = {
            let mut state = self.state.lock();
            if state.shut_down {
                Err(SessionError::ShuttingDown)
            } else if max_concurrent == 0 {
                Err(SessionError::ConfigurationConflict(
                    "max_concurrent must be at least 1".to_string(),
                ))
            } else {
                let ceiling = effective_ceiling(max_concurrent, self.engine.max_concurrency());
                if ceiling != state.scheduler.ceiling() {
                    tracing::info!(ceiling, "concurrency ceiling changed");
                    let admitted = state.scheduler.set_ceiling(ceiling);
                    if !admitted.is_empty() {
                        state.start_admitted(
                            admitted,
                            &self.engine,
                            &self.events_tx,
                            &mut notifications,
                        );
                        state.settle_wakeups(&mut notifications);
                        state.persist();
                    }
                }
                Ok(())
            }
        };
        notifications.dispatch(&self.session_events);
        result
    }

    /// Current concurrency ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().scheduler.ceiling()
    }

    /// Changes whether transfers may use metered (cellular) network paths.
    ///
    /// Applies to transfers that are already running: each active one is
    /// handed back to the engine under the new policy, keeping its slot,
    /// its state and its progress. No delegate callbacks fire for the
    /// switch, and no transfer fails because of it; one the engine cannot
    /// restart parks as `Paused` with its staged data intact.
    ///
    /// Ignored after shutdown.
    pub fn set_allows_cellular_access(&self, allow: bool) {
        let mut notifications = Notifications::default();
        {
            let mut state = self.state.lock();
            if state.shut_down {
                tracing::debug!("cellular policy change after shutdown ignored");
                return;
            }
            if state.allow_cellular == allow {
                return;
            }
            state.allow_cellular = allow;
            tracing::info!(allow_cellular = allow, "cellular access policy changed");
            let active = state.ids_in_state(TransferState::Active);
            for id in &active {
                state.reissue_transfer(id, &self.engine, &self.events_tx, &mut notifications);
            }
            state.persist();
        }
        notifications.dispatch(&self.session_events);
    }

    /// Current cellular access policy.
    pub fn allows_cellular_access(&self) -> bool {
        self.state.lock().allow_cellular
    }

    /// Snapshot of one transfer.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when the id is unknown or was stopped.
    pub fn lookup(&self, id: &TransferId) -> Result<Transfer, SessionError> {
        let state = self.state.lock();
        state
            .records
            .get(id)
            .map(|record| record.transfer.clone())
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Snapshots of all transfers, ordered by id.
    pub fn transfers(&self) -> Vec<Transfer> {
        let state = self.state.lock();
        let mut all: Vec<Transfer> = state
            .records
            .values()
            .map(|record| record.transfer.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Parks `handler` to run exactly once when every transfer tied to the
    /// wakeup identifier has settled.
    ///
    /// With nothing outstanding the handler runs before this returns. A
    /// handler registered after the current drain already ran is dropped;
    /// new work re-arms the latch for the next registration.
    pub fn register_background_completion(
        &self,
        id: &WakeupId,
        handler: impl FnOnce() + Send + 'static,
    ) {
        let ready = {
            let mut state = self.state.lock();
            if state.shut_down {
                tracing::warn!(wakeup = %id, "completion handler registered after shutdown, dropping");
                None
            } else {
                state.ledger.register(id, Box::new(handler))
            }
        };
        if let Some(handler) = ready {
            handler();
        }
    }

    /// Writes the session snapshot now.
    ///
    /// State transitions persist automatically; this is for callers that
    /// want a sync point, for instance before the host process suspends.
    ///
    /// # Errors
    ///
    /// [`SessionError::PersistenceWriteFailed`] when the write fails.
    pub fn save_status(&self) -> Result<(), SessionError> {
        self.state.lock().try_persist()
    }

    /// Subscribes to coarse session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    /// Suspends engine work, writes a final snapshot and stops the event
    /// pump.
    ///
    /// Active transfers are recorded as such, so the next [`open`] on the
    /// same directory re-admits them. Afterwards mutating operations
    /// return [`SessionError::ShuttingDown`]. Calling this more than once
    /// is harmless.
    ///
    /// [`open`]: Self::open
    pub async fn shutdown(&self) {
        let pump = self.pump.lock().take();
        {
            let mut state = self.state.lock();
            if !state.shut_down {
                state.shut_down = true;
                // Engine work is suspended without touching the recorded
                // states; the snapshot keeps Active so the next open
                // continues it.
                let live: Vec<(EngineHandle, TransferId)> = state
                    .handles
                    .iter()
                    .map(|(handle, id)| (*handle, id.clone()))
                    .collect();
                for (handle, id) in live {
                    state.handles.remove(&handle);
                    match self.engine.pause(handle) {
                        Ok(token) => {
                            if let Some(record) = state.records.get_mut(&id) {
                                record.token = Some(token);
                                record.handle = None;
                            }
                        }
                        Err(error) => {
                            tracing::debug!(id = %id, error = %error, "no live engine transfer at shutdown");
                        }
                    }
                }
                state.persist();
            }
        }
        self.shutdown.cancel();
        if let Some(task) = pump {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "event pump ended abnormally");
            }
        }
        tracing::info!("session shut down");
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }
}

/// Drains engine events into session state.
struct EventPump {
    state: Arc<Mutex<SessionState>>,
    engine: Arc<dyn TransferEngine>,
    events_tx: EngineEventSender,
    session_events: broadcast::Sender<SessionEvent>,
}

impl EventPump {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
            }
        }
        tracing::debug!("event pump stopped");
    }

    fn apply(&self, event: EngineEvent) {
        let mut notifications = Notifications::default();
        {
            let mut state = self.state.lock();
            let Some(id) = state.handles.get(&event.handle).cloned() else {
                // The handle was unmapped by a pause or stop that raced
                // this event; the transfer already moved on without it.
                tracing::trace!(handle = %event.handle, "stale engine event dropped");
                return;
            };
            match event.kind {
                EngineEventKind::Progress {
                    bytes_downloaded,
                    total_bytes,
                } => {
                    if let Some(record) = state.records.get_mut(&id) {
                        record.transfer.bytes_downloaded = bytes_downloaded;
                        if total_bytes.is_some() {
                            record.transfer.total_bytes = total_bytes;
                        }
                        notifications.calls.push((
                            record.delegate.clone(),
                            DelegateCall::Progress(record.transfer.clone()),
                        ));
                    }
                }
                EngineEventKind::Completed => {
                    state.handles.remove(&event.handle);
                    if let Some(record) = state.records.get_mut(&id) {
                        record.handle = None;
                        record.token = None;
                        record.transfer.state = TransferState::Completed;
                        if let Some(total) = record.transfer.total_bytes {
                            record.transfer.bytes_downloaded = total;
                        }
                        record.transfer.error = None;
                        tracing::info!(
                            id = %id,
                            path = %record.transfer.destination.display(),
                            "transfer completed"
                        );
                        notifications.calls.push((
                            record.delegate.clone(),
                            DelegateCall::Completed(record.transfer.clone()),
                        ));
                    }
                    self.finish(&mut state, &id, &mut notifications);
                }
                EngineEventKind::Failed { error } => {
                    state.handles.remove(&event.handle);
                    if let Some(record) = state.records.get_mut(&id) {
                        record.handle = None;
                        record.transfer.state = TransferState::Failed;
                        record.transfer.error = Some(error.to_string());
                        tracing::warn!(id = %id, error = %error, "transfer failed");
                        let failure = SessionError::TransferFailed {
                            id: id.clone(),
                            source: error,
                        };
                        notifications.calls.push((
                            record.delegate.clone(),
                            DelegateCall::Failed(record.transfer.clone(), failure),
                        ));
                    }
                    self.finish(&mut state, &id, &mut notifications);
                }
            }
        }
        notifications.dispatch(&self.session_events);
    }

    /// Common tail of a terminal event: free the slot, admit the next
    /// waiting transfer, settle wakeups and persist.
    fn finish(&self, state: &mut SessionState, id: &TransferId, notifications: &mut Notifications) {
        let admitted = state.scheduler.release(id);
        state.start_admitted(admitted, &self.engine, &self.events_tx, notifications);
        state.settle_wakeups(notifications);
        if state.scheduler.is_idle() {
            notifications.all_finished = true;
        }
        state.persist();
    }
}

/// Clamps a requested concurrency ceiling to what the engine can run.
fn effective_ceiling(requested: usize, engine_bound: usize) -> usize {
    let bound = engine_bound.max(1);
    if requested > bound {
        tracing::warn!(
            requested,
            engine_bound = bound,
            "concurrency ceiling clamped to engine bound"
        );
        bound
    } else {
        requested
    }
}

/// Destination path for a new transfer: the last URL path segment,
/// sanitized, prefixed with the short id so transfers that share a file
/// name never collide.
fn destination_for(directory: &Path, id: &TransferId, url: &str) -> PathBuf {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let segment = trimmed.rsplit('/').next().unwrap_or("");
    let sanitized: String = segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(80)
        .collect();
    let name = if sanitized.is_empty() {
        format!("{}.download", id.short())
    } else {
        format!("{}-{}", id.short(), sanitized)
    };
    directory.join(name)
}

fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove file")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_includes_short_id_and_file_name() {
        let url = "https://example.com/files/video.mp4";
        let id = TransferId::compute(url, None);
        let path = destination_for(Path::new("/dl"), &id, url);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(name.starts_with(id.short()));
        assert!(name.ends_with("video.mp4"));
        assert_eq!(path.parent(), Some(Path::new("/dl")));
    }

    #[test]
    fn test_destination_strips_query_and_fragment() {
        let url = "https://example.com/a.zip?sig=abc#frag";
        let id = TransferId::compute(url, None);
        let path = destination_for(Path::new("/dl"), &id, url);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(name.ends_with("a.zip"));
        assert!(!name.contains('?'));
        assert!(!name.contains('#'));
    }

    #[test]
    fn test_destination_for_bare_host_gets_placeholder() {
        let url = "https://example.com/";
        let id = TransferId::compute(url, None);
        let path = destination_for(Path::new("/dl"), &id, url);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap();
        assert_eq!(name, format!("{}.download", id.short()));
    }

    #[test]
    fn test_distinct_transfers_never_share_a_destination() {
        let a = TransferId::compute("https://one.test/data.bin", None);
        let b = TransferId::compute("https://two.test/data.bin", None);
        assert_ne!(
            destination_for(Path::new("/dl"), &a, "https://one.test/data.bin"),
            destination_for(Path::new("/dl"), &b, "https://two.test/data.bin")
        );
    }

    #[test]
    fn test_ceiling_clamped_to_engine_bound() {
        assert_eq!(effective_ceiling(3, 6), 3);
        assert_eq!(effective_ceiling(10, 6), 6);
        assert_eq!(effective_ceiling(6, 6), 6);
        assert_eq!(effective_ceiling(10, 0), 1);
    }
}
