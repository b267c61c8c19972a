//! The transfer engine seam.
//!
//! The session manages lifecycle, concurrency, and persistence; a
//! [`TransferEngine`] moves bytes. The trait is deliberately small:
//! control calls start, suspend, and cancel transfers without blocking,
//! and everything the engine learns flows back through a single event
//! channel the session owns and drains.
//!
//! [`HttpEngine`](http::HttpEngine) is the engine shipped with the crate;
//! tests drive the session with scripted engines instead.

pub mod http;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one live engine transfer.
///
/// A handle is minted by [`TransferEngine::begin`] or
/// [`TransferEngine::resume`] and dies with pause, cancel, or completion.
/// A transfer that is paused and resumed gets a fresh handle, which is
/// how events from its previous incarnation are recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle(u64);

impl EngineHandle {
    /// Creates a handle from a raw value. Engines must never reuse a
    /// value within their lifetime.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the session asks an engine to transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Source URL.
    pub url: String,

    /// Final destination path. Engines may stage partial data next to it.
    pub destination: PathBuf,

    /// Whether metered (cellular) network paths may be used.
    pub allow_cellular: bool,
}

/// Opaque engine state for continuing a suspended transfer.
///
/// The session stores and persists tokens without interpreting them; only
/// the engine that minted a token reads its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(serde_json::Value);

impl ResumeToken {
    /// Wraps an engine-defined payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self(payload)
    }

    /// The engine-defined payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }
}

/// One report from an engine to the session.
///
/// Events are tagged with the handle they concern. The session silently
/// drops events for handles it no longer tracks, so engines may report
/// without worrying about races against pause or stop.
#[derive(Debug)]
pub struct EngineEvent {
    pub handle: EngineHandle,
    pub kind: EngineEventKind,
}

#[derive(Debug)]
pub enum EngineEventKind {
    /// Bytes landed. `total_bytes` is set once the source declares it.
    Progress {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    /// The transfer finished and the file is at its destination.
    Completed,
    /// The transfer cannot continue.
    Failed { error: EngineError },
}

/// Channel on which engines report events.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Failures an engine can report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request failed at the HTTP layer (connect, TLS, status, body).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Staging or finalizing the file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL cannot be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The resume token was not minted by this engine.
    #[error("unrecognized resume token")]
    InvalidResumeToken,

    /// The handle does not refer to a live transfer.
    #[error("unknown engine handle {0}")]
    UnknownHandle(EngineHandle),
}

/// Moves bytes for the session.
///
/// Control calls must not block on network or disk: implementations start
/// work on their own tasks and report through the event channel. The
/// session invokes these methods while holding its internal lock.
pub trait TransferEngine: Send + Sync + 'static {
    /// Starts a fresh transfer, reporting to `events`.
    ///
    /// # Errors
    ///
    /// Fails when the request is unusable or the transfer cannot be
    /// spawned; the session parks the transfer as failed.
    fn begin(
        &self,
        request: TransferRequest,
        events: EngineEventSender,
    ) -> Result<EngineHandle, EngineError>;

    /// Suspends a live transfer and returns the state needed to continue
    /// it. The handle is dead afterwards.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownHandle`] when the handle is not live, for
    /// example because the transfer finished concurrently.
    fn pause(&self, handle: EngineHandle) -> Result<ResumeToken, EngineError>;

    /// Continues a transfer from a token minted by [`pause`](Self::pause).
    ///
    /// `token` is `None` when the transfer never produced one (paused
    /// before a slot opened, or the previous process could not collect
    /// it); engines then recover progress from staged data or start over.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidResumeToken`] for a token this engine did
    /// not mint, or any error [`begin`](Self::begin) can return.
    fn resume(
        &self,
        token: Option<ResumeToken>,
        request: TransferRequest,
        events: EngineEventSender,
    ) -> Result<EngineHandle, EngineError>;

    /// Abandons a live transfer.
    ///
    /// The engine stops moving bytes and drops its claim on staged data;
    /// removing that data is the caller's concern (see
    /// [`discard`](Self::discard)). Cancelling a dead handle is a no-op.
    fn cancel(&self, handle: EngineHandle);

    /// Removes staged partial data for a destination.
    ///
    /// Called when a transfer is stopped. Must be safe to call when
    /// nothing is staged.
    fn discard(&self, destination: &Path);

    /// Upper bound on transfers this engine can run at once.
    ///
    /// The session clamps its own concurrency ceiling to this value.
    fn max_concurrency(&self) -> usize;
}
