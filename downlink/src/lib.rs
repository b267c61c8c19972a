//! Client-side download session management.
//!
//! `downlink` runs a set of HTTP downloads with a bounded number active
//! at a time and everything else waiting in FIFO order. It provides:
//!
//! - pause, resume and stop, per transfer and across the board, with
//!   partial progress kept and continued via HTTP range requests
//! - persistence of the whole session, so a restarted process picks up
//!   exactly where the previous one left off
//! - per-transfer delegates for progress reporting, held weakly so a
//!   dropped observer never pins a transfer
//! - exactly-once completion handlers for hosts that wake the process to
//!   let background transfers finish
//!
//! # Example
//!
//! ```no_run
//! use downlink::{DownloadSession, HttpEngine, SessionConfig, Transfer, TransferDelegate};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl TransferDelegate for Printer {
//!     fn transfer_completed(&self, transfer: &Transfer) {
//!         println!("done: {}", transfer.destination.display());
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("/tmp/downloads").with_max_concurrent(2);
//! let session = DownloadSession::open(config, Arc::new(HttpEngine::new()?)).await?;
//!
//! let delegate: Arc<dyn TransferDelegate> = Arc::new(Printer);
//! let transfer = session.start("https://example.com/big.iso", None, &delegate)?;
//! println!("queued as {}", transfer.id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod transfer;

pub use config::SessionConfig;
pub use delegate::TransferDelegate;
pub use engine::http::HttpEngine;
pub use engine::{
    EngineError, EngineEvent, EngineEventKind, EngineEventSender, EngineHandle, ResumeToken,
    TransferEngine, TransferRequest,
};
pub use error::SessionError;
pub use identity::TransferId;
pub use session::{CompletionHandler, DownloadSession, SessionEvent, WakeupId};
pub use transfer::{Transfer, TransferState};

/// Crate version, for embedding in logs and user agents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
