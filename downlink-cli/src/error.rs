//! CLI error type.

use thiserror::Error;

/// Anything a command can fail with; printed to stderr with exit code 1.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] downlink::SessionError),

    #[error("{0}")]
    Engine(#[from] downlink::EngineError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
