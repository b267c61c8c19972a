//! Session configuration.

use crate::error::SessionError;
use crate::session::WakeupId;
use std::path::PathBuf;

/// Default bound on concurrently active transfers.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Wakeup identifier used when the caller does not supply one.
pub const DEFAULT_WAKEUP_IDENTIFIER: &str = "downlink.session.default";

/// Configuration for a [`DownloadSession`](crate::session::DownloadSession).
///
/// Only the directory is required; everything else has a sensible default
/// and a `with_*` builder.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding downloaded files and the session snapshot.
    pub directory: PathBuf,

    /// Bound on concurrently active transfers.
    ///
    /// Defaults to [`DEFAULT_MAX_CONCURRENT`]. Values above the engine's
    /// own concurrency bound are clamped to it at open.
    pub max_concurrent: usize,

    /// Whether transfers may use metered (cellular) network paths.
    /// Defaults to `true`.
    pub allow_cellular: bool,

    /// Identifier under which background-completion handlers are latched.
    /// Defaults to [`DEFAULT_WAKEUP_IDENTIFIER`].
    pub wakeup_identifier: WakeupId,
}

impl SessionConfig {
    /// Creates a configuration rooted at the given directory, with
    /// defaults for everything else.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            allow_cellular: true,
            wakeup_identifier: WakeupId::from(DEFAULT_WAKEUP_IDENTIFIER),
        }
    }

    /// Sets the bound on concurrently active transfers.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Allows or forbids metered (cellular) network paths.
    pub fn with_allow_cellular(mut self, allow: bool) -> Self {
        self.allow_cellular = allow;
        self
    }

    /// Sets the wakeup identifier for background-completion accounting.
    pub fn with_wakeup_identifier(mut self, id: impl Into<WakeupId>) -> Self {
        self.wakeup_identifier = id.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SessionError> {
        if self.max_concurrent == 0 {
            return Err(SessionError::ConfigurationConflict(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("/tmp/dl");
        assert_eq!(config.directory, PathBuf::from("/tmp/dl"));
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert!(config.allow_cellular);
        assert_eq!(config.wakeup_identifier.as_str(), DEFAULT_WAKEUP_IDENTIFIER);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::new("/tmp/dl")
            .with_max_concurrent(8)
            .with_allow_cellular(false)
            .with_wakeup_identifier("app.refresh");
        assert_eq!(config.max_concurrent, 8);
        assert!(!config.allow_cellular);
        assert_eq!(config.wakeup_identifier.as_str(), "app.refresh");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = SessionConfig::new("/tmp/dl").with_max_concurrent(0);
        assert!(matches!(
            config.validate(),
            Err(SessionError::ConfigurationConflict(_))
        ));
    }
}
