//! Stable transfer identity.
//!
//! A [`TransferId`] is derived from the request URL plus an optional caller
//! discriminator, so the same logical download maps to the same identifier
//! in every process that computes it. Two callers downloading the same URL
//! can keep separate transfers by supplying distinct discriminators.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of digest bytes kept in the identifier (32 hex characters).
const ID_BYTES: usize = 16;

/// Deterministic identifier for a transfer.
///
/// Computed as a truncated SHA-256 over the URL and discriminator, encoded
/// as lowercase hex. Identical inputs always produce the identical id,
/// which is what lets a restarted process match its persisted transfers
/// against new start requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Computes the identifier for a URL and optional discriminator.
    pub fn compute(url: &str, discriminator: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        if let Some(tag) = discriminator {
            hasher.update(b"\n");
            hasher.update(tag.as_bytes());
        }
        let hex = format!("{:x}", hasher.finalize());
        Self(hex[..ID_BYTES * 2].to_string())
    }

    /// Returns the identifier as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix for file names and log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when parsing a [`TransferId`] from a string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transfer id: {0:?}")]
pub struct ParseTransferIdError(String);

impl FromStr for TransferId {
    type Err = ParseTransferIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == ID_BYTES * 2
            && s.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseTransferIdError(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_inputs_same_id() {
        let a = TransferId::compute("https://example.com/file.zip", None);
        let b = TransferId::compute("https://example.com/file.zip", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_urls_differ() {
        let a = TransferId::compute("https://example.com/one.zip", None);
        let b = TransferId::compute("https://example.com/two.zip", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_discriminator_separates_transfers() {
        let url = "https://example.com/shared.bin";
        let plain = TransferId::compute(url, None);
        let tagged = TransferId::compute(url, Some("user-42"));
        let other = TransferId::compute(url, Some("user-43"));
        assert_ne!(plain, tagged);
        assert_ne!(tagged, other);
    }

    #[test]
    fn test_id_is_32_lowercase_hex_chars() {
        let id = TransferId::compute("https://example.com/x", Some("tag"));
        assert_eq!(id.as_str().len(), 32);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_short_prefix() {
        let id = TransferId::compute("https://example.com/x", None);
        assert_eq!(id.short(), &id.as_str()[..8]);
    }

    #[test]
    fn test_parse_round_trip() {
        let id = TransferId::compute("https://example.com/x", None);
        let parsed: TransferId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("not-an-id".parse::<TransferId>().is_err());
        assert!("ABCDEF00112233445566778899AABBCC"
            .parse::<TransferId>()
            .is_err());
        assert!("abc123".parse::<TransferId>().is_err());
    }
}
