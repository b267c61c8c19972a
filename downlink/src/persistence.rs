//! Durable session snapshots.
//!
//! The session writes a complete snapshot of every non-removed transfer
//! after each state transition, so a process that dies mid-session can
//! reconstruct its transfers on the next start. Writes go to a temp file
//! that is renamed over the snapshot, so a crash mid-write leaves the
//! previous snapshot intact.
//!
//! Snapshots carry a format version. A snapshot from an unknown format is
//! discarded with a warning rather than misread: download state can
//! always be rebuilt from scratch, a wrong reconstruction cannot.

use crate::engine::ResumeToken;
use crate::identity::TransferId;
use crate::transfer::TransferState;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Snapshot format version. Bump when [`PersistedTransfer`] changes shape.
pub const SNAPSHOT_VERSION: u32 = 1;

/// File name of the snapshot inside the session directory.
pub const SNAPSHOT_FILE_NAME: &str = "session.json";

/// One transfer as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTransfer {
    pub id: TransferId,
    pub url: String,
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    pub state: TransferState,
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-disk snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: String,
    transfers: Vec<PersistedTransfer>,
}

/// Reads and writes the session snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Creates a store for the snapshot inside the given session directory.
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(SNAPSHOT_FILE_NAME),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a complete snapshot atomically.
    ///
    /// The document goes to a temp file which is renamed over the
    /// snapshot, so readers never observe a half-written file.
    ///
    /// # Errors
    ///
    /// Any I/O error from creating, writing, or renaming the file.
    pub fn save(&self, transfers: Vec<PersistedTransfer>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            transfers,
        };

        let temp_path = self.path.with_extension("tmp");
        let file = std::fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &snapshot)
            .map_err(|e| io::Error::other(format!("failed to serialize snapshot: {}", e)))?;
        writer.flush()?;

        std::fs::rename(&temp_path, &self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            transfers = snapshot.transfers.len(),
            "saved session snapshot"
        );
        Ok(())
    }

    /// Loads the snapshot, if a usable one is present.
    ///
    /// Returns `Ok(None)` when no snapshot exists, and also when the file
    /// is corrupt or from a different format version; both are logged and
    /// treated as an empty session. Hard I/O errors propagate.
    pub fn load(&self) -> io::Result<Option<Vec<PersistedTransfer>>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let reader = BufReader::new(file);

        let snapshot: Snapshot = match serde_json::from_reader(reader) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding unreadable session snapshot"
                );
                return Ok(None);
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "discarding session snapshot with unknown format version"
            );
            return Ok(None);
        }

        tracing::debug!(
            transfers = snapshot.transfers.len(),
            saved_at = %snapshot.saved_at,
            "loaded session snapshot"
        );
        Ok(Some(snapshot.transfers))
    }

    /// Deletes the snapshot file. A missing file is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
