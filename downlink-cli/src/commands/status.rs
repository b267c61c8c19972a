//! Status command - inspect the persisted session.

use crate::error::CliError;
use downlink::persistence::SnapshotStore;
use indicatif::HumanBytes;
use std::path::Path;

/// Run the status command.
///
/// Reads the snapshot file directly instead of opening a session, so
/// looking at the state never admits or resumes anything.
pub fn run(directory: &Path) -> Result<(), CliError> {
    let store = SnapshotStore::new(directory);
    let Some(entries) = store.load()? else {
        println!("no session at {}", directory.display());
        return Ok(());
    };
    if entries.is_empty() {
        println!("session at {} has no transfers", directory.display());
        return Ok(());
    }
    for entry in entries {
        let progress = match entry.total_bytes {
            Some(total) => format!("{}/{}", HumanBytes(entry.bytes_downloaded), HumanBytes(total)),
            None => format!("{}", HumanBytes(entry.bytes_downloaded)),
        };
        println!(
            "{}  {:<9}  {:>21}  {}",
            entry.id.short(),
            entry.state,
            progress,
            entry.url
        );
    }
    Ok(())
}
