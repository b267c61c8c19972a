//! Resume command - continue a previously interrupted session.

use crate::error::CliError;
use crate::progress::ProgressReporter;
use downlink::{DownloadSession, HttpEngine, SessionConfig, TransferDelegate, TransferState};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the resume command.
pub struct ResumeArgs {
    pub directory: PathBuf,
    pub concurrent: usize,
}

/// Run the resume command.
pub async fn run(args: ResumeArgs) -> Result<(), CliError> {
    let config = SessionConfig::new(&args.directory).with_max_concurrent(args.concurrent);
    let session = DownloadSession::open(config, Arc::new(HttpEngine::new()?)).await?;

    let transfers = session.transfers();
    if transfers.is_empty() {
        println!("nothing to resume in {}", args.directory.display());
        session.shutdown().await;
        return Ok(());
    }

    let reporter = Arc::new(ProgressReporter::new());
    let delegate: Arc<dyn TransferDelegate> = reporter.clone();
    for transfer in &transfers {
        // start is idempotent here; it only re-attaches the delegate.
        session.start(&transfer.url, transfer.discriminator.as_deref(), &delegate)?;
        if transfer.state == TransferState::Failed {
            session.resume(&transfer.id)?;
        }
    }
    session.resume_all()?;

    super::wait_for_session(&session).await?;
    reporter.finish();
    super::report(&session);
    session.shutdown().await;
    Ok(())
}
