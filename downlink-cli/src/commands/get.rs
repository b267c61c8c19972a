//! Get command - download one or more URLs.

use crate::error::CliError;
use crate::progress::ProgressReporter;
use downlink::{DownloadSession, HttpEngine, SessionConfig, TransferDelegate};
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the get command.
pub struct GetArgs {
    pub urls: Vec<String>,
    pub directory: PathBuf,
    pub concurrent: usize,
    pub no_cellular: bool,
}

/// Run the get command.
pub async fn run(args: GetArgs) -> Result<(), CliError> {
    let config = SessionConfig::new(&args.directory)
        .with_max_concurrent(args.concurrent)
        .with_allow_cellular(!args.no_cellular);
    let session = DownloadSession::open(config, Arc::new(HttpEngine::new()?)).await?;

    let reporter = Arc::new(ProgressReporter::new());
    let delegate: Arc<dyn TransferDelegate> = reporter.clone();
    for url in &args.urls {
        let transfer = session.start(url, None, &delegate)?;
        tracing::debug!(id = %transfer.id, url, "transfer requested");
    }

    super::wait_for_session(&session).await?;
    reporter.finish();
    super::report(&session);
    session.shutdown().await;
    Ok(())
}
