//! CLI subcommands.

pub mod get;
pub mod resume;
pub mod status;

use crate::error::CliError;
use downlink::{DownloadSession, SessionEvent};
use indicatif::HumanBytes;
use tokio::sync::broadcast::error::RecvError;

/// Waits until every transfer settles or the user interrupts.
///
/// Ctrl-C pauses everything and saves the session; `downlink resume`
/// continues it later.
pub async fn wait_for_session(session: &DownloadSession) -> Result<(), CliError> {
    // Subscribe before checking, so a completion that lands in between
    // is not missed.
    let mut events = session.subscribe();
    if session.transfers().iter().all(|t| !t.state.is_live()) {
        return Ok(());
    }

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupt_live = true;
    loop {
        tokio::select! {
            signal = &mut interrupt, if interrupt_live => match signal {
                Ok(()) => {
                    eprintln!();
                    eprintln!("interrupted, pausing transfers");
                    session.pause_all()?;
                    session.save_status()?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ctrl-c handler unavailable");
                    interrupt_live = false;
                }
            },
            event = events.recv() => match event {
                Ok(SessionEvent::AllTransfersFinished) => return Ok(()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Prints one line per transfer.
pub fn report(session: &DownloadSession) {
    let transfers = session.transfers();
    if transfers.is_empty() {
        println!("no transfers");
        return;
    }
    for transfer in transfers {
        let progress = match transfer.total_bytes {
            Some(total) => format!(
                "{}/{}",
                HumanBytes(transfer.bytes_downloaded),
                HumanBytes(total)
            ),
            None => format!("{}", HumanBytes(transfer.bytes_downloaded)),
        };
        println!(
            "{}  {:<9}  {:>21}  {}",
            transfer.id.short(),
            transfer.state,
            progress,
            transfer.url
        );
    }
}
