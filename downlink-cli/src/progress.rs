//! Terminal progress bars, one per transfer.

use downlink::{SessionError, Transfer, TransferDelegate, TransferId};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Session delegate that renders each transfer as an indicatif bar.
pub struct ProgressReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<TransferId, ProgressBar>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Clears the bar area so the final report prints cleanly.
    pub fn finish(&self) {
        let _ = self.multi.clear();
    }

    fn bar_for(&self, transfer: &Transfer) -> ProgressBar {
        let mut bars = self.bars.lock();
        bars.entry(transfer.id.clone())
            .or_insert_with(|| {
                let bar = self
                    .multi
                    .add(ProgressBar::new(transfer.total_bytes.unwrap_or(0)));
                bar.set_style(bar_style());
                bar.set_message(label(transfer));
                bar
            })
            .clone()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{msg:24!} {bytes:>10}/{total_bytes:<10} {wide_bar} {bytes_per_sec:>12}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn label(transfer: &Transfer) -> String {
    transfer
        .destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| transfer.id.short().to_string())
}

impl TransferDelegate for ProgressReporter {
    fn transfer_progress(&self, transfer: &Transfer) {
        let bar = self.bar_for(transfer);
        if let Some(total) = transfer.total_bytes {
            bar.set_length(total);
        }
        bar.set_position(transfer.bytes_downloaded);
    }

    fn transfer_completed(&self, transfer: &Transfer) {
        let bar = self.bar_for(transfer);
        if let Some(total) = transfer.total_bytes {
            bar.set_length(total);
            bar.set_position(total);
        }
        bar.finish_with_message(format!("{} done", label(transfer)));
    }

    fn transfer_failed(&self, transfer: &Transfer, error: &SessionError) {
        let bar = self.bar_for(transfer);
        bar.abandon_with_message(format!("{} failed: {error}", label(transfer)));
    }
}
