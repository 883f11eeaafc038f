pub mod cache;
pub mod daemon;
pub mod sync;

use colored::{ColoredString, Colorize};
use stencil_core::{ProgressEvent, SyncStatus};

/// One progress line, e.g. `  Updating           40%`.
pub(crate) fn print_event(event: ProgressEvent) {
    println!(
        "  {:<18} {:>3}%",
        status_label(event.status).to_string(),
        event.progress
    );
}

pub(crate) fn status_label(status: SyncStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        SyncStatus::Updated | SyncStatus::UpdateNotRequired => label.green().bold(),
        SyncStatus::Updating | SyncStatus::Scanning => label.cyan(),
        SyncStatus::Failed => label.red().bold(),
        SyncStatus::Cancelled => label.yellow().bold(),
        SyncStatus::None | SyncStatus::Validating => label.bright_black(),
    }
}
