//! `stencil daemon` — background sync host lifecycle and remote syncs.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use stencil_core::SyncStatus;
use stencil_daemon::paths::socket_path;
use stencil_daemon::{request_status, request_stop, request_sync, start_blocking, DaemonError};

use super::print_event;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground.
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status and active sessions.
    Status,
    /// Ask the running daemon to sync a source, streaming its progress.
    Sync(DaemonSyncArgs),
}

#[derive(Args, Debug)]
pub struct DaemonSyncArgs {
    /// Template source: a local directory or a registered feed URL.
    pub path: String,

    /// Emit the final outcome as JSON instead of progress lines.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync(args) => {
            let json = args.json;
            let path = resolve_for_daemon(&args.path)?;
            let outcome = request_sync(&home, &path, |event| {
                if !json {
                    print_event(event);
                }
            })
            .with_context(|| format!("daemon sync failed for '{}'", args.path))?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome)
                        .context("failed to render sync outcome JSON")?
                );
            }
            let status: SyncStatus = serde_json::from_value(outcome["status"].clone())
                .context("daemon returned an outcome without a status")?;
            if !json {
                println!("{} '{}'", super::status_label(status), args.path);
            }
            if matches!(status, SyncStatus::Failed | SyncStatus::Cancelled) {
                bail!("daemon sync for '{}' ended {status}", args.path);
            }
        }
    }

    Ok(())
}

/// Relative local paths are resolved against this process's working
/// directory; the daemon's own is unrelated. URLs, empty input and absolute
/// paths pass through for the daemon to validate.
fn resolve_for_daemon(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("://") || Path::new(trimmed).is_absolute() {
        return Ok(raw.to_string());
    }
    let cwd = std::env::current_dir().context("could not determine working directory")?;
    Ok(cwd.join(trimmed).display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_anchored_at_the_caller() {
        let cwd = std::env::current_dir().expect("cwd");
        assert_eq!(
            resolve_for_daemon("./templates").expect("resolve"),
            cwd.join("./templates").display().to_string()
        );
        assert_eq!(
            resolve_for_daemon(" templates ").expect("resolve"),
            cwd.join("templates").display().to_string()
        );
    }

    #[test]
    fn urls_absolute_and_empty_paths_pass_through() {
        for raw in ["https://feed.example.com/web", "ftp://x", "/srv/templates", ""] {
            assert_eq!(resolve_for_daemon(raw).expect("resolve"), raw);
        }
    }
}
