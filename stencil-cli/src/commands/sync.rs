//! `stencil sync` — run one sync in-process and stream its progress.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use stencil_core::{config, ProgressEvent, SyncStatus};
use stencil_daemon::{Subscription, SyncOrchestrator, SyncOutcome};

use super::{print_event, status_label};

/// Arguments for `stencil sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Template source: a local directory or a registered feed URL.
    pub path: String,

    /// Emit the final outcome as JSON instead of progress lines.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load stencil config")?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let outcome = runtime.block_on(async {
            let orchestrator = SyncOrchestrator::new(&home, &config);
            let cancel = CancellationToken::new();
            let (subscribed_tx, mut subscribed_rx) = oneshot::channel();
            let sync = orchestrator.sync_subscribed(&self.path, cancel.clone(), subscribed_tx);
            tokio::pin!(sync);

            let mut subscription: Option<Subscription> = None;
            let mut awaiting_subscription = true;
            let result = loop {
                tokio::select! {
                    biased;
                    subscribed = &mut subscribed_rx, if awaiting_subscription => {
                        awaiting_subscription = false;
                        subscription = subscribed.ok();
                    }
                    Some(event) = next_event(&mut subscription), if subscription.is_some() => {
                        if !self.json {
                            print_event(event);
                        }
                    }
                    result = &mut sync => break result,
                    _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                        eprintln!("cancelling…");
                        cancel.cancel();
                    }
                }
            };
            if awaiting_subscription {
                subscription = subscribed_rx.try_recv().ok();
            }
            if let Some(subscription) = subscription.as_mut() {
                while let Some(event) = subscription.try_recv() {
                    if !self.json {
                        print_event(event);
                    }
                }
            }
            result
        });

        let outcome = outcome.with_context(|| format!("sync rejected for '{}'", self.path))?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?
            );
        } else {
            print_outcome(&outcome);
        }

        match outcome.status {
            SyncStatus::Failed => bail!("sync failed for '{}'; see logs", outcome.source),
            SyncStatus::Cancelled => bail!("sync cancelled for '{}'", outcome.source),
            _ => Ok(()),
        }
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ProgressEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) fn print_outcome(outcome: &SyncOutcome) {
    let summary = outcome.summary;
    match outcome.status {
        SyncStatus::UpdateNotRequired => {
            println!("✓ '{}' — {}", outcome.source, status_label(outcome.status));
        }
        SyncStatus::Updated => println!(
            "✓ '{}' {} ({} added, {} updated, {} removed, {} unchanged) in {}ms",
            outcome.source,
            status_label(outcome.status),
            summary.added,
            summary.updated,
            summary.removed,
            summary.unchanged,
            outcome.duration_ms,
        ),
        status => println!(
            "✗ '{}' {} at {}%",
            outcome.source,
            status_label(status),
            outcome.progress
        ),
    }
}
