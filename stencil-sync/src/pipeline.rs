//! Shared scan-then-write pipeline used by the orchestrator and the CLI.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::differ::{self, ChangeSummary};
use crate::manifest::{self, CacheLayout, CacheManifest};
use crate::validator::ValidatedSource;
use crate::writer::CacheWriter;
use crate::SyncError;

/// Where the pipeline is, reported through the `observe` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A non-empty change set was found; the writer is about to start.
    Updating { total: usize },
    /// `done` of `total` units are staged.
    Progress { done: usize, total: usize },
}

/// Successful end states of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Catalog and cache already agree.
    UpToDate,
    Applied {
        manifest: CacheManifest,
        summary: ChangeSummary,
    },
}

/// Options for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions<'a> {
    pub cache_root: &'a Path,
    pub keep_generations: usize,
}

/// Diff `validated` against its cache and, if anything changed, apply it.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn run(
    validated: &ValidatedSource,
    options: &PipelineOptions<'_>,
    cancel: &CancellationToken,
    observe: &mut dyn FnMut(Stage),
) -> Result<PipelineOutcome, SyncError> {
    let layout = CacheLayout::for_source(options.cache_root, &validated.key);
    let current = manifest::load(&layout, &validated.key)?;

    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let changes = differ::diff(validated.source.as_ref(), &current)?;
    if changes.is_empty() {
        tracing::info!("{} is up to date", validated.key);
        return Ok(PipelineOutcome::UpToDate);
    }
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let total = changes.total_units();
    observe(Stage::Updating { total });

    let writer = CacheWriter::new(layout, validated.key.clone())
        .keep_generations(options.keep_generations);
    let manifest = writer.apply(
        validated.source.as_ref(),
        &current,
        &changes,
        cancel,
        &mut |done, total| observe(Stage::Progress { done, total }),
    )?;

    Ok(PipelineOutcome::Applied {
        manifest,
        summary: changes.summary(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::source::DefaultResolver;
    use crate::validator::validate;

    #[test]
    fn run_twice_second_is_up_to_date() {
        let src = TempDir::new().expect("src");
        let cache = TempDir::new().expect("cache");
        fs::create_dir_all(src.path().join("webapi")).expect("mkdir");
        fs::write(src.path().join("webapi/a.txt"), "a").expect("write");

        let validated =
            validate(&src.path().display().to_string(), &DefaultResolver::new()).expect("valid");
        let options = PipelineOptions {
            cache_root: cache.path(),
            keep_generations: 0,
        };

        let mut stages = Vec::new();
        let first = run(&validated, &options, &CancellationToken::new(), &mut |s| {
            stages.push(s)
        })
        .expect("first run");
        assert!(matches!(first, PipelineOutcome::Applied { .. }));
        assert_eq!(
            stages,
            vec![
                Stage::Updating { total: 1 },
                Stage::Progress { done: 1, total: 1 }
            ]
        );

        let second = run(&validated, &options, &CancellationToken::new(), &mut |_| {})
            .expect("second run");
        assert_eq!(second, PipelineOutcome::UpToDate);
    }

    #[test]
    fn empty_source_against_empty_cache_is_up_to_date() {
        let src = TempDir::new().expect("src");
        let cache = TempDir::new().expect("cache");
        let validated =
            validate(&src.path().display().to_string(), &DefaultResolver::new()).expect("valid");
        let options = PipelineOptions {
            cache_root: cache.path(),
            keep_generations: 0,
        };

        let outcome = run(&validated, &options, &CancellationToken::new(), &mut |_| {})
            .expect("run");
        assert_eq!(outcome, PipelineOutcome::UpToDate);
    }
}
