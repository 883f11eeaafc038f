//! Cache writer — the only code that mutates a cache directory.
//!
//! ## `apply` — staging protocol
//!
//! 1. Clear leftovers of crashed attempts from `staging/`.
//! 2. Carry unchanged templates over from the live generation into
//!    `staging/<id>`.
//! 3. Materialize every added/updated template into `staging/<id>`,
//!    reporting progress per entry (removals count as one unit each).
//! 4. Rename `staging/<id>` → `generations/<id>` (fresh name, atomic).
//! 5. Commit: write `manifest.json.tmp`, rename over `manifest.json`.
//! 6. Prune superseded generations.
//!
//! Until step 5 succeeds nothing a reader resolves through the manifest has
//! changed; any failure or cancellation before that removes the staged tree.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stencil_core::{CatalogEntry, SourceKey};

use crate::differ::ChangeSet;
use crate::error::{io_err, SyncError};
use crate::manifest::{self, CacheLayout, CacheManifest};
use crate::source::{copy_tree, CatalogSource};

/// Applies change sets to one source's cache.
#[derive(Debug, Clone)]
pub struct CacheWriter {
    layout: CacheLayout,
    key: SourceKey,
    keep_generations: usize,
}

impl CacheWriter {
    pub fn new(layout: CacheLayout, key: SourceKey) -> Self {
        Self {
            layout,
            key,
            keep_generations: 0,
        }
    }

    /// Keep this many superseded generations after a successful commit.
    pub fn keep_generations(mut self, keep: usize) -> Self {
        self.keep_generations = keep;
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Apply `changes` on top of `current` and return the committed manifest.
    ///
    /// `on_progress(done, total)` is called after each unit of work.
    pub fn apply(
        &self,
        source: &dyn CatalogSource,
        current: &CacheManifest,
        changes: &ChangeSet,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<CacheManifest, SyncError> {
        self.clear_stale_staging()?;

        let id = Uuid::new_v4().simple().to_string();
        let staging = self.layout.staging_dir(&id);
        std::fs::create_dir_all(&staging).map_err(|e| io_err(&staging, e))?;
        let mut guard = StagingGuard::new(staging.clone());

        let total = changes.total_units();
        let mut next = CacheManifest::empty(&self.key);

        // Step 2: carry over.
        if let Some(live) = self.layout.live_dir(current) {
            for entry in &changes.unchanged {
                ensure_plain(entry, 0, total)?;
                let from = live.join(&entry.name.0);
                copy_tree(&from, &staging.join(&entry.name.0), cancel).map_err(|err| {
                    partial_write(entry, 0, total, err)
                })?;
                next.insert(entry);
            }
        } else if !changes.unchanged.is_empty() {
            return Err(SyncError::Io {
                path: self.layout.manifest_path(),
                source: std::io::Error::other("manifest lists entries but has no live generation"),
            });
        }

        // Step 3: removals are free; count them first so progress moves.
        let mut done = 0usize;
        for name in &changes.removed {
            done += 1;
            tracing::debug!("dropping template {name}");
            on_progress(done, total);
        }

        for entry in changes.added.iter().chain(changes.updated.iter()) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            ensure_plain(entry, done, total)?;
            let dest = staging.join(&entry.name.0);
            source
                .materialize(entry, &dest, cancel)
                .map_err(|err| partial_write(entry, done, total, err))?;
            next.insert(entry);
            done += 1;
            tracing::debug!("staged template {} ({done}/{total})", entry.name);
            on_progress(done, total);
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Step 4: promote staging to a generation.
        let generations = self.layout.generations_dir();
        std::fs::create_dir_all(&generations).map_err(|e| io_err(&generations, e))?;
        let generation = self.layout.generation_dir(&id);
        std::fs::rename(&staging, &generation).map_err(|e| io_err(&generation, e))?;
        guard.retarget(generation);

        // Step 5: commit.
        next.generation = Some(id.clone());
        next.synced_at = Utc::now();
        manifest::save(&self.layout, &next)?;
        guard.disarm();

        tracing::info!(
            "committed generation {id} for {} ({} template(s))",
            self.key,
            next.entries.len()
        );

        // Step 6: best effort.
        self.prune_generations(&id);
        Ok(next)
    }

    fn clear_stale_staging(&self) -> Result<(), SyncError> {
        let staging_root = self.layout.staging_root();
        let entries = match std::fs::read_dir(&staging_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(&staging_root, err)),
        };
        for entry in entries {
            let path = entry.map_err(|e| io_err(&staging_root, e))?.path();
            tracing::warn!("removing stale staging area {}", path.display());
            remove_tree(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    fn prune_generations(&self, live: &str) {
        let dir = self.layout.generations_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("cannot list generations at {}: {err}", dir.display());
                return;
            }
        };

        let mut superseded: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy() != live)
            .map(|e| {
                let modified = e
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (modified, e.path())
            })
            .collect();
        superseded.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in superseded.into_iter().skip(self.keep_generations) {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                tracing::warn!("failed to prune generation {}: {err}", path.display());
            }
        }
    }
}

/// Template names become directory names under staging; refuse anything
/// that would resolve outside it.
fn ensure_plain(entry: &CatalogEntry, completed: usize, total: usize) -> Result<(), SyncError> {
    if entry.name.is_plain_component() {
        return Ok(());
    }
    Err(partial_write(
        entry,
        completed,
        total,
        SyncError::SourceUnreachable {
            location: entry.location.clone(),
            reason: format!("template name '{}' is not a plain directory name", entry.name),
        },
    ))
}

fn partial_write(entry: &CatalogEntry, completed: usize, total: usize, err: SyncError) -> SyncError {
    if err.is_cancelled() {
        return err;
    }
    SyncError::PartialWrite {
        entry: entry.name.clone(),
        completed,
        total,
        source: Box::new(err),
    }
}

/// Removes a staged tree on drop unless disarmed.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn retarget(&mut self, path: PathBuf) {
        self.path = path;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = remove_tree(&self.path) {
            tracing::warn!("rollback failed to remove {}: {err}", self.path.display());
        } else {
            tracing::debug!("rolled back {}", self.path.display());
        }
    }
}

fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::diff;
    use crate::source::LocalDirSource;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        src: TempDir,
        cache: TempDir,
        key: SourceKey,
    }

    impl Fixture {
        fn new() -> Self {
            let src = TempDir::new().unwrap();
            let key = SourceKey(src.path().display().to_string());
            Self {
                src,
                cache: TempDir::new().unwrap(),
                key,
            }
        }

        fn write(&self, relative: &str, content: &str) {
            let path = self.src.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn writer(&self) -> CacheWriter {
            CacheWriter::new(
                CacheLayout::for_source(self.cache.path(), &self.key),
                self.key.clone(),
            )
        }

        fn sync(&self) -> (CacheManifest, Vec<(usize, usize)>) {
            let writer = self.writer();
            let source = LocalDirSource::new(self.src.path());
            let current = manifest::load(writer.layout(), &self.key).unwrap();
            let changes = diff(&source, &current).unwrap();
            let mut ticks = Vec::new();
            let next = writer
                .apply(&source, &current, &changes, &CancellationToken::new(), &mut |d, t| {
                    ticks.push((d, t))
                })
                .unwrap();
            (next, ticks)
        }
    }

    #[test]
    fn first_apply_materializes_and_commits() {
        let fx = Fixture::new();
        fx.write("webapi/Program.cs", "class Program {}");
        fx.write("blank/readme.md", "blank");

        let (manifest, ticks) = fx.sync();
        assert_eq!(ticks, vec![(1, 2), (2, 2)]);

        let layout = fx.writer().layout().clone();
        let live = layout.live_dir(&manifest).expect("live generation");
        assert_eq!(
            fs::read_to_string(live.join("webapi/Program.cs")).unwrap(),
            "class Program {}"
        );
        assert_eq!(manifest::load(&layout, &fx.key).unwrap(), manifest);
        assert!(!layout.staging_root().join(manifest.generation.as_ref().unwrap()).exists());
    }

    #[test]
    fn second_apply_carries_unchanged_and_prunes_old_generation() {
        let fx = Fixture::new();
        fx.write("keep/a.txt", "a");
        fx.write("edit/b.txt", "b");
        let (first, _) = fx.sync();

        fx.write("edit/b.txt", "b2");
        let (second, ticks) = fx.sync();
        assert_eq!(ticks, vec![(1, 1)]);

        let layout = fx.writer().layout().clone();
        let live = layout.live_dir(&second).unwrap();
        assert_eq!(fs::read_to_string(live.join("keep/a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(live.join("edit/b.txt")).unwrap(), "b2");
        assert!(!layout.live_dir(&first).unwrap().exists(), "old generation pruned");
    }

    #[test]
    fn removal_only_change_reports_progress() {
        let fx = Fixture::new();
        fx.write("keep/a.txt", "a");
        fx.write("drop/b.txt", "b");
        fx.sync();

        fs::remove_dir_all(fx.src.path().join("drop")).unwrap();
        let (manifest, ticks) = fx.sync();
        assert_eq!(ticks, vec![(1, 1)]);
        assert!(manifest.entries.contains_key("keep"));
        assert!(!manifest.entries.contains_key("drop"));
    }

    #[test]
    fn cancelled_apply_leaves_cache_untouched() {
        let fx = Fixture::new();
        fx.write("webapi/a.txt", "a");
        let (before, _) = fx.sync();
        let layout = fx.writer().layout().clone();
        let manifest_bytes = fs::read(layout.manifest_path()).unwrap();

        fx.write("webapi/a.txt", "changed");
        let source = LocalDirSource::new(fx.src.path());
        let changes = diff(&source, &before).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .writer()
            .apply(&source, &before, &changes, &cancel, &mut |_, _| {})
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(fs::read(layout.manifest_path()).unwrap(), manifest_bytes);
        assert!(fs::read_dir(layout.staging_root()).unwrap().next().is_none());
        let generations: Vec<_> = fs::read_dir(layout.generations_dir()).unwrap().collect();
        assert_eq!(generations.len(), 1);
    }

    #[test]
    fn escaping_name_is_refused_without_writing_outside() {
        let fx = Fixture::new();
        fx.write("webapi/a.txt", "a");
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("victim");

        let source = LocalDirSource::new(fx.src.path());
        let current = CacheManifest::empty(&fx.key);
        let mut changes = diff(&source, &current).unwrap();
        changes.added.push(CatalogEntry {
            name: victim.display().to_string().into(),
            hash: "00".to_string(),
            location: fx.src.path().join("webapi").display().to_string(),
        });

        let err = fx
            .writer()
            .apply(&source, &current, &changes, &CancellationToken::new(), &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, SyncError::PartialWrite { completed: 1, total: 2, .. }), "{err:?}");
        assert!(!victim.exists());
        let layout = fx.writer().layout().clone();
        assert!(!layout.manifest_path().exists());
        assert!(fs::read_dir(layout.staging_root()).unwrap().next().is_none());
    }

    #[test]
    fn keep_generations_retains_previous() {
        let fx = Fixture::new();
        fx.write("t/a.txt", "1");
        let (first, _) = fx.sync();

        fx.write("t/a.txt", "2");
        let writer = fx.writer().keep_generations(1);
        let source = LocalDirSource::new(fx.src.path());
        let changes = diff(&source, &first).unwrap();
        writer
            .apply(&source, &first, &changes, &CancellationToken::new(), &mut |_, _| {})
            .unwrap();

        assert!(writer.layout().live_dir(&first).unwrap().exists());
    }
}
