use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use stencil_core::{CatalogEntry, SourceKey};
use stencil_sync::{
    diff, manifest, CacheLayout, CacheWriter, CatalogSource, LocalDirSource, SyncError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Local source that fails to materialize one named template.
struct FailingSource {
    inner: LocalDirSource,
    fail_on: &'static str,
    materialized: AtomicUsize,
}

impl CatalogSource for FailingSource {
    fn location(&self) -> &str {
        self.inner.location()
    }

    fn probe(&self) -> Result<(), SyncError> {
        self.inner.probe()
    }

    fn list(&self) -> Result<Vec<CatalogEntry>, SyncError> {
        self.inner.list()
    }

    fn materialize(
        &self,
        entry: &CatalogEntry,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if entry.name.0 == self.fail_on {
            // Leave a half-written file behind, as a real fetch might.
            fs::create_dir_all(dest).expect("mkdir");
            fs::write(dest.join("partial.bin"), b"\0\0").expect("write partial");
            return Err(SyncError::SourceUnreachable {
                location: entry.location.clone(),
                reason: "connection reset".to_string(),
            });
        }
        self.materialized.fetch_add(1, Ordering::SeqCst);
        self.inner.materialize(entry, dest, cancel)
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, content).expect("write");
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn failed_write_leaves_manifest_byte_identical() {
    init_logging();
    let src = TempDir::new().expect("src");
    let cache = TempDir::new().expect("cache");
    let key = SourceKey(src.path().display().to_string());
    let layout = CacheLayout::for_source(cache.path(), &key);

    write(src.path(), "alpha/a.txt", "a1");
    write(src.path(), "bravo/b.txt", "b1");
    let local = LocalDirSource::new(src.path());
    let initial = manifest::load(&layout, &key).expect("load");
    let changes = diff(&local, &initial).expect("diff");
    let committed = CacheWriter::new(layout.clone(), key.clone())
        .apply(&local, &initial, &changes, &CancellationToken::new(), &mut |_, _| {})
        .expect("first apply");

    let manifest_before = fs::read(layout.manifest_path()).expect("read manifest");
    let live = layout.live_dir(&committed).expect("live");

    write(src.path(), "alpha/a.txt", "a2");
    write(src.path(), "charlie/c.txt", "c1");
    write(src.path(), "delta/d.txt", "d1");

    let failing = FailingSource {
        inner: LocalDirSource::new(src.path()),
        fail_on: "alpha",
        materialized: AtomicUsize::new(0),
    };
    let changes = diff(&failing, &committed).expect("diff");
    assert_eq!(changes.total_units(), 3);

    let mut ticks = Vec::new();
    let err = CacheWriter::new(layout.clone(), key.clone())
        .apply(
            &failing,
            &committed,
            &changes,
            &CancellationToken::new(),
            &mut |done, total| ticks.push((done, total)),
        )
        .expect_err("apply must fail");

    match err {
        SyncError::PartialWrite {
            entry,
            completed,
            total,
            ..
        } => {
            assert_eq!(entry.0, "alpha");
            assert_eq!(completed, 2);
            assert_eq!(total, 3);
        }
        other => panic!("expected PartialWrite, got {other:?}"),
    }
    assert_eq!(failing.materialized.load(Ordering::SeqCst), 2);
    assert_eq!(ticks, vec![(1, 3), (2, 3)]);

    assert_eq!(
        fs::read(layout.manifest_path()).expect("read manifest"),
        manifest_before,
        "manifest must be byte-identical after a failed apply"
    );
    assert_eq!(fs::read_to_string(live.join("alpha/a.txt")).expect("read"), "a1");
    assert!(!live.join("charlie").exists());
    assert!(!live.join("delta").exists());

    let staged: Vec<_> = fs::read_dir(layout.staging_root())
        .expect("staging root")
        .collect();
    assert!(staged.is_empty(), "staging must be discarded");
    let generations: Vec<_> = fs::read_dir(layout.generations_dir())
        .expect("generations")
        .collect();
    assert_eq!(generations.len(), 1, "no new generation may survive");
}

#[test]
fn failed_first_sync_leaves_no_manifest() {
    init_logging();
    let src = TempDir::new().expect("src");
    let cache = TempDir::new().expect("cache");
    let key = SourceKey(src.path().display().to_string());
    let layout = CacheLayout::for_source(cache.path(), &key);
    write(src.path(), "alpha/a.txt", "a");

    let failing = FailingSource {
        inner: LocalDirSource::new(src.path()),
        fail_on: "alpha",
        materialized: AtomicUsize::new(0),
    };
    let initial = manifest::load(&layout, &key).expect("load");
    let changes = diff(&failing, &initial).expect("diff");

    CacheWriter::new(layout.clone(), key)
        .apply(&failing, &initial, &changes, &CancellationToken::new(), &mut |_, _| {})
        .expect_err("apply must fail");

    assert!(!layout.manifest_path().exists());
    assert!(!layout.generations_dir().exists());
}
