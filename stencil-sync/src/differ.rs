//! Catalog diff — what a sync would change.
//!
//! Compares the source catalog with the cache manifest by name and hash.
//! Nothing is written.

use std::collections::BTreeMap;

use stencil_core::{CatalogEntry, TemplateName};

use crate::{manifest::CacheManifest, source::CatalogSource, SyncError};

/// Entries that differ between a source catalog and a cache manifest.
///
/// Every list is sorted by template name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<CatalogEntry>,
    pub updated: Vec<CatalogEntry>,
    pub removed: Vec<TemplateName>,
    /// Present on both sides with the same hash; carried over by the writer.
    pub unchanged: Vec<CatalogEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Units of work the writer reports progress over.
    pub fn total_units(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            updated: self.updated.len(),
            removed: self.removed.len(),
            unchanged: self.unchanged.len(),
        }
    }
}

/// Counts only; what hosts report back to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Diff the catalog at `source` against `manifest`.
///
/// Any enumeration failure is reported as [`SyncError::SourceUnreachable`],
/// as is a catalog listing a name that is not a plain directory name.
pub fn diff(source: &dyn CatalogSource, manifest: &CacheManifest) -> Result<ChangeSet, SyncError> {
    let listed = source.list().map_err(|err| match err {
        err @ (SyncError::SourceUnreachable { .. } | SyncError::Cancelled) => err,
        other => SyncError::SourceUnreachable {
            location: source.location().to_string(),
            reason: other.to_string(),
        },
    })?;

    let mut catalog = BTreeMap::new();
    for entry in listed {
        if !entry.name.is_plain_component() {
            return Err(SyncError::SourceUnreachable {
                location: source.location().to_string(),
                reason: format!("catalog lists unusable template name '{}'", entry.name),
            });
        }
        if catalog.contains_key(&entry.name.0) {
            return Err(SyncError::SourceUnreachable {
                location: source.location().to_string(),
                reason: format!("catalog lists template '{}' twice", entry.name),
            });
        }
        catalog.insert(entry.name.0.clone(), entry);
    }

    let mut changes = ChangeSet::default();
    for (name, entry) in &catalog {
        match manifest.entries.get(name) {
            None => changes.added.push(entry.clone()),
            Some(cached) if cached.hash != entry.hash => changes.updated.push(entry.clone()),
            Some(_) => changes.unchanged.push(entry.clone()),
        }
    }
    for name in manifest.entries.keys() {
        if !catalog.contains_key(name) {
            changes.removed.push(TemplateName::from(name.as_str()));
        }
    }

    tracing::debug!(
        "diff of {}: {} added, {} updated, {} removed, {} unchanged",
        source.location(),
        changes.added.len(),
        changes.updated.len(),
        changes.removed.len(),
        changes.unchanged.len(),
    );
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use stencil_core::SourceKey;
    use tempfile::TempDir;

    use super::*;
    use crate::source::LocalDirSource;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn manifest_from(source: &LocalDirSource) -> CacheManifest {
        let mut manifest = CacheManifest::empty(&SourceKey("test".to_string()));
        for entry in source.list().unwrap() {
            manifest.insert(&entry);
        }
        manifest
    }

    #[test]
    fn everything_added_against_empty_manifest() {
        let src = TempDir::new().unwrap();
        write(src.path(), "webapi/a.txt", "a");
        write(src.path(), "blank/b.txt", "b");
        let source = LocalDirSource::new(src.path());

        let changes = diff(&source, &CacheManifest::empty(&SourceKey("t".into()))).unwrap();
        let added: Vec<_> = changes.added.iter().map(|e| e.name.0.as_str()).collect();
        assert_eq!(added, ["blank", "webapi"]);
        assert_eq!(changes.total_units(), 2);
    }

    #[test]
    fn identical_catalog_is_empty() {
        let src = TempDir::new().unwrap();
        write(src.path(), "webapi/a.txt", "a");
        let source = LocalDirSource::new(src.path());
        let manifest = manifest_from(&source);

        let changes = diff(&source, &manifest).unwrap();
        assert!(changes.is_empty());
        assert_eq!(changes.unchanged.len(), 1);
    }

    #[test]
    fn detects_update_and_removal() {
        let src = TempDir::new().unwrap();
        write(src.path(), "keep/a.txt", "a");
        write(src.path(), "edit/b.txt", "b");
        write(src.path(), "drop/c.txt", "c");
        let source = LocalDirSource::new(src.path());
        let manifest = manifest_from(&source);

        write(src.path(), "edit/b.txt", "b2");
        fs::remove_dir_all(src.path().join("drop")).unwrap();
        write(src.path(), "fresh/d.txt", "d");

        let changes = diff(&source, &manifest).unwrap();
        assert_eq!(changes.added[0].name.0, "fresh");
        assert_eq!(changes.updated[0].name.0, "edit");
        assert_eq!(changes.removed, vec![TemplateName::from("drop")]);
        assert_eq!(changes.unchanged[0].name.0, "keep");
        assert_eq!(
            changes.summary(),
            ChangeSummary {
                added: 1,
                updated: 1,
                removed: 1,
                unchanged: 1
            }
        );
    }

    struct ListedSource(Vec<CatalogEntry>);

    impl CatalogSource for ListedSource {
        fn location(&self) -> &str {
            "listed"
        }

        fn probe(&self) -> Result<(), SyncError> {
            Ok(())
        }

        fn list(&self) -> Result<Vec<CatalogEntry>, SyncError> {
            Ok(self.0.clone())
        }

        fn materialize(
            &self,
            _entry: &CatalogEntry,
            _dest: &Path,
            _cancel: &tokio_util::sync::CancellationToken,
        ) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn entry(name: &str) -> CatalogEntry {
        CatalogEntry {
            name: TemplateName::from(name),
            hash: "00".to_string(),
            location: name.to_string(),
        }
    }

    #[test]
    fn names_escaping_the_cache_are_rejected() {
        let manifest = CacheManifest::empty(&SourceKey("t".into()));
        for name in ["/tmp/victim", "../victim", "a/b", ".."] {
            let source = ListedSource(vec![entry("ok"), entry(name)]);
            let err = diff(&source, &manifest).unwrap_err();
            match err {
                SyncError::SourceUnreachable { reason, .. } => {
                    assert!(reason.contains(name), "{name}: {reason}")
                }
                other => panic!("{name}: expected SourceUnreachable, got {other:?}"),
            }
        }
    }

    #[test]
    fn vanished_source_is_unreachable() {
        let src = TempDir::new().unwrap();
        let source = LocalDirSource::new(src.path().join("gone"));
        let err = diff(&source, &CacheManifest::empty(&SourceKey("t".into()))).unwrap_err();
        assert!(matches!(err, SyncError::SourceUnreachable { .. }));
    }
}
