//! Catalog sources — where templates come from.
//!
//! A [`CatalogSource`] enumerates templates and copies one of them into a
//! destination directory. [`LocalDirSource`] handles plain directories; remote
//! feeds are supplied by the host through [`DefaultResolver::with_feed`],
//! since fetching bytes over the network is not this crate's job.
//!
//! Local catalog layout: every non-hidden immediate subdirectory of the source
//! directory is one template, named after the directory.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use stencil_core::{types::is_remote, CatalogEntry, TemplateName};

use crate::error::{io_err, SyncError};

/// A catalog of templates at some location.
///
/// Methods block; callers run them off the async executor.
pub trait CatalogSource: Send + Sync {
    /// Display form of the location (path or URL).
    fn location(&self) -> &str;

    /// Cheap reachability check used by path validation.
    fn probe(&self) -> Result<(), SyncError>;

    /// Enumerate every template currently published at the source.
    fn list(&self) -> Result<Vec<CatalogEntry>, SyncError>;

    /// Copy `entry` into `dest`, which does not exist yet.
    ///
    /// Implementations should check `cancel` between units of work and
    /// return [`SyncError::Cancelled`] when it fires.
    fn materialize(
        &self,
        entry: &CatalogEntry,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>;
}

/// Maps a validated location onto a [`CatalogSource`].
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, location: &SourceLocation) -> Result<Arc<dyn CatalogSource>, SyncError>;
}

/// A syntactically valid source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    Remote(String),
}

impl SourceLocation {
    pub fn display(&self) -> String {
        match self {
            SourceLocation::Local(path) => path.display().to_string(),
            SourceLocation::Remote(url) => url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local directories
// ---------------------------------------------------------------------------

/// Templates stored as subdirectories of a local directory.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
    location: String,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let location = root.display().to_string();
        Self { root, location }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CatalogSource for LocalDirSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn probe(&self) -> Result<(), SyncError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SyncError::invalid_path(&self.location, "not a directory")),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SyncError::invalid_path(&self.location, "path does not exist"))
            }
            Err(err) => Err(SyncError::invalid_path(&self.location, err.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<CatalogEntry>, SyncError> {
        let unreachable = |reason: String| SyncError::SourceUnreachable {
            location: self.location.clone(),
            reason,
        };

        let read = std::fs::read_dir(&self.root).map_err(|e| unreachable(e.to_string()))?;
        let mut dirs = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| unreachable(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let ty = entry.file_type().map_err(|e| unreachable(e.to_string()))?;
            if ty.is_dir() {
                dirs.push((name, entry.path()));
            }
        }
        dirs.sort();

        let mut entries = Vec::with_capacity(dirs.len());
        for (name, path) in dirs {
            let hash = hash_template(&path).map_err(|e| unreachable(e.to_string()))?;
            entries.push(CatalogEntry {
                name: TemplateName::from(name),
                hash,
                location: path.display().to_string(),
            });
        }
        tracing::debug!("listed {} template(s) at {}", entries.len(), self.location);
        Ok(entries)
    }

    fn materialize(
        &self,
        entry: &CatalogEntry,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        copy_tree(Path::new(&entry.location), dest, cancel)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves local directories directly and remote URLs through registered
/// feed handlers (longest matching prefix wins).
#[derive(Default, Clone)]
pub struct DefaultResolver {
    feeds: BTreeMap<String, Arc<dyn CatalogSource>>,
}

impl DefaultResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote feed handler for URLs starting with `prefix`.
    pub fn with_feed(mut self, prefix: impl Into<String>, source: Arc<dyn CatalogSource>) -> Self {
        let prefix: String = prefix.into();
        self.feeds
            .insert(prefix.trim_end_matches('/').to_string(), source);
        self
    }
}

impl SourceResolver for DefaultResolver {
    fn resolve(&self, location: &SourceLocation) -> Result<Arc<dyn CatalogSource>, SyncError> {
        match location {
            SourceLocation::Local(path) => Ok(Arc::new(LocalDirSource::new(path.clone()))),
            SourceLocation::Remote(url) => self
                .feeds
                .iter()
                .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, source)| source.clone())
                .ok_or_else(|| SyncError::invalid_path(url, "no feed handler for remote source")),
        }
    }
}

impl std::fmt::Debug for DefaultResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultResolver")
            .field("feeds", &self.feeds.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `true` when the trimmed input looks like a URL with a scheme this crate
/// does not know how to route.
pub(crate) fn has_unsupported_scheme(raw: &str) -> bool {
    match raw.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
                && !is_remote(raw)
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

/// SHA-256 over the sorted relative paths and raw bytes of every file under
/// `dir`. Binary-safe: content is hashed as-is.
pub fn hash_template(dir: &Path) -> Result<String, SyncError> {
    let mut hasher = Sha256::new();
    for relative in collect_files(dir)? {
        let path = dir.join(&relative);
        let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copy `src` into the not-yet-existing `dest`, checking `cancel`
/// before every file.
pub fn copy_tree(src: &Path, dest: &Path, cancel: &CancellationToken) -> Result<(), SyncError> {
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    for relative in collect_files(src)? {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let from = src.join(&relative);
        let to = dest.join(&relative);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        std::fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
    }
    Ok(())
}

/// Relative paths of every regular file under `root`, sorted. Symlinks are
/// skipped.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = std::fs::read_dir(&current).map_err(|e| io_err(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            let path = entry.path();
            if ty.is_dir() {
                dirs.push(path);
            } else if ty.is_file() {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}
