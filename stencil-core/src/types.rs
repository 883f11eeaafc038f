//! Domain types shared by the sync engine, the daemon host and the CLI.
//!
//! Everything here is plain data: serializable with serde, cheap to clone,
//! free of I/O except [`SourceKey::from_raw`], which canonicalizes local paths.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a template in a catalog. Identity of a
/// [`CatalogEntry`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateName(pub String);

impl TemplateName {
    /// `true` when the name is usable as a single directory name under a
    /// cache generation: one normal path component, no separators, not
    /// hidden.
    pub fn is_plain_component(&self) -> bool {
        let name = self.0.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return false;
        }
        let mut components = Path::new(name).components();
        matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TemplateName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TemplateName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Normalized identity of a sync source.
///
/// Local paths are canonicalized so `.` and `/abs/path` map to the same key;
/// remote feeds keep their URL minus any trailing slash. Per-path locks,
/// subscriber sets and cache directories are all keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceKey(pub String);

impl SourceKey {
    /// Derive the key for a raw, caller-supplied source string.
    ///
    /// Never fails: a local path that cannot be canonicalized keeps its
    /// trimmed raw form, so subscribers registering for a not-yet-valid path
    /// still get a stable key.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_remote(trimmed) {
            return Self(trimmed.trim_end_matches('/').to_string());
        }
        match std::fs::canonicalize(Path::new(trimmed)) {
            Ok(path) => Self(path.display().to_string()),
            Err(_) => Self(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        is_remote(&self.0)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `true` when `raw` names a remote feed rather than a local directory.
pub fn is_remote(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

// ---------------------------------------------------------------------------
// Sync status + progress
// ---------------------------------------------------------------------------

/// Phase of a synchronization attempt.
///
/// Declaration order is the nominal progression; the four variants after
/// `Updating` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum SyncStatus {
    #[default]
    None,
    Validating,
    Scanning,
    Updating,
    UpdateNotRequired,
    Updated,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::UpdateNotRequired
                | SyncStatus::Updated
                | SyncStatus::Failed
                | SyncStatus::Cancelled
        )
    }

    /// Terminal statuses that must always be reported at 100%.
    pub fn completes_progress(self) -> bool {
        matches!(self, SyncStatus::UpdateNotRequired | SyncStatus::Updated)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::None => "None",
            SyncStatus::Validating => "Validating",
            SyncStatus::Scanning => "Scanning",
            SyncStatus::Updating => "Updating",
            SyncStatus::UpdateNotRequired => "UpdateNotRequired",
            SyncStatus::Updated => "Updated",
            SyncStatus::Failed => "Failed",
            SyncStatus::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

/// One `(status, progress)` message broadcast to subscribers of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: SyncStatus,
    /// Percentage in `0..=100`.
    pub progress: u8,
}

impl ProgressEvent {
    /// Build an event, clamping `progress` to 100.
    pub fn new(status: SyncStatus, progress: u8) -> Self {
        Self {
            status,
            progress: progress.min(100),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}%)", self.status, self.progress)
    }
}

/// Floor-rounded `done / total` percentage. An empty workload counts as done.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total);
    ((done * 100) / total) as u8
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A template as enumerated from a source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: TemplateName,
    /// Hex SHA-256 content hash; two entries with the same name and hash are
    /// considered identical.
    pub hash: String,
    /// Where the template lives at the source (path or URL).
    pub location: String,
}
