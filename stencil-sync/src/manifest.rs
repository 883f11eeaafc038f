//! Cache manifest — the persisted record of what a cache holds.
//!
//! Each source gets its own cache directory under the configured cache root:
//!
//! ```text
//! <cache_root>/<sha256(source key)[..16]>/
//!   manifest.json          (commit point; names the live generation)
//!   generations/<id>/      (one directory per template)
//!   staging/<id>/          (in-flight writes; never read)
//! ```
//!
//! Writes use the `.tmp` + rename pattern, so the manifest a reader sees is
//! always either the old or the new one in full.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stencil_core::{CatalogEntry, SourceKey};

use crate::error::{io_err, SyncError};

/// One materialized template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: String,
    pub location: String,
}

/// On-disk manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheManifest {
    pub source: String,
    pub synced_at: DateTime<Utc>,
    /// Live generation directory name; `None` before the first sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    /// Keyed by template name.
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl CacheManifest {
    pub fn empty(source: &SourceKey) -> Self {
        Self {
            source: source.to_string(),
            synced_at: Utc::now(),
            generation: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: &CatalogEntry) {
        self.entries.insert(
            entry.name.0.clone(),
            ManifestEntry {
                hash: entry.hash.clone(),
                location: entry.location.clone(),
            },
        );
    }
}

/// Paths making up one source's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Layout for `key` under `cache_root`. The directory name is a hash of
    /// the key so arbitrary paths and URLs map to a safe file name.
    pub fn for_source(cache_root: &Path, key: &SourceKey) -> Self {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        Self {
            root: cache_root.join(&digest[..16]),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn generations_dir(&self) -> PathBuf {
        self.root.join("generations")
    }

    pub fn generation_dir(&self, id: &str) -> PathBuf {
        self.generations_dir().join(id)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn staging_dir(&self, id: &str) -> PathBuf {
        self.staging_root().join(id)
    }

    /// Directory holding the live templates, if the cache was ever synced.
    pub fn live_dir(&self, manifest: &CacheManifest) -> Option<PathBuf> {
        manifest.generation.as_deref().map(|id| self.generation_dir(id))
    }

    /// Location of one cached template in the live generation.
    pub fn template_dir(&self, manifest: &CacheManifest, name: &str) -> Option<PathBuf> {
        if !manifest.entries.contains_key(name) {
            return None;
        }
        self.live_dir(manifest).map(|dir| dir.join(name))
    }
}

/// Load the manifest for `key`, or an empty one if the cache was never
/// written.
pub fn load(layout: &CacheLayout, key: &SourceKey) -> Result<CacheManifest, SyncError> {
    let path = layout.manifest_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CacheManifest::empty(key)),
        Err(err) => return Err(io_err(&path, err)),
    };
    Ok(serde_json::from_str(&contents)?)
}

/// Save the manifest atomically.
///
/// Writes to `<path>.tmp` then renames to `<path>`.
pub fn save(layout: &CacheLayout, manifest: &CacheManifest) -> Result<(), SyncError> {
    let path = layout.manifest_path();
    let dir = layout.root();
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(manifest)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}
