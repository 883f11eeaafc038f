//! Source path validation.
//!
//! Runs before any session exists and never publishes progress. Checks, in
//! order: non-empty, no NUL bytes, a known scheme, then reachability through
//! the resolved [`CatalogSource`]'s `probe`.

use std::path::PathBuf;
use std::sync::Arc;

use stencil_core::{types::is_remote, SourceKey};

use crate::error::SyncError;
use crate::source::{has_unsupported_scheme, CatalogSource, SourceLocation, SourceResolver};

/// A source that passed validation, ready to be scanned.
#[derive(Clone)]
pub struct ValidatedSource {
    pub key: SourceKey,
    pub location: SourceLocation,
    pub source: Arc<dyn CatalogSource>,
}

impl std::fmt::Debug for ValidatedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedSource")
            .field("key", &self.key)
            .field("location", &self.location)
            .finish()
    }
}

/// Validate a caller-supplied source path.
///
/// Every failure is [`SyncError::InvalidPath`].
pub fn validate(raw: &str, resolver: &dyn SourceResolver) -> Result<ValidatedSource, SyncError> {
    let location = parse(raw)?;
    let source = resolver.resolve(&location)?;
    source.probe().map_err(|err| match err {
        err @ SyncError::InvalidPath { .. } => err,
        other => SyncError::invalid_path(raw.trim(), other.to_string()),
    })?;

    let key = match &location {
        SourceLocation::Local(path) => SourceKey(path.display().to_string()),
        SourceLocation::Remote(_) => SourceKey::from_raw(raw),
    };
    tracing::debug!("validated source {key}");
    Ok(ValidatedSource {
        key,
        location,
        source,
    })
}

/// Syntactic checks only; local paths are canonicalized, which also proves
/// they exist.
pub fn parse(raw: &str) -> Result<SourceLocation, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::invalid_path(raw, "path is empty"));
    }
    if trimmed.contains('\0') {
        return Err(SyncError::invalid_path(trimmed, "path contains a NUL byte"));
    }
    if is_remote(trimmed) {
        let (_, rest) = trimmed.split_once("://").unwrap_or(("", ""));
        if rest.trim_matches('/').is_empty() {
            return Err(SyncError::invalid_path(trimmed, "URL has no host"));
        }
        return Ok(SourceLocation::Remote(
            trimmed.trim_end_matches('/').to_string(),
        ));
    }
    if has_unsupported_scheme(trimmed) {
        return Err(SyncError::invalid_path(trimmed, "unsupported URL scheme"));
    }

    let path = PathBuf::from(trimmed);
    let canonical = std::fs::canonicalize(&path)
        .map_err(|err| SyncError::invalid_path(trimmed, format!("cannot resolve path: {err}")))?;
    Ok(SourceLocation::Local(canonical))
}
