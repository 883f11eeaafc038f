//! # stencil-sync
//!
//! Validation, catalog diffing and atomic cache writes for template caches.
//!
//! Everything here blocks. [`pipeline::run`] is the single entrypoint that
//! scans a validated source and, if needed, applies the change set; async
//! hosts call it from `spawn_blocking`.

pub mod differ;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod source;
pub mod validator;
pub mod writer;

pub use differ::{diff, ChangeSet, ChangeSummary};
pub use error::SyncError;
pub use manifest::{CacheLayout, CacheManifest, ManifestEntry};
pub use pipeline::{PipelineOptions, PipelineOutcome, Stage};
pub use source::{CatalogSource, DefaultResolver, LocalDirSource, SourceLocation, SourceResolver};
pub use validator::{validate, ValidatedSource};
pub use writer::CacheWriter;
