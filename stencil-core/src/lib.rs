//! Stencil core library — domain types, configuration, errors.
//!
//! - [`types`] — sync status, progress events, catalog entries, source keys
//! - [`config`] — `~/.stencil/config.yaml` load / save
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BusyPolicy, StencilConfig};
pub use error::ConfigError;
pub use types::{
    percent, CatalogEntry, ProgressEvent, SourceKey, SyncStatus, TemplateName,
};
