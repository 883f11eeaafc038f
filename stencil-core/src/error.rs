//! Error types for stencil-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.stencil/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A field holds a value the engine cannot run with.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Convenience constructor for [`ConfigError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
