//! User configuration at `~/.stencil/config.yaml`.
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing file is not an error: every field has a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

/// Default per-subscriber queue depth for progress events.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// What a second `sync` on a path does while a session is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Block until the active session is terminal, then run a fresh one.
    #[default]
    Wait,
    /// Fail the second invocation immediately with `Busy`.
    Reject,
}

/// On-disk configuration. Unknown keys are rejected so typos surface early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StencilConfig {
    /// Root of the per-source cache directories. Defaults to
    /// `<home>/.stencil/cache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,
    pub subscriber_capacity: usize,
    pub busy_policy: BusyPolicy,
    /// Superseded cache generations kept after a successful swap.
    pub keep_generations: usize,
}

impl Default for StencilConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            busy_policy: BusyPolicy::Wait,
            keep_generations: 0,
        }
    }
}

impl StencilConfig {
    /// Resolve the cache root against `home`.
    pub fn cache_root_at(&self, home: &Path) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(|| stencil_root(home).join("cache"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "subscriber_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// `<home>/.stencil`
pub fn stencil_root(home: &Path) -> PathBuf {
    home.join(".stencil")
}

/// `<home>/.stencil/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    stencil_root(home).join("config.yaml")
}

/// Load the configuration rooted at `home`, falling back to defaults when the
/// file does not exist.
pub fn load_at(home: &Path) -> Result<StencilConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(StencilConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(StencilConfig::default());
    }
    let config: StencilConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<StencilConfig, ConfigError> {
    load_at(&home()?)
}

/// Save the configuration atomically (`.tmp` + rename).
pub fn save_at(home: &Path, config: &StencilConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let path = config_path_at(home);
    let dir = stencil_root(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// The user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_file_missing() {
        let home = TempDir::new().unwrap();
        let config = load_at(home.path()).unwrap();
        assert_eq!(config, StencilConfig::default());
        assert_eq!(
            config.cache_root_at(home.path()),
            home.path().join(".stencil").join("cache")
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(stencil_root(home.path())).unwrap();
        std::fs::write(config_path_at(home.path()), "busy_policy: reject\n").unwrap();

        let config = load_at(home.path()).unwrap();
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.subscriber_capacity, DEFAULT_SUBSCRIBER_CAPACITY);
    }

    #[test]
    fn roundtrip_save_load() {
        let home = TempDir::new().unwrap();
        let config = StencilConfig {
            cache_root: Some(home.path().join("elsewhere")),
            subscriber_capacity: 8,
            busy_policy: BusyPolicy::Reject,
            keep_generations: 2,
        };
        save_at(home.path(), &config).unwrap();
        assert_eq!(load_at(home.path()).unwrap(), config);
        assert!(!config_path_at(home.path())
            .with_extension("yaml.tmp")
            .exists());
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(stencil_root(home.path())).unwrap();
        std::fs::write(config_path_at(home.path()), "subscriber_capacity: [oops\n").unwrap();

        let err = load_at(home.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, config_path_at(home.path())),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(stencil_root(home.path())).unwrap();
        std::fs::write(config_path_at(home.path()), "subscriber_capacity: 0\n").unwrap();

        assert!(matches!(
            load_at(home.path()),
            Err(ConfigError::Invalid {
                field: "subscriber_capacity",
                ..
            })
        ));
    }
}
