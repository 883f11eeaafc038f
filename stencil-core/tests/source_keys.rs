//! Source key normalization and config error surfaces, exercised through the
//! public API only.

use std::fs;

use stencil_core::{config, ConfigError, SourceKey};
use tempfile::TempDir;

#[test]
fn equivalent_local_spellings_share_one_key() {
    let dir = TempDir::new().expect("tempdir");
    fs::create_dir_all(dir.path().join("catalog")).expect("mkdir");

    let plain = SourceKey::from_raw(&dir.path().join("catalog").display().to_string());
    let dotted = SourceKey::from_raw(&format!("{}/./catalog/", dir.path().display()));
    let padded = SourceKey::from_raw(&format!("  {}  ", dir.path().join("catalog").display()));

    assert_eq!(plain, dotted);
    assert_eq!(plain, padded);
    assert!(!plain.is_remote());
}

#[test]
fn remote_keys_ignore_trailing_slash() {
    let a = SourceKey::from_raw("https://templates.example.com/feed/");
    let b = SourceKey::from_raw("https://templates.example.com/feed");
    assert_eq!(a, b);
    assert!(a.is_remote());
}

#[test]
fn unknown_config_keys_are_rejected_with_path() {
    let home = TempDir::new().expect("home");
    fs::create_dir_all(config::stencil_root(home.path())).expect("mkdir");
    fs::write(config::config_path_at(home.path()), "subscriber_capacty: 4\n").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "got: {err}");
}
