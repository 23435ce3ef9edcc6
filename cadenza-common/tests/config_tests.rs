//! Integration tests for configuration loading and data directory resolution
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate CADENZA_DATA_DIR are marked with #[serial].

use cadenza_common::config::{
    default_data_dir, resolve_data_dir, EngineBackend, TomlConfig, DATA_DIR_ENV,
};
use cadenza_common::Error;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};

#[test]
fn test_load_or_create_writes_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = TomlConfig::load_or_create(&path).expect("missing file must not fail");
    assert_eq!(config, TomlConfig::default());
    assert!(path.exists(), "default config should be written back");

    // Second load reads the file that was just written
    let reloaded = TomlConfig::load_or_create(&path).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_load_reports_parse_errors_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[instance]\nmax_concurrent_connections = \"many\"\n").unwrap();

    match TomlConfig::load(&path) {
        Err(Error::ConfigParse { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected ConfigParse, got {:?}", other),
    }
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[player]\ninitial_volume = 3.0\n").unwrap();

    assert!(matches!(TomlConfig::load(&path), Err(Error::Config(_))));

    for invalid in [
        "[player]\nevent_capacity = 0\n",
        "[instance]\nhandshake_timeout_ms = 0\n",
        "[instance]\nconnect_timeout_ms = 0\n",
    ] {
        std::fs::write(&path, invalid).unwrap();
        assert!(
            matches!(TomlConfig::load(&path), Err(Error::Config(_))),
            "accepted {:?}",
            invalid
        );
    }
}

#[test]
fn test_save_round_trips_custom_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = TomlConfig::default();
    config.engine.backend = EngineBackend::Simulated;
    config.engine.plugin_dir = Some(PathBuf::from("/opt/cadenza/plugins"));
    config.instance.handshake_timeout_ms = 250;
    config.logging.file = Some(PathBuf::from("cadenza.log"));
    config.save(&path).unwrap();

    assert_eq!(TomlConfig::load(&path).unwrap(), config);
}

#[test]
#[serial]
fn test_cli_argument_wins() {
    env::set_var(DATA_DIR_ENV, "/tmp/cadenza-env");
    let mut config = TomlConfig::default();
    config.data_dir = Some(PathBuf::from("/tmp/cadenza-toml"));

    let resolved = resolve_data_dir(Some(Path::new("/tmp/cadenza-cli")), &config);
    assert_eq!(resolved, PathBuf::from("/tmp/cadenza-cli"));

    env::remove_var(DATA_DIR_ENV);
}

#[test]
#[serial]
fn test_env_beats_toml() {
    env::set_var(DATA_DIR_ENV, "/tmp/cadenza-env");
    let mut config = TomlConfig::default();
    config.data_dir = Some(PathBuf::from("/tmp/cadenza-toml"));

    assert_eq!(resolve_data_dir(None, &config), PathBuf::from("/tmp/cadenza-env"));

    env::remove_var(DATA_DIR_ENV);
}

#[test]
#[serial]
fn test_toml_then_default() {
    env::remove_var(DATA_DIR_ENV);
    let mut config = TomlConfig::default();
    config.data_dir = Some(PathBuf::from("/tmp/cadenza-toml"));
    assert_eq!(resolve_data_dir(None, &config), PathBuf::from("/tmp/cadenza-toml"));

    config.data_dir = None;
    let resolved = resolve_data_dir(None, &config);
    assert_eq!(resolved, default_data_dir());
    assert!(!resolved.as_os_str().is_empty());
}
