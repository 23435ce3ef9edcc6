//! cadenza-player runtime configuration
//!
//! Combines the TOML file with command-line overrides into the settings the
//! binary actually runs with.

use cadenza_common::config::{resolve_data_dir, EngineBackend, TomlConfig};
use cadenza_common::Result;
use std::path::{Path, PathBuf};

/// Values the command line may override
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub engine: Option<EngineBackend>,
    pub log_level: Option<String>,
    pub no_single_instance: bool,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub config_file: Option<PathBuf>,
    pub toml: TomlConfig,
}

impl Config {
    /// Load `config_file` (created with defaults when missing) and apply overrides
    ///
    /// Without a config file path the defaults are used as-is.
    pub fn resolve(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut toml = match config_file {
            Some(path) => TomlConfig::load_or_create(path)?,
            None => TomlConfig::default(),
        };

        if let Some(backend) = overrides.engine {
            toml.engine.backend = backend;
        }
        if let Some(level) = &overrides.log_level {
            toml.logging.level = level.clone();
        }
        if overrides.no_single_instance {
            toml.instance.enabled = false;
        }
        toml.validate()?;

        let data_dir = resolve_data_dir(overrides.data_dir.as_deref(), &toml);
        Ok(Self {
            data_dir,
            config_file: config_file.map(Path::to_path_buf),
            toml,
        })
    }

    pub fn single_instance(&self) -> bool {
        self.toml.instance.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_common::config::DATA_DIR_ENV;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\nbackend = \"bass\"\n\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let overrides = Overrides {
            data_dir: Some(dir.path().join("data")),
            engine: Some(EngineBackend::Simulated),
            log_level: Some("debug".to_string()),
            no_single_instance: true,
        };
        let config = Config::resolve(Some(&path), &overrides).unwrap();

        assert_eq!(config.toml.engine.backend, EngineBackend::Simulated);
        assert_eq!(config.toml.logging.level, "debug");
        assert!(!config.single_instance());
        assert_eq!(config.data_dir, dir.path().join("data"));
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::resolve(Some(&path), &Overrides::default()).unwrap();

        assert!(path.exists());
        assert!(config.single_instance());
        assert_eq!(config.config_file.as_deref(), Some(path.as_path()));
    }

    #[test]
    #[serial]
    fn test_environment_data_dir_used_without_cli_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::env::set_var(DATA_DIR_ENV, dir.path().join("from-env"));

        let from_env = Config::resolve(Some(&path), &Overrides::default()).unwrap();
        let overrides = Overrides {
            data_dir: Some(dir.path().join("from-cli")),
            ..Overrides::default()
        };
        let from_cli = Config::resolve(Some(&path), &overrides).unwrap();
        std::env::remove_var(DATA_DIR_ENV);

        assert_eq!(from_env.data_dir, dir.path().join("from-env"));
        assert_eq!(from_cli.data_dir, dir.path().join("from-cli"));
    }
}
