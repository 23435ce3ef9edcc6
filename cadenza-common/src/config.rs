//! Configuration loading and data directory resolution
//!
//! Cadenza keeps all of its settings in a single TOML file. Every field has a
//! built-in default, so a missing file (or a missing section inside it) never
//! prevents startup.
//!
//! # Data directory priority
//!
//! 1. Command-line argument (highest priority)
//! 2. `CADENZA_DATA_DIR` environment variable
//! 3. `data_dir` key of the TOML config file
//! 4. OS-dependent default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the per-user data directory
pub const DATA_DIR_ENV: &str = "CADENZA_DATA_DIR";

/// Directory name used below the platform config/data roots
pub const APP_DIR_NAME: &str = "cadenza";

/// Root of the TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Per-user data directory (instance lock file, named mutex, logs)
    pub data_dir: Option<PathBuf>,

    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub instance: InstanceConfig,
    pub player: PlayerSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    /// Log file path (optional, logs to stderr only if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Which implementation of the native engine surface to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Vendor BASS library, loaded at runtime
    #[default]
    Bass,
    /// In-process software engine (no audio output)
    Simulated,
}

impl std::str::FromStr for EngineBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bass" => Ok(Self::Bass),
            "simulated" => Ok(Self::Simulated),
            other => Err(Error::Config(format!("Unknown engine backend '{}'", other))),
        }
    }
}

/// Native engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: EngineBackend,

    /// Output device index, -1 selects the system default device
    pub device: i32,

    /// Output sample rate in Hz
    pub frequency: u32,

    /// Resample web streams to the output rate
    pub restrate: bool,

    /// Explicit path of the engine shared library
    pub library_path: Option<PathBuf>,

    /// Directory scanned for engine format plugins
    pub plugin_dir: Option<PathBuf>,

    /// User agent sent by the engine for web streams
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            device: -1,
            frequency: 44100,
            restrate: false,
            library_path: None,
            plugin_dir: None,
            user_agent: None,
        }
    }
}

/// Single-instance broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Forward to / serve a running instance at all
    pub enabled: bool,

    /// File name (inside the data directory) recording the serving port
    pub lock_file_name: String,

    /// Name of the cross-process mutex guarding the lock file
    pub mutex_name: String,

    /// Upper bound on waiting for the cross-process mutex
    pub mutex_timeout_ms: u64,

    /// Upper bound on each read from an inbound connection
    pub handshake_timeout_ms: u64,

    /// Upper bound on connecting to a running instance
    pub connect_timeout_ms: u64,

    /// Inbound connections processed at the same time
    pub max_concurrent_connections: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_file_name: "instancelock.txt".to_string(),
            mutex_name: "cadenza-instance".to_string(),
            mutex_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
            max_concurrent_connections: 8,
        }
    }
}

impl InstanceConfig {
    pub fn mutex_timeout(&self) -> Duration {
        Duration::from_millis(self.mutex_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Player task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// Interval of the position/status poll timer
    pub poll_interval_ms: u64,

    /// Global volume applied at startup (0.0-1.0)
    pub initial_volume: f32,

    /// Capacity of the player event bus
    pub event_capacity: usize,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            initial_volume: 1.0,
            event_capacity: 256,
        }
    }
}

impl PlayerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TomlConfig {
    /// Parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration, writing a default file when none exists
    ///
    /// A missing file is not an error: defaults are used and written back so
    /// the user has a file to edit. Failing to write the default file is
    /// logged and ignored.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            return Self::load(path);
        }

        warn!(
            "Configuration file {} not found, using built-in defaults",
            path.display()
        );
        let config = Self::default();
        if let Err(e) = config.save(path) {
            warn!("Could not write default configuration to {}: {}", path.display(), e);
        }
        Ok(config)
    }

    /// Write the configuration as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.instance.max_concurrent_connections == 0 {
            return Err(Error::Config(
                "instance.max_concurrent_connections must be at least 1".to_string(),
            ));
        }
        if self.instance.lock_file_name.trim().is_empty() || self.instance.mutex_name.trim().is_empty() {
            return Err(Error::Config(
                "instance.lock_file_name and instance.mutex_name must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.player.initial_volume) {
            return Err(Error::Config(format!(
                "player.initial_volume must be within 0.0-1.0, got {}",
                self.player.initial_volume
            )));
        }
        if self.instance.handshake_timeout_ms == 0 || self.instance.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "instance.handshake_timeout_ms and instance.connect_timeout_ms must be positive".to_string(),
            ));
        }
        if self.player.poll_interval_ms == 0 {
            return Err(Error::Config("player.poll_interval_ms must be positive".to_string()));
        }
        if self.player.event_capacity == 0 {
            return Err(Error::Config("player.event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Default configuration file path for the platform
///
/// `<config_dir>/cadenza/config.toml`, e.g. `~/.config/cadenza/config.toml`
/// on Linux or `%APPDATA%\cadenza\config.toml` on Windows.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join("config.toml"))
}

/// Resolve the per-user data directory following the priority order above
pub fn resolve_data_dir(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(DATA_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &config.data_dir {
        return path.clone();
    }

    // Priority 4: OS-dependent default
    default_data_dir()
}

/// OS-dependent default data directory
pub fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/cadenza
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from("/tmp/cadenza"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/cadenza
        dirs::data_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from("/tmp/cadenza"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\cadenza
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\cadenza"))
    } else {
        PathBuf::from("./cadenza_data")
    }
}
