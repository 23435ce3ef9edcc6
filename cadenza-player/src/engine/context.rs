//! Owning context for the process-wide engine
//!
//! The native engine is a process-global resource. Instead of a global
//! singleton the player creates exactly one [`EngineContext`] and shares it
//! through `Arc`; dropping the last reference frees the engine.
//!
//! **Responsibilities:**
//! - Initialize the output device and probe floating point output support
//! - Load format plugins and apply the web stream user agent
//! - Provide the stream flag sets used for file and URL streams
//! - Restart output after a device failure
//! - Map the 0.0-1.0 global volume onto the engine's 0-10000 configs

use super::{AudioEngine, ConfigOption, EngineResult, StreamFlags};
use crate::error::{Error, Result};
use cadenza_common::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scale of the engine's global volume configs
const GLOBAL_VOLUME_MAX: u32 = 10_000;

/// Engine initialization parameters
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Output device, -1 for the system default
    pub device: i32,
    /// Output sample rate in Hz
    pub frequency: u32,
    /// Resample web streams to the output rate
    pub restrate: bool,
    /// Directory scanned for format plugins
    pub plugin_dir: Option<PathBuf>,
    /// HTTP user agent for web streams
    pub user_agent: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            device: config.device,
            frequency: config.frequency,
            restrate: config.restrate,
            plugin_dir: config.plugin_dir.clone(),
            user_agent: config.user_agent.clone(),
        }
    }
}

/// The single owner of an initialized engine
pub struct EngineContext {
    engine: Arc<dyn AudioEngine>,
    settings: EngineSettings,
    float_flag: StreamFlags,
    restrate_flag: StreamFlags,
    plugin_count: usize,
}

impl EngineContext {
    /// Initialize `engine` and wrap it in a context
    ///
    /// A second initialization while another context for the same engine is
    /// alive fails with [`super::ErrorCode::Already`].
    pub fn initialize(engine: Arc<dyn AudioEngine>, settings: EngineSettings) -> Result<Self> {
        let version = engine.version();
        info!(
            "Initializing {} engine version {}",
            engine.name(),
            format_version(version)
        );

        let plugin_count = match &settings.plugin_dir {
            Some(dir) => load_plugins(engine.as_ref(), dir),
            None => 0,
        };

        if let Err(code) = engine.init(settings.device, settings.frequency) {
            if plugin_count > 0 {
                let _ = engine.free_plugins();
            }
            return Err(Error::engine("Init", code));
        }

        // From here on the context owns the device, so Drop frees it on error
        let mut context = Self {
            engine,
            settings,
            float_flag: StreamFlags::empty(),
            restrate_flag: StreamFlags::empty(),
            plugin_count,
        };

        context.float_flag = if probe_float_support(context.engine.as_ref()) {
            info!("Enabling floating point data output");
            StreamFlags::SAMPLE_FLOAT
        } else {
            StreamFlags::empty()
        };

        if context.settings.restrate {
            info!("Enabling stream restrate");
            context.restrate_flag = StreamFlags::RESTRATE;
        }

        if let Some(agent) = &context.settings.user_agent {
            info!("Setting user agent to {}", agent);
            if let Err(code) = context.engine.set_user_agent(agent) {
                warn!("Failed to set user agent: {}", code);
            }
        }

        info!(
            "Engine initialization complete (device {}, {} Hz, {} plugin(s))",
            context.settings.device, context.settings.frequency, context.plugin_count
        );
        Ok(context)
    }

    /// The wrapped engine
    pub fn engine(&self) -> &dyn AudioEngine {
        self.engine.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// True when streams are created with 32-bit float samples
    pub fn float_output(&self) -> bool {
        self.float_flag.contains(StreamFlags::SAMPLE_FLOAT)
    }

    /// Flags for local file streams
    pub fn file_stream_flags(&self) -> StreamFlags {
        self.float_flag | StreamFlags::ASYNC_FILE | StreamFlags::PRESCAN | StreamFlags::AUTO_FREE
    }

    /// Flags for web streams
    pub fn url_stream_flags(&self) -> StreamFlags {
        self.float_flag | self.restrate_flag | StreamFlags::AUTO_FREE
    }

    /// Restart output after it stopped or the device was lost
    pub fn restart(&self) -> EngineResult<()> {
        debug!("Restarting engine output");
        self.engine.start()
    }

    /// Global stream volume, 0.0-1.0
    pub fn global_volume(&self) -> EngineResult<f32> {
        let raw = self.engine.config(ConfigOption::GlobalVolumeStream)?;
        Ok(raw.min(GLOBAL_VOLUME_MAX) as f32 / GLOBAL_VOLUME_MAX as f32)
    }

    /// Set the global sample, stream and music volume, 0.0-1.0
    pub fn set_global_volume(&self, volume: f32) -> EngineResult<()> {
        let raw = (volume.clamp(0.0, 1.0) * GLOBAL_VOLUME_MAX as f32).round() as u32;
        self.engine.set_config(ConfigOption::GlobalVolumeSample, raw)?;
        self.engine.set_config(ConfigOption::GlobalVolumeStream, raw)?;
        self.engine.set_config(ConfigOption::GlobalVolumeMusic, raw)?;
        Ok(())
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        if self.plugin_count > 0 {
            if let Err(code) = self.engine.free_plugins() {
                warn!("Failed to unload engine plugins: {}", code);
            }
        }
        match self.engine.free() {
            Ok(()) => info!("Engine freed"),
            Err(code) => warn!("Engine free failed: {}", code),
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("engine", &self.engine.name())
            .field("settings", &self.settings)
            .field("float_output", &self.float_output())
            .finish()
    }
}

/// Render a packed `0xMMmmppRR` version
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (version >> 24) & 0xff,
        (version >> 16) & 0xff,
        (version >> 8) & 0xff,
        version & 0xff
    )
}

/// Floating point output works when the engine reports support and a
/// throwaway float stream can be created
fn probe_float_support(engine: &dyn AudioEngine) -> bool {
    match engine.config(ConfigOption::FloatSupport) {
        Ok(0) | Err(_) => return false,
        Ok(_) => {}
    }
    match engine.stream_create(44_100, 1, StreamFlags::SAMPLE_FLOAT) {
        Ok(probe) => {
            if let Err(code) = engine.stream_free(probe) {
                warn!("Failed to free float probe stream: {}", code);
            }
            true
        }
        Err(code) => {
            debug!("Float stream probe failed: {}", code);
            false
        }
    }
}

/// Load every shared library in `dir` as a format plugin
fn load_plugins(engine: &dyn AudioEngine, dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read plugin directory {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext == std::env::consts::DLL_EXTENSION)
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        match engine.load_plugin(&path) {
            Ok(handle) => {
                info!("Loaded engine plugin {} (handle {})", path.display(), handle.0);
                loaded += 1;
            }
            Err(code) => warn!("Loading {} as plugin failed: {}", path.display(), code),
        }
    }
    loaded
}
