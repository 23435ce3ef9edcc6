//! Native audio engine surface
//!
//! Decode, mix and output are delegated to a third-party engine reached
//! through a narrow C ABI. [`AudioEngine`] is that surface expressed as a
//! trait so the rest of the player can run against either the vendor
//! library ([`BassEngine`]) or the in-process [`SimulatedEngine`].
//!
//! **Conventions:**
//! - Every call that can fail returns [`EngineResult`]; backends translate
//!   the native "sentinel return + last error code" pattern into `Err(code)`
//! - Sync callbacks run on engine-owned threads, never on a tokio worker
//! - A stream handle must not be used after it was freed (explicitly or by
//!   the engine itself)

pub mod bass;
pub mod context;
pub mod simulated;
pub mod types;

pub use bass::BassEngine;
pub use context::{EngineContext, EngineSettings};
pub use simulated::{EngineOp, SimulatedEngine};
pub use types::{
    ChannelAttribute, ChannelInfo, ChannelStatus, ConfigOption, EngineResult, ErrorCode, LengthMode,
    PluginHandle, StreamFlags, StreamHandle, SyncCallback, SyncHandle, SyncKind,
};

use std::path::Path;

/// The native engine surface used by the player
///
/// Implementations must be callable from any thread.
pub trait AudioEngine: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Packed engine version (`major.minor.patch.revision`, one byte each)
    fn version(&self) -> u32;

    /// Initialize the output device
    ///
    /// Fails with [`ErrorCode::Already`] while a previous initialization is
    /// still active.
    fn init(&self, device: i32, frequency: u32) -> EngineResult<()>;

    /// Release the output device and every stream still alive
    fn free(&self) -> EngineResult<()>;

    /// Restart output after it was stopped or the device was lost
    fn start(&self) -> EngineResult<()>;

    /// Load a format plugin
    fn load_plugin(&self, path: &Path) -> EngineResult<PluginHandle>;

    /// Unload all plugins
    fn free_plugins(&self) -> EngineResult<()>;

    /// Set the HTTP user agent for web streams
    fn set_user_agent(&self, agent: &str) -> EngineResult<()>;

    /// Create a playable stream from a local file
    fn stream_from_file(&self, path: &Path, flags: StreamFlags) -> EngineResult<StreamHandle>;

    /// Create a playable stream from an HTTP(S) URL
    fn stream_from_url(&self, url: &str, flags: StreamFlags) -> EngineResult<StreamHandle>;

    /// Create a user stream with no data source (used to probe capabilities)
    fn stream_create(&self, frequency: u32, channels: u32, flags: StreamFlags) -> EngineResult<StreamHandle>;

    fn stream_free(&self, handle: StreamHandle) -> EngineResult<()>;

    fn channel_play(&self, handle: StreamHandle, restart: bool) -> EngineResult<()>;

    fn channel_pause(&self, handle: StreamHandle) -> EngineResult<()>;

    /// Stop a channel; an `AUTO_FREE` stream is released by this
    fn channel_stop(&self, handle: StreamHandle) -> EngineResult<()>;

    /// Current channel state; invalid handles report `Stopped`
    fn channel_status(&self, handle: StreamHandle) -> ChannelStatus;

    fn channel_info(&self, handle: StreamHandle) -> EngineResult<ChannelInfo>;

    fn channel_length(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64>;

    fn channel_position(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64>;

    fn bytes_to_seconds(&self, handle: StreamHandle, bytes: u64) -> EngineResult<f64>;

    fn channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute) -> EngineResult<f32>;

    fn set_channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute, value: f32) -> EngineResult<()>;

    fn config(&self, option: ConfigOption) -> EngineResult<u32>;

    fn set_config(&self, option: ConfigOption, value: u32) -> EngineResult<()>;

    /// Register `callback` to run when `kind` happens on `handle`
    fn set_sync(&self, handle: StreamHandle, kind: SyncKind, callback: SyncCallback) -> EngineResult<SyncHandle>;

    fn remove_sync(&self, handle: StreamHandle, sync: SyncHandle) -> EngineResult<()>;

    /// Drop host-side callback slots of a stream the engine already freed
    ///
    /// Makes no native call on `handle`.
    fn forget_stream(&self, handle: StreamHandle);
}
