//! Value types of the native engine surface
//!
//! Numeric values match the vendor C ABI so backends can pass them through
//! unchanged.

use bitflags::bitflags;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque handle of one decoded/streamed channel owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u32);

impl StreamHandle {
    /// "No handle" sentinel returned by failed stream constructors
    pub const NULL: StreamHandle = StreamHandle(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{:08x}", self.0)
    }
}

/// Opaque handle of one sync (callback) registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncHandle(pub u32);

impl SyncHandle {
    pub const NULL: SyncHandle = SyncHandle(0);
}

/// Opaque handle of a loaded format plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PluginHandle(pub u32);

bitflags! {
    /// Stream creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlags: u32 {
        /// 32-bit floating point sample data
        const SAMPLE_FLOAT = 0x100;
        /// Scan the whole file up front for an exact length
        const PRESCAN = 0x20000;
        /// Engine frees the stream itself when it stops or ends
        const AUTO_FREE = 0x40000;
        /// Resample web streams to the output rate
        const RESTRATE = 0x80000;
        /// Download web streams in small blocks
        const BLOCK = 0x100000;
        /// Decoding channel, not playable
        const DECODE = 0x200000;
        /// Read the file asynchronously
        const ASYNC_FILE = 0x40000000;
        /// File names are UTF-16
        const UNICODE = 0x80000000;
    }
}

/// Raw channel state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Stopped,
    Playing,
    /// Playing but starved of data (web streams)
    Stalled,
    Paused,
    /// Paused because the output device went away
    PausedDevice,
}

impl ChannelStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Playing,
            2 => Self::Stalled,
            3 => Self::Paused,
            4 => Self::PausedDevice,
            _ => Self::Stopped,
        }
    }
}

/// Unit for channel length/position queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthMode {
    Bytes = 0,
}

/// Per-channel attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAttribute {
    Frequency = 1,
    /// Channel volume, 0.0-1.0
    Volume = 2,
    Pan = 3,
}

/// Global engine configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigOption {
    /// Global sample volume, 0-10000
    GlobalVolumeSample = 4,
    /// Global stream volume, 0-10000
    GlobalVolumeStream = 5,
    /// Global MOD music volume, 0-10000
    GlobalVolumeMusic = 6,
    /// Non-zero when floating point output is possible
    FloatSupport = 0x10024,
}

/// Sync (callback) event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// Playback reached the end of the stream
    End = 2,
    /// The stream was freed (explicitly or by `AUTO_FREE`)
    Free = 8,
    /// The output device failed
    DeviceFail = 14,
}

/// Channel metadata fetched once when a stream is opened
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Sample rate in Hz
    pub frequency: u32,
    pub channels: u32,
    pub flags: StreamFlags,
    /// Engine-specific channel type code
    pub channel_type: u32,
    /// Plugin that decodes the stream, default for built-in formats
    pub plugin: PluginHandle,
    /// File name the engine opened, if the stream is file based
    pub file_name: Option<PathBuf>,
}

/// Callback invoked by the engine from one of its own threads
///
/// Arguments: the sync registration and the stream it fired for.
pub type SyncCallback = Arc<dyn Fn(SyncHandle, StreamHandle) + Send + Sync>;

/// Engine error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Memory,
    FileOpen,
    Driver,
    BufferLost,
    Handle,
    SampleFormat,
    Position,
    Init,
    Start,
    Ssl,
    Already,
    NotAudio,
    NoChannel,
    IllegalType,
    IllegalParam,
    No3D,
    NoEax,
    Device,
    NoPlay,
    Frequency,
    NotFile,
    NoHw,
    Empty,
    NoNet,
    Create,
    NoFx,
    NotAvailable,
    Decode,
    Dx,
    Timeout,
    FileForm,
    Speaker,
    Version,
    Codec,
    Ended,
    Busy,
    Unstreamable,
    Unknown,
    /// Code outside the documented table
    Other(i32),
}

impl ErrorCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Memory,
            2 => Self::FileOpen,
            3 => Self::Driver,
            4 => Self::BufferLost,
            5 => Self::Handle,
            6 => Self::SampleFormat,
            7 => Self::Position,
            8 => Self::Init,
            9 => Self::Start,
            10 => Self::Ssl,
            14 => Self::Already,
            17 => Self::NotAudio,
            18 => Self::NoChannel,
            19 => Self::IllegalType,
            20 => Self::IllegalParam,
            21 => Self::No3D,
            22 => Self::NoEax,
            23 => Self::Device,
            24 => Self::NoPlay,
            25 => Self::Frequency,
            27 => Self::NotFile,
            29 => Self::NoHw,
            31 => Self::Empty,
            32 => Self::NoNet,
            33 => Self::Create,
            34 => Self::NoFx,
            37 => Self::NotAvailable,
            38 => Self::Decode,
            39 => Self::Dx,
            40 => Self::Timeout,
            41 => Self::FileForm,
            42 => Self::Speaker,
            43 => Self::Version,
            44 => Self::Codec,
            45 => Self::Ended,
            46 => Self::Busy,
            47 => Self::Unstreamable,
            -1 => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Memory => 1,
            Self::FileOpen => 2,
            Self::Driver => 3,
            Self::BufferLost => 4,
            Self::Handle => 5,
            Self::SampleFormat => 6,
            Self::Position => 7,
            Self::Init => 8,
            Self::Start => 9,
            Self::Ssl => 10,
            Self::Already => 14,
            Self::NotAudio => 17,
            Self::NoChannel => 18,
            Self::IllegalType => 19,
            Self::IllegalParam => 20,
            Self::No3D => 21,
            Self::NoEax => 22,
            Self::Device => 23,
            Self::NoPlay => 24,
            Self::Frequency => 25,
            Self::NotFile => 27,
            Self::NoHw => 29,
            Self::Empty => 31,
            Self::NoNet => 32,
            Self::Create => 33,
            Self::NoFx => 34,
            Self::NotAvailable => 37,
            Self::Decode => 38,
            Self::Dx => 39,
            Self::Timeout => 40,
            Self::FileForm => 41,
            Self::Speaker => 42,
            Self::Version => 43,
            Self::Codec => 44,
            Self::Ended => 45,
            Self::Busy => 46,
            Self::Unstreamable => 47,
            Self::Unknown => -1,
            Self::Other(raw) => raw,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Memory => "memory error",
            Self::FileOpen => "can't open the file",
            Self::Driver => "no free/valid driver",
            Self::BufferLost => "sample buffer was lost",
            Self::Handle => "invalid handle",
            Self::SampleFormat => "unsupported sample format",
            Self::Position => "invalid position",
            Self::Init => "engine not initialized",
            Self::Start => "engine output not started",
            Self::Ssl => "SSL/HTTPS support not available",
            Self::Already => "already initialized/paused",
            Self::NotAudio => "file does not contain audio",
            Self::NoChannel => "no free channel",
            Self::IllegalType => "illegal type",
            Self::IllegalParam => "illegal parameter",
            Self::No3D => "no 3D support",
            Self::NoEax => "no EAX support",
            Self::Device => "illegal device number",
            Self::NoPlay => "not playing",
            Self::Frequency => "illegal sample rate",
            Self::NotFile => "stream is not a file stream",
            Self::NoHw => "no hardware voices available",
            Self::Empty => "no sequence data",
            Self::NoNet => "no internet connection could be opened",
            Self::Create => "couldn't create the file",
            Self::NoFx => "effects not available",
            Self::NotAvailable => "requested data/action not available",
            Self::Decode => "channel is/isn't a decoding channel",
            Self::Dx => "insufficient DirectX version",
            Self::Timeout => "connection timed out",
            Self::FileForm => "unsupported file format",
            Self::Speaker => "unavailable speaker",
            Self::Version => "invalid engine version",
            Self::Codec => "codec not available/supported",
            Self::Ended => "channel/file has ended",
            Self::Busy => "device is busy",
            Self::Unstreamable => "unstreamable file",
            Self::Unknown | Self::Other(_) => "unknown problem",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description(), self.raw())
    }
}

/// Result of a single engine call
pub type EngineResult<T> = std::result::Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for raw in -1..=50 {
            assert_eq!(ErrorCode::from_raw(raw).raw(), raw);
        }
        assert_eq!(ErrorCode::from_raw(2), ErrorCode::FileOpen);
        assert_eq!(ErrorCode::from_raw(99), ErrorCode::Other(99));
    }

    #[test]
    fn test_error_code_display_includes_raw_code() {
        assert_eq!(ErrorCode::NoNet.to_string(), "no internet connection could be opened (code 32)");
    }

    #[test]
    fn test_channel_status_from_raw() {
        assert_eq!(ChannelStatus::from_raw(1), ChannelStatus::Playing);
        assert_eq!(ChannelStatus::from_raw(4), ChannelStatus::PausedDevice);
        assert_eq!(ChannelStatus::from_raw(42), ChannelStatus::Stopped);
    }

    #[test]
    fn test_null_handle() {
        assert!(StreamHandle::NULL.is_null());
        assert!(!StreamHandle(7).is_null());
    }
}
