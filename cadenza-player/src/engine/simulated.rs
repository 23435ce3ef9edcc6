//! In-process software engine
//!
//! Implements [`AudioEngine`] without any audio output so the player can run
//! headless and the stream lifecycle can be tested deterministically.
//!
//! **Behavior:**
//! - Streams are virtual: their position follows wall-clock time while playing
//! - A worker thread ends streams that reach their length, fires their
//!   `End` syncs and frees `AUTO_FREE` streams (firing `Free` syncs) from
//!   that foreign thread, the same way the vendor engine does
//! - Failures can be injected per operation with [`SimulatedEngine::fail_next`]
//! - [`SimulatedEngine::simulate_device_loss`] pauses playing streams with
//!   `PausedDevice` and fires `DeviceFail` syncs
//! - Every state-changing call is recorded in an operation journal that
//!   keeps the most recent [`JOURNAL_CAPACITY`] entries
//!
//! Callbacks are never invoked while the internal lock is held.

use super::{
    AudioEngine, ChannelAttribute, ChannelInfo, ChannelStatus, ConfigOption, EngineResult, ErrorCode,
    LengthMode, PluginHandle, StreamFlags, StreamHandle, SyncCallback, SyncHandle, SyncKind,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Reported engine version, 2.4.17.0
const VERSION: u32 = 0x0204_1100;

/// Length of file streams without an explicit override
const DEFAULT_TRACK_LENGTH: Duration = Duration::from_secs(180);

/// Worker poll period
const DEFAULT_TICK: Duration = Duration::from_millis(5);

/// Entries kept in the operation journal
pub const JOURNAL_CAPACITY: usize = 4096;

/// First stream handle handed out; handles are never reused
const FIRST_HANDLE: u32 = 0x1000_0001;

/// Operations recorded in the journal
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    Init,
    Free,
    Start,
    LoadPlugin(PathBuf),
    FreePlugins,
    SetUserAgent(String),
    StreamFromFile(StreamHandle),
    StreamFromUrl(StreamHandle),
    StreamCreate(StreamHandle),
    StreamFree(StreamHandle),
    Play(StreamHandle),
    Pause(StreamHandle),
    Stop(StreamHandle),
    SetAttribute(StreamHandle, ChannelAttribute),
    SetConfig(ConfigOption, u32),
    SetSync(StreamHandle, SyncKind),
    RemoveSync(StreamHandle),
    ForgetStream(StreamHandle),
    /// The engine itself freed the stream (end of an `AUTO_FREE` stream)
    AutoFree(StreamHandle),
}

impl EngineOp {
    /// Stream handle the operation targeted, if any
    pub fn handle(&self) -> Option<StreamHandle> {
        match self {
            EngineOp::StreamFromFile(h)
            | EngineOp::StreamFromUrl(h)
            | EngineOp::StreamCreate(h)
            | EngineOp::StreamFree(h)
            | EngineOp::Play(h)
            | EngineOp::Pause(h)
            | EngineOp::Stop(h)
            | EngineOp::SetAttribute(h, _)
            | EngineOp::SetSync(h, _)
            | EngineOp::RemoveSync(h)
            | EngineOp::ForgetStream(h)
            | EngineOp::AutoFree(h) => Some(*h),
            _ => None,
        }
    }
}

/// Operations that can be made to fail with [`SimulatedEngine::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Init,
    Start,
    /// File, URL and user stream constructors
    StreamCreate,
    ChannelInfo,
    SetSync,
    RemoveSync,
    Play,
    Stop,
    StreamFree,
}

struct VirtualStream {
    location: String,
    file_name: Option<PathBuf>,
    flags: StreamFlags,
    frequency: u32,
    channels: u32,
    /// `None` for endless streams
    length: Option<Duration>,
    /// Position accumulated before the current run
    played: Duration,
    running_since: Option<Instant>,
    status: ChannelStatus,
    volume: f32,
}

impl VirtualStream {
    fn position(&self, now: Instant) -> Duration {
        let running = self
            .running_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        let position = self.played + running;
        match self.length {
            Some(length) => position.min(length),
            None => position,
        }
    }

    fn halt(&mut self, now: Instant, status: ChannelStatus) {
        self.played = self.position(now);
        self.running_since = None;
        self.status = status;
    }

    fn bytes_per_second(&self) -> u64 {
        let sample_size = if self.flags.contains(StreamFlags::SAMPLE_FLOAT) { 4 } else { 2 };
        u64::from(self.frequency) * u64::from(self.channels) * sample_size
    }

    fn has_ended(&self, now: Instant) -> bool {
        self.status == ChannelStatus::Playing
            && self.length.map(|length| self.position(now) >= length).unwrap_or(false)
    }
}

struct SyncSlot {
    stream: StreamHandle,
    kind: SyncKind,
    callback: SyncCallback,
}

type PendingCallback = (SyncHandle, StreamHandle, SyncCallback);

struct SimState {
    initialized: bool,
    device_lost: bool,
    float_supported: bool,
    frequency: u32,
    next_handle: u32,
    next_sync: u32,
    next_plugin: u32,
    default_length: Duration,
    /// Time stream constructors block, like a slow host or disk
    open_delay: Duration,
    source_lengths: HashMap<String, Duration>,
    streams: HashMap<StreamHandle, VirtualStream>,
    syncs: HashMap<SyncHandle, SyncSlot>,
    freed_handle_calls: usize,
    faults: Vec<(FaultPoint, ErrorCode)>,
    config: HashMap<ConfigOption, u32>,
    plugins: Vec<(PluginHandle, PathBuf)>,
    user_agent: Option<String>,
    journal: VecDeque<EngineOp>,
}

impl SimState {
    fn new() -> Self {
        Self {
            initialized: false,
            device_lost: false,
            float_supported: true,
            frequency: 44_100,
            next_handle: FIRST_HANDLE,
            next_sync: 1,
            next_plugin: 1,
            default_length: DEFAULT_TRACK_LENGTH,
            open_delay: Duration::ZERO,
            source_lengths: HashMap::new(),
            streams: HashMap::new(),
            syncs: HashMap::new(),
            freed_handle_calls: 0,
            faults: Vec::new(),
            config: HashMap::new(),
            plugins: Vec::new(),
            user_agent: None,
            journal: VecDeque::new(),
        }
    }

    fn take_fault(&mut self, point: FaultPoint) -> EngineResult<()> {
        match self.faults.iter().position(|(p, _)| *p == point) {
            Some(index) => Err(self.faults.remove(index).1),
            None => Ok(()),
        }
    }

    fn require_init(&self) -> EngineResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(ErrorCode::Init)
        }
    }

    fn stream(&mut self, handle: StreamHandle) -> EngineResult<&mut VirtualStream> {
        if !self.streams.contains_key(&handle) {
            if self.was_issued(handle) {
                self.freed_handle_calls += 1;
            }
            return Err(ErrorCode::Handle);
        }
        self.streams.get_mut(&handle).ok_or(ErrorCode::Handle)
    }

    /// Whether `handle` was handed out by this engine at some point
    fn was_issued(&self, handle: StreamHandle) -> bool {
        (FIRST_HANDLE..self.next_handle).contains(&handle.0)
    }

    fn record(&mut self, op: EngineOp) {
        if self.journal.len() == JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(op);
    }

    fn add_stream(&mut self, stream: VirtualStream) -> StreamHandle {
        let handle = StreamHandle(self.next_handle);
        self.next_handle += 1;
        self.streams.insert(handle, stream);
        handle
    }

    fn new_stream(&self, location: String, file_name: Option<PathBuf>, flags: StreamFlags, length: Option<Duration>) -> VirtualStream {
        VirtualStream {
            location,
            file_name,
            flags,
            frequency: self.frequency,
            channels: 2,
            length,
            played: Duration::ZERO,
            running_since: None,
            status: ChannelStatus::Stopped,
            volume: 1.0,
        }
    }

    fn callbacks_for(&self, handle: StreamHandle, kind: SyncKind) -> Vec<PendingCallback> {
        self.syncs
            .iter()
            .filter(|(_, slot)| slot.stream == handle && slot.kind == kind)
            .map(|(sync, slot)| (*sync, handle, slot.callback.clone()))
            .collect()
    }

    /// Drop a stream and its syncs, returning the `Free` callbacks to fire
    fn release_stream(&mut self, handle: StreamHandle) -> Vec<PendingCallback> {
        let callbacks = self.callbacks_for(handle, SyncKind::Free);
        self.streams.remove(&handle);
        self.syncs.retain(|_, slot| slot.stream != handle);
        callbacks
    }
}

struct Shared {
    state: Mutex<SimState>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One worker pass: end finished streams and auto-free them
    fn tick(&self) {
        let now = Instant::now();
        let mut pending = Vec::new();
        {
            let mut state = self.state();
            let ended: Vec<StreamHandle> = state
                .streams
                .iter()
                .filter(|(_, stream)| stream.has_ended(now))
                .map(|(handle, _)| *handle)
                .collect();

            for handle in ended {
                let auto_free = match state.streams.get_mut(&handle) {
                    Some(stream) => {
                        debug!("{} ({}) reached its end", handle, stream.location);
                        stream.halt(now, ChannelStatus::Stopped);
                        stream.flags.contains(StreamFlags::AUTO_FREE)
                    }
                    None => continue,
                };
                pending.extend(state.callbacks_for(handle, SyncKind::End));
                if auto_free {
                    state.record(EngineOp::AutoFree(handle));
                    pending.extend(state.release_stream(handle));
                }
            }
        }
        fire(pending);
    }
}

fn fire(callbacks: Vec<PendingCallback>) {
    for (sync, handle, callback) in callbacks {
        callback(sync, handle);
    }
}

/// Software implementation of the engine surface
pub struct SimulatedEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Create an engine whose worker polls every `tick`
    pub fn with_tick(tick: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::new()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("sim-engine".to_string())
            .spawn(move || run_worker(worker_shared, tick));

        let (worker, worker_id) = match worker {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                warn!("Failed to spawn simulated engine worker, streams will not end: {}", e);
                (None, None)
            }
        };

        Self {
            shared,
            worker,
            worker_id,
        }
    }

    /// Queue a one-shot failure for the next call reaching `point`
    pub fn fail_next(&self, point: FaultPoint, code: ErrorCode) {
        self.shared.state().faults.push((point, code));
    }

    /// Whether floating point output is reported as supported
    pub fn set_float_supported(&self, supported: bool) {
        self.shared.state().float_supported = supported;
    }

    /// Make file and URL stream constructors block for `delay`
    pub fn set_open_delay(&self, delay: Duration) {
        self.shared.state().open_delay = delay;
    }

    /// Wait out the configured open delay without holding the lock
    fn open_delay(&self) {
        let delay = self.shared.state().open_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Length of file streams opened from now on without an override
    pub fn set_default_length(&self, length: Duration) {
        self.shared.state().default_length = length;
    }

    /// Length of streams opened from `location` (path or URL)
    pub fn set_source_length(&self, location: impl Into<String>, length: Duration) {
        self.shared.state().source_lengths.insert(location.into(), length);
    }

    /// Lose the output device: playing streams pause with `PausedDevice`
    /// and every `DeviceFail` sync fires on the calling thread
    pub fn simulate_device_loss(&self) {
        let now = Instant::now();
        let pending = {
            let mut state = self.shared.state();
            state.device_lost = true;
            let mut pending = Vec::new();
            let handles: Vec<StreamHandle> = state.streams.keys().copied().collect();
            for handle in handles {
                if let Some(stream) = state.streams.get_mut(&handle) {
                    if matches!(stream.status, ChannelStatus::Playing | ChannelStatus::Stalled) {
                        stream.halt(now, ChannelStatus::PausedDevice);
                    }
                }
                pending.extend(state.callbacks_for(handle, SyncKind::DeviceFail));
            }
            pending
        };
        fire(pending);
    }

    /// Free `handle` the way the engine does on its own, firing `Free` syncs
    /// on the calling thread. Returns false when the handle is not live.
    pub fn fire_free(&self, handle: StreamHandle) -> bool {
        let pending = {
            let mut state = self.shared.state();
            if !state.streams.contains_key(&handle) {
                return false;
            }
            state.record(EngineOp::AutoFree(handle));
            state.release_stream(handle)
        };
        fire(pending);
        true
    }

    /// Move a stream to its end so the worker ends (and auto-frees) it
    pub fn finish_stream(&self, handle: StreamHandle) -> bool {
        let now = Instant::now();
        let mut state = self.shared.state();
        match state.streams.get_mut(&handle) {
            Some(stream) => {
                let position = stream.position(now);
                let length = *stream.length.get_or_insert(position);
                stream.played = length;
                stream.running_since = Some(now);
                stream.status = ChannelStatus::Playing;
                true
            }
            None => false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state().initialized
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.state().device_lost
    }

    pub fn live_stream_count(&self) -> usize {
        self.shared.state().streams.len()
    }

    pub fn live_streams(&self) -> Vec<StreamHandle> {
        let mut handles: Vec<StreamHandle> = self.shared.state().streams.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Syncs currently registered on `handle`
    pub fn sync_count(&self, handle: StreamHandle) -> usize {
        self.shared
            .state()
            .syncs
            .values()
            .filter(|slot| slot.stream == handle)
            .count()
    }

    /// Calls made with a handle after it was freed (forget excluded)
    pub fn freed_handle_calls(&self) -> usize {
        self.shared.state().freed_handle_calls
    }

    pub fn loaded_plugins(&self) -> Vec<PathBuf> {
        self.shared.state().plugins.iter().map(|(_, path)| path.clone()).collect()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.shared.state().user_agent.clone()
    }

    /// Snapshot of the operation journal
    pub fn journal(&self) -> Vec<EngineOp> {
        self.shared.state().journal.iter().cloned().collect()
    }

    /// Journal entries that targeted `handle`
    pub fn journal_for(&self, handle: StreamHandle) -> Vec<EngineOp> {
        self.shared
            .state()
            .journal
            .iter()
            .filter(|op| op.handle() == Some(handle))
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        self.shared.state().journal.clear();
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        {
            let mut shutdown = self.shared.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            *shutdown = true;
        }
        self.shared.wake.notify_all();

        // The last reference can be released from a callback running on the
        // worker itself; it exits on its own after the flag is seen.
        if self.worker_id == Some(std::thread::current().id()) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Simulated engine worker panicked");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, tick: Duration) {
    debug!("Simulated engine worker started");
    loop {
        {
            let shutdown = shared.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            let (shutdown, _) = shared
                .wake
                .wait_timeout(shutdown, tick)
                .unwrap_or_else(PoisonError::into_inner);
            if *shutdown {
                break;
            }
        }
        shared.tick();
    }
    debug!("Simulated engine worker stopped");
}

impl AudioEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn init(&self, device: i32, frequency: u32) -> EngineResult<()> {
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::Init)?;
        if state.initialized {
            return Err(ErrorCode::Already);
        }
        if device < -1 || device > 1 {
            return Err(ErrorCode::Device);
        }
        if frequency == 0 {
            return Err(ErrorCode::Frequency);
        }
        state.initialized = true;
        state.device_lost = false;
        state.frequency = frequency;
        state.record(EngineOp::Init);
        Ok(())
    }

    fn free(&self) -> EngineResult<()> {
        let pending = {
            let mut state = self.shared.state();
            state.require_init()?;
            state.record(EngineOp::Free);
            let handles: Vec<StreamHandle> = state.streams.keys().copied().collect();
            let mut pending = Vec::new();
            for handle in handles {
                pending.extend(state.release_stream(handle));
            }
            state.initialized = false;
            pending
        };
        fire(pending);
        Ok(())
    }

    fn start(&self) -> EngineResult<()> {
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::Start)?;
        state.require_init()?;
        state.device_lost = false;
        state.record(EngineOp::Start);
        Ok(())
    }

    fn load_plugin(&self, path: &Path) -> EngineResult<PluginHandle> {
        let mut state = self.shared.state();
        if !path.is_file() {
            return Err(ErrorCode::FileOpen);
        }
        let handle = PluginHandle(state.next_plugin);
        state.next_plugin += 1;
        state.plugins.push((handle, path.to_path_buf()));
        state.record(EngineOp::LoadPlugin(path.to_path_buf()));
        Ok(handle)
    }

    fn free_plugins(&self) -> EngineResult<()> {
        let mut state = self.shared.state();
        state.plugins.clear();
        state.record(EngineOp::FreePlugins);
        Ok(())
    }

    fn set_user_agent(&self, agent: &str) -> EngineResult<()> {
        let mut state = self.shared.state();
        state.user_agent = Some(agent.to_string());
        state.record(EngineOp::SetUserAgent(agent.to_string()));
        Ok(())
    }

    fn stream_from_file(&self, path: &Path, flags: StreamFlags) -> EngineResult<StreamHandle> {
        self.open_delay();
        let mut state = self.shared.state();
        state.require_init()?;
        state.take_fault(FaultPoint::StreamCreate)?;
        if !path.is_file() {
            return Err(ErrorCode::FileOpen);
        }
        let location = path.to_string_lossy().into_owned();
        let length = state
            .source_lengths
            .get(&location)
            .copied()
            .unwrap_or(state.default_length);
        let stream = state.new_stream(location, Some(path.to_path_buf()), flags, Some(length));
        let handle = state.add_stream(stream);
        state.record(EngineOp::StreamFromFile(handle));
        Ok(handle)
    }

    fn stream_from_url(&self, url: &str, flags: StreamFlags) -> EngineResult<StreamHandle> {
        self.open_delay();
        let mut state = self.shared.state();
        state.require_init()?;
        state.take_fault(FaultPoint::StreamCreate)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ErrorCode::FileForm);
        }
        // Web streams are endless unless a length was configured
        let length = state.source_lengths.get(url).copied();
        let stream = state.new_stream(url.to_string(), None, flags, length);
        let handle = state.add_stream(stream);
        state.record(EngineOp::StreamFromUrl(handle));
        Ok(handle)
    }

    fn stream_create(&self, frequency: u32, channels: u32, flags: StreamFlags) -> EngineResult<StreamHandle> {
        let mut state = self.shared.state();
        state.require_init()?;
        state.take_fault(FaultPoint::StreamCreate)?;
        if flags.contains(StreamFlags::SAMPLE_FLOAT) && !state.float_supported {
            return Err(ErrorCode::SampleFormat);
        }
        let mut stream = state.new_stream(String::new(), None, flags, None);
        stream.frequency = frequency;
        stream.channels = channels;
        let handle = state.add_stream(stream);
        state.record(EngineOp::StreamCreate(handle));
        Ok(handle)
    }

    fn stream_free(&self, handle: StreamHandle) -> EngineResult<()> {
        let pending = {
            let mut state = self.shared.state();
            state.take_fault(FaultPoint::StreamFree)?;
            state.stream(handle)?;
            state.record(EngineOp::StreamFree(handle));
            state.release_stream(handle)
        };
        fire(pending);
        Ok(())
    }

    fn channel_play(&self, handle: StreamHandle, restart: bool) -> EngineResult<()> {
        let now = Instant::now();
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::Play)?;
        state.require_init()?;
        let device_lost = state.device_lost;
        let stream = state.stream(handle)?;
        if device_lost {
            return Err(ErrorCode::Start);
        }
        if restart {
            stream.played = Duration::ZERO;
            stream.running_since = None;
        }
        if stream.running_since.is_none() {
            stream.running_since = Some(now);
        }
        stream.status = ChannelStatus::Playing;
        state.record(EngineOp::Play(handle));
        Ok(())
    }

    fn channel_pause(&self, handle: StreamHandle) -> EngineResult<()> {
        let now = Instant::now();
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        match stream.status {
            ChannelStatus::Playing | ChannelStatus::Stalled => stream.halt(now, ChannelStatus::Paused),
            ChannelStatus::Paused => return Err(ErrorCode::Already),
            ChannelStatus::Stopped | ChannelStatus::PausedDevice => return Err(ErrorCode::NoPlay),
        }
        state.record(EngineOp::Pause(handle));
        Ok(())
    }

    fn channel_stop(&self, handle: StreamHandle) -> EngineResult<()> {
        let now = Instant::now();
        let pending = {
            let mut state = self.shared.state();
            state.take_fault(FaultPoint::Stop)?;
            let stream = state.stream(handle)?;
            stream.halt(now, ChannelStatus::Stopped);
            let auto_free = stream.flags.contains(StreamFlags::AUTO_FREE);
            state.record(EngineOp::Stop(handle));
            if auto_free {
                state.release_stream(handle)
            } else {
                Vec::new()
            }
        };
        fire(pending);
        Ok(())
    }

    fn channel_status(&self, handle: StreamHandle) -> ChannelStatus {
        let mut state = self.shared.state();
        match state.stream(handle) {
            Ok(stream) => stream.status,
            Err(_) => ChannelStatus::Stopped,
        }
    }

    fn channel_info(&self, handle: StreamHandle) -> EngineResult<ChannelInfo> {
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::ChannelInfo)?;
        let stream = state.stream(handle)?;
        Ok(ChannelInfo {
            frequency: stream.frequency,
            channels: stream.channels,
            flags: stream.flags,
            channel_type: 0x10000,
            plugin: PluginHandle::default(),
            file_name: stream.file_name.clone(),
        })
    }

    fn channel_length(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64> {
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        match (mode, stream.length) {
            (LengthMode::Bytes, Some(length)) => {
                Ok((length.as_secs_f64() * stream.bytes_per_second() as f64) as u64)
            }
            (LengthMode::Bytes, None) => Err(ErrorCode::NotAvailable),
        }
    }

    fn channel_position(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64> {
        let now = Instant::now();
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        match mode {
            LengthMode::Bytes => {
                Ok((stream.position(now).as_secs_f64() * stream.bytes_per_second() as f64) as u64)
            }
        }
    }

    fn bytes_to_seconds(&self, handle: StreamHandle, bytes: u64) -> EngineResult<f64> {
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        Ok(bytes as f64 / stream.bytes_per_second() as f64)
    }

    fn channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute) -> EngineResult<f32> {
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        Ok(match attribute {
            ChannelAttribute::Frequency => stream.frequency as f32,
            ChannelAttribute::Volume => stream.volume,
            ChannelAttribute::Pan => 0.0,
        })
    }

    fn set_channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute, value: f32) -> EngineResult<()> {
        let mut state = self.shared.state();
        let stream = state.stream(handle)?;
        match attribute {
            ChannelAttribute::Volume if value >= 0.0 => stream.volume = value,
            ChannelAttribute::Frequency if value > 0.0 => stream.frequency = value as u32,
            _ => return Err(ErrorCode::IllegalParam),
        }
        state.record(EngineOp::SetAttribute(handle, attribute));
        Ok(())
    }

    fn config(&self, option: ConfigOption) -> EngineResult<u32> {
        let state = self.shared.state();
        Ok(match option {
            ConfigOption::FloatSupport => u32::from(state.float_supported),
            other => state.config.get(&other).copied().unwrap_or(10_000),
        })
    }

    fn set_config(&self, option: ConfigOption, value: u32) -> EngineResult<()> {
        let mut state = self.shared.state();
        match option {
            ConfigOption::FloatSupport => return Err(ErrorCode::IllegalType),
            _ if value > 10_000 => return Err(ErrorCode::IllegalParam),
            _ => {}
        }
        state.config.insert(option, value);
        state.record(EngineOp::SetConfig(option, value));
        Ok(())
    }

    fn set_sync(&self, handle: StreamHandle, kind: SyncKind, callback: SyncCallback) -> EngineResult<SyncHandle> {
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::SetSync)?;
        state.stream(handle)?;
        let sync = SyncHandle(state.next_sync);
        state.next_sync += 1;
        state.syncs.insert(
            sync,
            SyncSlot {
                stream: handle,
                kind,
                callback,
            },
        );
        state.record(EngineOp::SetSync(handle, kind));
        Ok(sync)
    }

    fn remove_sync(&self, handle: StreamHandle, sync: SyncHandle) -> EngineResult<()> {
        let mut state = self.shared.state();
        state.take_fault(FaultPoint::RemoveSync)?;
        state.stream(handle)?;
        let registered = state.syncs.get(&sync).map(|slot| slot.stream == handle).unwrap_or(false);
        if !registered {
            return Err(ErrorCode::Handle);
        }
        state.syncs.remove(&sync);
        state.record(EngineOp::RemoveSync(handle));
        Ok(())
    }

    fn forget_stream(&self, handle: StreamHandle) {
        let mut state = self.shared.state();
        state.syncs.retain(|_, slot| slot.stream != handle);
        state.record(EngineOp::ForgetStream(handle));
    }
}
