//! Lifecycle of the live playback stream
//!
//! A [`StreamWrapper`] owns exactly one engine stream handle. The handle can
//! go away in three ways, and exactly one of them performs the teardown:
//!
//! 1. [`StreamWrapper::dispose`] called by the player
//! 2. The engine's `Free` sync, fired from an engine thread when an
//!    `AUTO_FREE` stream ends
//! 3. `Drop`, as a backstop when neither of the above ran
//!
//! The winner is decided by a single `Live -> Disposed` swap under the
//! lifecycle mutex. Engine calls on the handle (reads included) are made
//! while holding that mutex, so once either path has observed the handle as
//! freed no further call reaches the engine with it.
//!
//! Engine callbacks capture only a `Weak` reference; they never keep a
//! wrapper alive and never run async code.

use crate::engine::{
    AudioEngine, ChannelAttribute, ChannelInfo, ChannelStatus, EngineContext, EngineResult, ErrorCode,
    LengthMode, StreamFlags, StreamHandle, SyncCallback, SyncHandle, SyncKind,
};
use crate::error::{Error, Result};
use cadenza_common::{PlaybackSource, SourceKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Stream state as reported to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Playing,
    Paused,
    /// Stopped, freed or disposed
    Invalid,
}

impl From<ChannelStatus> for StreamStatus {
    fn from(status: ChannelStatus) -> Self {
        match status {
            ChannelStatus::Playing | ChannelStatus::Stalled => StreamStatus::Playing,
            ChannelStatus::Paused | ChannelStatus::PausedDevice => StreamStatus::Paused,
            ChannelStatus::Stopped => StreamStatus::Invalid,
        }
    }
}

/// Notification posted from engine callbacks toward the player task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamNotice {
    /// The output device failed while the stream was live
    DeviceFailed { handle: StreamHandle },
    /// The engine freed the stream on its own
    Freed { handle: StreamHandle },
}

#[derive(Debug, Clone, Copy)]
struct Registrations {
    device_fail: SyncHandle,
    free: SyncHandle,
}

#[derive(Debug)]
enum Lifecycle {
    /// Syncs are being registered
    Constructing,
    Live(Registrations),
    Disposed,
}

struct StreamInner {
    ctx: Arc<EngineContext>,
    handle: StreamHandle,
    info: ChannelInfo,
    source: PlaybackSource,
    lifecycle: Mutex<Lifecycle>,
    /// Mirror of `lifecycle == Disposed` for lock-free status checks
    disposed: AtomicBool,
    notices: UnboundedSender<StreamNotice>,
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> &dyn AudioEngine {
        self.ctx.engine()
    }

    /// Explicit teardown; returns false when another path already ran
    fn teardown(&self) -> bool {
        let mut lifecycle = self.lock();
        let registrations = match &*lifecycle {
            Lifecycle::Live(registrations) => *registrations,
            Lifecycle::Constructing | Lifecycle::Disposed => return false,
        };
        *lifecycle = Lifecycle::Disposed;
        self.disposed.store(true, Ordering::Release);
        self.release(registrations);
        true
    }

    /// Remove syncs, stop, and free unless the engine frees it on stop
    ///
    /// A sync that could not be removed may still fire from inside the stop
    /// or free call below, on this thread and with the lifecycle lock held.
    /// The callbacks see `disposed` already set and return without locking.
    fn release(&self, registrations: Registrations) {
        let engine = self.engine();
        let handle = self.handle;
        let mut armed_syncs = false;

        for sync in [registrations.device_fail, registrations.free] {
            if let Err(code) = engine.remove_sync(handle, sync) {
                if code == ErrorCode::Handle {
                    debug!("{} was already freed by the engine", handle);
                    engine.forget_stream(handle);
                    return;
                }
                warn!("Failed to remove sync from {}: {}", handle, code);
                armed_syncs = true;
            }
        }

        let stopped = match engine.channel_stop(handle) {
            Ok(()) => true,
            Err(ErrorCode::Handle) => {
                debug!("{} was already freed by the engine", handle);
                engine.forget_stream(handle);
                return;
            }
            Err(code) => {
                warn!("Failed to stop {}: {}", handle, code);
                false
            }
        };

        // An auto-free stream is released by a successful stop only
        if !stopped || !self.info.flags.contains(StreamFlags::AUTO_FREE) {
            if let Err(code) = engine.stream_free(handle) {
                warn!("Failed to free {}, leaking it: {}", handle, code);
            }
        }
        if armed_syncs {
            engine.forget_stream(handle);
        }
        debug!("Released {}", handle);
    }

    /// Read a byte count and convert it to a duration, zero on any failure
    fn read_duration(&self, read: impl FnOnce(&dyn AudioEngine, StreamHandle) -> EngineResult<u64>) -> Duration {
        if self.disposed.load(Ordering::Acquire) {
            return Duration::ZERO;
        }
        let lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::Live(_)) {
            return Duration::ZERO;
        }
        let engine = self.engine();
        match read(engine, self.handle).and_then(|bytes| engine.bytes_to_seconds(self.handle, bytes)) {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => Duration::from_secs_f64(seconds),
            _ => Duration::ZERO,
        }
    }

    /// Run an engine call on the live handle
    fn with_live<T>(&self, call: impl FnOnce(&dyn AudioEngine, StreamHandle) -> Result<T>) -> Result<T> {
        let lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::Live(_)) {
            return Err(Error::InvalidState(format!("{} is disposed", self.handle)));
        }
        call(self.engine(), self.handle)
    }
}

/// `Free` sync: the engine released the handle on its own
fn on_freed(weak: &Weak<StreamInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    // Teardown already owns the handle and may be holding the lock on this thread
    if inner.disposed.load(Ordering::Acquire) {
        return;
    }
    {
        let mut lifecycle = inner.lock();
        if matches!(*lifecycle, Lifecycle::Disposed) {
            return;
        }
        *lifecycle = Lifecycle::Disposed;
        inner.disposed.store(true, Ordering::Release);
        // The native handle is gone; only host-side slots remain
        inner.engine().forget_stream(inner.handle);
    }
    debug!("{} freed by the engine", inner.handle);
    let _ = inner.notices.send(StreamNotice::Freed { handle: inner.handle });
}

/// `DeviceFail` sync: restart output and tell the player
fn on_device_failed(weak: &Weak<StreamInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.disposed.load(Ordering::Acquire) {
        return;
    }
    warn!("Output device failed while playing {}", inner.source);
    if let Err(code) = inner.ctx.restart() {
        error!("Engine restart after device failure failed: {}", code);
    }
    let _ = inner.notices.send(StreamNotice::DeviceFailed { handle: inner.handle });
}

fn sync_callback(weak: Weak<StreamInner>, handler: fn(&Weak<StreamInner>)) -> SyncCallback {
    Arc::new(move |_sync: SyncHandle, _handle: StreamHandle| handler(&weak))
}

/// Release what a failed construction already acquired
fn release_partial(engine: &dyn AudioEngine, handle: StreamHandle, syncs: &[SyncHandle]) {
    for sync in syncs {
        if let Err(code) = engine.remove_sync(handle, *sync) {
            warn!("Failed to remove sync from {}: {}", handle, code);
        }
    }
    if let Err(code) = engine.stream_free(handle) {
        warn!("Failed to free {} after a failed start: {}", handle, code);
    }
}

/// The one live playback stream
///
/// Not `Clone`: exactly one owner decides when to dispose.
pub struct StreamWrapper {
    inner: Arc<StreamInner>,
}

impl StreamWrapper {
    /// Open `source`, register the device-fail and free syncs and start playback
    ///
    /// On failure every native resource acquired so far is released and the
    /// failing engine call is reported as [`Error::Engine`].
    pub fn create(
        ctx: Arc<EngineContext>,
        source: PlaybackSource,
        notices: UnboundedSender<StreamNotice>,
    ) -> Result<Self> {
        let opened = match source.kind {
            SourceKind::File => ctx
                .engine()
                .stream_from_file(Path::new(&source.location), ctx.file_stream_flags())
                .map_err(|code| Error::engine("StreamCreateFile", code)),
            SourceKind::WebStream => ctx
                .engine()
                .stream_from_url(&source.location, ctx.url_stream_flags())
                .map_err(|code| Error::engine("StreamCreateURL", code)),
        };
        let handle = opened?;

        let info = match ctx.engine().channel_info(handle) {
            Ok(info) => info,
            Err(code) => {
                release_partial(ctx.engine(), handle, &[]);
                return Err(Error::engine("ChannelGetInfo", code));
            }
        };

        let inner = Arc::new(StreamInner {
            ctx,
            handle,
            info,
            source,
            lifecycle: Mutex::new(Lifecycle::Constructing),
            disposed: AtomicBool::new(false),
            notices,
        });
        let engine = inner.engine();

        let device_fail = match engine.set_sync(
            handle,
            SyncKind::DeviceFail,
            sync_callback(Arc::downgrade(&inner), on_device_failed),
        ) {
            Ok(sync) => sync,
            Err(code) => {
                release_partial(engine, handle, &[]);
                return Err(Error::engine("ChannelSetSync", code));
            }
        };

        let free = match engine.set_sync(handle, SyncKind::Free, sync_callback(Arc::downgrade(&inner), on_freed)) {
            Ok(sync) => sync,
            Err(code) => {
                release_partial(engine, handle, &[device_fail]);
                return Err(Error::engine("ChannelSetSync", code));
            }
        };

        {
            let mut lifecycle = inner.lock();
            if !matches!(*lifecycle, Lifecycle::Constructing) {
                // Freed by the engine before construction finished
                return Err(Error::engine("ChannelSetSync", ErrorCode::Handle));
            }
            *lifecycle = Lifecycle::Live(Registrations { device_fail, free });
        }

        let wrapper = StreamWrapper { inner };
        if let Err(code) = wrapper.inner.engine().channel_play(handle, false) {
            wrapper.inner.teardown();
            return Err(Error::engine("ChannelPlay", code));
        }

        info!(
            "Playing {} as {} ({} Hz, {} ch)",
            wrapper.inner.source, handle, wrapper.inner.info.frequency, wrapper.inner.info.channels
        );
        Ok(wrapper)
    }

    pub fn handle(&self) -> StreamHandle {
        self.inner.handle
    }

    pub fn source(&self) -> &PlaybackSource {
        &self.inner.source
    }

    /// Channel metadata captured when the stream was opened
    pub fn info(&self) -> &ChannelInfo {
        &self.inner.info
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn pause(&self) -> Result<()> {
        self.inner.with_live(|engine, handle| {
            engine
                .channel_pause(handle)
                .map_err(|code| Error::engine("ChannelPause", code))
        })
    }

    /// Resume playback, restarting engine output first when the device was lost
    pub fn resume(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        self.inner.with_live(|engine, handle| {
            if engine.channel_status(handle) == ChannelStatus::PausedDevice {
                info!("Restarting output before resuming {}", handle);
                ctx.restart().map_err(|code| Error::engine("Start", code))?;
            }
            engine
                .channel_play(handle, false)
                .map_err(|code| Error::engine("ChannelPlay", code))
        })
    }

    pub fn status(&self) -> StreamStatus {
        if self.is_disposed() {
            return StreamStatus::Invalid;
        }
        let lifecycle = self.inner.lock();
        if !matches!(*lifecycle, Lifecycle::Live(_)) {
            return StreamStatus::Invalid;
        }
        self.inner.engine().channel_status(self.inner.handle).into()
    }

    /// Total length, zero for endless streams or once disposed
    pub fn total_time(&self) -> Duration {
        self.inner
            .read_duration(|engine, handle| engine.channel_length(handle, LengthMode::Bytes))
    }

    /// Playback position, zero once disposed
    pub fn current_time(&self) -> Duration {
        self.inner
            .read_duration(|engine, handle| engine.channel_position(handle, LengthMode::Bytes))
    }

    /// Per-channel volume, 0.0-1.0
    pub fn volume(&self) -> Result<f32> {
        self.inner.with_live(|engine, handle| {
            engine
                .channel_attribute(handle, ChannelAttribute::Volume)
                .map_err(|code| Error::engine("ChannelGetAttribute", code))
        })
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.inner.with_live(|engine, handle| {
            engine
                .set_channel_attribute(handle, ChannelAttribute::Volume, volume.clamp(0.0, 1.0))
                .map_err(|code| Error::engine("ChannelSetAttribute", code))
        })
    }

    /// Path of a file source
    ///
    /// The name the engine reports is preferred when it exists on disk,
    /// otherwise the requested path made absolute. `None` for web streams.
    pub fn file_path(&self) -> Option<PathBuf> {
        let requested = self.inner.source.path()?;
        if let Some(name) = &self.inner.info.file_name {
            if name.exists() {
                return Some(name.clone());
            }
        }
        let absolute = std::fs::canonicalize(requested).unwrap_or_else(|_| {
            std::env::current_dir()
                .map(|dir| dir.join(requested))
                .unwrap_or_else(|_| requested.to_path_buf())
        });
        Some(absolute)
    }

    /// Tear the stream down; idempotent and callable from any thread
    ///
    /// Returns true when this call performed the teardown, false when the
    /// stream had already been disposed or freed by the engine.
    pub fn dispose(&self) -> bool {
        let performed = self.inner.teardown();
        if performed {
            debug!("Disposed {}", self.inner.handle);
        }
        performed
    }
}

impl Drop for StreamWrapper {
    fn drop(&mut self) {
        if self.inner.teardown() {
            warn!("{} ({}) dropped without dispose", self.inner.handle, self.inner.source);
        }
    }
}

impl std::fmt::Debug for StreamWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWrapper")
            .field("handle", &self.inner.handle)
            .field("source", &self.inner.source)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
