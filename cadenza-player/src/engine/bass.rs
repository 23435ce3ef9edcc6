//! Runtime binding to the vendor BASS library
//!
//! The library is opened with `libloading` and every entry point used by the
//! player is resolved up front, so a missing symbol fails at load time rather
//! than mid-playback.
//!
//! Sync callbacks are routed through [`sync_trampoline`]: each registration
//! owns a heap slot whose address is handed to the engine as the `user`
//! pointer. Slots are never freed while the engine might still call into
//! them. Removed or forgotten slots are disarmed and kept as spares for
//! later registrations, and a slot only runs its callback for the stream it
//! is armed for, so a late call from a previous owner is ignored. Spares are
//! released once the engine itself has been freed.

use super::{
    AudioEngine, ChannelAttribute, ChannelInfo, ChannelStatus, ConfigOption, EngineResult, ErrorCode,
    LengthMode, PluginHandle, StreamFlags, StreamHandle, SyncCallback, SyncHandle, SyncKind,
};
use crate::error::{Error, Result};
use libloading::Library;
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

type Bool = c_int;

/// `BASS_CONFIG_NET_AGENT`
const CONFIG_NET_AGENT: u32 = 16;

type SyncProc = unsafe extern "system" fn(u32, u32, u32, *mut c_void);

type GetVersionFn = unsafe extern "system" fn() -> u32;
type ErrorGetCodeFn = unsafe extern "system" fn() -> c_int;
type InitFn = unsafe extern "system" fn(c_int, u32, u32, *mut c_void, *const c_void) -> Bool;
type NoArgBoolFn = unsafe extern "system" fn() -> Bool;
type PluginLoadFn = unsafe extern "system" fn(*const c_void, u32) -> u32;
type HandleBoolFn = unsafe extern "system" fn(u32) -> Bool;
type SetConfigFn = unsafe extern "system" fn(u32, u32) -> Bool;
type GetConfigFn = unsafe extern "system" fn(u32) -> u32;
type SetConfigPtrFn = unsafe extern "system" fn(u32, *const c_void) -> Bool;
type StreamCreateFileFn = unsafe extern "system" fn(Bool, *const c_void, u64, u64, u32) -> u32;
type StreamCreateUrlFn = unsafe extern "system" fn(*const c_char, u32, u32, *const c_void, *mut c_void) -> u32;
type StreamCreateFn = unsafe extern "system" fn(u32, u32, u32, *const c_void, *mut c_void) -> u32;
type ChannelPlayFn = unsafe extern "system" fn(u32, Bool) -> Bool;
type ChannelIsActiveFn = unsafe extern "system" fn(u32) -> u32;
type ChannelGetInfoFn = unsafe extern "system" fn(u32, *mut RawChannelInfo) -> Bool;
type ChannelGetLengthFn = unsafe extern "system" fn(u32, u32) -> u64;
type ChannelBytes2SecondsFn = unsafe extern "system" fn(u32, u64) -> f64;
type ChannelGetAttributeFn = unsafe extern "system" fn(u32, u32, *mut f32) -> Bool;
type ChannelSetAttributeFn = unsafe extern "system" fn(u32, u32, f32) -> Bool;
type ChannelSetSyncFn = unsafe extern "system" fn(u32, u32, u64, Option<SyncProc>, *mut c_void) -> u32;
type ChannelRemoveSyncFn = unsafe extern "system" fn(u32, u32) -> Bool;

/// `BASS_CHANNELINFO`
#[repr(C)]
#[allow(dead_code)]
struct RawChannelInfo {
    freq: u32,
    chans: u32,
    flags: u32,
    ctype: u32,
    origres: u32,
    plugin: u32,
    sample: u32,
    filename: *const c_char,
}

struct Api {
    get_version: GetVersionFn,
    error_get_code: ErrorGetCodeFn,
    init: InitFn,
    free: NoArgBoolFn,
    start: NoArgBoolFn,
    plugin_load: PluginLoadFn,
    plugin_free: HandleBoolFn,
    set_config: SetConfigFn,
    get_config: GetConfigFn,
    set_config_ptr: SetConfigPtrFn,
    stream_create_file: StreamCreateFileFn,
    stream_create_url: StreamCreateUrlFn,
    stream_create: StreamCreateFn,
    stream_free: HandleBoolFn,
    channel_play: ChannelPlayFn,
    channel_pause: HandleBoolFn,
    channel_stop: HandleBoolFn,
    channel_is_active: ChannelIsActiveFn,
    channel_get_info: ChannelGetInfoFn,
    channel_get_length: ChannelGetLengthFn,
    channel_get_position: ChannelGetLengthFn,
    channel_bytes2seconds: ChannelBytes2SecondsFn,
    channel_get_attribute: ChannelGetAttributeFn,
    channel_set_attribute: ChannelSetAttributeFn,
    channel_set_sync: ChannelSetSyncFn,
    channel_remove_sync: ChannelRemoveSyncFn,
}

impl Api {
    unsafe fn resolve(lib: &Library) -> std::result::Result<Self, libloading::Error> {
        Ok(Api {
            get_version: *lib.get::<GetVersionFn>(b"BASS_GetVersion\0")?,
            error_get_code: *lib.get::<ErrorGetCodeFn>(b"BASS_ErrorGetCode\0")?,
            init: *lib.get::<InitFn>(b"BASS_Init\0")?,
            free: *lib.get::<NoArgBoolFn>(b"BASS_Free\0")?,
            start: *lib.get::<NoArgBoolFn>(b"BASS_Start\0")?,
            plugin_load: *lib.get::<PluginLoadFn>(b"BASS_PluginLoad\0")?,
            plugin_free: *lib.get::<HandleBoolFn>(b"BASS_PluginFree\0")?,
            set_config: *lib.get::<SetConfigFn>(b"BASS_SetConfig\0")?,
            get_config: *lib.get::<GetConfigFn>(b"BASS_GetConfig\0")?,
            set_config_ptr: *lib.get::<SetConfigPtrFn>(b"BASS_SetConfigPtr\0")?,
            stream_create_file: *lib.get::<StreamCreateFileFn>(b"BASS_StreamCreateFile\0")?,
            stream_create_url: *lib.get::<StreamCreateUrlFn>(b"BASS_StreamCreateURL\0")?,
            stream_create: *lib.get::<StreamCreateFn>(b"BASS_StreamCreate\0")?,
            stream_free: *lib.get::<HandleBoolFn>(b"BASS_StreamFree\0")?,
            channel_play: *lib.get::<ChannelPlayFn>(b"BASS_ChannelPlay\0")?,
            channel_pause: *lib.get::<HandleBoolFn>(b"BASS_ChannelPause\0")?,
            channel_stop: *lib.get::<HandleBoolFn>(b"BASS_ChannelStop\0")?,
            channel_is_active: *lib.get::<ChannelIsActiveFn>(b"BASS_ChannelIsActive\0")?,
            channel_get_info: *lib.get::<ChannelGetInfoFn>(b"BASS_ChannelGetInfo\0")?,
            channel_get_length: *lib.get::<ChannelGetLengthFn>(b"BASS_ChannelGetLength\0")?,
            channel_get_position: *lib.get::<ChannelGetLengthFn>(b"BASS_ChannelGetPosition\0")?,
            channel_bytes2seconds: *lib.get::<ChannelBytes2SecondsFn>(b"BASS_ChannelBytes2Seconds\0")?,
            channel_get_attribute: *lib.get::<ChannelGetAttributeFn>(b"BASS_ChannelGetAttribute\0")?,
            channel_set_attribute: *lib.get::<ChannelSetAttributeFn>(b"BASS_ChannelSetAttribute\0")?,
            channel_set_sync: *lib.get::<ChannelSetSyncFn>(b"BASS_ChannelSetSync\0")?,
            channel_remove_sync: *lib.get::<ChannelRemoveSyncFn>(b"BASS_ChannelRemoveSync\0")?,
        })
    }
}

/// Heap slot addressed by the `user` pointer of one sync registration
#[derive(Default)]
struct SyncSlot {
    armed: Mutex<Option<(StreamHandle, SyncCallback)>>,
}

impl SyncSlot {
    fn arm(&self, handle: StreamHandle, callback: SyncCallback) {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some((handle, callback));
    }

    fn disarm(&self) {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Callback to run for a sync fired on `channel`
    fn callback_for(&self, channel: u32) -> Option<SyncCallback> {
        let armed = self.armed.lock().ok()?;
        match &*armed {
            Some((stream, callback)) if stream.0 == channel => Some(callback.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct SyncRegistry {
    active: HashMap<SyncHandle, (StreamHandle, Box<SyncSlot>)>,
    /// Disarmed slots the engine may still hold a pointer to
    spare: Vec<Box<SyncSlot>>,
}

impl SyncRegistry {
    fn take_slot(&mut self) -> Box<SyncSlot> {
        self.spare.pop().unwrap_or_default()
    }

    fn retire(&mut self, slot: Box<SyncSlot>) {
        slot.disarm();
        self.spare.push(slot);
    }
}

/// Entry point the engine calls for every sync
///
/// # Safety
///
/// `user` is either null or the address of a [`SyncSlot`] owned by a
/// [`SyncRegistry`] that outlives the engine's use of it.
unsafe extern "system" fn sync_trampoline(sync: u32, channel: u32, _data: u32, user: *mut c_void) {
    if user.is_null() {
        return;
    }
    // SAFETY: slots stay allocated until the engine has been freed
    let callback = (*(user as *const SyncSlot)).callback_for(channel);
    if let Some(callback) = callback {
        let handle = StreamHandle(channel);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(SyncHandle(sync), handle)));
        if result.is_err() {
            error!("Sync callback for {} panicked", handle);
        }
    }
}

#[cfg(windows)]
type NativePath = Vec<u16>;
#[cfg(not(windows))]
type NativePath = CString;

/// Encode a path for the engine, returning the flag that announces the encoding
#[cfg(windows)]
fn native_path(path: &Path) -> EngineResult<(NativePath, u32)> {
    use std::os::windows::ffi::OsStrExt;
    let wide = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    Ok((wide, StreamFlags::UNICODE.bits()))
}

#[cfg(not(windows))]
fn native_path(path: &Path) -> EngineResult<(NativePath, u32)> {
    CString::new(path.to_string_lossy().into_owned())
        .map(|c| (c, 0))
        .map_err(|_| ErrorCode::IllegalParam)
}

/// Read the engine-owned file name of a channel
unsafe fn channel_file_name(ptr: *const c_char, flags: StreamFlags) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    if cfg!(windows) && flags.contains(StreamFlags::UNICODE) {
        let wide = ptr as *const u16;
        let mut len = 0;
        while *wide.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(wide, len);
        return Some(PathBuf::from(String::from_utf16_lossy(units)));
    }
    Some(PathBuf::from(CStr::from_ptr(ptr).to_string_lossy().into_owned()))
}

/// Platform file names tried when no explicit library path is configured
fn library_names() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &["bass.dll"]
    } else if cfg!(target_os = "macos") {
        &["libbass.dylib"]
    } else {
        &["libbass.so"]
    }
}

/// Library paths tried in order
pub fn library_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for name in library_names() {
                candidates.push(dir.join(name));
            }
        }
    }
    for name in library_names() {
        candidates.push(PathBuf::from(name));
    }
    candidates
}

/// [`AudioEngine`] backed by the vendor library
pub struct BassEngine {
    api: Api,
    registry: Mutex<SyncRegistry>,
    _lib: Library,
}

impl BassEngine {
    /// Load the library from `explicit`, or search next to the executable
    /// and then the system library path
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut last_error = None;
        for candidate in library_candidates(explicit) {
            // SAFETY: loading the vendor library runs its initializers; the
            // resolved symbol types match the published C ABI.
            match unsafe { Self::load_from(&candidate) } {
                Ok(engine) => {
                    info!("Engine library loaded from {}", candidate.display());
                    return Ok(engine);
                }
                Err(e) => {
                    debug!("Engine library not usable at {}: {}", candidate.display(), e);
                    last_error = Some(Error::EngineLibrary {
                        path: candidate,
                        source: e,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::InvalidState("no engine library candidates".to_string())))
    }

    unsafe fn load_from(path: &Path) -> std::result::Result<Self, libloading::Error> {
        let lib = Library::new(path)?;
        let api = Api::resolve(&lib)?;
        Ok(Self {
            api,
            registry: Mutex::new(SyncRegistry::default()),
            _lib: lib,
        })
    }

    fn registry(&self) -> MutexGuard<'_, SyncRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_error(&self) -> ErrorCode {
        // SAFETY: no arguments; reads the calling thread's last error
        ErrorCode::from_raw(unsafe { (self.api.error_get_code)() })
    }

    fn check(&self, ok: Bool) -> EngineResult<()> {
        if ok != 0 {
            Ok(())
        } else {
            Err(self.last_error())
        }
    }

    fn check_handle(&self, raw: u32) -> EngineResult<StreamHandle> {
        if raw != 0 {
            Ok(StreamHandle(raw))
        } else {
            Err(self.last_error())
        }
    }

    fn check_u64(&self, value: u64) -> EngineResult<u64> {
        if value != u64::MAX {
            Ok(value)
        } else {
            Err(self.last_error())
        }
    }
}

impl AudioEngine for BassEngine {
    fn name(&self) -> &'static str {
        "bass"
    }

    fn version(&self) -> u32 {
        // SAFETY: no arguments
        unsafe { (self.api.get_version)() }
    }

    fn init(&self, device: i32, frequency: u32) -> EngineResult<()> {
        // SAFETY: null window and device GUID are valid on every platform
        let ok = unsafe { (self.api.init)(device, frequency, 0, std::ptr::null_mut(), std::ptr::null()) };
        self.check(ok)
    }

    fn free(&self) -> EngineResult<()> {
        // SAFETY: no arguments
        let ok = unsafe { (self.api.free)() };
        let result = self.check(ok);
        if result.is_ok() {
            // No stream survives, so no slot can be called any more
            let mut registry = self.registry();
            registry.active.clear();
            registry.spare.clear();
        }
        result
    }

    fn start(&self) -> EngineResult<()> {
        // SAFETY: no arguments
        let ok = unsafe { (self.api.start)() };
        self.check(ok)
    }

    fn load_plugin(&self, path: &Path) -> EngineResult<PluginHandle> {
        let (native, unicode) = native_path(path)?;
        // SAFETY: `native` is NUL terminated and outlives the call
        let raw = unsafe { (self.api.plugin_load)(native.as_ptr() as *const c_void, unicode) };
        if raw == 0 {
            return Err(self.last_error());
        }
        Ok(PluginHandle(raw))
    }

    fn free_plugins(&self) -> EngineResult<()> {
        // SAFETY: handle 0 means all plugins
        let ok = unsafe { (self.api.plugin_free)(0) };
        self.check(ok)
    }

    fn set_user_agent(&self, agent: &str) -> EngineResult<()> {
        let agent = CString::new(agent).map_err(|_| ErrorCode::IllegalParam)?;
        // SAFETY: the engine copies the string
        let ok = unsafe { (self.api.set_config_ptr)(CONFIG_NET_AGENT, agent.as_ptr() as *const c_void) };
        self.check(ok)
    }

    fn stream_from_file(&self, path: &Path, flags: StreamFlags) -> EngineResult<StreamHandle> {
        let (native, unicode) = native_path(path)?;
        // SAFETY: `native` is NUL terminated and outlives the call
        let raw = unsafe {
            (self.api.stream_create_file)(0, native.as_ptr() as *const c_void, 0, 0, flags.bits() | unicode)
        };
        self.check_handle(raw)
    }

    fn stream_from_url(&self, url: &str, flags: StreamFlags) -> EngineResult<StreamHandle> {
        let url = CString::new(url).map_err(|_| ErrorCode::IllegalParam)?;
        // SAFETY: no download callback; `url` outlives the call
        let raw = unsafe {
            (self.api.stream_create_url)(url.as_ptr(), 0, flags.bits(), std::ptr::null(), std::ptr::null_mut())
        };
        self.check_handle(raw)
    }

    fn stream_create(&self, frequency: u32, channels: u32, flags: StreamFlags) -> EngineResult<StreamHandle> {
        // SAFETY: a null STREAMPROC creates a "push" stream with no callback
        let raw = unsafe {
            (self.api.stream_create)(frequency, channels, flags.bits(), std::ptr::null(), std::ptr::null_mut())
        };
        self.check_handle(raw)
    }

    fn stream_free(&self, handle: StreamHandle) -> EngineResult<()> {
        // SAFETY: invalid handles are reported through the error code
        let ok = unsafe { (self.api.stream_free)(handle.0) };
        self.check(ok)
    }

    fn channel_play(&self, handle: StreamHandle, restart: bool) -> EngineResult<()> {
        // SAFETY: as above
        let ok = unsafe { (self.api.channel_play)(handle.0, Bool::from(restart)) };
        self.check(ok)
    }

    fn channel_pause(&self, handle: StreamHandle) -> EngineResult<()> {
        // SAFETY: as above
        let ok = unsafe { (self.api.channel_pause)(handle.0) };
        self.check(ok)
    }

    fn channel_stop(&self, handle: StreamHandle) -> EngineResult<()> {
        // SAFETY: as above
        let ok = unsafe { (self.api.channel_stop)(handle.0) };
        self.check(ok)
    }

    fn channel_status(&self, handle: StreamHandle) -> ChannelStatus {
        // SAFETY: as above
        ChannelStatus::from_raw(unsafe { (self.api.channel_is_active)(handle.0) })
    }

    fn channel_info(&self, handle: StreamHandle) -> EngineResult<ChannelInfo> {
        let mut raw = RawChannelInfo {
            freq: 0,
            chans: 0,
            flags: 0,
            ctype: 0,
            origres: 0,
            plugin: 0,
            sample: 0,
            filename: std::ptr::null(),
        };
        // SAFETY: `raw` matches BASS_CHANNELINFO and is writable
        let ok = unsafe { (self.api.channel_get_info)(handle.0, &mut raw) };
        self.check(ok)?;

        let flags = StreamFlags::from_bits_retain(raw.flags);
        // SAFETY: the engine owns the name for the lifetime of the channel
        let file_name = unsafe { channel_file_name(raw.filename, flags) };
        Ok(ChannelInfo {
            frequency: raw.freq,
            channels: raw.chans,
            flags,
            channel_type: raw.ctype,
            plugin: PluginHandle(raw.plugin),
            file_name,
        })
    }

    fn channel_length(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64> {
        // SAFETY: invalid handles are reported through the error code
        let value = unsafe { (self.api.channel_get_length)(handle.0, mode as u32) };
        self.check_u64(value)
    }

    fn channel_position(&self, handle: StreamHandle, mode: LengthMode) -> EngineResult<u64> {
        // SAFETY: as above
        let value = unsafe { (self.api.channel_get_position)(handle.0, mode as u32) };
        self.check_u64(value)
    }

    fn bytes_to_seconds(&self, handle: StreamHandle, bytes: u64) -> EngineResult<f64> {
        // SAFETY: as above
        let seconds = unsafe { (self.api.channel_bytes2seconds)(handle.0, bytes) };
        if seconds < 0.0 {
            return Err(self.last_error());
        }
        Ok(seconds)
    }

    fn channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute) -> EngineResult<f32> {
        let mut value = 0.0f32;
        // SAFETY: `value` is a valid out pointer
        let ok = unsafe { (self.api.channel_get_attribute)(handle.0, attribute as u32, &mut value) };
        self.check(ok)?;
        Ok(value)
    }

    fn set_channel_attribute(&self, handle: StreamHandle, attribute: ChannelAttribute, value: f32) -> EngineResult<()> {
        // SAFETY: invalid handles are reported through the error code
        let ok = unsafe { (self.api.channel_set_attribute)(handle.0, attribute as u32, value) };
        self.check(ok)
    }

    fn config(&self, option: ConfigOption) -> EngineResult<u32> {
        // SAFETY: plain integer option
        let value = unsafe { (self.api.get_config)(option as u32) };
        if value == u32::MAX {
            return Err(self.last_error());
        }
        Ok(value)
    }

    fn set_config(&self, option: ConfigOption, value: u32) -> EngineResult<()> {
        // SAFETY: plain integer option
        let ok = unsafe { (self.api.set_config)(option as u32, value) };
        self.check(ok)
    }

    fn set_sync(&self, handle: StreamHandle, kind: SyncKind, callback: SyncCallback) -> EngineResult<SyncHandle> {
        let slot = self.registry().take_slot();
        slot.arm(handle, callback);
        let user = &*slot as *const SyncSlot as *mut c_void;

        // The registry lock is not held across the native call: a sync
        // running on an engine thread may need it.
        // SAFETY: `slot` is moved into the registry below and stays allocated
        // until the engine is freed.
        let raw = unsafe { (self.api.channel_set_sync)(handle.0, kind as u32, 0, Some(sync_trampoline), user) };
        if raw == 0 {
            let code = self.last_error();
            self.registry().retire(slot);
            return Err(code);
        }

        let sync = SyncHandle(raw);
        self.registry().active.insert(sync, (handle, slot));
        Ok(sync)
    }

    fn remove_sync(&self, handle: StreamHandle, sync: SyncHandle) -> EngineResult<()> {
        // SAFETY: invalid handles are reported through the error code
        let ok = unsafe { (self.api.channel_remove_sync)(handle.0, sync.0) };
        self.check(ok)?;

        let mut registry = self.registry();
        if let Some((_, slot)) = registry.active.remove(&sync) {
            registry.retire(slot);
        }
        Ok(())
    }

    fn forget_stream(&self, handle: StreamHandle) {
        let mut registry = self.registry();
        let syncs: Vec<SyncHandle> = registry
            .active
            .iter()
            .filter(|(_, (stream, _))| *stream == handle)
            .map(|(sync, _)| *sync)
            .collect();
        for sync in syncs {
            if let Some((_, slot)) = registry.active.remove(&sync) {
                registry.retire(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_library_path_is_the_only_candidate() {
        let candidates = library_candidates(Some(Path::new("/opt/bass/libbass.so")));
        assert_eq!(candidates, vec![PathBuf::from("/opt/bass/libbass.so")]);
    }

    #[test]
    fn test_default_candidates_end_with_bare_name() {
        let candidates = library_candidates(None);
        let last = candidates.last().unwrap();
        assert_eq!(last, &PathBuf::from(library_names()[0]));
    }

    #[test]
    fn test_missing_library_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("libbass.so");
        match BassEngine::load(Some(&missing)) {
            Err(Error::EngineLibrary { path, .. }) => assert_eq!(path, missing),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("loading a missing library must fail"),
        }
    }

    #[test]
    fn test_trampoline_invokes_armed_slot_only() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let callback: SyncCallback = Arc::new(move |_: SyncHandle, handle: StreamHandle| {
            s.store(handle.0, Ordering::SeqCst);
        });
        let slot = Box::new(SyncSlot::default());
        slot.arm(StreamHandle(42), callback);
        let user = &*slot as *const SyncSlot as *mut c_void;

        unsafe { sync_trampoline(1, 42, 0, user) };
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        slot.disarm();
        unsafe { sync_trampoline(1, 42, 0, user) };
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_recycled_slot_ignores_previous_stream() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let callback = |calls: &Arc<AtomicUsize>| -> SyncCallback {
            let calls = calls.clone();
            Arc::new(move |_: SyncHandle, _: StreamHandle| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut registry = SyncRegistry::default();
        let slot = registry.take_slot();
        slot.arm(StreamHandle(7), callback(&calls));
        let first_address = &*slot as *const SyncSlot;
        registry.retire(slot);

        let slot = registry.take_slot();
        assert_eq!(&*slot as *const SyncSlot, first_address, "spare slot is reused");
        assert!(registry.spare.is_empty());
        slot.arm(StreamHandle(8), callback(&calls));
        let user = &*slot as *const SyncSlot as *mut c_void;

        // A late call for the old stream is dropped, the new owner still runs
        unsafe { sync_trampoline(1, 7, 0, user) };
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        unsafe { sync_trampoline(2, 8, 0, user) };
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
