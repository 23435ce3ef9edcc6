//! Stream lifecycle tests against the simulated engine
//!
//! Covers the three ways a live handle can go away (explicit dispose, the
//! engine freeing it from its own thread, Drop) and what must hold when
//! they race:
//! - exactly one path tears the handle down
//! - after the engine freed a handle no call reaches the engine with it
//! - failed construction leaks no handle or sync
//! - teardown failures are logged and swallowed; teardown always returns

mod helpers;

use cadenza_common::PlaybackSource;
use cadenza_player::engine::simulated::FaultPoint;
use cadenza_player::engine::{AudioEngine, ChannelStatus, EngineOp, ErrorCode, SimulatedEngine, StreamHandle};
use cadenza_player::stream::{StreamNotice, StreamStatus, StreamWrapper};
use cadenza_player::Error;
use helpers::{audio_file, test_engine, wait_until};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio::sync::mpsc;

const RADIO: &str = "http://radio.example/live";
const TEARDOWN_LIMIT: Duration = Duration::from_secs(3);

/// Dispose on another thread; `None` when it did not return in time
fn dispose_on_worker(stream: Arc<StreamWrapper>) -> Option<bool> {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(stream.dispose());
    });
    done_rx.recv_timeout(TEARDOWN_LIMIT).ok()
}

fn drain_freed(rx: &mut mpsc::UnboundedReceiver<StreamNotice>, handle: StreamHandle) -> usize {
    let mut count = 0;
    while let Ok(notice) = rx.try_recv() {
        if notice == (StreamNotice::Freed { handle }) {
            count += 1;
        }
    }
    count
}

#[test]
fn test_dispose_racing_engine_free_tears_down_once() {
    let t = test_engine();

    for _ in 0..200 {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = Arc::new(StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap());
        let handle = stream.handle();
        let barrier = Arc::new(Barrier::new(2));

        let freer = {
            let engine = t.engine.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                engine.fire_free(handle)
            })
        };
        let disposer = {
            let stream = stream.clone();
            std::thread::spawn(move || {
                barrier.wait();
                stream.dispose()
            })
        };

        freer.join().unwrap();
        let disposed_here = disposer.join().unwrap();
        let freed_notices = drain_freed(&mut rx, handle);

        assert_eq!(
            disposed_here as usize + freed_notices,
            1,
            "exactly one path must win for {}",
            handle
        );
        let terminal_ops = t
            .engine
            .journal_for(handle)
            .into_iter()
            .filter(|op| matches!(op, EngineOp::Stop(_) | EngineOp::ForgetStream(_)))
            .count();
        assert_eq!(terminal_ops, 1, "teardown ran more than once for {}", handle);
        assert!(stream.is_disposed());
        assert_eq!(stream.status(), StreamStatus::Invalid);
        assert_eq!(t.engine.live_stream_count(), 0);
        assert_eq!(t.engine.sync_count(handle), 0);
    }
}

#[test]
fn test_engine_free_makes_no_further_native_call() {
    let t = test_engine();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap();
    let handle = stream.handle();
    t.engine.clear_journal();

    assert!(t.engine.fire_free(handle));
    assert_eq!(rx.try_recv().unwrap(), StreamNotice::Freed { handle });

    assert!(stream.is_disposed());
    assert!(!stream.dispose());
    assert_eq!(stream.status(), StreamStatus::Invalid);
    assert_eq!(stream.current_time(), Duration::ZERO);
    assert_eq!(stream.total_time(), Duration::ZERO);
    assert!(matches!(stream.pause(), Err(Error::InvalidState(_))));
    assert!(matches!(stream.set_volume(0.3), Err(Error::InvalidState(_))));
    drop(stream);

    assert_eq!(t.engine.freed_handle_calls(), 0);
    assert_eq!(
        t.engine.journal_for(handle),
        vec![EngineOp::AutoFree(handle), EngineOp::ForgetStream(handle)]
    );
}

#[test]
fn test_stream_end_frees_from_engine_thread() {
    let t = test_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = audio_file(dir.path(), "short.mp3");
    let source = PlaybackSource::file(&path);
    t.engine.set_source_length(source.location.clone(), Duration::from_millis(150));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), source, tx).unwrap();
    let handle = stream.handle();
    let total = stream.total_time();
    assert!(total > Duration::from_millis(149) && total < Duration::from_millis(151), "{:?}", total);
    assert_eq!(stream.file_path(), Some(path.clone()));

    let mut notices = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        !notices.is_empty()
    }));
    assert_eq!(notices, vec![StreamNotice::Freed { handle }]);
    assert!(stream.is_disposed());
    assert!(!stream.dispose());
    assert_eq!(t.engine.freed_handle_calls(), 0);
}

#[test]
fn test_missing_file_reports_engine_error() {
    let t = test_engine();
    let dir = tempfile::tempdir().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = StreamWrapper::create(t.ctx.clone(), PlaybackSource::file(dir.path().join("gone.mp3")), tx).unwrap_err();
    match err {
        Error::Engine { operation, code } => {
            assert_eq!(operation, "StreamCreateFile");
            assert_eq!(code, ErrorCode::FileOpen);
        }
        other => panic!("expected engine error, got {:?}", other),
    }
    assert_eq!(t.engine.live_stream_count(), 0);
}

#[test]
fn test_failed_sync_registration_leaks_nothing() {
    let t = test_engine();
    t.engine.clear_journal();
    t.engine.fail_next(FaultPoint::SetSync, ErrorCode::Memory);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::Memory));

    let handle = t
        .engine
        .journal()
        .iter()
        .find_map(|op| match op {
            EngineOp::StreamFromUrl(h) => Some(*h),
            _ => None,
        })
        .expect("stream was opened");
    assert!(t.engine.journal_for(handle).contains(&EngineOp::StreamFree(handle)));
    assert_eq!(t.engine.live_stream_count(), 0);
    assert_eq!(t.engine.sync_count(handle), 0);
}

#[test]
fn test_failed_play_releases_stream_and_syncs() {
    let t = test_engine();
    t.engine.fail_next(FaultPoint::Play, ErrorCode::Start);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap_err();
    match err {
        Error::Engine { operation, code } => {
            assert_eq!(operation, "ChannelPlay");
            assert_eq!(code, ErrorCode::Start);
        }
        other => panic!("expected engine error, got {:?}", other),
    }
    assert_eq!(t.engine.live_stream_count(), 0);
    assert!(rx.try_recv().is_err(), "teardown must not be reported as an engine free");
}

#[test]
fn test_drop_tears_down_forgotten_wrapper() {
    let t = test_engine();
    let (tx, _rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap();
    let handle = stream.handle();
    assert_eq!(t.engine.sync_count(handle), 2);

    drop(stream);

    assert_eq!(t.engine.live_stream_count(), 0);
    assert_eq!(t.engine.sync_count(handle), 0);
    assert!(t.engine.journal_for(handle).contains(&EngineOp::Stop(handle)));
}

#[test]
fn test_resume_restarts_output_only_after_device_loss() {
    let t = test_engine();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap();
    let handle = stream.handle();
    let engine: &SimulatedEngine = t.engine.as_ref();
    let starts = || engine.journal().iter().filter(|op| **op == EngineOp::Start).count();

    // Ordinary pause / resume never restarts the output
    stream.pause().unwrap();
    assert_eq!(stream.status(), StreamStatus::Paused);
    stream.resume().unwrap();
    assert_eq!(stream.status(), StreamStatus::Playing);
    assert_eq!(starts(), 0);

    t.engine.simulate_device_loss();
    assert_eq!(rx.try_recv().unwrap(), StreamNotice::DeviceFailed { handle });
    assert_eq!(engine.channel_status(handle), ChannelStatus::PausedDevice);
    assert_eq!(stream.status(), StreamStatus::Paused);
    let after_failure = starts();
    assert_eq!(after_failure, 1, "the device-fail callback restarts output");

    stream.resume().unwrap();
    assert_eq!(stream.status(), StreamStatus::Playing);
    assert_eq!(starts(), after_failure + 1);

    assert!(stream.dispose());
}

#[test]
fn test_dispose_with_failed_sync_removal_returns() {
    let t = test_engine();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = Arc::new(StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap());
    let handle = stream.handle();
    t.engine.fail_next(FaultPoint::RemoveSync, ErrorCode::Unknown);
    t.engine.fail_next(FaultPoint::RemoveSync, ErrorCode::Unknown);

    // Stopping the auto-free stream fires the still armed Free sync on the
    // disposing thread
    assert_eq!(dispose_on_worker(stream.clone()), Some(true), "dispose hung");

    assert_eq!(stream.status(), StreamStatus::Invalid);
    assert_eq!(t.engine.live_stream_count(), 0);
    assert_eq!(t.engine.sync_count(handle), 0);
    assert_eq!(drain_freed(&mut rx, handle), 0, "dispose won, no engine free is reported");
    assert!(t.engine.journal_for(handle).contains(&EngineOp::ForgetStream(handle)));
}

#[test]
fn test_dispose_frees_explicitly_when_stop_fails() {
    let t = test_engine();
    let (tx, _rx) = mpsc::unbounded_channel();
    let stream = Arc::new(StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap());
    let handle = stream.handle();
    t.engine.fail_next(FaultPoint::Stop, ErrorCode::Unknown);

    assert_eq!(dispose_on_worker(stream.clone()), Some(true), "dispose hung");

    assert_eq!(stream.status(), StreamStatus::Invalid);
    assert_eq!(t.engine.live_stream_count(), 0);
    let ops = t.engine.journal_for(handle);
    assert!(!ops.contains(&EngineOp::Stop(handle)));
    assert!(ops.contains(&EngineOp::StreamFree(handle)));
}

#[test]
fn test_dispose_leaks_stream_when_stop_and_free_fail() {
    let t = test_engine();
    let (tx, _rx) = mpsc::unbounded_channel();
    let stream = Arc::new(StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap());
    let handle = stream.handle();
    t.engine.fail_next(FaultPoint::Stop, ErrorCode::Unknown);
    t.engine.fail_next(FaultPoint::StreamFree, ErrorCode::Busy);

    assert_eq!(dispose_on_worker(stream.clone()), Some(true), "dispose hung");

    assert_eq!(stream.status(), StreamStatus::Invalid);
    assert!(!stream.dispose());
    assert_eq!(t.engine.live_streams(), vec![handle], "the handle is leaked, not reused");
    assert_eq!(t.engine.freed_handle_calls(), 0);
}

#[test]
fn test_drop_with_failed_teardown_returns() {
    let t = test_engine();
    let (tx, _rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap();
    t.engine.fail_next(FaultPoint::RemoveSync, ErrorCode::Unknown);
    t.engine.fail_next(FaultPoint::RemoveSync, ErrorCode::Unknown);
    t.engine.fail_next(FaultPoint::Stop, ErrorCode::Unknown);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        drop(stream);
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(TEARDOWN_LIMIT).is_ok(), "drop hung");
    assert_eq!(t.engine.live_stream_count(), 0);
}

#[test]
fn test_failed_free_after_failed_construction_is_swallowed() {
    let t = test_engine();
    t.engine.fail_next(FaultPoint::ChannelInfo, ErrorCode::Memory);
    t.engine.fail_next(FaultPoint::StreamFree, ErrorCode::Busy);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap_err();
    match err {
        Error::Engine { operation, code } => {
            assert_eq!(operation, "ChannelGetInfo");
            assert_eq!(code, ErrorCode::Memory);
        }
        other => panic!("expected engine error, got {:?}", other),
    }
    assert_eq!(t.engine.live_stream_count(), 1);
}

#[test]
fn test_resume_reports_failed_output_restart() {
    let t = test_engine();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = StreamWrapper::create(t.ctx.clone(), PlaybackSource::web(RADIO), tx).unwrap();
    let handle = stream.handle();

    t.engine.simulate_device_loss();
    assert_eq!(rx.try_recv().unwrap(), StreamNotice::DeviceFailed { handle });
    t.engine.fail_next(FaultPoint::Start, ErrorCode::Driver);

    match stream.resume() {
        Err(Error::Engine { operation, code }) => {
            assert_eq!(operation, "Start");
            assert_eq!(code, ErrorCode::Driver);
        }
        other => panic!("expected restart failure, got {:?}", other),
    }
    assert_eq!(stream.status(), StreamStatus::Paused);

    // The next attempt restarts and plays
    stream.resume().unwrap();
    assert_eq!(stream.status(), StreamStatus::Playing);
    assert!(stream.dispose());
}
