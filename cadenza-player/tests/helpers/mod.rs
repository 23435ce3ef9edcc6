//! Shared fixtures for cadenza-player integration tests

#![allow(dead_code)]

use cadenza_player::engine::{EngineContext, EngineSettings, SimulatedEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A simulated engine and an initialized context over it
pub struct TestEngine {
    pub engine: Arc<SimulatedEngine>,
    pub ctx: Arc<EngineContext>,
}

pub fn test_engine() -> TestEngine {
    let engine = Arc::new(SimulatedEngine::new());
    let ctx = EngineContext::initialize(engine.clone(), EngineSettings::default())
        .expect("simulated engine must initialize");
    TestEngine {
        engine,
        ctx: Arc::new(ctx),
    }
}

/// Create an (empty) audio file the simulated engine can open
pub fn audio_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"").expect("write test audio file");
    path
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Async variant of [`wait_until`]
pub async fn wait_until_async(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
