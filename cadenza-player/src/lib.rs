//! # Cadenza Player Library (cadenza-player)
//!
//! Single-instance audio player driving a native playback engine.
//!
//! **Purpose:** Own the one live engine stream safely across engine-thread
//! callbacks, hand command-line requests from later launches to the running
//! instance, and sequence a play queue.
//!
//! **Architecture:**
//! - `engine`: narrow native engine surface, BASS binding and simulated engine
//! - `stream`: lifecycle of the live stream handle
//! - `instance`: named mutex, lock file and loopback hand-off protocol
//! - `player`: queue and playback state task

pub mod config;
pub mod engine;
pub mod error;
pub mod instance;
pub mod logging;
pub mod player;
pub mod stream;

pub use error::{Error, Result};
pub use player::{Player, PlayerCommand, PlayerHandle};
pub use stream::{StreamNotice, StreamStatus, StreamWrapper};
