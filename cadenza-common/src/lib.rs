//! # Cadenza Common Library
//!
//! Shared code for the Cadenza player crates:
//! - Error types
//! - Configuration loading and data directory resolution
//! - Playback source types shared by the protocol and the player
//! - Player event types and the EventBus
//! - Clock-style time formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod source;

pub use error::{Error, Result};
pub use source::{PlaybackSource, SourceKind};
