//! Event types for the Cadenza event system
//!
//! The player publishes every observable change (track, state, position,
//! volume) on an [`EventBus`]. Front ends subscribe instead of polling the
//! player directly.

use crate::source::PlaybackSource;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Playback state as seen by front ends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum PlaybackState {
    /// A stream is live and producing audio
    Playing,
    /// A stream is live but paused
    Paused,
    /// No live stream
    Stopped,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Paused => write!(f, "Paused"),
            PlaybackState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Player event types
///
/// Serializable so front ends can forward them as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A new stream went live
    TrackStarted {
        source: PlaybackSource,
        /// Total length reported by the engine (0 for endless web streams)
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The live stream went away
    TrackEnded {
        source: PlaybackSource,
        /// True when the engine freed the stream at its end, false when the
        /// player stopped or replaced it
        completed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playing / Paused / Stopped transition
    PlaybackStateChanged {
        old_state: PlaybackState,
        new_state: PlaybackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic position update from the poll timer
    PlaybackProgress {
        position_ms: u64,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Global volume changed (0.0-1.0)
    VolumeChanged {
        volume: f32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A source could not be opened; the player moved on
    PlaybackFailed {
        source: PlaybackSource,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The output device failed while a stream was live
    DeviceFailure {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Another invocation asked this instance to come to the foreground
    ActivationRequested {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use cadenza_common::events::{EventBus, PlayerEvent};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(PlayerEvent::ActivationRequested {
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(PlayerEvent::ActivationRequested { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: PlayerEvent) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
