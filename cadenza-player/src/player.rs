//! Headless player
//!
//! The [`Player`] task owns the engine context, the one live
//! [`StreamWrapper`] and the play queue. Everything else talks to it through
//! a cloneable [`PlayerHandle`]; engine callbacks reach it as
//! [`StreamNotice`]s. State changes are published on the [`EventBus`].
//!
//! **Queue rules:**
//! - Starting a track always disposes the previous stream first
//! - A source that fails to open is reported and the next one is tried
//! - When the engine frees the live stream at its end the queue advances
//! - Streams are opened on the blocking pool; a slow web host delays the
//!   queue but never a runtime worker

use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::stream::{StreamNotice, StreamStatus, StreamWrapper};
use cadenza_common::config::PlayerSettings;
use cadenza_common::events::{EventBus, PlaybackState, PlayerEvent};
use cadenza_common::PlaybackSource;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Depth of the command channel
pub const COMMAND_CAPACITY: usize = 256;

/// Requests accepted by the player task
#[derive(Debug)]
pub enum PlayerCommand {
    /// Append to the queue, starting playback when idle
    Enqueue(PlaybackSource),
    /// Replace the current track immediately
    PlayNow(PlaybackSource),
    Pause,
    Resume,
    TogglePause,
    /// Stop the current track, keeping the queue
    Stop,
    /// Skip to the next queued track
    Next,
    /// Global volume, 0.0-1.0
    SetVolume(f32),
    /// Another invocation asked this instance to come to the foreground
    Activate,
    /// Report the current state
    Status(oneshot::Sender<PlayerStatus>),
    Shutdown,
}

/// Snapshot of the player
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub current: Option<PlaybackSource>,
    pub queued: Vec<PlaybackSource>,
    pub position: Duration,
    pub duration: Duration,
    pub volume: f32,
}

/// Cloneable sender side of the player
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
}

impl PlayerHandle {
    /// Create a handle and the receiver a [`Player`] consumes
    ///
    /// Commands sent before the player starts are queued in the channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PlayerCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: PlayerCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::PlayerStopped)
    }

    pub async fn enqueue(&self, source: PlaybackSource) -> Result<()> {
        self.send(PlayerCommand::Enqueue(source)).await
    }

    pub async fn status(&self) -> Result<PlayerStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(PlayerCommand::Status(tx)).await?;
        rx.await.map_err(|_| Error::PlayerStopped)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(PlayerCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The player task state
pub struct Player {
    ctx: Arc<EngineContext>,
    commands: mpsc::Receiver<PlayerCommand>,
    notices_tx: mpsc::UnboundedSender<StreamNotice>,
    notices_rx: mpsc::UnboundedReceiver<StreamNotice>,
    events: EventBus,
    current: Option<StreamWrapper>,
    queue: VecDeque<PlaybackSource>,
    state: PlaybackState,
    volume: f32,
    poll_interval: Duration,
}

impl Player {
    pub fn new(
        ctx: Arc<EngineContext>,
        commands: mpsc::Receiver<PlayerCommand>,
        events: EventBus,
        settings: &PlayerSettings,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            commands,
            notices_tx,
            notices_rx,
            events,
            current: None,
            queue: VecDeque::new(),
            state: PlaybackState::Stopped,
            volume: settings.initial_volume.clamp(0.0, 1.0),
            poll_interval: settings.poll_interval(),
        }
    }

    /// Run the player on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        if let Err(code) = self.ctx.set_global_volume(self.volume) {
            warn!("Failed to apply initial volume: {}", code);
        }
        info!("Player started");

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PlayerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice).await,
                _ = poll.tick() => self.poll(),
            }
        }

        self.stop_current();
        self.set_state(PlaybackState::Stopped);
        info!("Player stopped");
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        debug!("Player command: {:?}", command);
        match command {
            PlayerCommand::Enqueue(source) => {
                self.queue.push_back(source);
                if self.current.is_none() {
                    self.advance().await;
                }
            }
            PlayerCommand::PlayNow(source) => {
                self.queue.push_front(source);
                self.advance().await;
            }
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Resume => self.resume(),
            PlayerCommand::TogglePause => match self.current.as_ref().map(StreamWrapper::status) {
                Some(StreamStatus::Playing) => self.pause(),
                Some(StreamStatus::Paused) => self.resume(),
                _ => {}
            },
            PlayerCommand::Stop => {
                self.stop_current();
                self.set_state(PlaybackState::Stopped);
            }
            PlayerCommand::Next => self.advance().await,
            PlayerCommand::SetVolume(volume) => self.set_volume(volume),
            PlayerCommand::Activate => {
                info!("Activation requested by another instance");
                self.emit(PlayerEvent::ActivationRequested { timestamp: Utc::now() });
            }
            PlayerCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            PlayerCommand::Shutdown => {}
        }
    }

    async fn handle_notice(&mut self, notice: StreamNotice) {
        match notice {
            StreamNotice::Freed { handle } => {
                if self.current.as_ref().map(StreamWrapper::handle) != Some(handle) {
                    debug!("Ignoring free notice for stale {}", handle);
                    return;
                }
                if let Some(stream) = self.current.take() {
                    info!("Finished {}", stream.source());
                    self.emit(PlayerEvent::TrackEnded {
                        source: stream.source().clone(),
                        completed: true,
                        timestamp: Utc::now(),
                    });
                }
                self.advance().await;
            }
            StreamNotice::DeviceFailed { handle } => {
                warn!("Output device failed while playing {}", handle);
                self.emit(PlayerEvent::DeviceFailure { timestamp: Utc::now() });
                if self.current.as_ref().map(StreamWrapper::handle) == Some(handle) {
                    self.set_state(PlaybackState::Paused);
                }
            }
        }
    }

    fn poll(&mut self) {
        let Some(stream) = &self.current else {
            return;
        };
        let position = stream.current_time();
        let duration = stream.total_time();
        let state = match stream.status() {
            StreamStatus::Playing => PlaybackState::Playing,
            StreamStatus::Paused => PlaybackState::Paused,
            // The free notice is on its way
            StreamStatus::Invalid => return,
        };
        self.set_state(state);
        self.emit(PlayerEvent::PlaybackProgress {
            position_ms: position.as_millis() as u64,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    /// Dispose the current track and start the next playable queue entry
    async fn advance(&mut self) {
        self.stop_current();

        while let Some(source) = self.queue.pop_front() {
            match open_stream(self.ctx.clone(), source.clone(), self.notices_tx.clone()).await {
                Ok(stream) => {
                    self.emit(PlayerEvent::TrackStarted {
                        source,
                        duration_ms: stream.total_time().as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                    self.current = Some(stream);
                    self.set_state(PlaybackState::Playing);
                    return;
                }
                Err(e) => {
                    error!("Cannot play {}: {}", source, e);
                    self.emit(PlayerEvent::PlaybackFailed {
                        source,
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        self.set_state(PlaybackState::Stopped);
    }

    fn stop_current(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.dispose();
            self.emit(PlayerEvent::TrackEnded {
                source: stream.source().clone(),
                completed: false,
                timestamp: Utc::now(),
            });
        }
    }

    fn pause(&mut self) {
        let Some(stream) = &self.current else {
            return;
        };
        match stream.pause() {
            Ok(()) => self.set_state(PlaybackState::Paused),
            Err(e) => warn!("Pause failed: {}", e),
        }
    }

    fn resume(&mut self) {
        let Some(stream) = &self.current else {
            return;
        };
        match stream.resume() {
            Ok(()) => self.set_state(PlaybackState::Playing),
            Err(e) => warn!("Resume failed: {}", e),
        }
    }

    fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        match self.ctx.set_global_volume(volume) {
            Ok(()) => {
                self.volume = volume;
                self.emit(PlayerEvent::VolumeChanged {
                    volume,
                    timestamp: Utc::now(),
                });
            }
            Err(code) => warn!("Setting volume failed: {}", code),
        }
    }

    fn set_state(&mut self, new_state: PlaybackState) {
        if self.state == new_state {
            return;
        }
        let old_state = std::mem::replace(&mut self.state, new_state);
        debug!("Playback state {} -> {}", old_state, new_state);
        self.emit(PlayerEvent::PlaybackStateChanged {
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
    }

    fn snapshot(&self) -> PlayerStatus {
        let (position, duration) = match &self.current {
            Some(stream) => (stream.current_time(), stream.total_time()),
            None => (Duration::ZERO, Duration::ZERO),
        };
        PlayerStatus {
            state: self.state,
            current: self.current.as_ref().map(|s| s.source().clone()),
            queued: self.queue.iter().cloned().collect(),
            position,
            duration,
            volume: self.volume,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        self.events.emit_lossy(event);
    }
}

/// Open and start `source` off the runtime; engine constructors block
async fn open_stream(
    ctx: Arc<EngineContext>,
    source: PlaybackSource,
    notices: mpsc::UnboundedSender<StreamNotice>,
) -> Result<StreamWrapper> {
    tokio::task::spawn_blocking(move || StreamWrapper::create(ctx, source, notices))
        .await
        .map_err(|e| Error::InvalidState(format!("Stream open task failed: {}", e)))?
}
