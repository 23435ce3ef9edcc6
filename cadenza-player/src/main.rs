//! Cadenza (cadenza) - Main entry point
//!
//! Plays the files and web streams given on the command line. When another
//! instance is already running the arguments are handed to it and this
//! process exits immediately.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadenza_common::config::{default_config_path, EngineBackend};
use cadenza_common::events::{EventBus, PlayerEvent};
use cadenza_common::human_time::{format_clock, progress_percent};
use cadenza_common::PlaybackSource;
use cadenza_player::config::{Config, Overrides};
use cadenza_player::engine::{AudioEngine, BassEngine, EngineContext, EngineSettings, SimulatedEngine};
use cadenza_player::instance::{BrokerSettings, Role, SingleInstanceBroker};
use cadenza_player::player::{Player, PlayerHandle, COMMAND_CAPACITY};
use cadenza_player::logging;
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Command-line arguments for cadenza
#[derive(Parser, Debug)]
#[command(name = "cadenza")]
#[command(about = "Single-instance audio player")]
#[command(version)]
struct Args {
    /// Files or http(s) URLs to play
    #[arg(value_name = "SOURCES")]
    sources: Vec<String>,

    /// Configuration file (default: <config_dir>/cadenza/config.toml)
    #[arg(short, long, env = "CADENZA_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the instance lock file
    #[arg(long, env = "CADENZA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Engine backend: bass or simulated
    #[arg(long)]
    engine: Option<EngineBackend>,

    /// Always start a new instance
    #[arg(long)]
    no_single_instance: bool,

    /// Log level directive, e.g. "info" or "cadenza_player=debug"
    #[arg(long, env = "CADENZA_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = Overrides {
        data_dir: args.data_dir.clone(),
        engine: args.engine,
        log_level: args.log_level.clone(),
        no_single_instance: args.no_single_instance,
    };
    let config_file = args.config.clone().or_else(default_config_path);
    let config = Config::resolve(config_file.as_deref(), &overrides).context("Failed to load configuration")?;

    logging::init(&config.toml.logging).context("Failed to initialize logging")?;
    logging::log_build_info();
    if let Some(path) = &config.config_file {
        info!("Configuration: {}", path.display());
    }
    info!("Data directory: {}", config.data_dir.display());

    let sources: Vec<PlaybackSource> = args.sources.iter().map(|arg| PlaybackSource::from_arg(arg)).collect();
    let (player_handle, commands) = PlayerHandle::channel(COMMAND_CAPACITY.max(sources.len() + 1));

    // Both paths leave `sources` queued unless another instance took them
    let role = if config.single_instance() {
        let broker = SingleInstanceBroker::new(BrokerSettings::new(&config.data_dir, &config.toml.instance));
        broker.arbitrate(&sources, player_handle.clone()).await
    } else {
        for source in &sources {
            player_handle.enqueue(source.clone()).await?;
        }
        Role::Standalone
    };
    if let Role::Secondary = role {
        info!("Request handed to the running instance, exiting");
        return Ok(());
    }
    info!("Running as {} instance", role.name());

    let ctx = match start_engine(&config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            release_role(role).await;
            return Err(e);
        }
    };

    let events = EventBus::new(config.toml.player.event_capacity);
    let event_log = spawn_event_log(events.subscribe());
    let player = Player::new(ctx, commands, events, &config.toml.player).spawn();

    shutdown_signal().await;

    release_role(role).await;
    if let Err(e) = player_handle.shutdown().await {
        debug!("Player already stopped: {}", e);
    }
    player.await.context("Player task failed")?;
    event_log.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Load the configured backend and initialize it
fn start_engine(config: &Config) -> Result<EngineContext> {
    let engine_config = &config.toml.engine;
    let engine: Arc<dyn AudioEngine> = match engine_config.backend {
        EngineBackend::Bass => Arc::new(
            BassEngine::load(engine_config.library_path.as_deref()).context("Failed to load the BASS library")?,
        ),
        EngineBackend::Simulated => {
            warn!("Using the simulated engine, no audio will be produced");
            Arc::new(SimulatedEngine::new())
        }
    };
    let ctx = EngineContext::initialize(engine, EngineSettings::from(engine_config))
        .context("Failed to initialize the audio engine")?;
    Ok(ctx)
}

async fn release_role(role: Role) {
    if let Role::Primary(primary) = role {
        primary.shutdown().await;
    }
}

/// Log player events the way a front end would show them
fn spawn_event_log(mut events: broadcast::Receiver<PlayerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event log lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match &event {
                PlayerEvent::TrackStarted {
                    source, duration_ms, ..
                } => info!(
                    "Now playing {} [{}]",
                    source,
                    format_clock(Duration::from_millis(*duration_ms))
                ),
                PlayerEvent::PlaybackProgress {
                    position_ms,
                    duration_ms,
                    ..
                } => {
                    let position = Duration::from_millis(*position_ms);
                    let duration = Duration::from_millis(*duration_ms);
                    debug!(
                        "{} / {} ({}%)",
                        format_clock(position),
                        format_clock(duration),
                        progress_percent(position, duration)
                    );
                }
                PlayerEvent::PlaybackFailed { source, reason, .. } => error!("Could not play {}: {}", source, reason),
                PlayerEvent::ActivationRequested { .. } => info!("Another launch asked for this window"),
                _ => match serde_json::to_string(&event) {
                    Ok(json) => debug!("Event: {}", json),
                    Err(e) => warn!("Cannot serialize event: {}", e),
                },
            }
        }
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
