//! Loopback server receiving playback requests from later invocations
//!
//! **Responsibilities:**
//! - Accept connections on `127.0.0.1` until shut down
//! - Bound concurrent connections with a semaphore
//! - Decode each request and hand it to the player as commands
//!
//! A failing connection is logged and dropped; the accept loop keeps going.

use super::protocol::{ProtocolError, RequestReader};
use crate::player::{PlayerCommand, PlayerHandle};
use cadenza_common::SourceKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server limits
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Bound on every read from a peer
    pub handshake_timeout: Duration,
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_connections: 8,
        }
    }
}

/// Running accept loop
pub struct PlaybackServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PlaybackServer {
    /// Bind an ephemeral loopback port
    pub async fn bind() -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Start accepting on `listener`, forwarding requests to `player`
    pub fn spawn(listener: TcpListener, player: PlayerHandle, settings: ServerSettings) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!("Instance server listening on {}", local_addr);
        let task = tokio::spawn(accept_loop(listener, player, settings, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the loop to exit
    ///
    /// Connections already being served finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Instance server task ended abnormally: {}", e);
        }
        info!("Instance server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    player: PlayerHandle,
    settings: ServerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(settings.max_connections.max(1)));

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let player = player.clone();
        let timeout = settings.handshake_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            debug!("Connection from {}", peer);
            match serve_connection(stream, &player, timeout).await {
                Ok(accepted) => debug!("Request from {} done, {} entries enqueued", peer, accepted),
                Err(e @ ProtocolError::IdentityMismatch { .. }) => info!("Dropped foreign connection from {}: {}", peer, e),
                Err(e) => warn!("Dropped connection from {}: {}", peer, e),
            }
        });
    }
    debug!("Accept loop exiting");
}

/// Decode one request and dispatch it; returns the number of entries enqueued
async fn serve_connection(stream: TcpStream, player: &PlayerHandle, timeout: Duration) -> Result<usize, ProtocolError> {
    let mut reader = RequestReader::new(BufReader::new(stream), timeout);
    reader.read_preamble().await?;

    if player.send(PlayerCommand::Activate).await.is_err() {
        warn!("Player is gone, ignoring request");
        return Ok(0);
    }

    let count = reader.read_count().await?;
    let mut enqueued = 0;
    for index in 0..count {
        let entry = reader.read_entry().await?;
        let Some(source) = entry.source() else {
            warn!("Skipping entry {} with unknown source tag {}", index, entry.tag);
            continue;
        };
        if source.kind == SourceKind::File && !Path::new(&source.location).is_file() {
            warn!("Skipping entry {}: file not found: {}", index, source.location);
            continue;
        }
        if player.enqueue(source).await.is_err() {
            warn!("Player is gone, dropping remaining entries");
            break;
        }
        enqueued += 1;
    }
    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::protocol::{encode_entries, protocol_identity, WireEntry, PROTOCOL_VERSION};
    use crate::player::COMMAND_CAPACITY;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    async fn send_raw(port: u16, bytes: &[u8]) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    async fn next_command(rx: &mut mpsc::Receiver<PlayerCommand>) -> PlayerCommand {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("command not delivered")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_unknown_tag_and_missing_file_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.mp3");
        std::fs::write(&present, b"").unwrap();

        let (handle, mut rx) = PlayerHandle::channel(COMMAND_CAPACITY);
        let server = PlaybackServer::spawn(PlaybackServer::bind().await.unwrap(), handle, ServerSettings::default())
            .unwrap();

        let entries = vec![
            WireEntry {
                location: "mystery".to_string(),
                tag: 9,
            },
            WireEntry {
                location: dir.path().join("absent.mp3").to_string_lossy().into_owned(),
                tag: SourceKind::File.tag(),
            },
            WireEntry {
                location: present.to_string_lossy().into_owned(),
                tag: SourceKind::File.tag(),
            },
        ];
        send_raw(server.port(), &encode_entries(protocol_identity(), PROTOCOL_VERSION, &entries)).await;

        assert!(matches!(next_command(&mut rx).await, PlayerCommand::Activate));
        match next_command(&mut rx).await {
            PlayerCommand::Enqueue(source) => assert_eq!(source.path(), Some(present.as_path())),
            other => panic!("unexpected command {:?}", other),
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_connection_releases_permit() {
        let (handle, mut rx) = PlayerHandle::channel(COMMAND_CAPACITY);
        let settings = ServerSettings {
            handshake_timeout: Duration::from_millis(100),
            max_connections: 1,
        };
        let server = PlaybackServer::spawn(PlaybackServer::bind().await.unwrap(), handle, settings).unwrap();

        // Holds the only permit until the read times out
        let _stalled = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();

        send_raw(server.port(), &encode_entries(protocol_identity(), PROTOCOL_VERSION, &[])).await;
        assert!(matches!(next_command(&mut rx).await, PlayerCommand::Activate));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (handle, _rx) = PlayerHandle::channel(COMMAND_CAPACITY);
        let server = PlaybackServer::spawn(PlaybackServer::bind().await.unwrap(), handle, ServerSettings::default())
            .unwrap();
        let port = server.port();
        server.shutdown().await;

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
