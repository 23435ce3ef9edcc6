//! Single-instance arbitration
//!
//! The first launch becomes the primary: it listens on a loopback port and
//! records the port in `<data_dir>/instancelock.txt`. Later launches find the
//! port, forward their arguments to the primary and exit. A named mutex
//! (an OS file lock) serializes every read-decide-write on the lock file so
//! two simultaneous launches converge on one primary.
//!
//! **Arbitration:**
//! 1. Wait up to `mutex_timeout` for the mutex; on timeout carry on anyway
//! 2. Lock file names a port and forwarding succeeds: [`Role::Secondary`]
//! 3. Otherwise bind, serve and record the port: [`Role::Primary`]
//! 4. Bind or lock file write failed: [`Role::Standalone`]
//!
//! The channel behind the [`PlayerHandle`] must have room for the whole
//! request, since the player task usually starts only after arbitration.

pub mod client;
pub mod lock;
pub mod protocol;
pub mod server;

pub use lock::{InstanceLockFile, NamedMutex, NamedMutexGuard};
pub use server::{PlaybackServer, ServerSettings};

use crate::player::PlayerHandle;
use cadenza_common::config::InstanceConfig;
use cadenza_common::PlaybackSource;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broker parameters
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub lock_file: PathBuf,
    pub mutex_dir: PathBuf,
    pub mutex_name: String,
    pub mutex_timeout: Duration,
    pub connect_timeout: Duration,
    pub server: ServerSettings,
}

impl BrokerSettings {
    pub fn new(data_dir: &Path, config: &InstanceConfig) -> Self {
        Self {
            lock_file: data_dir.join(&config.lock_file_name),
            mutex_dir: data_dir.to_path_buf(),
            mutex_name: config.mutex_name.clone(),
            mutex_timeout: config.mutex_timeout(),
            connect_timeout: config.connect_timeout(),
            server: ServerSettings {
                handshake_timeout: config.handshake_timeout(),
                max_connections: config.max_concurrent_connections,
            },
        }
    }
}

/// Outcome of arbitration
pub enum Role {
    /// This process serves later launches
    Primary(PrimaryInstance),
    /// The request went to a running instance; this process should exit
    Secondary,
    /// No hand-off possible; play locally without IPC
    Standalone,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Primary(_) => "primary",
            Role::Secondary => "secondary",
            Role::Standalone => "standalone",
        }
    }
}

/// Decides this process's role
pub struct SingleInstanceBroker {
    settings: BrokerSettings,
    mutex: NamedMutex,
    lock_file: InstanceLockFile,
}

impl SingleInstanceBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        let mutex = NamedMutex::new(&settings.mutex_dir, &settings.mutex_name);
        let lock_file = InstanceLockFile::new(settings.lock_file.clone());
        Self {
            settings,
            mutex,
            lock_file,
        }
    }

    /// Hand `request` to a running instance, or become the instance
    ///
    /// Unless the role is [`Role::Secondary`], `request` has been queued on
    /// `player` ahead of anything a later launch sends. As primary, requests
    /// from later launches are sent to `player`.
    pub async fn arbitrate(&self, request: &[PlaybackSource], player: PlayerHandle) -> Role {
        let _guard = self.lock().await;

        if let Some(port) = self.lock_file.read_port() {
            match client::forward_request(port, request, self.settings.connect_timeout).await {
                Ok(()) => {
                    info!("Forwarded {} entries to the running instance on port {}", request.len(), port);
                    return Role::Secondary;
                }
                Err(e) => info!("Stale instance lock file (port {}): {}", port, e),
            }
        }

        for source in request {
            if let Err(e) = player.enqueue(source.clone()).await {
                warn!("Cannot queue {}: {}", source, e);
            }
        }

        let listener = match PlaybackServer::bind().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Cannot bind instance server, running standalone: {}", e);
                return Role::Standalone;
            }
        };
        let server = match PlaybackServer::spawn(listener, player, self.settings.server) {
            Ok(server) => server,
            Err(e) => {
                warn!("Cannot start instance server, running standalone: {}", e);
                return Role::Standalone;
            }
        };
        if let Err(e) = self.lock_file.write_port(server.port()) {
            warn!(
                "Cannot write {}, running standalone: {}",
                self.lock_file.path().display(),
                e
            );
            server.shutdown().await;
            return Role::Standalone;
        }

        info!("Primary instance on port {}", server.port());
        Role::Primary(PrimaryInstance {
            server,
            mutex: self.mutex.clone(),
            lock_file: self.lock_file.clone(),
            mutex_timeout: self.settings.mutex_timeout,
        })
    }

    async fn lock(&self) -> Option<NamedMutexGuard> {
        lock_bounded(&self.mutex, self.settings.mutex_timeout).await
    }
}

/// Running primary; call [`PrimaryInstance::shutdown`] before exit
pub struct PrimaryInstance {
    server: PlaybackServer,
    mutex: NamedMutex,
    lock_file: InstanceLockFile,
    mutex_timeout: Duration,
}

impl PrimaryInstance {
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Remove our lock file entry and stop the server
    pub async fn shutdown(self) {
        let _guard = lock_bounded(&self.mutex, self.mutex_timeout).await;
        let port = self.server.port();
        match self.lock_file.remove_if_port(port) {
            Ok(true) => debug!("Removed {}", self.lock_file.path().display()),
            Ok(false) => debug!("Lock file no longer records port {}", port),
            Err(e) => warn!("Cannot remove {}: {}", self.lock_file.path().display(), e),
        }
        self.server.shutdown().await;
    }
}

async fn lock_bounded(mutex: &NamedMutex, timeout: Duration) -> Option<NamedMutexGuard> {
    match mutex.acquire(timeout).await {
        Ok(Some(guard)) => Some(guard),
        Ok(None) => {
            warn!(
                "Timed out after {:?} waiting for {}, proceeding without it",
                timeout,
                mutex.path().display()
            );
            None
        }
        Err(e) => {
            warn!("Cannot take {}, proceeding without it: {}", mutex.path().display(), e);
            None
        }
    }
}
