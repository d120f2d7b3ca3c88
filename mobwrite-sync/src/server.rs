//! TCP sync server: one request block per connection.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── spawn_blocking ──┐
//!            ├── accept loop ──┤  SyncService       │── reply, close
//! Client B ──┘   (origin check)│   ├── SessionRegistry (texts, views, buffers)
//!                              │   └── SyncEngine (diff / patch)
//!                              └────────────────────┘
//!                                         │
//!                    cleanup task ────────┼── Storage (memory / file / RocksDB)
//!                    (every interval)     │
//! ```
//!
//! Each connection:
//! - Reads until the request block ends with a blank line, the peer closes
//!   the write side, a read times out or the block grows past
//!   `max_request_bytes` (the last two are dropped without a reply)
//! - Runs the request on the blocking pool, since diffing and storage calls
//!   are synchronous
//! - Writes the reply block and closes

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::config::SyncConfig;
use crate::protocol;
use crate::registry::SessionRegistry;
use crate::service::SyncService;
use crate::storage::{Persister, Storage, StorageConfig, StoreError};

/// Read chunk size.
const READ_CHUNK: usize = 8 * 1024;

/// Default cap on one request block.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Only accept connections from this address (None = anyone)
    pub allowed_origin: Option<IpAddr>,
    /// Per-read timeout; the connection is dropped when it expires
    pub read_timeout: Duration,
    /// Largest request block accepted; longer ones drop the connection
    pub max_request_bytes: usize,
    /// Interval between cleanup sweeps
    pub cleanup_interval: Duration,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Synchronization limits and timeouts
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3017".to_string(),
            allowed_origin: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            read_timeout: Duration::from_secs(2),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            cleanup_interval: Duration::from_secs(60),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loopback server with short timeouts and in-memory storage.
    pub fn for_testing(port: u16) -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{port}"),
            read_timeout: Duration::from_millis(500),
            cleanup_interval: Duration::from_millis(100),
            sync: SyncConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Connections dropped on a read timeout
    pub timeouts: u64,
    /// Connections refused by the origin check
    pub refused: u64,
    /// Connections dropped for sending an oversized request
    pub oversized: u64,
}

/// Per-connection read limits.
#[derive(Debug, Clone, Copy)]
struct ReadLimits {
    timeout: Duration,
    max_bytes: usize,
}

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    service: Arc<SyncService>,
    storage: Arc<Storage>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured storage and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.storage)?);
        let persister: Arc<dyn Persister> = storage.clone();
        let registry = Arc::new(SessionRegistry::new(config.sync.clone(), persister));
        Ok(Self {
            config,
            service: Arc::new(SyncService::new(registry)),
            storage,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then save every dirty text.
    pub async fn run_until_shutdown(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        info!("MobWrite server listening on {}", self.config.bind_addr);

        let cleanup = tokio::spawn(Self::cleanup_loop(
            self.service.registry().clone(),
            self.storage.clone(),
            self.config.cleanup_interval,
            self.config.sync.text_timeout,
        ));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    if !self.origin_allowed(&addr) {
                        warn!("Connection refused from {}", addr.ip());
                        self.stats.write().await.refused += 1;
                        continue;
                    }
                    debug!("New TCP connection from {addr}");

                    let service = self.service.clone();
                    let stats = self.stats.clone();
                    let limits = ReadLimits {
                        timeout: self.config.read_timeout,
                        max_bytes: self.config.max_request_bytes,
                    };
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, service, stats, limits).await
                        {
                            error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        cleanup.abort();
        let registry = self.service.registry().clone();
        let failures = tokio::task::spawn_blocking(move || registry.flush()).await?;
        if failures > 0 {
            error!("{failures} texts could not be saved at shutdown");
        }
        Ok(())
    }

    fn origin_allowed(&self, addr: &SocketAddr) -> bool {
        match self.config.allowed_origin {
            Some(allowed) => addr.ip().to_canonical() == allowed,
            None => true,
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<SyncService>,
        stats: Arc<RwLock<ServerStats>>,
        limits: ReadLimits,
    ) -> Result<(), ServerError> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        let result = Self::serve(stream, addr, service, &stats, limits).await;
        stats.write().await.active_connections -= 1;
        result
    }

    async fn serve(
        mut stream: TcpStream,
        addr: SocketAddr,
        service: Arc<SyncService>,
        stats: &RwLock<ServerStats>,
        limits: ReadLimits,
    ) -> Result<(), ServerError> {
        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = match tokio::time::timeout(limits.timeout, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    warn!("Read timeout from {addr}, dropping connection");
                    stats.write().await.timeouts += 1;
                    return Ok(());
                }
            };
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
            if data.len() > limits.max_bytes {
                warn!(
                    "Request from {addr} exceeds {} bytes, dropping connection",
                    limits.max_bytes
                );
                stats.write().await.oversized += 1;
                return Ok(());
            }
            if protocol::is_terminated(&data) {
                break;
            }
        }

        let bytes_in = data.len() as u64;
        let reply = tokio::task::spawn_blocking(move || service.handle_bytes(&data)).await?;
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await?;

        let mut s = stats.write().await;
        s.total_requests += 1;
        s.bytes_in += bytes_in;
        s.bytes_out += reply.len() as u64;
        Ok(())
    }

    async fn cleanup_loop(
        registry: Arc<SessionRegistry>,
        storage: Arc<Storage>,
        every: Duration,
        text_timeout: Duration,
    ) {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let registry = registry.clone();
            let storage = storage.clone();
            let sweep = tokio::task::spawn_blocking(move || {
                let report = registry.cleanup();
                let purged = storage.purge_expired(text_timeout);
                (report, purged)
            })
            .await;
            match sweep {
                Ok((report, Ok(purged))) => {
                    debug!("Cleanup: {:?}, purged {} stored texts", report, purged);
                }
                Ok((_, Err(e))) => error!("Failed to purge expired texts: {e}"),
                Err(e) => error!("Cleanup task failed: {e}"),
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}
