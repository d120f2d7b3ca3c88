//! MobWrite daemon.
//!
//! Serves the differential synchronization protocol over TCP until Ctrl-C,
//! then saves every unsaved text and exits.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use mobwrite_sync::server::DEFAULT_MAX_REQUEST_BYTES;
use mobwrite_sync::{ServerConfig, StorageConfig, StorageMode, SyncConfig, SyncServer};

/// Daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "mobwrite-daemon")]
#[command(about = "Differential synchronization server for shared plain-text documents")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MOBWRITE_BIND", default_value = "0.0.0.0:3017")]
    bind: String,

    /// Only accept connections from this address
    #[arg(long, env = "MOBWRITE_ALLOWED_ORIGIN", default_value = "127.0.0.1")]
    allowed_origin: IpAddr,

    /// Accept connections from any address
    #[arg(long, env = "MOBWRITE_ALLOW_ANY_ORIGIN")]
    allow_any_origin: bool,

    /// Storage backend: memory, file or rocks
    #[arg(long, env = "MOBWRITE_STORAGE", default_value = "memory")]
    storage: StorageMode,

    /// Directory for the file and rocks backends
    #[arg(long, env = "MOBWRITE_DATA_DIR", default_value = "mobwrite_data", value_name = "PATH")]
    data_dir: PathBuf,

    /// Longest document kept, in characters (0 = unlimited)
    #[arg(long, env = "MOBWRITE_MAX_CHARS", default_value_t = 0)]
    max_chars: usize,

    /// Maximum number of live views (0 = unlimited)
    #[arg(long, env = "MOBWRITE_MAX_VIEWS", default_value_t = 10_000)]
    max_views: usize,

    /// Seconds before an idle view is dropped
    #[arg(long, env = "MOBWRITE_VIEW_TIMEOUT", default_value_t = 30 * 60)]
    view_timeout: u64,

    /// Seconds before an unmodified stored text is purged
    #[arg(long, env = "MOBWRITE_TEXT_TIMEOUT", default_value_t = 24 * 60 * 60)]
    text_timeout: u64,

    /// Seconds before a partial buffer is discarded
    #[arg(long, env = "MOBWRITE_BUFFER_TIMEOUT", default_value_t = 15 * 60)]
    buffer_timeout: u64,

    /// Milliseconds allowed for one diff
    #[arg(long, env = "MOBWRITE_DIFF_TIMEOUT_MS", default_value_t = 100)]
    diff_timeout_ms: u64,

    /// Milliseconds to wait for each read before dropping a connection
    #[arg(long, env = "MOBWRITE_READ_TIMEOUT_MS", default_value_t = 2000)]
    read_timeout_ms: u64,

    /// Largest request block accepted, in bytes
    #[arg(long, env = "MOBWRITE_MAX_REQUEST_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    max_request_bytes: usize,

    /// Seconds between cleanup sweeps
    #[arg(long, env = "MOBWRITE_CLEANUP_INTERVAL", default_value_t = 60)]
    cleanup_interval: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "MOBWRITE_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            allowed_origin: (!self.allow_any_origin).then_some(self.allowed_origin),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_request_bytes: self.max_request_bytes,
            cleanup_interval: Duration::from_secs(self.cleanup_interval.max(1)),
            storage: StorageConfig::new(self.storage, &self.data_dir),
            sync: SyncConfig {
                max_chars: self.max_chars,
                max_views: self.max_views,
                view_timeout: Duration::from_secs(self.view_timeout),
                text_timeout: Duration::from_secs(self.text_timeout),
                buffer_timeout: Duration::from_secs(self.buffer_timeout),
                diff_timeout: Duration::from_millis(self.diff_timeout_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("Starting mobwrite-daemon with {} storage", args.storage);

    let server = SyncServer::new(args.server_config())?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    server.run_until_shutdown(shutdown).await?;

    let stats = server.stats().await;
    info!(
        "Served {} requests on {} connections ({} bytes in, {} bytes out)",
        stats.total_requests, stats.total_connections, stats.bytes_in, stats.bytes_out
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let args = Args::parse_from(["mobwrite-daemon"]);
        let config = args.server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.allowed_origin, defaults.allowed_origin);
        assert_eq!(config.read_timeout, defaults.read_timeout);
        assert_eq!(config.max_request_bytes, defaults.max_request_bytes);
        assert_eq!(config.cleanup_interval, defaults.cleanup_interval);
        assert_eq!(config.storage.mode, StorageMode::Memory);
        assert_eq!(config.sync.max_views, defaults.sync.max_views);
        assert_eq!(config.sync.view_timeout, defaults.sync.view_timeout);
        assert_eq!(config.sync.text_timeout, defaults.sync.text_timeout);
        assert_eq!(config.sync.buffer_timeout, defaults.sync.buffer_timeout);
        assert_eq!(config.sync.diff_timeout, defaults.sync.diff_timeout);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "mobwrite-daemon",
            "--bind",
            "127.0.0.1:4000",
            "--allow-any-origin",
            "--storage",
            "rocksdb",
            "--data-dir",
            "/tmp/mw",
            "--max-chars",
            "500",
            "--max-request-bytes",
            "4096",
        ]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "127.0.0.1:4000");
        assert_eq!(config.allowed_origin, None);
        assert_eq!(config.storage.mode, StorageMode::Rocks);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/mw"));
        assert_eq!(config.sync.max_chars, 500);
        assert_eq!(config.max_request_bytes, 4096);
    }

    #[test]
    fn test_rejects_unknown_storage() {
        assert!(Args::try_parse_from(["mobwrite-daemon", "--storage", "s3"]).is_err());
    }
}
