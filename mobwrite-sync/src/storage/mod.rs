//! Persistence of master texts.
//!
//! ```text
//! ┌─────────────┐  load / save   ┌──────────────────────────────────┐
//! │ TextObject  │ ─────────────► │ Persister                        │
//! │ (in-memory) │                │  ├─ MemoryStore  (HashMap)       │
//! └─────────────┘                │  ├─ FileStore    (<dir>/<n>.txt) │
//!                                │  └─ RocksStore   (RocksDB, LZ4)  │
//!                                └──────────────────────────────────┘
//! ```
//!
//! Persisters are synchronous and are called while the caller holds a
//! text lock; they must never call back into the registry.

pub mod file;
pub mod memory;
pub mod rocks;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use rocks::{RocksStore, TextMetadata};

/// Loads and saves master texts by document name.
pub trait Persister: Send + Sync {
    /// Stored text for `name`, or `None` if nothing is stored.
    fn load(&self, name: &str) -> Result<Option<String>, StoreError>;

    /// Store `text` under `name`; `None` deletes the stored document.
    fn save(&self, name: &str, text: Option<&str>) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Stored text for {0:?} is not valid UTF-8")]
    InvalidText(String),
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    #[default]
    Memory,
    File,
    Rocks,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Memory => write!(f, "memory"),
            StorageMode::File => write!(f, "file"),
            StorageMode::Rocks => write!(f, "rocks"),
        }
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StorageMode::Memory),
            "file" | "files" => Ok(StorageMode::File),
            "rocks" | "rocksdb" => Ok(StorageMode::Rocks),
            other => Err(format!("unknown storage mode: {other}")),
        }
    }
}

/// Backend selection.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Directory for the file and RocksDB backends.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Memory,
            data_dir: PathBuf::from("mobwrite_data"),
        }
    }
}

impl StorageConfig {
    pub fn new(mode: StorageMode, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            data_dir: data_dir.into(),
        }
    }
}

/// The configured backend.
pub enum Storage {
    Memory(MemoryStore),
    File(FileStore),
    Rocks(RocksStore),
}

impl Storage {
    /// Open the backend named by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        log::info!("Opening {} storage at {}", config.mode, config.data_dir.display());
        Ok(match config.mode {
            StorageMode::Memory => Storage::Memory(MemoryStore::new()),
            StorageMode::File => Storage::File(FileStore::open(&config.data_dir)?),
            StorageMode::Rocks => Storage::Rocks(RocksStore::open(&config.data_dir)?),
        })
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            Storage::Memory(_) => StorageMode::Memory,
            Storage::File(_) => StorageMode::File,
            Storage::Rocks(_) => StorageMode::Rocks,
        }
    }

    /// Delete stored documents not modified within `max_age`.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        match self {
            Storage::Memory(store) => Ok(store.purge_expired(max_age)),
            Storage::File(store) => store.purge_expired(max_age),
            Storage::Rocks(store) => store.purge_expired(max_age),
        }
    }
}

impl Persister for Storage {
    fn load(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self {
            Storage::Memory(store) => store.load(name),
            Storage::File(store) => store.load(name),
            Storage::Rocks(store) => store.load(name),
        }
    }

    fn save(&self, name: &str, text: Option<&str>) -> Result<(), StoreError> {
        match self {
            Storage::Memory(store) => store.save(name, text),
            Storage::File(store) => store.save(name, text),
            Storage::Rocks(store) => store.save(name, text),
        }
    }
}
