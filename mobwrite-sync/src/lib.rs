//! # mobwrite-sync — Differential synchronization server core
//!
//! Keeps many clients' copies of named plain-text documents eventually
//! consistent using differential synchronization over the line-oriented
//! MobWrite protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   request block    ┌─────────────┐
//! │ Client      │ ─────────────────► │ SyncServer  │  one TCP connection
//! │ (browser)   │ ◄───────────────── │ (tokio)     │  per request
//! └─────────────┘    reply block     └──────┬──────┘
//!                                           │
//!                                    ┌──────▼──────┐      ┌──────────────┐
//!                                    │ SyncService │ ───► │ SyncEngine   │
//!                                    └──────┬──────┘      │ (diff/patch) │
//!                                           │             └──────────────┘
//!                                   ┌───────▼────────┐
//!                                   │SessionRegistry │  texts, views,
//!                                   └───────┬────────┘  buffers
//!                                           │
//!                                   ┌───────▼────────┐
//!                                   │ Persister      │  memory / file /
//!                                   └────────────────┘  RocksDB
//! ```
//!
//! ## Modules
//!
//! - [`diff`] — Diff, delta codec and fuzzy patching
//! - [`protocol`] — Request parser and reply encoder
//! - [`buffer`] — Reassembly of fragmented requests
//! - [`text`] / [`view`] — Master texts and per-client shadows
//! - [`engine`] — Differential synchronization state machine
//! - [`registry`] — Object maps and lifecycle sweeps
//! - [`service`] — Request orchestration
//! - [`server`] — TCP daemon
//! - [`storage`] — Persistence backends

pub mod buffer;
pub mod config;
pub mod diff;
pub mod engine;
pub mod escape;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod text;
pub mod view;

// Re-exports for convenience
pub use config::SyncConfig;
pub use diff::{Diff, DiffEngine, DiffError, Operation, Patch};
pub use engine::{RunOutcome, SyncEngine};
pub use protocol::{Action, Mode, Request};
pub use registry::{CleanupReport, RegistryStats, SessionRegistry};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use service::SyncService;
pub use storage::{
    FileStore, MemoryStore, Persister, RocksStore, Storage, StorageConfig, StorageMode,
    StoreError, TextMetadata,
};
pub use text::TextObject;
pub use view::{ViewObject, ViewState};
