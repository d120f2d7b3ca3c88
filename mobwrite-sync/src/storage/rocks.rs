//! RocksDB-backed text store.
//!
//! Column families:
//! - `texts`    — Master texts, UTF-8, LZ4 compressed (keyed by name)
//! - `metadata` — Per-text metadata (bincode: sizes, created_at, updated_at)
//!
//! Both are written in one batch so a text never exists without its
//! metadata. Expiry scans `metadata` and deletes whole entries.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{Persister, StoreError};

const CF_TEXTS: &str = "texts";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_TEXTS, CF_METADATA];

/// Block cache per column family.
const BLOCK_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// Metadata stored alongside each text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMetadata {
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last save timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl TextMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable text store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    path: PathBuf,
}

impl RocksStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &path,
            cf_descriptors,
        )?;
        Ok(Self { db, path })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(BLOCK_CACHE_SIZE);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.optimize_for_point_lookup(BLOCK_CACHE_SIZE as u64);

        match name {
            // Values are already LZ4 framed.
            CF_TEXTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of a stored text.
    pub fn metadata(&self, name: &str) -> Result<Option<TextMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => TextMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Names of every stored text.
    pub fn list_texts(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(name) => names.push(name),
                Err(_) => warn!("Skipping non UTF-8 key in metadata"),
            }
        }
        Ok(names)
    }

    /// Delete texts not saved within `max_age`.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cf_texts = self.cf(CF_TEXTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cutoff = now_secs().saturating_sub(max_age.as_secs());

        let mut batch = WriteBatch::default();
        let mut purged = 0;
        for item in self.db.iterator_cf(cf_meta, IteratorMode::Start) {
            let (key, value) = item?;
            let meta = TextMetadata::decode(&value)?;
            if meta.updated_at < cutoff {
                batch.delete_cf(cf_texts, &key);
                batch.delete_cf(cf_meta, &key);
                purged += 1;
            }
        }
        if purged > 0 {
            self.db.write(batch)?;
            info!("Purged {} expired texts from {}", purged, self.path.display());
        }
        Ok(purged)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Serialization(format!("Column family '{name}' not found")))
    }
}

impl Persister for RocksStore {
    fn load(&self, name: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_TEXTS)?;
        let Some(compressed) = self.db.get_cf(cf, name.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        debug!("Loaded {} bytes for {:?}", bytes.len(), name);
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| StoreError::InvalidText(name.to_string()))
    }

    fn save(&self, name: &str, text: Option<&str>) -> Result<(), StoreError> {
        let cf_texts = self.cf(CF_TEXTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = name.as_bytes();
        let mut batch = WriteBatch::default();

        match text {
            Some(text) => {
                let compressed = lz4_flex::compress_prepend_size(text.as_bytes());
                let now = now_secs();
                let created_at = self.metadata(name)?.map_or(now, |meta| meta.created_at);
                let meta = TextMetadata {
                    size: text.len() as u64,
                    compressed_size: compressed.len() as u64,
                    created_at,
                    updated_at: now,
                };
                batch.put_cf(cf_texts, key, &compressed);
                batch.put_cf(cf_meta, key, meta.encode()?);
            }
            None => {
                batch.delete_cf(cf_texts, key);
                batch.delete_cf(cf_meta, key);
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
