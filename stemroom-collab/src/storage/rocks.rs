//! RocksDB-backed track store.
//!
//! Column families:
//! - `documents` full yrs state per track (LZ4), key = track id
//! - `updates`   merged updates since the last snapshot (LZ4),
//!               key = track id ‖ 0x00 ‖ seq (u64 big-endian)
//! - `metadata`  [`TrackMetadata`] (bincode), key = track id
//!
//! A room is restored as snapshot + every update still in `updates`.
//! Saving a snapshot compacts the updates it already covers.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use stemroom_core::TrackError;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stemroom_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub track_id: String,
    /// Sequence number of the last appended update.
    pub last_seq: u64,
    /// Highest sequence folded into the stored snapshot.
    pub snapshot_seq: u64,
    pub update_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub updated_at: u64,
}

impl TrackMetadata {
    fn new(track_id: &str) -> Self {
        let now = stemroom_core::unix_seconds();
        Self {
            track_id: track_id.to_string(),
            last_seq: 0,
            snapshot_seq: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("track not found: {0}")]
    NotFound(String),
    #[error("invalid track id {0:?}")]
    InvalidTrackId(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for TrackError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => TrackError::NotFound(format!("track {id}")),
            StoreError::InvalidTrackId(_) => TrackError::InvalidRequest(e.to_string()),
            other => TrackError::Internal(other.to_string()),
        }
    }
}

/// Durable storage for track documents.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened track store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_DOCUMENTS | CF_UPDATES => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store the full state of a track and drop the updates it covers.
    pub fn save_snapshot(&self, track_id: &str, snapshot: &[u8]) -> Result<TrackMetadata, StoreError> {
        validate_track_id(track_id)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(track_id)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.snapshot_seq = meta.last_seq;
        meta.update_count = 0;
        meta.updated_at = stemroom_core::unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, track_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, track_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        let removed = self.compact_updates(track_id, meta.snapshot_seq)?;
        log::debug!(
            "Snapshot for {track_id}: {} -> {} bytes, {removed} updates compacted",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, track_id: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, track_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(track_id.to_string())),
        }
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append one merged update. Returns its sequence number.
    ///
    /// Callers serialize appends per track; the room lock does that.
    pub fn append_update(&self, track_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        validate_track_id(track_id)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(track_id)?;
        meta.last_seq += 1;
        meta.update_count += 1;
        meta.updated_at = stemroom_core::unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_updates,
            update_key(track_id, meta.last_seq),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(&cf_meta, track_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(meta.last_seq)
    }

    /// Updates with a sequence number above `after_seq`, in order.
    pub fn load_updates_since(
        &self,
        track_id: &str,
        after_seq: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = update_key(track_id, after_seq.saturating_add(1));
        let prefix = update_prefix(track_id);

        let mut updates = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            let Some(seq) = seq_from_key(&key, &prefix) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }
        Ok(updates)
    }

    pub fn load_updates(&self, track_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_updates_since(track_id, 0)
    }

    /// Delete updates with `seq <= up_to_seq`. Returns how many went.
    pub fn compact_updates(&self, track_id: &str, up_to_seq: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(track_id);

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            match seq_from_key(&key, &prefix) {
                Some(seq) if seq <= up_to_seq => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, track_id: &str) -> Result<TrackMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, track_id.as_bytes())? {
            Some(bytes) => TrackMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(track_id.to_string())),
        }
    }

    fn metadata_or_new(&self, track_id: &str) -> Result<TrackMetadata, StoreError> {
        match self.load_metadata(track_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(TrackMetadata::new(track_id)),
            Err(e) => Err(e),
        }
    }

    pub fn track_exists(&self, track_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, track_id.as_bytes())?.is_some())
    }

    pub fn list_tracks(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut tracks = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            tracks.push(id);
        }
        Ok(tracks)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

fn validate_track_id(track_id: &str) -> Result<(), StoreError> {
    if track_id.is_empty() || track_id.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::InvalidTrackId(track_id.to_string()));
    }
    Ok(())
}

fn update_prefix(track_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(track_id.len() + 1);
    key.extend_from_slice(track_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

fn update_key(track_id: &str, seq: u64) -> Vec<u8> {
    let mut key = update_prefix(track_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
