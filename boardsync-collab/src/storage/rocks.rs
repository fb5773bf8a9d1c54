//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: full replica state per room (LZ4 compressed)
//! - `metadata`: per-room bookkeeping (sizes, save count, timestamps)
//!
//! Snapshot and metadata are written in one atomic batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("boardsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Number of times this room has been saved
    pub save_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(room: &str) -> Self {
        let now = unix_now();
        Self {
            room: room.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            save_count: 0,
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

/// RocksDB snapshot store.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if needed.
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
        log::info!("Opened snapshot store at {}", config.path.display());

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
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are LZ4 framed already.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    /// Save a full snapshot (LZ4 compressed) and update its metadata.
    pub fn save_snapshot(&self, room: &str, snapshot: &[u8]) -> Result<SnapshotMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(room)?
            .unwrap_or_else(|| SnapshotMetadata::new(room));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.save_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot for room {}: {} bytes ({} compressed)",
            room,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, room: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All rooms with a stored snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, room.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, room.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_snapshot(room)
    }

    fn put(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_snapshot(room, snapshot).map(|_| ())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_open() {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_save_load() {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let data = b"board snapshot with enough repeated data data data to compress".to_vec();

        let meta = store.save_snapshot("board-1", &data).unwrap();
        assert_eq!(meta.room, "board-1");
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert_eq!(meta.save_count, 1);

        assert_eq!(store.load_snapshot("board-1").unwrap(), Some(data));
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(store.load_snapshot("nope").unwrap(), None);
        assert_eq!(store.load_metadata("nope").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_and_counts() {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.put("board-1", b"first").unwrap();
        store.put("board-1", b"second").unwrap();

        assert_eq!(store.get("board-1").unwrap(), Some(b"second".to_vec()));
        let meta = store.load_metadata("board-1").unwrap().unwrap();
        assert_eq!(meta.save_count, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.put("a", b"alpha").unwrap();
        store.put("b", b"beta").unwrap();

        let mut rooms = store.list_rooms().unwrap();
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);

        store.delete_room("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(b"beta".to_vec()));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put("board-1", &[7u8; 4096]).unwrap();
            store.sync().unwrap();
        }
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get("board-1").unwrap(), Some(vec![7u8; 4096]));
    }
}
