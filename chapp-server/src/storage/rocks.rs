//! RocksDB-backed key-value store.
//!
//! Column families:
//! - `records`: plain `SET`/`GET`/`DEL` keys (message JSON)
//! - `lists`: one value per list key, bincode `VecDeque<String>` compressed with LZ4
//!
//! List operations are read-modify-write on the whole blob, serialized by
//! `list_lock`. `set_and_push` puts the record and the updated list in one
//! `WriteBatch`, so a crash never leaves one without the other.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{remove_matches, resolve_range, BackendError, KvBackend};

/// Column family names.
const CF_RECORDS: &str = "records";
const CF_LISTS: &str = "lists";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_LISTS];

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chapp_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
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

/// Persistent backend on RocksDB.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes list read-modify-write cycles.
    list_lock: Mutex<()>,
}

impl RocksBackend {
    /// Open (or create) the database at `config.path`.
    ///
    /// Opening the same path twice in one process fails with a lock error
    /// from RocksDB; share one handle instead.
    pub fn open(config: RocksConfig) -> Result<Self, BackendError> {
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

        log::info!("Opened RocksDB backend at {}", config.path.display());

        Ok(Self {
            db,
            config,
            list_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS => {
                // Small JSON values, point lookups only
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_LISTS => {
                // Blobs are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, BackendError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| BackendError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock_lists(&self) -> MutexGuard<'_, ()> {
        self.list_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_list(&self, list: &str) -> Result<VecDeque<String>, BackendError> {
        let cf = self.cf(CF_LISTS)?;
        match self.db.get_cf(cf, list.as_bytes())? {
            Some(blob) => decode_list(&blob),
            None => Ok(VecDeque::new()),
        }
    }

    fn list_batch(
        &self,
        batch: &mut WriteBatch,
        list: &str,
        entries: &VecDeque<String>,
    ) -> Result<(), BackendError> {
        let cf = self.cf(CF_LISTS)?;
        if entries.is_empty() {
            batch.delete_cf(cf, list.as_bytes());
        } else {
            batch.put_cf(cf, list.as_bytes(), encode_list(entries)?);
        }
        Ok(())
    }
}

impl KvBackend for RocksBackend {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let cf = self.cf(CF_RECORDS)?;
        self.db
            .put_cf_opt(cf, key.as_bytes(), value.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| BackendError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn del(&self, key: &str) -> Result<bool, BackendError> {
        let cf = self.cf(CF_RECORDS)?;
        let existed = self.db.get_cf(cf, key.as_bytes())?.is_some();
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        Ok(existed)
    }

    fn lpush(&self, list: &str, value: &str) -> Result<usize, BackendError> {
        let _guard = self.lock_lists();
        let mut entries = self.load_list(list)?;
        entries.push_front(value.to_string());

        let mut batch = WriteBatch::default();
        self.list_batch(&mut batch, list, &entries)?;
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(entries.len())
    }

    fn lrange(&self, list: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError> {
        let entries = self.load_list(list)?;
        Ok(match resolve_range(entries.len(), start, stop) {
            Some((from, to)) => entries.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    fn lrem(&self, list: &str, count: i64, value: &str) -> Result<usize, BackendError> {
        let _guard = self.lock_lists();
        let mut entries = self.load_list(list)?;
        let removed = remove_matches(&mut entries, count, value);
        if removed > 0 {
            let mut batch = WriteBatch::default();
            self.list_batch(&mut batch, list, &entries)?;
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }

    fn set_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        item: &str,
    ) -> Result<(), BackendError> {
        let cf_records = self.cf(CF_RECORDS)?;

        let _guard = self.lock_lists();
        let mut entries = self.load_list(list)?;
        entries.push_front(item.to_string());

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_records, key.as_bytes(), value.as_bytes());
        self.list_batch(&mut batch, list, &entries)?;
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.db.flush()?;
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

fn encode_list(entries: &VecDeque<String>) -> Result<Vec<u8>, BackendError> {
    let bytes = bincode::serde::encode_to_vec(entries, bincode::config::standard())
        .map_err(|e| BackendError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_list(blob: &[u8]) -> Result<VecDeque<String>, BackendError> {
    let bytes = lz4_flex::decompress_size_prepended(blob)
        .map_err(|e| BackendError::Compression(e.to_string()))?;
    let (entries, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| BackendError::Serialization(e.to_string()))?;
    Ok(entries)
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

    fn open_temp() -> (tempfile::TempDir, RocksBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksBackend::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, kv) = open_temp();
        assert!(kv.path().exists());
    }

    #[test]
    fn test_set_get_del() {
        let (_dir, kv) = open_temp();
        kv.set("message_a", r#"{"id":"a"}"#).unwrap();
        assert_eq!(kv.get("message_a").unwrap().as_deref(), Some(r#"{"id":"a"}"#));
        assert!(kv.del("message_a").unwrap());
        assert!(!kv.del("message_a").unwrap());
        assert_eq!(kv.get("message_a").unwrap(), None);
    }

    #[test]
    fn test_list_ops() {
        let (_dir, kv) = open_temp();
        for v in ["1", "2", "3", "2"] {
            kv.lpush("idx", v).unwrap();
        }
        assert_eq!(kv.lrange("idx", 0, -1).unwrap(), vec!["2", "3", "2", "1"]);
        assert_eq!(kv.lrange("idx", 1, 2).unwrap(), vec!["3", "2"]);

        assert_eq!(kv.lrem("idx", 0, "2").unwrap(), 2);
        assert_eq!(kv.lrange("idx", 0, -1).unwrap(), vec!["3", "1"]);

        assert_eq!(kv.lrem("idx", 0, "3").unwrap(), 1);
        assert_eq!(kv.lrem("idx", 0, "1").unwrap(), 1);
        assert!(kv.lrange("idx", 0, -1).unwrap().is_empty());
    }

    #[test]
    fn test_set_and_push_single_batch() {
        let (_dir, kv) = open_temp();
        kv.set_and_push("message_x", "{}", "idx", "x").unwrap();
        kv.set_and_push("message_y", "{}", "idx", "y").unwrap();
        assert_eq!(kv.lrange("idx", 0, -1).unwrap(), vec!["y", "x"]);
        assert!(kv.get("message_x").unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = RocksConfig::for_testing(dir.path().join("db"));

        {
            let kv = RocksBackend::open(config.clone()).unwrap();
            kv.set_and_push("message_1", "one", "idx", "1").unwrap();
            kv.lpush("idx", "2").unwrap();
            kv.flush().unwrap();
        }

        let kv = RocksBackend::open(config).unwrap();
        assert_eq!(kv.get("message_1").unwrap().as_deref(), Some("one"));
        assert_eq!(kv.lrange("idx", 0, -1).unwrap(), vec!["2", "1"]);
    }

    #[test]
    fn test_corrupt_list_blob() {
        let (_dir, kv) = open_temp();
        let cf = kv.cf(CF_LISTS).unwrap();
        let garbage = lz4_flex::compress_prepend_size(&[0xFF, 0xFF, 0xFF]);
        kv.db.put_cf(cf, b"idx", garbage).unwrap();
        assert!(kv.lrange("idx", 0, -1).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = RocksConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(config.path, PathBuf::from("chapp_data"));
    }
}
