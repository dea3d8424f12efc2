//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: encoded `{doc, version}` records, one key per document name
//! - `metadata`: per-document metadata (bincode: version, size, timestamps)
//!
//! Records arrive already LZ4-compressed from [`Disk`](super::Disk), so the
//! `documents` family stores them without a second compression pass.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::backend::DiskBackend;
use super::DiskError;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false; Disk already batches writes)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
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

/// Metadata stored alongside each record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_name: String,
    /// Version of the stored record
    pub version: u64,
    /// Encoded record size in bytes
    pub stored_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
    /// Number of writes this document received
    pub write_count: u64,
}

impl DocumentMetadata {
    fn new(doc_name: &str) -> Self {
        let now = now_secs();
        Self {
            doc_name: doc_name.to_string(),
            version: 0,
            stored_size: 0,
            created_at: now,
            updated_at: now,
            write_count: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, DiskError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DiskError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, DiskError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DiskError::Decode(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<rocksdb::Error> for DiskError {
    fn from(e: rocksdb::Error) -> Self {
        DiskError::Backend(e.to_string())
    }
}

/// RocksDB document store.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBackend {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: RocksConfig) -> Result<Self, DiskError> {
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

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
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
            CF_DOCUMENTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn load_metadata(&self, doc_name: &str) -> Result<Option<DocumentMetadata>, DiskError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_name.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a document and its metadata.
    pub fn delete(&self, doc_name: &str) -> Result<(), DiskError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, doc_name.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, doc_name.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), DiskError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, DiskError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DiskError::Backend(format!("Column family '{name}' not found")))
    }
}

impl DiskBackend for RocksBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, DiskError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    fn write(&self, key: &str, bytes: &[u8], version: u64) -> Result<(), DiskError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(key)?
            .unwrap_or_else(|| DocumentMetadata::new(key));
        meta.version = version;
        meta.stored_size = bytes.len() as u64;
        meta.updated_at = now_secs();
        meta.write_count += 1;

        // Record and metadata land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key.as_bytes(), bytes);
        batch.put_cf(cf_meta, key.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, DiskError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| DiskError::Decode("document key is not UTF-8".into()))?;
            keys.push(name);
        }
        Ok(keys)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksBackend {
        RocksBackend::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.read("nope").unwrap(), None);
        assert_eq!(store.load_metadata("nope").unwrap(), None);
    }

    #[test]
    fn test_write_read_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        store.write("notes", b"first", 1).unwrap();
        store.write("notes", b"second record", 7).unwrap();

        assert_eq!(store.read("notes").unwrap(), Some(b"second record".to_vec()));
        let meta = store.load_metadata("notes").unwrap().unwrap();
        assert_eq!(meta.doc_name, "notes");
        assert_eq!(meta.version, 7);
        assert_eq!(meta.stored_size, 13);
        assert_eq!(meta.write_count, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_keys_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.write("b", b"2", 1).unwrap();
        store.write("a", b"1", 1).unwrap();

        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete("a").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
        assert_eq!(store.read("a").unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.write("notes", b"durable", 3).unwrap();
            store.sync().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.read("notes").unwrap(), Some(b"durable".to_vec()));
        assert_eq!(store.load_metadata("notes").unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_config_default() {
        let config = RocksConfig::default();
        assert_eq!(config.path, PathBuf::from("scribe_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
