//! Database backends
//!
//! The multistore persists through the [`Database`] trait. Two backends
//! are provided:
//!
//! - [`RocksDatabase`] - RocksDB with one column family per [`Column`]
//! - [`MemDatabase`] - ordered in-process maps, for tests
//!
//! # Column Families
//!
//! - `meta` - Latest version and per-version commit info
//! - `partitions` - Per-version change sets (key: name || 0x00 || version)
//!   and periodic full snapshots (key: name || 0x01 || version)

use crate::{
    config::{Backend, Config},
    error::{Error, Result},
};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Column family names
const CF_META: &str = "meta";
const CF_PARTITIONS: &str = "partitions";

/// Logical column of the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Column {
    /// Commit metadata
    Meta,
    /// Versioned partition snapshots
    Partitions,
}

impl Column {
    fn cf_name(self) -> &'static str {
        match self {
            Column::Meta => CF_META,
            Column::Partitions => CF_PARTITIONS,
        }
    }
}

/// Atomic group of writes
#[derive(Debug, Default)]
pub struct DbBatch {
    ops: Vec<(Column, Vec<u8>, Option<Vec<u8>>)>,
}

impl DbBatch {
    /// Create empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put
    pub fn put(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((column, key, Some(value)));
    }

    /// Queue a delete
    pub fn delete(&mut self, column: Column, key: Vec<u8>) {
        self.ops.push((column, key, None));
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage engine seam used by the multistore
pub trait Database: Send + Sync + fmt::Debug {
    /// Point read
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply a batch atomically
    fn write(&self, batch: DbBatch) -> Result<()>;

    /// Greatest entry whose key is `<= key` and starts with `prefix`
    fn seek_prev(&self, column: Column, prefix: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Entries with `from <= key <= to`, in key order
    fn scan(&self, column: Column, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Open the backend selected by configuration
pub fn open_database(config: &Config) -> Result<Arc<dyn Database>> {
    match config.backend {
        Backend::RocksDb => Ok(Arc::new(RocksDatabase::open(config)?)),
        Backend::Memory => Ok(Arc::new(MemDatabase::new())),
    }
}

/// RocksDB-backed database
pub struct RocksDatabase {
    db: DB,
    sync_writes: bool,
}

impl fmt::Debug for RocksDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksDatabase")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDatabase {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_META, Self::cf_options_meta()),
            ColumnFamilyDescriptor::new(CF_PARTITIONS, Self::cf_options_partitions()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf_options_meta() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_partitions() -> Options {
        let mut opts = Options::default();
        // Snapshots are written once and read on reload
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, column: Column) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(column.cf_name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", column.cf_name())))
    }
}

impl Database for RocksDatabase {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(column)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn write(&self, batch: DbBatch) -> Result<()> {
        let mut write_batch = WriteBatch::default();
        for (column, key, value) in batch.ops {
            let cf = self.cf_handle(column)?;
            match value {
                Some(value) => write_batch.put_cf(cf, key, value),
                None => write_batch.delete_cf(cf, key),
            }
        }

        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(write_batch, &opts)?;
        Ok(())
    }

    fn seek_prev(&self, column: Column, prefix: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(column)?;
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(key, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (found_key, value) = item?;
                if found_key.starts_with(prefix) {
                    Ok(Some((found_key.to_vec(), value.to_vec())))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn scan(&self, column: Column, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(column)?;
        let mut found = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(from, Direction::Forward))
        {
            let (key, value) = item?;
            if &key[..] > to {
                break;
            }
            found.push((key.to_vec(), value.to_vec()));
        }
        Ok(found)
    }
}

/// In-memory database
#[derive(Debug, Default)]
pub struct MemDatabase {
    columns: RwLock<BTreeMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemDatabase {
    /// Create empty database
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemDatabase {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let columns = self.columns.read();
        Ok(columns.get(&column).and_then(|c| c.get(key).cloned()))
    }

    fn write(&self, batch: DbBatch) -> Result<()> {
        let mut columns = self.columns.write();
        for (column, key, value) in batch.ops {
            let entries = columns.entry(column).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn seek_prev(&self, column: Column, prefix: &[u8], key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let columns = self.columns.read();
        let found = columns.get(&column).and_then(|entries| {
            entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
        });
        Ok(found)
    }

    fn scan(&self, column: Column, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if from > to {
            return Ok(Vec::new());
        }
        let columns = self.columns.read();
        let found = columns
            .get(&column)
            .map(|entries| {
                entries
                    .range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rocks() -> (RocksDatabase, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (RocksDatabase::open(&config).unwrap(), temp_dir)
    }

    fn exercise(db: &dyn Database) {
        let mut batch = DbBatch::new();
        batch.put(Column::Partitions, b"acc\x00\x01".to_vec(), b"v1".to_vec());
        batch.put(Column::Partitions, b"acc\x00\x03".to_vec(), b"v3".to_vec());
        batch.put(Column::Partitions, b"bank\x00\x01".to_vec(), b"b1".to_vec());
        batch.put(Column::Meta, b"latest".to_vec(), b"3".to_vec());
        db.write(batch).unwrap();

        assert_eq!(db.get(Column::Meta, b"latest").unwrap(), Some(b"3".to_vec()));
        assert_eq!(db.get(Column::Partitions, b"latest").unwrap(), None);

        let found = db.seek_prev(Column::Partitions, b"acc\x00", b"acc\x00\x02").unwrap();
        assert_eq!(found.map(|(_, v)| v), Some(b"v1".to_vec()));

        let found = db.seek_prev(Column::Partitions, b"acc\x00", b"acc\x00\x09").unwrap();
        assert_eq!(found.map(|(_, v)| v), Some(b"v3".to_vec()));

        // Nothing under this prefix at or before the key
        let found = db.seek_prev(Column::Partitions, b"bank\x00", b"bank\x00\x00").unwrap();
        assert!(found.is_none());

        let found = db.scan(Column::Partitions, b"acc\x00\x00", b"acc\x00\x03").unwrap();
        let values: Vec<_> = found.into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![b"v1".to_vec(), b"v3".to_vec()]);
        assert!(db.scan(Column::Partitions, b"acc\x00\x02", b"acc\x00\x01").unwrap().is_empty());

        let mut batch = DbBatch::new();
        batch.delete(Column::Meta, b"latest".to_vec());
        db.write(batch).unwrap();
        assert_eq!(db.get(Column::Meta, b"latest").unwrap(), None);
    }

    #[test]
    fn test_mem_database() {
        exercise(&MemDatabase::new());
    }

    #[test]
    fn test_rocks_database() {
        let (db, _temp) = rocks();
        exercise(&db);
    }
}
