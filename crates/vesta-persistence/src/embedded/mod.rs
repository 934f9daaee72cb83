// Embedded release content store using RocksDB
// Keeps active release bodies on local disk so the metadata index stays small

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options,
    WriteBatch,
};
use tracing::info;

use crate::traits::ReleaseContentStore;

/// Column family holding release content
pub const CF_RELEASE_CONTENT: &str = "release_content";

/// Separates the owner-key bucket from the active key inside a RocksDB key
const BUCKET_SEPARATOR: u8 = 0x1f;

/// RocksDB-backed offload store
///
/// Buckets are emulated with a key prefix: `owner_key 0x1f active_key`.
pub struct RocksContentStore {
    db: Arc<DB>,
}

impl RocksContentStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);

        let mut cf_opts = Options::default();
        cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        cf_opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_RELEASE_CONTENT, cf_opts)];
        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)
            .map_err(|e| anyhow::anyhow!("RocksDB open error: {}", e))?;

        info!(path = %path.as_ref().display(), "release content store opened");
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self) -> anyhow::Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_RELEASE_CONTENT)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", CF_RELEASE_CONTENT))
    }

    fn bucket_prefix(owner_key: &str) -> Vec<u8> {
        let mut prefix = owner_key.as_bytes().to_vec();
        prefix.push(BUCKET_SEPARATOR);
        prefix
    }

    fn entry_key(owner_key: &str, active_key: &str) -> Vec<u8> {
        let mut key = Self::bucket_prefix(owner_key);
        key.extend_from_slice(active_key.as_bytes());
        key
    }
}

impl ReleaseContentStore for RocksContentStore {
    fn put(&self, owner_key: &str, active_key: &str, content: &str) -> anyhow::Result<()> {
        self.db
            .put_cf(self.cf()?, Self::entry_key(owner_key, active_key), content.as_bytes())
            .map_err(|e| anyhow::anyhow!("RocksDB put error: {}", e))
    }

    fn get(&self, owner_key: &str, active_key: &str) -> anyhow::Result<Option<String>> {
        let value = self
            .db
            .get_cf(self.cf()?, Self::entry_key(owner_key, active_key))
            .map_err(|e| anyhow::anyhow!("RocksDB get error: {}", e))?;
        value
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| anyhow::anyhow!("release content is not valid UTF-8: {}", e))
            })
            .transpose()
    }

    fn delete(&self, owner_key: &str, active_key: &str) -> anyhow::Result<()> {
        self.db
            .delete_cf(self.cf()?, Self::entry_key(owner_key, active_key))
            .map_err(|e| anyhow::anyhow!("RocksDB delete error: {}", e))
    }

    fn bucket_keys(&self, owner_key: &str) -> anyhow::Result<Vec<String>> {
        let prefix = Self::bucket_prefix(owner_key);
        let mut keys = Vec::new();
        let mode = IteratorMode::From(prefix.as_slice(), Direction::Forward);
        for item in self.db.iterator_cf(self.cf()?, mode) {
            let (key, _) = item.map_err(|e| anyhow::anyhow!("RocksDB iterate error: {}", e))?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(keys)
    }

    fn clear(&self) -> anyhow::Result<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| anyhow::anyhow!("RocksDB iterate error: {}", e))?;
            batch.delete_cf(cf, key);
        }
        self.db
            .write(batch)
            .map_err(|e| anyhow::anyhow!("RocksDB write error: {}", e))
    }
}
