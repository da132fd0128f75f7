//! # bptree-kv
//!
//! An embedded, single-node key-value store backed by a paged, disk-resident
//! B+ tree. Fixed-width integer keys map to fixed-width integer values with
//! point lookup, insert, update and delete under concurrent access from
//! multiple threads within one process.
//!
//! ## Architecture
//!
//! The engine is composed of layered components:
//!
//! - **Storage Layer** (`storage`): page-granular I/O against a single
//!   backing file
//! - **Buffer Pool** (`buffer`): a fixed set of pinned-counted page frames
//!   with strict-LRU eviction
//! - **Page Layer** (`page`): in-place leaf and internal node layouts
//! - **B+ Tree** (`btree`): concurrent tree operations using latch crabbing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bptree_kv::{Config, KvStore};
//!
//! let store = KvStore::open(Config::new("my_database.db"))?;
//!
//! store.insert(1, 100)?;
//! assert_eq!(store.get(1)?, 100);
//!
//! store.remove(1)?;
//! assert_eq!(store.get(1)?, KvStore::NOT_FOUND);
//! ```

pub mod btree;
pub mod buffer;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

pub use error::{Result, StorageError};
pub use types::{Key, PageId, TreeConfig, Value, PAGE_SIZE};

// Re-export main public API
pub use btree::BPlusTree;
pub use buffer::BufferPoolManager;
pub use storage::DiskManager;

use std::path::PathBuf;
use std::sync::Arc;

/// Store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the database file
    pub path: PathBuf,
    /// Buffer pool size in number of frames (default: 1000)
    pub pool_size: usize,
    /// B+ tree configuration for node limits
    pub tree_config: TreeConfig,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            pool_size: 1000,
            tree_config: TreeConfig::default(),
        }
    }

    /// Set the buffer pool size
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the B+ tree configuration
    pub fn tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config;
        self
    }
}

/// Main store handle providing key-value access backed by the B+ tree.
///
/// Every operation may be called concurrently from multiple threads.
pub struct KvStore {
    tree: BPlusTree,
    pool: Arc<BufferPoolManager>,
}

impl KvStore {
    /// Sentinel returned by [`get`](Self::get) for absent keys
    pub const NOT_FOUND: Value = -1;

    /// Open or create a store at the configured path
    pub fn open(config: Config) -> Result<Self> {
        let disk = DiskManager::open(&config.path)?;
        let pool = Arc::new(BufferPoolManager::new(config.pool_size, disk));
        let tree = BPlusTree::with_config(Arc::clone(&pool), config.tree_config);

        Ok(Self { tree, pool })
    }

    /// Get the value for `key`, or [`NOT_FOUND`](Self::NOT_FOUND)
    pub fn get(&self, key: Key) -> Result<Value> {
        Ok(self.tree.get_value(key)?.unwrap_or(Self::NOT_FOUND))
    }

    /// Insert a key-value pair; false when the key already exists
    pub fn insert(&self, key: Key, value: Value) -> Result<bool> {
        self.tree.insert(key, value)
    }

    /// Update is insert-on-absent: an existing key is left untouched and
    /// reported as false
    pub fn update(&self, key: Key, value: Value) -> Result<bool> {
        self.tree.insert(key, value)
    }

    /// Remove a key; false when it was absent
    pub fn remove(&self, key: Key) -> Result<bool> {
        self.tree.remove(key)
    }

    /// Write every resident page back to the backing file
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all_pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (KvStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("test.db")).pool_size(50);
        (KvStore::open(config).unwrap(), dir)
    }

    #[test]
    fn test_basic_operations() -> Result<()> {
        let (store, _dir) = test_store();

        assert!(store.insert(1, 100)?);
        assert_eq!(store.get(1)?, 100);

        assert!(store.remove(1)?);
        assert_eq!(store.get(1)?, KvStore::NOT_FOUND);
        assert!(!store.remove(1)?);

        assert_eq!(store.get(999)?, KvStore::NOT_FOUND);

        Ok(())
    }

    #[test]
    fn test_insert_then_remove_then_get() -> Result<()> {
        let (store, _dir) = test_store();

        assert!(store.insert(5, 55)?);
        assert_eq!(store.get(5)?, 55);
        assert!(store.remove(5)?);
        assert_eq!(store.get(5)?, KvStore::NOT_FOUND);

        Ok(())
    }

    #[test]
    fn test_duplicate_insert_keeps_first_value() -> Result<()> {
        let (store, _dir) = test_store();

        assert!(store.insert(7, 1)?);
        assert!(!store.insert(7, 2)?);
        assert_eq!(store.get(7)?, 1);

        // Update has the same insert-on-absent contract.
        assert!(!store.update(7, 3)?);
        assert_eq!(store.get(7)?, 1);
        assert!(store.update(8, 80)?);
        assert_eq!(store.get(8)?, 80);

        Ok(())
    }

    #[test]
    fn test_many_entries_with_flush() -> Result<()> {
        let (store, _dir) = test_store();

        for key in 0i64..2_000 {
            assert!(store.insert(key, (key + 100) as Value)?);
        }
        store.flush()?;

        for key in 0i64..2_000 {
            assert_eq!(store.get(key)?, (key + 100) as Value);
        }

        Ok(())
    }
}
