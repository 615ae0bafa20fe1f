pub mod rocksdb_store;

pub use rocksdb_store::RocksStore;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One atomic unit of writes: either everything lands or nothing does.
#[derive(Debug, Default)]
pub struct Batch {
    pub puts: Vec<Entry>,
    pub merges: Vec<Entry>,
    pub deletes: Vec<Vec<u8>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.merges.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IterOptions {
    pub reverse: bool,
    /// Hint only; some backends cannot skip value loads.
    pub fetch_values: bool,
}

impl IterOptions {
    pub fn reverse() -> Self {
        Self {
            reverse: true,
            fetch_values: true,
        }
    }
}

/// Cursor over the ordered keyspace. In forward mode `seek` lands on the
/// first key >= target and `next` advances; in reverse mode `seek` lands on
/// the last key <= target and `next` steps backwards.
pub trait RangeIter: Send {
    fn seek(&mut self, key: &[u8]);
    fn valid(&self) -> bool;
    fn valid_for_prefix(&self, prefix: &[u8]) -> bool;
    fn key(&self) -> Option<&[u8]>;
    fn value(&self) -> Option<&[u8]>;
    fn next(&mut self);
}

/// Reduction folded into the store for keys written with `merge`: given the
/// existing value (if any) and one operand, produce the value to keep, or
/// `None` to signal a malformed operand (the existing value then survives).
pub type MergeFn = fn(existing: Option<&[u8]>, operand: &[u8]) -> Option<Vec<u8>>;

#[derive(Clone)]
pub struct MergeOperator {
    pub name: &'static str,
    pub merge: MergeFn,
}

impl std::fmt::Debug for MergeOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOperator").field("name", &self.name).finish()
    }
}

/// Ordered key/value store backing every partition log.
pub trait Store: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn batch_put(&self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Apply the registered merge operator to `key`.
    fn merge(&self, key: &[u8], operand: &[u8]) -> Result<(), StorageError>;

    /// Apply a mixed batch of puts, merges and deletes atomically.
    fn write(&self, batch: Batch) -> Result<(), StorageError>;

    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    fn batch_delete(&self, keys: &[Vec<u8>]) -> Result<(), StorageError>;

    fn iter(&self, opts: IterOptions) -> Box<dyn RangeIter + '_>;

    /// Delete every key under `prefix` starting at `min`, in chunks of
    /// `batch_size` keys per write.
    fn truncate(&self, prefix: &[u8], min: &[u8], batch_size: usize) -> Result<(), StorageError>;
}
