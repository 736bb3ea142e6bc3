//! Storage backends
//!
//! A backend maps the cache's two logical tables onto an embedded storage
//! engine. Keys are owned by the backend (native types, engine-specific
//! encoding and ordering); values are opaque bytes produced by a chain.
//!
//! - **sqlite**: rusqlite, supports server-side row transforms
//! - **sled_store**: sled trees, per-operation durability, atomic batches
//!
//! # Capability model
//!
//! ```text
//! get / set / delete / scan_page / len / clear      required
//! begin_transaction / commit / rollback / write_batch required
//! forces_per_op_commit                               flag
//! supports_server_side_row_transform                 optional capability
//!   └─ apply_row_transform(table, chain, f)          engine-driven rewrite
//! ```

pub mod sled_store;
pub mod sqlite;

use crate::error::{CacheError, CacheResult};
use crate::transform::ChainId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;

pub use sled_store::SledBackend;
pub use sqlite::SqliteBackend;

/// Rows fetched per round trip by [`RowIter`]
pub const SCAN_PAGE_SIZE: usize = 512;

/// A cache key
///
/// Ordering is `Int < Text < Bytes`, then natural ordering within a
/// variant. Backends must preserve this ordering when iterating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{:?}", s),
            Key::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl Key {
    /// Key for a value of any serializable type
    ///
    /// The JSON encoding of `key` becomes a [`Key::Bytes`], whatever chain
    /// the values use. Equal keys must encode equally, so maps need a
    /// stable field order (structs, `BTreeMap`, `serde_json::Value`).
    pub fn from_serialized<K: Serialize + ?Sized>(key: &K) -> CacheResult<Self> {
        Ok(Key::Bytes(serde_json::to_vec(key)?))
    }

    /// Inverse of [`Key::from_serialized`]
    pub fn decode_serialized<K: DeserializeOwned>(&self) -> CacheResult<K> {
        match self {
            Key::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            other => Err(CacheError::Serialization(format!(
                "key {} was not built from a serialized value",
                other
            ))),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key::Int(value as i64)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Key::Text(value.clone())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Key::Bytes(value)
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Key::Bytes(value.to_vec())
    }
}

impl From<&Key> for Key {
    fn from(value: &Key) -> Self {
        value.clone()
    }
}

/// Logical tables every backend provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    /// Cache records
    Data,
    /// Chain descriptors, dictionaries, settings
    Metadata,
}

impl TableName {
    pub const ALL: [TableName; 2] = [TableName::Data, TableName::Metadata];

    /// Physical name used inside the engine
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Data => "cache",
            TableName::Metadata => "metadata",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored row: value bytes plus the chain that produced them
///
/// Metadata rows carry no chain unless they belong to one (dictionaries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub chain_id: Option<ChainId>,
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(chain_id: Option<ChainId>, value: Vec<u8>) -> Self {
        Self { chain_id, value }
    }

    /// A row that belongs to no chain
    pub fn plain(value: Vec<u8>) -> Self {
        Self {
            chain_id: None,
            value,
        }
    }
}

/// One write in an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { table: TableName, key: Key, row: Row },
    Delete { table: TableName, key: Key },
}

impl BatchOp {
    pub fn table(&self) -> TableName {
        match self {
            BatchOp::Put { table, .. } | BatchOp::Delete { table, .. } => *table,
        }
    }
}

/// Row count and value byte totals for a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSize {
    pub rows: u64,
    pub value_bytes: u64,
}

/// A diagnostic engine option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOption {
    Enabled,
    Number(i64),
    Text(String),
}

impl fmt::Display for EngineOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineOption::Enabled => f.write_str("enabled"),
            EngineOption::Number(n) => write!(f, "{}", n),
            EngineOption::Text(s) => f.write_str(s),
        }
    }
}

/// Callable run by the engine on every row of a server-side transform
pub type RowTransform = Box<dyn FnMut(&Key, &[u8]) -> CacheResult<Vec<u8>> + Send>;

/// Unified key-value table interface over an embedded storage engine
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Location on disk, `None` for in-memory/temporary stores
    fn path(&self) -> Option<&Path>;

    fn table_exists(&self, table: TableName) -> CacheResult<bool>;

    fn create_table(&mut self, table: TableName) -> CacheResult<()>;

    fn get(&self, table: TableName, key: &Key) -> CacheResult<Option<Row>>;

    /// Upsert
    fn set(&mut self, table: TableName, key: &Key, row: &Row) -> CacheResult<()>;

    /// Returns `true` if the key existed
    fn delete(&mut self, table: TableName, key: &Key) -> CacheResult<bool>;

    fn contains(&self, table: TableName, key: &Key) -> CacheResult<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// Up to `limit` rows with keys strictly greater than `after`, in key order
    fn scan_page(
        &self,
        table: TableName,
        after: Option<&Key>,
        limit: usize,
    ) -> CacheResult<Vec<(Key, Row)>>;

    fn len(&self, table: TableName) -> CacheResult<u64>;

    fn data_size(&self, table: TableName) -> CacheResult<DataSize>;

    /// Remove every row, keeping the table
    fn clear(&mut self, table: TableName) -> CacheResult<()>;

    fn begin_transaction(&mut self) -> CacheResult<()>;

    fn commit(&mut self) -> CacheResult<()>;

    /// Discard uncommitted writes
    fn rollback(&mut self) -> CacheResult<()>;

    /// Apply all ops atomically, across tables
    fn write_batch(&mut self, ops: Vec<BatchOp>) -> CacheResult<()>;

    /// Every operation is durable on its own; commit counters are ignored
    fn forces_per_op_commit(&self) -> bool {
        false
    }

    fn supports_server_side_row_transform(&self) -> bool {
        false
    }

    /// Rewrite the value of every row under `chain_id` inside the engine
    ///
    /// Runs within the current transaction. Returns the number of rows
    /// rewritten.
    fn apply_row_transform(
        &mut self,
        table: TableName,
        chain_id: ChainId,
        _transform: RowTransform,
    ) -> CacheResult<u64> {
        Err(CacheError::Configuration(format!(
            "{} backend cannot transform rows of `{}` server-side (chain {})",
            self.kind(),
            table,
            chain_id
        )))
    }

    /// Engine build/compile options
    fn engine_options(&self) -> CacheResult<BTreeMap<String, EngineOption>>;

    fn vacuum(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn optimize(&mut self) -> CacheResult<()> {
        Ok(())
    }
}

impl<'b> dyn Backend + 'b {
    /// Lazily iterate every row of a table in key order
    ///
    /// Finite; to restart, call again.
    pub fn iter_all(&self, table: TableName) -> RowIter<'_> {
        RowIter {
            backend: self,
            table,
            cursor: None,
            page: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Paged iterator over a table, see [`Backend::scan_page`]
pub struct RowIter<'a> {
    backend: &'a dyn Backend,
    table: TableName,
    cursor: Option<Key>,
    page: VecDeque<(Key, Row)>,
    exhausted: bool,
}

impl Iterator for RowIter<'_> {
    type Item = CacheResult<(Key, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self
                .backend
                .scan_page(self.table, self.cursor.as_ref(), SCAN_PAGE_SIZE)
            {
                Ok(rows) => {
                    if rows.len() < SCAN_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some((last, _)) = rows.last() {
                        self.cursor = Some(last.clone());
                    }
                    self.page.extend(rows);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

/// Supported storage engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Sled,
}

impl BackendKind {
    pub const ALL: &'static [BackendKind] = &[BackendKind::Sqlite, BackendKind::Sled];

    /// File extensions (lowercase, without dot) that select this backend
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Sqlite => &["sqlite", "sqlite3", "db"],
            BackendKind::Sled => &["sled"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Sled => "sled",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Pick a backend by the path's extension
    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| {
                CacheError::Configuration(format!(
                    "cannot pick a backend for {:?}: path has no extension",
                    path
                ))
            })?;

        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.extensions().contains(&ext.as_str()))
            .ok_or_else(|| {
                CacheError::Configuration(format!(
                    "unsupported storage extension `.{}` for {:?}",
                    ext, path
                ))
            })
    }

    /// Open (creating if needed) a store of this kind at `path`
    pub fn open(&self, path: &Path) -> CacheResult<Box<dyn Backend>> {
        Ok(match self {
            BackendKind::Sqlite => Box::new(SqliteBackend::open(path)?),
            BackendKind::Sled => Box::new(SledBackend::open(path)?),
        })
    }

    /// Delete a closed store of this kind at `path`; missing is fine
    ///
    /// SQLite's `-wal`/`-shm` side files go with the database file, a sled
    /// store is a whole directory.
    pub fn remove(&self, path: &Path) -> CacheResult<()> {
        fn ignore_missing(result: std::io::Result<()>) -> CacheResult<()> {
            match result {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => Ok(other?),
            }
        }

        match self {
            BackendKind::Sqlite => {
                for suffix in ["-wal", "-shm"] {
                    let mut side = path.as_os_str().to_owned();
                    side.push(suffix);
                    ignore_missing(std::fs::remove_file(side))?;
                }
                ignore_missing(std::fs::remove_file(path))
            }
            BackendKind::Sled => ignore_missing(std::fs::remove_dir_all(path)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_backend_from_extension() {
        assert_eq!(
            BackendKind::from_path(&PathBuf::from("./cache.sqlite")).unwrap(),
            BackendKind::Sqlite
        );
        assert_eq!(
            BackendKind::from_path(&PathBuf::from("/tmp/x.DB")).unwrap(),
            BackendKind::Sqlite
        );
        assert_eq!(
            BackendKind::from_path(&PathBuf::from("data/cache.sled")).unwrap(),
            BackendKind::Sled
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let err = BackendKind::from_path(&PathBuf::from("cache.parquet")).unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));

        let err = BackendKind::from_path(&PathBuf::from("cache")).unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_serialized_keys() {
        let key = Key::from_serialized(&vec![1, 2]).unwrap();
        assert_eq!(key, Key::Bytes(b"[1,2]".to_vec()));
        assert_eq!(key.decode_serialized::<Vec<i32>>().unwrap(), vec![1, 2]);

        let float = Key::from_serialized(&2.0f64).unwrap();
        assert_ne!(float, Key::from_serialized(&2i64).unwrap());
        assert_eq!(float.decode_serialized::<f64>().unwrap(), 2.0);

        let err = Key::Int(1).decode_serialized::<i64>().unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::from(vec![0u8]),
            Key::from("b"),
            Key::from(10i64),
            Key::from("a"),
            Key::from(-3i64),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::Int(-3),
                Key::Int(10),
                Key::Text("a".into()),
                Key::Text("b".into()),
                Key::Bytes(vec![0]),
            ]
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::from(7i64).to_string(), "7");
        assert_eq!(Key::from("k").to_string(), "\"k\"");
        assert_eq!(Key::from(vec![0xab, 0x01]).to_string(), "0xab01");
    }
}
