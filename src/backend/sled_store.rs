//! sled backend
//!
//! Each logical table maps to a separate sled `Tree`. sled stores raw bytes,
//! so this backend owns an order-preserving key encoding:
//!
//! ```text
//! Int   0x01 | i64 big-endian with the sign bit flipped
//! Text  0x02 | utf-8 bytes
//! Bytes 0x03 | raw bytes
//! ```
//!
//! Rows are stored as `flag (u8) | chain id (u32 BE, if flag = 1) | value`.
//!
//! Every write is applied to the tree immediately, so the backend reports
//! `forces_per_op_commit` and `commit` flushes to disk. There is no
//! server-side row transform; recompression goes through [`Backend::write_batch`],
//! which runs as one sled transaction over both trees.

use crate::backend::{Backend, BackendKind, BatchOp, DataSize, EngineOption, Key, Row, TableName};
use crate::error::{CacheError, CacheResult};
use crate::transform::ChainId;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

const TAG_INT: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;

/// Encode a key so that byte order matches `Key` order
pub fn encode_key(key: &Key) -> Vec<u8> {
    match key {
        Key::Int(i) => {
            let mut buf = Vec::with_capacity(9);
            buf.push(TAG_INT);
            buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            buf
        }
        Key::Text(s) => {
            let mut buf = Vec::with_capacity(1 + s.len());
            buf.push(TAG_TEXT);
            buf.extend_from_slice(s.as_bytes());
            buf
        }
        Key::Bytes(b) => {
            let mut buf = Vec::with_capacity(1 + b.len());
            buf.push(TAG_BYTES);
            buf.extend_from_slice(b);
            buf
        }
    }
}

pub fn decode_key(raw: &[u8]) -> CacheResult<Key> {
    let (tag, body) = raw
        .split_first()
        .ok_or_else(|| CacheError::Corruption("empty key".to_string()))?;
    match *tag {
        TAG_INT => {
            let bytes: [u8; 8] = body.try_into().map_err(|_| {
                CacheError::Corruption(format!("bad integer key length {}", body.len()))
            })?;
            Ok(Key::Int((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64))
        }
        TAG_TEXT => String::from_utf8(body.to_vec())
            .map(Key::Text)
            .map_err(|e| CacheError::Corruption(format!("text key is not utf-8: {}", e))),
        TAG_BYTES => Ok(Key::Bytes(body.to_vec())),
        other => Err(CacheError::Corruption(format!("unknown key tag {:#04x}", other))),
    }
}

fn encode_row(row: &Row) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + row.value.len());
    match row.chain_id {
        Some(chain) => {
            buf.push(1);
            buf.extend_from_slice(&chain.0.to_be_bytes());
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&row.value);
    buf
}

fn decode_row(raw: &[u8]) -> CacheResult<Row> {
    match raw.split_first() {
        Some((0, value)) => Ok(Row::plain(value.to_vec())),
        Some((1, rest)) if rest.len() >= 4 => {
            let (chain, value) = rest.split_at(4);
            let chain = u32::from_be_bytes([chain[0], chain[1], chain[2], chain[3]]);
            Ok(Row::new(Some(ChainId(chain)), value.to_vec()))
        }
        _ => Err(CacheError::Corruption("malformed row header".to_string())),
    }
}

/// sled-backed key-value store
pub struct SledBackend {
    db: sled::Db,
    path: Option<PathBuf>,
}

impl SledBackend {
    /// Open (creating if needed) a sled store at the given directory path
    pub fn open(path: &Path) -> CacheResult<Self> {
        let db = sled::open(path)?;
        tracing::debug!("Opened sled store at {:?}", path);
        Ok(Self {
            db,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a temporary store (for testing). Data is deleted on drop.
    pub fn open_temporary() -> CacheResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, path: None })
    }

    fn tree(&self, table: TableName) -> CacheResult<sled::Tree> {
        Ok(self.db.open_tree(table.as_str())?)
    }
}

impl Backend for SledBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sled
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn table_exists(&self, table: TableName) -> CacheResult<bool> {
        Ok(self
            .db
            .tree_names()
            .iter()
            .any(|name| &name[..] == table.as_str().as_bytes()))
    }

    fn create_table(&mut self, table: TableName) -> CacheResult<()> {
        self.tree(table)?;
        Ok(())
    }

    fn get(&self, table: TableName, key: &Key) -> CacheResult<Option<Row>> {
        let tree = self.tree(table)?;
        tree.get(encode_key(key))?
            .map(|raw| decode_row(&raw))
            .transpose()
    }

    fn set(&mut self, table: TableName, key: &Key, row: &Row) -> CacheResult<()> {
        let tree = self.tree(table)?;
        tree.insert(encode_key(key), encode_row(row))?;
        Ok(())
    }

    fn delete(&mut self, table: TableName, key: &Key) -> CacheResult<bool> {
        let tree = self.tree(table)?;
        Ok(tree.remove(encode_key(key))?.is_some())
    }

    fn contains(&self, table: TableName, key: &Key) -> CacheResult<bool> {
        let tree = self.tree(table)?;
        Ok(tree.contains_key(encode_key(key))?)
    }

    fn scan_page(
        &self,
        table: TableName,
        after: Option<&Key>,
        limit: usize,
    ) -> CacheResult<Vec<(Key, Row)>> {
        let tree = self.tree(table)?;
        let iter = match after {
            Some(after) => {
                tree.range::<Vec<u8>, _>((Bound::Excluded(encode_key(after)), Bound::Unbounded))
            }
            None => tree.iter(),
        };

        let mut rows = Vec::with_capacity(limit.min(1024));
        for item in iter.take(limit) {
            let (k, v) = item?;
            rows.push((decode_key(&k)?, decode_row(&v)?));
        }
        Ok(rows)
    }

    fn len(&self, table: TableName) -> CacheResult<u64> {
        Ok(self.tree(table)?.len() as u64)
    }

    fn data_size(&self, table: TableName) -> CacheResult<DataSize> {
        let mut size = DataSize::default();
        for item in self.tree(table)?.iter() {
            let (_, v) = item?;
            size.rows += 1;
            size.value_bytes += decode_row(&v)?.value.len() as u64;
        }
        Ok(size)
    }

    fn clear(&mut self, table: TableName) -> CacheResult<()> {
        self.tree(table)?.clear()?;
        Ok(())
    }

    fn begin_transaction(&mut self) -> CacheResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> CacheResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn rollback(&mut self) -> CacheResult<()> {
        // writes are already applied; atomic groups go through write_batch
        Ok(())
    }

    fn write_batch(&mut self, ops: Vec<BatchOp>) -> CacheResult<()> {
        let data = self.tree(TableName::Data)?;
        let metadata = self.tree(TableName::Metadata)?;

        // encode once, the closure may be retried on conflict
        let encoded: Vec<(TableName, Vec<u8>, Option<Vec<u8>>)> = ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { table, key, row } => {
                    (*table, encode_key(key), Some(encode_row(row)))
                }
                BatchOp::Delete { table, key } => (*table, encode_key(key), None),
            })
            .collect();

        (&data, &metadata)
            .transaction(|(data, metadata)| {
                for (table, key, value) in &encoded {
                    let tree = match table {
                        TableName::Data => data,
                        TableName::Metadata => metadata,
                    };
                    match value {
                        Some(value) => {
                            tree.insert(key.as_slice(), value.as_slice())?;
                        }
                        None => {
                            tree.remove(key.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => CacheError::from(e),
                TransactionError::Abort(()) => {
                    CacheError::Configuration("sled batch aborted".to_string())
                }
            })?;

        self.db.flush()?;
        Ok(())
    }

    fn forces_per_op_commit(&self) -> bool {
        true
    }

    fn engine_options(&self) -> CacheResult<BTreeMap<String, EngineOption>> {
        let mut options = BTreeMap::new();
        options.insert(
            "ENGINE".to_string(),
            EngineOption::Text("sled".to_string()),
        );
        options.insert(
            "SIZE_ON_DISK".to_string(),
            EngineOption::Number(self.db.size_on_disk()? as i64),
        );
        options.insert(
            "TREES".to_string(),
            EngineOption::Number(self.db.tree_names().len() as i64),
        );
        if self.db.was_recovered() {
            options.insert("WAS_RECOVERED".to_string(), EngineOption::Enabled);
        }
        Ok(options)
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::warn!("Failed to flush sled store on close: {}", e);
        }
    }
}
