//! SQLite backend
//!
//! Each logical table is a `WITHOUT ROWID` table keyed by the native SQLite
//! value of the [`Key`] (INTEGER, TEXT or BLOB; SQLite orders these the same
//! way `Key` does). Writes open an implicit transaction that lives until
//! [`Backend::commit`].
//!
//! Recompression runs server-side: the row transform is registered as a SQL
//! scalar function and driven by a single `UPDATE`, so SQLite never has to
//! iterate and write the same table from the application side.

use crate::backend::{
    Backend, BackendKind, BatchOp, DataSize, EngineOption, Key, Row, RowTransform, TableName,
};
use crate::error::CacheResult;
use crate::transform::ChainId;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, ToSql};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

/// SQL name of the scalar function used for server-side row transforms
const ROW_TRANSFORM_FN: &str = "blobcache_transform_row";

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Key::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Key::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Key::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(Key::Int(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Key::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(b) => Ok(Key::Bytes(b.to_vec())),
            ValueRef::Null | ValueRef::Real(_) => Err(FromSqlError::InvalidType),
        }
    }
}

fn chain_from_sql(chain: Option<i64>) -> Option<ChainId> {
    chain.map(|c| ChainId(c as u32))
}

fn chain_to_sql(chain: Option<ChainId>) -> Option<i64> {
    chain.map(|c| c.0 as i64)
}

/// SQLite-backed key-value store
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Create or open a database file
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        tracing::debug!("Opened SQLite store at {:?}", path);

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// A private in-memory database
    pub fn open_in_memory() -> CacheResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wrap an already opened connection
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn, path: None }
    }

    fn ensure_transaction(&self) -> CacheResult<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn upsert(conn: &Connection, table: TableName, key: &Key, row: &Row) -> CacheResult<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO \"{}\" (key, chain, val) VALUES (?1, ?2, ?3)",
            table
        );
        conn.prepare_cached(&sql)?
            .execute(params![key, chain_to_sql(row.chain_id), row.value])?;
        Ok(())
    }

    fn remove(conn: &Connection, table: TableName, key: &Key) -> CacheResult<bool> {
        let sql = format!("DELETE FROM \"{}\" WHERE key = ?1", table);
        let changed = conn.prepare_cached(&sql)?.execute(params![key])?;
        Ok(changed > 0)
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn table_exists(&self, table: TableName) -> CacheResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_table(&mut self, table: TableName) -> CacheResult<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                key PRIMARY KEY NOT NULL,
                chain INTEGER,
                val BLOB NOT NULL
            ) WITHOUT ROWID;",
            table
        ))?;
        Ok(())
    }

    fn get(&self, table: TableName, key: &Key) -> CacheResult<Option<Row>> {
        let sql = format!("SELECT chain, val FROM \"{}\" WHERE key = ?1", table);
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![key], |row| {
                Ok(Row::new(chain_from_sql(row.get(0)?), row.get(1)?))
            })
            .optional()?;
        Ok(row)
    }

    fn set(&mut self, table: TableName, key: &Key, row: &Row) -> CacheResult<()> {
        self.ensure_transaction()?;
        Self::upsert(&self.conn, table, key, row)
    }

    fn delete(&mut self, table: TableName, key: &Key) -> CacheResult<bool> {
        self.ensure_transaction()?;
        Self::remove(&self.conn, table, key)
    }

    fn contains(&self, table: TableName, key: &Key) -> CacheResult<bool> {
        let sql = format!("SELECT 1 FROM \"{}\" WHERE key = ?1", table);
        let found = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![key], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn scan_page(
        &self,
        table: TableName,
        after: Option<&Key>,
        limit: usize,
    ) -> CacheResult<Vec<(Key, Row)>> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(Key, Row)> {
            Ok((
                row.get(0)?,
                Row::new(chain_from_sql(row.get(1)?), row.get(2)?),
            ))
        };

        let rows = match after {
            Some(after) => {
                let sql = format!(
                    "SELECT key, chain, val FROM \"{}\" WHERE key > ?1 ORDER BY key LIMIT ?2",
                    table
                );
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![after, limit as i64], map_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT key, chain, val FROM \"{}\" ORDER BY key LIMIT ?1",
                    table
                );
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![limit as i64], map_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    fn len(&self, table: TableName) -> CacheResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM \"{}\"", table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn data_size(&self, table: TableName) -> CacheResult<DataSize> {
        let (rows, bytes): (i64, i64) = self.conn.query_row(
            &format!(
                "SELECT count(*), coalesce(sum(length(val)), 0) FROM \"{}\"",
                table
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DataSize {
            rows: rows as u64,
            value_bytes: bytes as u64,
        })
    }

    fn clear(&mut self, table: TableName) -> CacheResult<()> {
        self.ensure_transaction()?;
        self.conn
            .execute(&format!("DELETE FROM \"{}\"", table), [])?;
        Ok(())
    }

    fn begin_transaction(&mut self) -> CacheResult<()> {
        self.ensure_transaction()
    }

    fn commit(&mut self) -> CacheResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> CacheResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn write_batch(&mut self, ops: Vec<BatchOp>) -> CacheResult<()> {
        let sp = self.conn.savepoint()?;
        for op in &ops {
            match op {
                BatchOp::Put { table, key, row } => Self::upsert(&sp, *table, key, row)?,
                BatchOp::Delete { table, key } => {
                    Self::remove(&sp, *table, key)?;
                }
            }
        }
        sp.commit()?;
        Ok(())
    }

    fn supports_server_side_row_transform(&self) -> bool {
        true
    }

    fn apply_row_transform(
        &mut self,
        table: TableName,
        chain_id: ChainId,
        transform: RowTransform,
    ) -> CacheResult<u64> {
        let mut transform = AssertUnwindSafe(transform);
        self.conn.create_scalar_function(
            ROW_TRANSFORM_FN,
            2,
            FunctionFlags::SQLITE_UTF8,
            move |ctx| {
                let transform = &mut transform;
                let key: Key = ctx.get(0)?;
                let value = ctx
                    .get_raw(1)
                    .as_blob()
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
                (transform.0)(&key, value)
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
            },
        )?;

        self.ensure_transaction()?;
        let result = self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET val = {}(key, val) WHERE chain = ?1",
                table, ROW_TRANSFORM_FN
            ),
            params![chain_id.0 as i64],
        );

        if let Err(e) = self.conn.remove_function(ROW_TRANSFORM_FN, 2) {
            tracing::warn!("Failed to unregister {}: {}", ROW_TRANSFORM_FN, e);
        }

        Ok(result? as u64)
    }

    fn engine_options(&self) -> CacheResult<BTreeMap<String, EngineOption>> {
        let mut options = BTreeMap::new();

        let mut stmt = self.conn.prepare("PRAGMA compile_options")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for option in rows {
            let option = option?;
            match option.split_once('=') {
                Some((name, value)) => {
                    let value = value
                        .parse::<i64>()
                        .map(EngineOption::Number)
                        .unwrap_or_else(|_| EngineOption::Text(value.to_string()));
                    options.insert(name.to_string(), value);
                }
                None => {
                    options.insert(option, EngineOption::Enabled);
                }
            }
        }

        // Not reported by compile_options
        if self
            .conn
            .query_row("SELECT count(*) FROM sqlite_dbpage", [], |_| Ok(()))
            .is_ok()
        {
            options.insert("ENABLE_DBPAGE_VTAB".to_string(), EngineOption::Enabled);
        }

        options.insert(
            "VERSION".to_string(),
            EngineOption::Text(rusqlite::version().to_string()),
        );

        Ok(options)
    }

    fn vacuum(&mut self) -> CacheResult<()> {
        self.commit()?;
        self.conn.execute_batch("REINDEX; VACUUM;")?;
        Ok(())
    }

    fn optimize(&mut self) -> CacheResult<()> {
        self.conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            tracing::warn!("Failed to commit SQLite store on close: {}", e);
        }
    }
}
