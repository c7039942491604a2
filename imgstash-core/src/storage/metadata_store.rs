use crate::error::{Result, StashError};
use rusqlite::{Connection, OptionalExtension, ToSql, TransactionBehavior, params};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered key/value pair returned by bucket scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Embedded transactional key-value store.
///
/// Keys live inside named buckets and are compared as raw bytes, so scans
/// come back in byte order. Every read and write goes through either
/// [`MetadataStore::view`] or [`MetadataStore::update`]; a write transaction
/// holds the database write lock for its whole duration, so there is only
/// ever one writer. Readers get a consistent snapshot (WAL mode) and may run
/// alongside the writer.
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        // WAL is recorded in the database file; `synchronous` is set per
        // connection in `get_conn`.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        // Keys are bound as BLOBs so SQLite orders them with memcmp.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sequences (
                bucket TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Run `f` inside a read-only snapshot.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let store_tx = StoreTx {
            inner: tx,
            writable: false,
        };
        let out = f(&store_tx)?;
        store_tx.inner.rollback()?;
        Ok(out)
    }

    /// Run `f` inside a write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`. Any error, from
    /// `f` or from the commit itself, discards every write made inside it.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let store_tx = StoreTx {
            inner: tx,
            writable: true,
        };
        let out = f(&store_tx)?;
        store_tx.inner.commit()?;
        Ok(out)
    }
}

/// An open transaction on the [`MetadataStore`].
pub struct StoreTx<'conn> {
    inner: rusqlite::Transaction<'conn>,
    writable: bool,
}

impl<'conn> StoreTx<'conn> {
    pub fn bucket<'a>(&'a self, name: &'static str) -> Bucket<'a, 'conn> {
        Bucket { tx: self, name }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StashError::ReadOnlyTransaction)
        }
    }
}

/// A named keyspace inside a transaction.
pub struct Bucket<'a, 'conn> {
    tx: &'a StoreTx<'conn>,
    name: &'static str,
}

impl Bucket<'_, '_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .tx
            .inner
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        self.tx.inner.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![self.name, key, value],
        )?;
        Ok(())
    }

    /// Returns whether a key was removed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.tx.ensure_writable()?;
        let affected = self.tx.inner.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![self.name, key],
        )?;
        Ok(affected > 0)
    }

    /// Remove every key starting with `prefix`; returns the number removed.
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        self.tx.ensure_writable()?;
        let affected = match prefix_successor(prefix) {
            Some(upper) => self.tx.inner.execute(
                "DELETE FROM kv WHERE bucket = ?1 AND key >= ?2 AND key < ?3",
                params![self.name, prefix, upper],
            )?,
            None => self.tx.inner.execute(
                "DELETE FROM kv WHERE bucket = ?1 AND key >= ?2",
                params![self.name, prefix],
            )?,
        };
        Ok(affected)
    }

    /// Allocate the next value of this bucket's sequence, starting at 1.
    ///
    /// Values are never handed out twice, even if the keys they were used
    /// for are later deleted.
    pub fn next_sequence(&self) -> Result<u64> {
        self.tx.ensure_writable()?;
        let value: i64 = self.tx.inner.query_row(
            "INSERT INTO sequences (bucket, value) VALUES (?1, 1)
             ON CONFLICT (bucket) DO UPDATE SET value = value + 1
             RETURNING value",
            params![self.name],
            |row| row.get(0),
        )?;
        u64::try_from(value)
            .map_err(|_| StashError::Internal(format!("negative sequence in {}", self.name)))
    }

    /// Stream entries with `lower <= key < upper` in the given order until
    /// `f` breaks. Missing bounds are open.
    pub fn for_each_in_range<F>(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        order: ScanOrder,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>,
    {
        let mut args: Vec<&dyn ToSql> = vec![&self.name];
        if let Some(lower) = &lower {
            args.push(lower);
        }
        if let Some(upper) = &upper {
            args.push(upper);
        }
        let sql = range_sql(lower.is_some(), upper.is_some(), order);

        let mut stmt = self.tx.inner.prepare(&sql)?;
        let mut rows = stmt.query(args.as_slice())?;

        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if f(&key, &value)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    pub fn scan_range(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        order: ScanOrder,
    ) -> Result<Vec<KeyValue>> {
        let mut entries = Vec::new();
        self.for_each_in_range(lower, upper, order, |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(entries)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let upper = prefix_successor(prefix);
        self.scan_range(Some(prefix), upper.as_deref(), ScanOrder::Ascending)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.tx.inner.query_row(
            "SELECT COUNT(*) FROM kv WHERE bucket = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Only present bounds go into the WHERE clause so SQLite can seek on the
/// `(bucket, key)` primary key instead of filtering every row of the bucket.
fn range_sql(has_lower: bool, has_upper: bool, order: ScanOrder) -> String {
    let mut sql = String::from("SELECT key, value FROM kv WHERE bucket = ?1");
    let mut next = 2;
    if has_lower {
        sql.push_str(&format!(" AND key >= ?{}", next));
        next += 1;
    }
    if has_upper {
        sql.push_str(&format!(" AND key < ?{}", next));
    }
    sql.push_str(match order {
        ScanOrder::Ascending => " ORDER BY key ASC",
        ScanOrder::Descending => " ORDER BY key DESC",
    });
    sql
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (empty prefix or all `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
