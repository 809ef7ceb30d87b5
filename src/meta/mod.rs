//! The local metadata store.
//!
//! Everything durable lives here: the object graph (`objects`,
//! `object_relations`), the shadow tree of the local filesystem
//! (`fsentry`), snapshot roots and settings. The store is a single SQLite
//! database behind a mutex; there is one writer at a time within a
//! process, and write transactions are taken `IMMEDIATE` so the writer
//! lock is acquired up front instead of upgrading mid-transaction.
//!
//! Deletion cascades (`fsentry` subtrees, `object_relations` edges) are
//! enforced by the schema. The application never pulls a deletion set
//! into memory.
//!
//! rusqlite is a blocking API. Access from async code goes through
//! [MetaStore::with_conn] and [MetaStore::with_txn], which hop onto the
//! blocking thread pool so a transaction never stalls an executor
//! thread; the `*_blocking` variants exist for engine code that already
//! runs on a blocking thread.

pub mod queries;

use std::path::Path as StdPath;
use std::sync::Arc;

use bstr::{BStr, BString, ByteSlice};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, Transaction, TransactionBehavior};
use tracing::debug;

use crate::digests::ObjId;
use crate::payload::ObjectKind;
use crate::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    objid         BLOB PRIMARY KEY,
    type          TEXT NOT NULL,
    payload       BLOB,
    file_size     INTEGER,
    last_modified DATETIME
);

CREATE TABLE IF NOT EXISTS object_relations (
    parent BLOB NOT NULL REFERENCES objects (objid) ON DELETE CASCADE,
    child  BLOB NOT NULL REFERENCES objects (objid) ON DELETE CASCADE,
    name   TEXT,
    UNIQUE (parent, child)
);
CREATE INDEX IF NOT EXISTS object_relations_parent ON object_relations (parent);
CREATE INDEX IF NOT EXISTS object_relations_child ON object_relations (child);

CREATE TABLE IF NOT EXISTS fsentry (
    id          INTEGER PRIMARY KEY,
    obj         BLOB REFERENCES objects (objid) ON DELETE SET NULL,
    path        BLOB NOT NULL UNIQUE,
    parent      INTEGER REFERENCES fsentry (id) ON DELETE CASCADE,
    new         BOOLEAN NOT NULL DEFAULT 1,
    st_mode     INTEGER,
    st_mtime_ns INTEGER,
    st_size     INTEGER
);
CREATE INDEX IF NOT EXISTS fsentry_parent ON fsentry (parent);
CREATE INDEX IF NOT EXISTS fsentry_new ON fsentry (new);
CREATE INDEX IF NOT EXISTS fsentry_obj ON fsentry (obj);

CREATE TABLE IF NOT EXISTS snapshots (
    id   INTEGER PRIMARY KEY,
    path BLOB NOT NULL,
    root BLOB NOT NULL REFERENCES objects (objid),
    date DATETIME NOT NULL
);
CREATE INDEX IF NOT EXISTS snapshots_date ON snapshots (date);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetaStore {
    pub fn open(path: &StdPath) -> Result<Self, Error> {
        debug!(path=%path.display(), "opening metadata store");
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, Error> {
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool,
    /// outside any explicit transaction.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock())).await?
    }

    /// Runs `f` inside one `IMMEDIATE` write transaction on the blocking
    /// thread pool, committing on success and rolling back on error.
    pub async fn with_txn<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&txn)?;
            txn.commit()?;
            Ok(value)
        })
        .await?
    }

    /// Like [Self::with_conn], for callers already running on a blocking
    /// thread (the scan passes and the GC sweep drive many small queries
    /// per pass and are scheduled onto the pool wholesale).
    pub fn with_conn_blocking<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        f(&self.conn.lock())
    }

    /// Like [Self::with_txn], for callers already running on a blocking
    /// thread.
    pub fn with_txn_blocking<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Refreshes the query planner statistics. Worth calling after batch
    /// mutations like a scan or backup pass.
    pub async fn analyze(&self) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute_batch("ANALYZE")?;
            Ok(())
        })
        .await
    }
}

/// The stat fields used for change detection, plus the extra fields that
/// end up in inode and tree payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
}

impl From<&std::fs::Metadata> for StatInfo {
    fn from(m: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: m.mode(),
            size: m.size(),
            mtime_ns: m.mtime() * 1_000_000_000 + m.mtime_nsec(),
            atime_ns: m.atime() * 1_000_000_000 + m.atime_nsec(),
            ino: m.ino(),
            uid: m.uid(),
            gid: m.gid(),
        }
    }
}

impl StatInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    pub fn is_file(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == libc::S_IFREG as u32
    }
}

/// One node of the shadow tree. `obj == None` marks the entry dirty: it
/// needs to be (re-)backed up before the next snapshot can be cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    pub id: i64,
    pub obj: Option<ObjId>,
    /// Absolute local path, raw bytes. Not necessarily valid UTF-8.
    pub path: BString,
    pub parent: Option<i64>,
    pub new: bool,
    pub st_mode: Option<u32>,
    pub st_mtime_ns: Option<i64>,
    pub st_size: Option<u64>,
}

impl FsEntry {
    /// The last path component, as raw bytes.
    pub fn name(&self) -> &BStr {
        match self.path.rfind_byte(b'/') {
            Some(idx) => BStr::new(&self.path[idx + 1..]),
            None => self.path.as_bstr(),
        }
    }

    pub fn local_path(&self) -> std::path::PathBuf {
        use std::os::unix::ffi::OsStrExt;
        std::ffi::OsStr::from_bytes(&self.path).into()
    }

    /// Lossy rendering for log output.
    pub fn display_path(&self) -> std::borrow::Cow<'_, str> {
        self.path.to_str_lossy()
    }

    pub fn was_dir(&self) -> bool {
        self.st_mode
            .is_some_and(|mode| mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32)
    }

    pub fn matches_stat(&self, stat: &StatInfo) -> bool {
        self.st_mode == Some(stat.mode)
            && self.st_mtime_ns == Some(stat.mtime_ns)
            && self.st_size == Some(stat.size)
    }
}

/// An object row as cached locally. `payload` is kept for `tree` and
/// `inode` objects only; blob bytes live in remote storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    pub objid: ObjId,
    pub kind: ObjectKind,
    pub payload: Option<Vec<u8>>,
    pub file_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The advisory index columns of an object row about to be admitted.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub kind: ObjectKind,
    pub file_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A parent-to-child edge about to be admitted alongside its parent.
/// `name` is a lossy UTF-8 rendering kept for indexing; the authoritative
/// raw name lives in the parent payload.
#[derive(Debug, Clone)]
pub struct Relation {
    pub child: ObjId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: i64,
    pub path: BString,
    pub root: ObjId,
    pub date: DateTime<Utc>,
}

impl ToSql for ObjId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_slice().into())
    }
}

impl FromSql for ObjId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ObjId::try_from(value.as_blob()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ObjectKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ObjectKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: crate::payload::DecodeError| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::queries;

    #[test]
    fn fsentry_name_is_last_component() {
        let entry = FsEntry {
            id: 1,
            obj: None,
            path: BString::from("/srv/data/file.txt"),
            parent: None,
            new: true,
            st_mode: None,
            st_mtime_ns: None,
            st_size: None,
        };
        assert_eq!(entry.name(), "file.txt");
    }

    #[test]
    fn cascading_delete_removes_subtree() {
        let store = MetaStore::open_in_memory().expect("open");
        store
            .with_txn_blocking(|txn| {
                let root = queries::fsentry_insert_root(txn, b"/r")?;
                let child = queries::fsentry_insert_child(txn, root, b"/r/a")?;
                queries::fsentry_insert_child(txn, child, b"/r/a/b")?;
                queries::fsentry_delete(txn, root)?;
                Ok(())
            })
            .expect("txn");
        let left = store
            .with_conn_blocking(|conn| queries::fsentry_count(conn).map_err(Into::into))
            .expect("count");
        assert_eq!(left, 0);
    }

    #[test]
    fn path_uniqueness_is_enforced() {
        let store = MetaStore::open_in_memory().expect("open");
        let err = store.with_txn_blocking(|txn| {
            queries::fsentry_insert_root(txn, b"/r")?;
            queries::fsentry_insert_root(txn, b"/r")?;
            Ok(())
        });
        assert!(matches!(err, Err(Error::Meta(e)) if queries::is_unique_violation(&e)));
    }
}
