//! Row-level queries. All functions take a plain connection so they work
//! both standalone and inside a [Transaction](rusqlite::Transaction),
//! which derefs to one.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{FsEntry, NewObject, ObjectRow, Relation, Snapshot, StatInfo};
use crate::digests::ObjId;

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// -- settings ------------------------------------------------------------

pub fn setting_get(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

/// Like [setting_get], for keys that have no sensible fallback: a
/// missing row is an error instead of a default.
pub fn setting_get_required(conn: &Connection, key: &str) -> Result<String, crate::Error> {
    setting_get(conn, key)?
        .ok_or_else(|| crate::Error::Config(format!("no such setting: {key}")))
}

pub fn setting_set(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// -- fsentry -------------------------------------------------------------

fn map_fsentry(row: &Row<'_>) -> Result<FsEntry, rusqlite::Error> {
    Ok(FsEntry {
        id: row.get("id")?,
        obj: row.get("obj")?,
        path: row.get::<_, Vec<u8>>("path")?.into(),
        parent: row.get("parent")?,
        new: row.get("new")?,
        st_mode: row.get("st_mode")?,
        st_mtime_ns: row.get("st_mtime_ns")?,
        st_size: row.get("st_size")?,
    })
}

const FSENTRY_COLS: &str = "id, obj, path, parent, new, st_mode, st_mtime_ns, st_size";

pub fn fsentry_get(conn: &Connection, id: i64) -> Result<Option<FsEntry>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {FSENTRY_COLS} FROM fsentry WHERE id = ?1"),
        [id],
        map_fsentry,
    )
    .optional()
}

pub fn fsentry_by_path(
    conn: &Connection,
    path: &[u8],
) -> Result<Option<FsEntry>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {FSENTRY_COLS} FROM fsentry WHERE path = ?1"),
        [path],
        map_fsentry,
    )
    .optional()
}

pub fn fsentry_insert_root(conn: &Connection, path: &[u8]) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO fsentry (path, parent, new) VALUES (?1, NULL, 1)",
        [path],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fsentry_insert_child(
    conn: &Connection,
    parent: i64,
    path: &[u8],
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO fsentry (path, parent, new) VALUES (?1, ?2, 1)",
        params![path, parent],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fsentry_set_parent(
    conn: &Connection,
    id: i64,
    parent: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE fsentry SET parent = ?2 WHERE id = ?1",
        params![id, parent],
    )?;
    Ok(())
}

/// Children in primary-key order, which is the order the names were first
/// discovered in their directory.
pub fn fsentry_children(
    conn: &Connection,
    parent: i64,
) -> Result<Vec<FsEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FSENTRY_COLS} FROM fsentry WHERE parent = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([parent], map_fsentry)?;
    rows.collect()
}

pub fn fsentry_roots(conn: &Connection) -> Result<Vec<FsEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FSENTRY_COLS} FROM fsentry WHERE parent IS NULL ORDER BY id"
    ))?;
    let rows = stmt.query_map([], map_fsentry)?;
    rows.collect()
}

pub fn fsentry_delete(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
    // Descendants go with it, via the parent foreign key cascade.
    conn.execute("DELETE FROM fsentry WHERE id = ?1", [id])?;
    Ok(())
}

pub fn fsentry_delete_children(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM fsentry WHERE parent = ?1", [id])?;
    Ok(())
}

/// Persists the outcome of scanning an entry: dirty, no longer new, stat
/// fields refreshed.
pub fn fsentry_update_scanned(
    conn: &Connection,
    id: i64,
    stat: &StatInfo,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE fsentry
         SET obj = NULL, new = 0, st_mode = ?2, st_mtime_ns = ?3, st_size = ?4
         WHERE id = ?1",
        params![id, stat.mode, stat.mtime_ns, stat.size],
    )?;
    Ok(())
}

pub fn fsentry_set_backed_up(
    conn: &Connection,
    id: i64,
    objid: &ObjId,
    stat: &StatInfo,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE fsentry
         SET obj = ?2, st_mode = ?3, st_mtime_ns = ?4, st_size = ?5
         WHERE id = ?1",
        params![id, objid, stat.mode, stat.mtime_ns, stat.size],
    )?;
    Ok(())
}

/// Marks the entry and every ancestor up to its root dirty, in one
/// recursive query instead of a per-level walk.
pub fn fsentry_invalidate_ancestors(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "WITH RECURSIVE ancestors (id) AS (
             SELECT id FROM fsentry WHERE id = ?1
             UNION ALL
             SELECT fsentry.parent FROM fsentry
             INNER JOIN ancestors ON fsentry.id = ancestors.id
             WHERE fsentry.parent IS NOT NULL
         )
         UPDATE fsentry SET obj = NULL WHERE fsentry.id IN ancestors",
        [id],
    )?;
    Ok(())
}

pub fn fsentry_all_ids(conn: &Connection) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id FROM fsentry ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn fsentry_new_ids(conn: &Connection) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id FROM fsentry WHERE new ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn fsentry_any_new(conn: &Connection) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT EXISTS (SELECT 1 FROM fsentry WHERE new)", [], |row| {
        row.get(0)
    })
}

pub fn fsentry_count(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM fsentry", [], |row| row.get(0))
}

pub fn fsentry_dirty_count(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM fsentry WHERE obj IS NULL",
        [],
        |row| row.get(0),
    )
}

/// The dirty entries whose children have all been backed up already:
/// exactly the set that can be serialized right now.
pub fn fsentry_ready_ids(conn: &Connection) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT e.id FROM fsentry AS e
         WHERE e.obj IS NULL
           AND NOT EXISTS (
               SELECT 1 FROM fsentry AS c
               WHERE c.parent = e.id AND c.obj IS NULL
           )
         ORDER BY e.id",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

// -- objects -------------------------------------------------------------

pub fn object_exists(conn: &Connection, objid: &ObjId) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM objects WHERE objid = ?1)",
        [objid],
        |row| row.get(0),
    )
}

pub fn object_get(
    conn: &Connection,
    objid: &ObjId,
) -> Result<Option<ObjectRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT objid, type, payload, file_size, last_modified
         FROM objects WHERE objid = ?1",
        [objid],
        |row| {
            Ok(ObjectRow {
                objid: row.get(0)?,
                kind: row.get(1)?,
                payload: row.get(2)?,
                file_size: row.get(3)?,
                last_modified: row.get(4)?,
            })
        },
    )
    .optional()
}

pub fn object_insert(
    conn: &Connection,
    objid: &ObjId,
    object: &NewObject,
    payload: Option<&[u8]>,
    relations: &[Relation],
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO objects (objid, type, payload, file_size, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            objid,
            object.kind,
            payload,
            object.file_size,
            object.last_modified,
        ],
    )?;
    let mut stmt = conn.prepare_cached(
        // A payload may reference the same child more than once (repeated
        // chunk contents); the edge set stays unique.
        "INSERT OR IGNORE INTO object_relations (parent, child, name)
         VALUES (?1, ?2, ?3)",
    )?;
    for relation in relations {
        stmt.execute(params![objid, relation.child, relation.name])?;
    }
    Ok(())
}

pub fn object_delete(conn: &Connection, objid: &ObjId) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM objects WHERE objid = ?1", [objid])?;
    Ok(())
}

pub fn object_count(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
}

/// One page of objids in key order, for resumable full-table sweeps.
pub fn object_ids_page(
    conn: &Connection,
    after: Option<&ObjId>,
    limit: u64,
) -> Result<Vec<ObjId>, rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT objid FROM objects
         WHERE ?1 IS NULL OR objid > ?1
         ORDER BY objid LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after, limit], |row| row.get(0))?;
    rows.collect()
}

pub fn object_children(
    conn: &Connection,
    objid: &ObjId,
) -> Result<Vec<ObjId>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT child FROM object_relations WHERE parent = ?1")?;
    let rows = stmt.query_map([objid], |row| row.get(0))?;
    rows.collect()
}

/// Walks the object graph from every snapshot root, calling `f` once per
/// visited edge target (plus once per root). Objects reachable through
/// several paths are reported once per path.
pub fn reachable_objids(
    conn: &Connection,
    mut f: impl FnMut(ObjId),
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE reachable (objid) AS (
             SELECT root FROM snapshots
             UNION ALL
             SELECT object_relations.child FROM object_relations
             INNER JOIN reachable ON reachable.objid = object_relations.parent
         )
         SELECT objid FROM reachable",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, ObjId>(0))?;
    for row in rows {
        f(row?);
    }
    Ok(())
}

// -- snapshots -----------------------------------------------------------

pub fn snapshot_insert(
    conn: &Connection,
    path: &[u8],
    root: &ObjId,
    date: DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO snapshots (path, root, date) VALUES (?1, ?2, ?3)",
        params![path, root, date],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn snapshot_list(conn: &Connection) -> Result<Vec<Snapshot>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT id, path, root, date FROM snapshots ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(Snapshot {
            id: row.get(0)?,
            path: row.get::<_, Vec<u8>>(1)?.into(),
            root: row.get(2)?,
            date: row.get(3)?,
        })
    })?;
    rows.collect()
}

pub fn snapshot_delete(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM snapshots WHERE id = ?1", [id])?;
    Ok(())
}
