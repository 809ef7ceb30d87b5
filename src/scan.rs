//! Incremental filesystem scanning.
//!
//! A scan makes the persisted shadow tree reflect the filesystem again:
//! every entry whose on-disk metadata diverges from the recorded state is
//! marked dirty (`obj = NULL`), along with all of its ancestors, and
//! directory listings are diffed against the recorded children to create
//! and delete rows. The backup engine later consumes exactly the dirty
//! set.
//!
//! The walk is breadth-first over the database, not the filesystem: one
//! pass over all existing entries (inside a single large transaction, to
//! amortize commit cost and keep the WAL small), then repeated passes
//! over entries flagged `new` until none appear. Scans are idempotent and
//! restartable; an interrupted scan just gets re-run.
//!
//! Scanning assumes no concurrent backup against the same metadata store.

use std::collections::{HashMap, HashSet};

use bstr::{BStr, BString, ByteSlice};
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use crate::meta::{queries, FsEntry, MetaStore, StatInfo};
use crate::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: u64,
}

/// Scans every tracked filesystem entry for changes.
///
/// With `skip_existing`, only entries flagged `new` are scanned; useful
/// right after adding a root, when the rest of the tree is known fresh.
/// `progress` receives the running count, and the total while it is
/// known (the new-entry passes have none).
#[instrument(skip_all, fields(skip_existing))]
pub fn scan(
    meta: &MetaStore,
    skip_existing: bool,
    mut progress: impl FnMut(u64, Option<u64>),
) -> Result<ScanStats, Error> {
    let mut scanned: u64 = 0;

    if !skip_existing {
        let ids = meta.with_conn_blocking(|conn| Ok(queries::fsentry_all_ids(conn)?))?;
        let total = ids.len() as u64;
        meta.with_txn_blocking(|txn| {
            for id in ids {
                if let Some(entry) = queries::fsentry_get(txn, id)? {
                    scan_entry(txn, entry)?;
                }
                scanned += 1;
                progress(scanned, Some(total));
            }
            Ok(())
        })?;
    }

    // Newly discovered entries queue up behind the pass that found them;
    // keep taking passes until a pass discovers nothing.
    loop {
        let ids = meta.with_conn_blocking(|conn| Ok(queries::fsentry_new_ids(conn)?))?;
        if ids.is_empty() {
            break;
        }
        meta.with_txn_blocking(|txn| {
            for id in ids {
                let Some(entry) = queries::fsentry_get(txn, id)? else {
                    continue;
                };
                scan_entry(txn, entry)?;
                // An entry that survives its scan still flagged new would
                // be selected again on every later pass.
                if let Some(after) = queries::fsentry_get(txn, id)? {
                    if after.new {
                        return Err(Error::Inconsistent(format!(
                            "{} still flagged new after scanning",
                            after.display_path()
                        )));
                    }
                }
                scanned += 1;
                progress(scanned, None);
            }
            Ok(())
        })?;
    }

    meta.with_conn_blocking(|conn| {
        conn.execute_batch("ANALYZE fsentry")?;
        Ok(())
    })?;

    Ok(ScanStats { scanned })
}

/// Scans a single entry: stat it, detect changes, diff directory
/// listings, and mark the entry and its ancestors dirty if anything
/// moved.
fn scan_entry(conn: &Connection, entry: FsEntry) -> Result<(), Error> {
    debug!(path = %entry.display_path(), "scanning");

    let stat = match std::fs::symlink_metadata(entry.local_path()) {
        Ok(m) => StatInfo::from(&m),
        Err(e) if entry_vanished(&e) => {
            info!(path = %entry.display_path(), "entry gone, deleting");
            queries::fsentry_delete(conn, entry.id)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if entry.was_dir() && !stat.is_dir() {
        // A deleted directory hits the vanished path above and cascades;
        // this handles a non-directory recreated under the same name
        // before any scan ran. Child scans would also clean these up.
        info!(path = %entry.display_path(), "no longer a directory, dropping children");
        queries::fsentry_delete_children(conn, entry.id)?;
    }

    if !entry.new && entry.matches_stat(&stat) {
        debug!(path = %entry.display_path(), "unchanged");
        return Ok(());
    }

    if stat.is_dir() {
        scan_directory_entries(conn, &entry)?;
    }

    queries::fsentry_update_scanned(conn, entry.id, &stat)?;
    queries::fsentry_invalidate_ancestors(conn, entry.id)?;
    info!(path = %entry.display_path(), "entry updated");
    Ok(())
}

/// Diffs the recorded children of a directory entry against its current
/// on-disk names.
fn scan_directory_entries(conn: &Connection, entry: &FsEntry) -> Result<(), Error> {
    use std::os::unix::ffi::OsStrExt;

    let children = queries::fsentry_children(conn, entry.id)?;

    let on_disk: Vec<BString> = match std::fs::read_dir(entry.local_path()) {
        Ok(iter) => {
            let mut names = Vec::new();
            for dirent in iter {
                names.push(BString::from(dirent?.file_name().as_bytes()));
            }
            names
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            // The recorded children stay as they are; they get cleaned up
            // individually once they become scannable or vanish.
            warn!(path = %entry.display_path(), "permission denied listing directory");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    let have: HashMap<&BStr, &FsEntry> = children.iter().map(|c| (c.name(), c)).collect();
    let on_disk_set: HashSet<&BStr> = on_disk.iter().map(|n| n.as_bstr()).collect();

    for name in &on_disk {
        if have.contains_key(name.as_bstr()) {
            continue;
        }
        let child_path = join_path(&entry.path, name);
        match queries::fsentry_insert_child(conn, entry.id, &child_path) {
            Ok(_) => info!(path = %child_path.to_str_lossy(), "new path"),
            Err(e) if queries::is_unique_violation(&e) => {
                reparent_existing(conn, entry, &child_path)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for child in &children {
        if !on_disk_set.contains(child.name()) {
            info!(path = %child.display_path(), "vanished from directory, deleting");
            queries::fsentry_delete(conn, child.id)?;
        }
    }

    Ok(())
}

/// A newly added root that is an ancestor of an existing root rediscovers
/// that root through its directory listing. The two trees merge: the old
/// root is reparented under the discovering directory. Any other path
/// collision means the tree is corrupt.
fn reparent_existing(conn: &Connection, parent: &FsEntry, path: &BString) -> Result<(), Error> {
    let existing = queries::fsentry_by_path(conn, path)?.ok_or_else(|| {
        Error::Inconsistent(format!(
            "insert of {} collided but no row has that path",
            path.to_str_lossy()
        ))
    })?;
    if existing.parent.is_some() {
        return Err(Error::Inconsistent(format!(
            "{} is already tracked under another parent",
            existing.display_path()
        )));
    }
    warn!(path = %existing.display_path(), "existing root rediscovered, reparenting");
    queries::fsentry_set_parent(conn, existing.id, parent.id)?;
    Ok(())
}

fn entry_vanished(e: &std::io::Error) -> bool {
    // NotADirectory shows up when a parent of the entry stopped being a
    // directory.
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

pub(crate) fn join_path(parent: &[u8], name: &[u8]) -> BString {
    let mut path = BString::from(parent);
    if !path.ends_with(b"/") {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::Arc;

    fn tracked_root(meta: &MetaStore, dir: &std::path::Path) -> i64 {
        meta.with_txn_blocking(|txn| {
            Ok(queries::fsentry_insert_root(
                txn,
                dir.as_os_str().as_bytes(),
            )?)
        })
        .expect("insert root")
    }

    fn all_entries(meta: &MetaStore) -> Vec<FsEntry> {
        meta.with_conn_blocking(|conn| {
            let ids = queries::fsentry_all_ids(conn)?;
            ids.into_iter()
                .map(|id| Ok(queries::fsentry_get(conn, id)?.expect("entry exists")))
                .collect()
        })
        .expect("list entries")
    }

    #[test]
    fn scan_builds_the_shadow_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/file.txt"), b"contents").expect("write");

        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        tracked_root(&meta, dir.path());
        let stats = scan(&meta, false, |_, _| {}).expect("scan");

        // Root, sub and file each get scanned once.
        assert_eq!(stats.scanned, 3);
        let entries = all_entries(&meta);
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert!(!entry.new, "{} still new", entry.display_path());
            assert!(entry.obj.is_none());
            assert!(entry.st_mode.is_some());
        }
    }

    #[test]
    fn rescan_without_changes_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"aaa").expect("write");

        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        tracked_root(&meta, dir.path());
        scan(&meta, false, |_, _| {}).expect("first scan");
        let before = all_entries(&meta);
        scan(&meta, false, |_, _| {}).expect("second scan");
        assert_eq!(all_entries(&meta), before);
    }

    #[test]
    fn vanished_entries_are_deleted_with_descendants() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/file.txt"), b"contents").expect("write");

        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        tracked_root(&meta, dir.path());
        scan(&meta, false, |_, _| {}).expect("scan");
        assert_eq!(all_entries(&meta).len(), 3);

        std::fs::remove_dir_all(dir.path().join("sub")).expect("rmdir");
        scan(&meta, false, |_, _| {}).expect("rescan");
        assert_eq!(all_entries(&meta).len(), 1);
    }

    #[test]
    fn new_root_above_existing_root_merges_the_trees() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/file.txt"), b"contents").expect("write");

        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        let sub_id = meta
            .with_txn_blocking(|txn| {
                Ok(queries::fsentry_insert_root(
                    txn,
                    dir.path().join("sub").as_os_str().as_bytes(),
                )?)
            })
            .expect("insert sub root");
        scan(&meta, false, |_, _| {}).expect("scan sub");

        let outer_id = tracked_root(&meta, dir.path());
        scan(&meta, false, |_, _| {}).expect("scan outer");

        let sub = meta
            .with_conn_blocking(|conn| Ok(queries::fsentry_get(conn, sub_id)?))
            .expect("get")
            .expect("sub still tracked");
        assert_eq!(sub.parent, Some(outer_id));

        let roots = meta
            .with_conn_blocking(|conn| Ok(queries::fsentry_roots(conn)?))
            .expect("roots");
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, outer_id);
    }

    #[test]
    fn skip_existing_leaves_known_entries_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"aaa").expect("write");

        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        tracked_root(&meta, dir.path());
        scan(&meta, false, |_, _| {}).expect("scan");

        // Touch the file; a skip_existing scan must not notice.
        std::fs::write(dir.path().join("a"), b"bbbb").expect("write");
        let stats = scan(&meta, true, |_, _| {}).expect("skip-existing scan");
        assert_eq!(stats.scanned, 0);
    }

    #[test]
    fn join_path_handles_the_filesystem_root() {
        assert_eq!(join_path(b"/", b"etc"), BString::from("/etc"));
        assert_eq!(join_path(b"/srv/data", b"x"), BString::from("/srv/data/x"));
    }
}
