//! The backup engine.
//!
//! Backs up every dirty entry of the shadow tree into the object graph,
//! bottom-up: an entry only becomes "ready" once none of its children are
//! dirty, so blobs are admitted before the inode that references them and
//! every child objid exists before its parent directory is serialized.
//! The ordering is enforced by the ready query alone; the worker pool
//! never has to coordinate.
//!
//! The producer streams ready entries into a pool of `worker_count`
//! tasks, throttling once more than `worker_count + 1` are in flight so a
//! cancellation is honored promptly. On interrupt, submission stops and
//! in-flight work drains, keeping the store consistent: partial progress
//! is durable and simply absent from the next run's ready set.
//!
//! Once nothing is dirty, a snapshot is cut per root and the planner
//! statistics refreshed.

use std::sync::Arc;

use bstr::ByteSlice;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunker::FixedChunker;
use crate::config::Config;
use crate::digests::ObjId;
use crate::meta::{queries, FsEntry, MetaStore, Relation, StatInfo};
use crate::objectservice::{ObjectSink, ObjectService};
use crate::payload::{FileContent, InodeMeta, Payload, TreeMeta};
use crate::remote::Remote;
use crate::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupStats {
    /// Entries processed, including ones deleted because they vanished.
    pub entries: u64,
    pub snapshots: u64,
}

#[derive(Clone, Copy)]
struct EntryOpts {
    inline_threshold: u64,
    chunk_size: u64,
}

/// Runs a full backup cycle: drain the dirty set, then cut one snapshot
/// per root.
///
/// Requires a completed scan; entries still flagged `new` abort the run.
/// Cancelling the token stops submission and lets in-flight uploads
/// drain, so every acked upload has its matching row.
#[instrument(skip_all)]
pub async fn backup(
    meta: &Arc<MetaStore>,
    objects: &Arc<ObjectService>,
    remote: &Remote,
    config: &Config,
    cancel: &CancellationToken,
    mut progress: impl FnMut(u64, u64),
) -> Result<BackupStats, Error> {
    if meta
        .with_conn(|conn| Ok(queries::fsentry_any_new(conn)?))
        .await?
    {
        return Err(Error::ScanNotRun);
    }

    let opts = EntryOpts {
        inline_threshold: config.inline_threshold,
        chunk_size: config.chunk_size,
    };
    let workers = config.worker_count.max(1);
    let total = meta
        .with_conn(|conn| Ok(queries::fsentry_dirty_count(conn)?))
        .await?;
    let mut done: u64 = 0;
    let mut first_err: Option<Error> = None;
    let mut tasks: JoinSet<Result<i64, Error>> = JoinSet::new();
    let mut in_flight: std::collections::HashSet<i64> = std::collections::HashSet::new();

    debug!(total, workers, "starting backup");

    'outer: while first_err.is_none() && !cancel.is_cancelled() {
        let dirty = meta
            .with_conn(|conn| Ok(queries::fsentry_dirty_count(conn)?))
            .await?;
        if dirty == 0 {
            break;
        }

        let ready = meta
            .with_conn(|conn| Ok(queries::fsentry_ready_ids(conn)?))
            .await?;
        let ready: Vec<i64> = ready
            .into_iter()
            .filter(|id| !in_flight.contains(id))
            .collect();
        if ready.is_empty() {
            // Nothing new is ready. If work is still in flight its
            // completion will unblock parents; wait for one. With an
            // empty pool this is a cycle or a scheduling bug, not a
            // recoverable state.
            match tasks.join_next().await {
                Some(res) => {
                    record_completion(res, &mut done, &mut first_err, &mut in_flight);
                    progress(done, total);
                    continue;
                }
                None => {
                    first_err = Some(Error::NoProgress(dirty));
                    break;
                }
            }
        }

        for id in ready {
            if cancel.is_cancelled() || first_err.is_some() {
                break 'outer;
            }

            in_flight.insert(id);
            let meta = meta.clone();
            let objects = objects.clone();
            tasks.spawn(async move {
                backup_entry(&meta, objects.as_ref(), &opts, id)
                    .await
                    .map(|()| id)
            });

            // Block for a completion once the pool is saturated, so
            // queued work stays bounded; otherwise just poll.
            if tasks.len() > workers + 1 {
                if let Some(res) = tasks.join_next().await {
                    record_completion(res, &mut done, &mut first_err, &mut in_flight);
                    progress(done, total);
                }
            }
            while let Some(res) = tasks.try_join_next() {
                record_completion(res, &mut done, &mut first_err, &mut in_flight);
                progress(done, total);
            }
        }
    }

    // Drain whatever is still in flight, even on error or cancellation:
    // an upload that completes now needs its row committed.
    while let Some(res) = tasks.join_next().await {
        record_completion(res, &mut done, &mut first_err, &mut in_flight);
        progress(done, total);
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    if cancel.is_cancelled() {
        info!("backup interrupted, in-flight uploads drained");
        return Err(Error::Interrupted);
    }

    let now = Utc::now();
    let roots = meta
        .with_conn(|conn| Ok(queries::fsentry_roots(conn)?))
        .await?;
    let mut snapshots = 0;
    for root in roots {
        create_snapshot(meta, remote, &root, now).await?;
        snapshots += 1;
    }

    meta.analyze().await?;

    Ok(BackupStats {
        entries: done,
        snapshots,
    })
}

fn record_completion(
    res: Result<Result<i64, Error>, tokio::task::JoinError>,
    done: &mut u64,
    first_err: &mut Option<Error>,
    in_flight: &mut std::collections::HashSet<i64>,
) {
    match res {
        Ok(Ok(id)) => {
            in_flight.remove(&id);
            *done += 1;
        }
        Ok(Err(e)) => {
            if first_err.is_none() {
                *first_err = Some(e);
            }
        }
        Err(join_err) => {
            if first_err.is_none() {
                *first_err = Some(join_err.into());
            }
        }
    }
}

/// Serializes one entry into the object graph.
///
/// Every exit either admits an object and records it on the entry, or
/// deletes the entry. Leaving a row behind with `obj` still null would
/// make the ready query select it forever.
#[instrument(skip(meta, sink, opts), fields(entry.id = id))]
async fn backup_entry(
    meta: &MetaStore,
    sink: &dyn ObjectSink,
    opts: &EntryOpts,
    id: i64,
) -> Result<(), Error> {
    let Some(entry) = meta
        .with_conn(move |conn| Ok(queries::fsentry_get(conn, id)?))
        .await?
    else {
        return Ok(());
    };
    if entry.obj.is_some() {
        // Already backed up; a row surfaced twice between batches.
        return Ok(());
    }

    let stat = match std::fs::symlink_metadata(entry.local_path()) {
        Ok(m) => StatInfo::from(&m),
        Err(e) if entry_vanished(&e) => {
            info!(path = %entry.display_path(), "entry disappeared, deleting");
            meta.with_conn(move |conn| Ok(queries::fsentry_delete(conn, id)?))
                .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if stat.is_file() {
        backup_file(meta, sink, opts, &entry, &stat).await
    } else if stat.is_dir() {
        backup_directory(meta, sink, &entry, &stat).await
    } else {
        // Symlinks, sockets, devices and fifos are not backed up.
        warn!(
            path = %entry.display_path(),
            mode = stat.mode,
            "unsupported file type, not backing up"
        );
        meta.with_conn(move |conn| Ok(queries::fsentry_delete(conn, id)?))
            .await?;
        Ok(())
    }
}

async fn backup_file(
    meta: &MetaStore,
    sink: &dyn ObjectSink,
    opts: &EntryOpts,
    entry: &FsEntry,
    stat: &StatInfo,
) -> Result<(), Error> {
    let inode_meta = InodeMeta {
        size: stat.size,
        inode: stat.ino,
        uid: stat.uid,
        gid: stat.gid,
        mode: stat.mode,
        mtime_ns: stat.mtime_ns,
        atime_ns: stat.atime_ns,
    };

    let mut file = match open_for_backup(&entry.local_path()).await {
        Ok(file) => file,
        Err(e) => return recover_unreadable(meta, entry, e).await,
    };

    let (content, relations) = if stat.size < opts.inline_threshold {
        let mut buf = Vec::with_capacity(stat.size as usize);
        use tokio::io::AsyncReadExt;
        if let Err(e) = file.read_to_end(&mut buf).await {
            return recover_unreadable(meta, entry, e).await;
        }
        (FileContent::Immediate(Bytes::from(buf)), Vec::new())
    } else {
        let mut chunker = FixedChunker::new(file, opts.chunk_size as usize);
        let mut chunks: Vec<(u64, ObjId)> = Vec::new();
        let mut relations: Vec<Relation> = Vec::new();
        loop {
            match chunker.next_chunk().await {
                Ok(Some((offset, data))) => {
                    let objid = sink.admit(Payload::Blob(data), vec![]).await?;
                    chunks.push((offset, objid.clone()));
                    relations.push(Relation {
                        child: objid,
                        name: None,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    // Chunks already admitted stay behind as orphans on
                    // the remote; that only costs space.
                    return recover_unreadable(meta, entry, e).await;
                }
            }
        }
        (FileContent::Chunks(chunks), relations)
    };

    let object_count = relations.len() + 1;
    let objid = sink
        .admit(
            Payload::Inode {
                meta: inode_meta,
                content,
            },
            relations,
        )
        .await?;
    let entry_id = entry.id;
    let stat = *stat;
    meta.with_conn(move |conn| {
        Ok(queries::fsentry_set_backed_up(conn, entry_id, &objid, &stat)?)
    })
    .await?;
    info!(
        path = %entry.display_path(),
        objects = object_count,
        "backed up file"
    );
    Ok(())
}

async fn backup_directory(
    meta: &MetaStore,
    sink: &dyn ObjectSink,
    entry: &FsEntry,
    stat: &StatInfo,
) -> Result<(), Error> {
    // No filesystem reads beyond the lstat: the children and their
    // objids are already in the database.
    let entry_id = entry.id;
    let children = meta
        .with_conn(move |conn| Ok(queries::fsentry_children(conn, entry_id)?))
        .await?;

    let mut entries = Vec::with_capacity(children.len());
    let mut relations = Vec::with_capacity(children.len());
    for child in &children {
        let Some(objid) = &child.obj else {
            // The producer never emits a directory before its children
            // are all backed up; reaching this is a scheduler bug.
            return Err(Error::Dependency(format!(
                "{} depends on {}, which has not been backed up yet",
                entry.display_path(),
                child.display_path()
            )));
        };
        entries.push((child.name().to_owned(), objid.clone()));
        relations.push(Relation {
            child: objid.clone(),
            name: Some(child.name().to_str_lossy().into_owned()),
        });
    }

    let objid = sink
        .admit(
            Payload::Tree {
                meta: TreeMeta {
                    uid: stat.uid,
                    gid: stat.gid,
                    mode: stat.mode,
                    mtime_ns: stat.mtime_ns,
                    atime_ns: stat.atime_ns,
                },
                entries,
            },
            relations,
        )
        .await?;
    let stat = *stat;
    meta.with_conn(move |conn| {
        Ok(queries::fsentry_set_backed_up(conn, entry_id, &objid, &stat)?)
    })
    .await?;
    info!(path = %entry.display_path(), "backed up directory");
    Ok(())
}

/// Local recovery for files that vanish or become unreadable mid-backup:
/// drop the entry so the parent directory still gets backed up.
async fn recover_unreadable(
    meta: &MetaStore,
    entry: &FsEntry,
    e: std::io::Error,
) -> Result<(), Error> {
    if entry_vanished(&e) {
        info!(path = %entry.display_path(), "file disappeared, deleting");
    } else {
        warn!(path = %entry.display_path(), error = %e, "cannot read file, deleting");
    }
    let id = entry.id;
    meta.with_conn(move |conn| Ok(queries::fsentry_delete(conn, id)?))
        .await?;
    Ok(())
}

fn entry_vanished(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

/// Opens a file for reading without updating its atime where the
/// platform and permissions allow it. `O_NOATIME` is refused for files
/// the caller does not own; fall back to a plain open then.
async fn open_for_backup(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true).custom_flags(libc::O_NOATIME);
        match tokio::fs::OpenOptions::from(opts).open(path).await {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {}
            Err(e) => return Err(e),
        }
    }
    tokio::fs::File::open(path).await
}

/// Commits a snapshot for a backed-up root: the serialized record is
/// uploaded first, then the row, like any other object-graph mutation.
async fn create_snapshot(
    meta: &Arc<MetaStore>,
    remote: &Remote,
    root: &FsEntry,
    date: DateTime<Utc>,
) -> Result<(), Error> {
    let Some(objid) = &root.obj else {
        return Err(Error::Inconsistent(format!(
            "root {} has no object after backup",
            root.display_path()
        )));
    };

    let record = snapshot_record(&root.path, objid, date);
    let digest: ObjId = blake3::hash(&record).into();
    remote.put_snapshot(&digest, record.into()).await?;
    let path = root.path.clone();
    let root_objid = objid.clone();
    meta.with_txn(move |txn| Ok(queries::snapshot_insert(txn, &path, &root_objid, date)?))
        .await?;
    info!(path = %root.path.to_str_lossy(), root = %objid, "snapshot created");
    Ok(())
}

fn snapshot_record(path: &[u8], root: &ObjId, date: DateTime<Utc>) -> Vec<u8> {
    use crate::payload::{put_bytes, put_str, put_u64};
    let mut buf = Vec::new();
    put_str(&mut buf, "snapshot");
    put_bytes(&mut buf, path);
    put_bytes(&mut buf, root.as_slice());
    put_u64(&mut buf, date.timestamp_nanos_opt().unwrap_or_default() as u64);
    buf
}
