//! Object admission.
//!
//! Admitting an object is the one operation that touches both sides of
//! the repository: the payload is uploaded to remote storage, then the
//! object row and its child relations are committed to the metadata
//! store. The ordering is fixed. A crash after the upload but before the
//! commit leaves an unreferenced remote key, which wastes space and
//! nothing else; a row without an acked upload would corrupt every future
//! backup that deduplicates against it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use tracing::{instrument, trace};

use crate::digests::ObjId;
use crate::meta::{queries, MetaStore, NewObject, Relation};
use crate::payload::{ObjectKind, Payload};
use crate::remote::Remote;
use crate::Error;

/// The seam between entry serialization and object admission: submit a
/// payload with its child edges, receive the admitted objid back.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn admit(&self, payload: Payload, relations: Vec<Relation>) -> Result<ObjId, Error>;
}

pub struct ObjectService {
    meta: Arc<MetaStore>,
    remote: Remote,
    /// Objids currently being uploaded by some task in this process.
    inflight: tokio::sync::Mutex<HashSet<ObjId>>,
    inflight_done: tokio::sync::Notify,
}

impl ObjectService {
    pub fn new(meta: Arc<MetaStore>, remote: Remote) -> Self {
        Self {
            meta,
            remote,
            inflight: tokio::sync::Mutex::new(HashSet::new()),
            inflight_done: tokio::sync::Notify::new(),
        }
    }

    async fn upload_and_commit(
        &self,
        objid: &ObjId,
        payload: &Payload,
        encoded: bytes::Bytes,
        relations: Vec<Relation>,
    ) -> Result<(), Error> {
        // Re-check under the claim: a concurrent admission may have
        // committed between our lookup and the claim acquisition.
        let check = objid.clone();
        if self
            .meta
            .with_conn(move |conn| Ok(queries::object_exists(conn, &check)?))
            .await?
        {
            return Ok(());
        }

        // Remote first. The row only exists once the upload is durable.
        self.remote.put_object(objid, encoded.clone()).await?;

        let object = NewObject {
            kind: payload.kind(),
            file_size: match payload {
                Payload::Inode { meta, .. } => Some(meta.size),
                _ => None,
            },
            last_modified: match payload {
                Payload::Inode { meta, .. } => timestamp(meta.mtime_ns),
                Payload::Tree { meta, .. } => timestamp(meta.mtime_ns),
                Payload::Blob(_) => None,
            },
        };
        // Blob bytes live only remotely; metadata payloads are cached
        // locally so trees can be listed without a round-trip.
        let local_payload = match payload.kind() {
            ObjectKind::Blob => None,
            ObjectKind::Inode | ObjectKind::Tree => Some(encoded),
        };

        let objid = objid.clone();
        self.meta
            .with_txn(move |txn| {
                if queries::object_exists(txn, &objid)? {
                    return Ok(());
                }
                queries::object_insert(txn, &objid, &object, local_payload.as_deref(), &relations)?;
                Ok(())
            })
            .await
    }
}

fn timestamp(mtime_ns: i64) -> Option<DateTime<chrono::Utc>> {
    DateTime::from_timestamp(
        mtime_ns.div_euclid(1_000_000_000),
        mtime_ns.rem_euclid(1_000_000_000) as u32,
    )
}

#[async_trait]
impl ObjectSink for ObjectService {
    /// Hashes, uploads and commits the payload, or short-circuits if the
    /// object is already admitted. At most one remote PUT happens per
    /// distinct objid per process: concurrent admissions of the same
    /// content wait for the first upload instead of racing it.
    #[instrument(skip_all, fields(object.kind = %payload.kind()))]
    async fn admit(&self, payload: Payload, relations: Vec<Relation>) -> Result<ObjId, Error> {
        let encoded = payload.encode();
        let objid: ObjId = blake3::hash(&encoded).into();

        loop {
            let check = objid.clone();
            if self
                .meta
                .with_conn(move |conn| Ok(queries::object_exists(conn, &check)?))
                .await?
            {
                trace!(object.objid = %objid, "already admitted");
                return Ok(objid);
            }

            let done = self.inflight_done.notified();
            tokio::pin!(done);
            // Register for the wakeup before checking the claim, so a
            // claim released between our check and our await still wakes
            // us.
            done.as_mut().enable();

            if self.inflight.lock().await.insert(objid.clone()) {
                break;
            }
            done.await;
        }

        let result = self
            .upload_and_commit(&objid, &payload, encoded, relations)
            .await;

        self.inflight.lock().await.remove(&objid);
        self.inflight_done.notify_waiters();

        result.map(|()| objid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::fixtures::{BLOB_PAYLOAD_A, CHUNK_A, INODE_PAYLOAD_IMMEDIATE};
    use url::Url;

    fn service() -> ObjectService {
        let meta = Arc::new(MetaStore::open_in_memory().expect("open"));
        let remote = Remote::parse_url(
            &Url::parse("memory:///").expect("static url"),
            Compression::None,
        )
        .expect("memory remote");
        ObjectService::new(meta, remote)
    }

    #[tokio::test]
    async fn admit_uploads_and_commits() {
        let svc = service();
        let objid = svc
            .admit(BLOB_PAYLOAD_A.clone(), vec![])
            .await
            .expect("admit");

        assert_eq!(objid, ObjId::from(blake3::hash(&BLOB_PAYLOAD_A.encode())));
        let row = svc
            .meta
            .with_conn_blocking(|conn| Ok(queries::object_get(conn, &objid)?))
            .expect("query")
            .expect("row exists");
        assert_eq!(row.kind, ObjectKind::Blob);
        // Blob payloads are not cached locally.
        assert_eq!(row.payload, None);
        let uploaded = svc
            .remote
            .get_object(&objid)
            .await
            .expect("get")
            .expect("uploaded");
        assert_eq!(uploaded, BLOB_PAYLOAD_A.encode());
    }

    #[tokio::test]
    async fn duplicate_admission_short_circuits() {
        let svc = service();
        let first = svc
            .admit(BLOB_PAYLOAD_A.clone(), vec![])
            .await
            .expect("admit");
        let second = svc
            .admit(BLOB_PAYLOAD_A.clone(), vec![])
            .await
            .expect("admit again");
        assert_eq!(first, second);
        let count = svc
            .meta
            .with_conn_blocking(|conn| Ok(queries::object_count(conn)?))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn inode_rows_carry_advisory_fields() {
        let svc = service();
        let objid = svc
            .admit(INODE_PAYLOAD_IMMEDIATE.clone(), vec![])
            .await
            .expect("admit");
        let row = svc
            .meta
            .with_conn_blocking(|conn| Ok(queries::object_get(conn, &objid)?))
            .expect("query")
            .expect("row exists");
        assert_eq!(row.kind, ObjectKind::Inode);
        assert_eq!(row.file_size, Some(CHUNK_A.len() as u64));
        assert!(row.payload.is_some());
        assert!(row.last_modified.is_some());
    }

    #[tokio::test]
    async fn relations_are_recorded_with_the_parent() {
        let svc = service();
        let child = svc
            .admit(BLOB_PAYLOAD_A.clone(), vec![])
            .await
            .expect("admit blob");
        let parent = svc
            .admit(
                INODE_PAYLOAD_IMMEDIATE.clone(),
                vec![Relation {
                    child: child.clone(),
                    name: None,
                }],
            )
            .await
            .expect("admit inode");
        let children = svc
            .meta
            .with_conn_blocking(|conn| Ok(queries::object_children(conn, &parent)?))
            .expect("children");
        assert_eq!(children, vec![child]);
    }

    #[tokio::test]
    async fn concurrent_admissions_of_identical_content_converge() {
        let svc = Arc::new(service());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let svc = svc.clone();
            tasks.spawn(async move { svc.admit(BLOB_PAYLOAD_A.clone(), vec![]).await });
        }
        let mut ids = Vec::new();
        while let Some(res) = tasks.join_next().await {
            ids.push(res.expect("join").expect("admit"));
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let count = svc
            .meta
            .with_conn_blocking(|conn| Ok(queries::object_count(conn)?))
            .expect("count");
        assert_eq!(count, 1);
    }
}
