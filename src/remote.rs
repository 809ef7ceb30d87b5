//! Remote object storage.
//!
//! Uses any backend supported by the [object_store] crate. Object
//! payloads are stored at `objects/<shard>/<hex objid>`, snapshot records
//! at `snapshots/<hex digest>`; the two-character shard keeps directory
//! fan-out manageable on [object_store::local::LocalFileSystem].
//!
//! Bytes may be zstd-compressed at rest. Objids always hash the
//! uncompressed serialized payload, so the compression mode never changes
//! an object's identity.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use data_encoding::HEXLOWER;
use object_store::{path::Path, ObjectStore};
use tracing::{debug, instrument, trace};
use url::Url;

use crate::config::Compression;
use crate::digests::ObjId;
use crate::Error;

#[derive(Clone)]
pub struct Remote {
    object_store: Arc<dyn ObjectStore>,
    base_path: Path,
    compression: Compression,
}

impl Remote {
    /// Constructs a [Remote] from a [Url] supported by [object_store],
    /// with any path suffix becoming the base path. Additional options
    /// are passed through as in [object_store::parse_url_opts].
    pub fn parse_url_opts<I, K, V>(
        url: &Url,
        options: I,
        compression: Compression,
    ) -> Result<Self, object_store::Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (object_store, base_path) = object_store::parse_url_opts(url, options)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            base_path,
            compression,
        })
    }

    /// Like [Self::parse_url_opts], without options.
    pub fn parse_url(url: &Url, compression: Compression) -> Result<Self, object_store::Error> {
        Self::parse_url_opts(url, Vec::<(String, String)>::new(), compression)
    }

    fn object_path(&self, objid: &ObjId) -> Path {
        self.base_path
            .child("objects")
            .child(HEXLOWER.encode(&objid.as_slice()[..1]))
            .child(HEXLOWER.encode(objid.as_slice()))
    }

    fn snapshot_path(&self, digest: &ObjId) -> Path {
        self.base_path
            .child("snapshots")
            .child(HEXLOWER.encode(digest.as_slice()))
    }

    fn encode(&self, bytes: Bytes) -> Result<Bytes, Error> {
        match self.compression {
            Compression::None => Ok(bytes),
            Compression::Zstd => Ok(zstd::encode_all(
                Cursor::new(bytes),
                zstd::DEFAULT_COMPRESSION_LEVEL,
            )?
            .into()),
        }
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes, Error> {
        match self.compression {
            Compression::None => Ok(bytes),
            Compression::Zstd => Ok(zstd::stream::decode_all(Cursor::new(bytes))?.into()),
        }
    }

    /// Uploads a payload under its objid. The backend acknowledges only
    /// after the write is durable; re-uploading the same objid is
    /// harmless, the contents are identical by construction.
    #[instrument(skip_all, err, fields(object.objid = %objid, object.size = payload.len()))]
    pub async fn put_object(&self, objid: &ObjId, payload: Bytes) -> Result<(), Error> {
        let at_rest = self.encode(payload)?;
        trace!(compressed_size = at_rest.len(), "uploading object");
        self.object_store
            .put(&self.object_path(objid), at_rest.into())
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(object.objid = %objid))]
    pub async fn get_object(&self, objid: &ObjId) -> Result<Option<Bytes>, Error> {
        match self.object_store.get(&self.object_path(objid)).await {
            Ok(res) => Ok(Some(self.decode(res.bytes().await?)?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes an object's remote bytes. Silent when the key is already
    /// gone.
    #[instrument(skip_all, err, fields(object.objid = %objid))]
    pub async fn delete_object(&self, objid: &ObjId) -> Result<(), Error> {
        match self.object_store.delete(&self.object_path(objid)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!("object already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, err, fields(object.objid = %objid))]
    pub async fn object_exists(&self, objid: &ObjId) -> Result<bool, Error> {
        match self.object_store.head(&self.object_path(objid)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Uploads a serialized snapshot record, keyed by its own digest.
    /// Snapshot records make the remote self-contained: the local cache
    /// can be rebuilt from remote data alone.
    #[instrument(skip_all, err, fields(snapshot.digest = %digest))]
    pub async fn put_snapshot(&self, digest: &ObjId, record: Bytes) -> Result<(), Error> {
        let at_rest = self.encode(record)?;
        self.object_store
            .put(&self.snapshot_path(digest), at_rest.into())
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(snapshot.digest = %digest))]
    pub async fn delete_snapshot(&self, digest: &ObjId) -> Result<(), Error> {
        match self.object_store.delete(&self.snapshot_path(digest)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
