//! The repository: one metadata store, one remote, one configuration.

use std::path::Path;
use std::sync::Arc;

use bstr::ByteSlice;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::backup::{self, BackupStats};
use crate::config::Config;
use crate::gc::{self, GcStats};
use crate::meta::{queries, MetaStore};
use crate::objectservice::ObjectService;
use crate::remote::Remote;
use crate::scan::{self, ScanStats};
use crate::Error;

pub struct Repository {
    pub meta: Arc<MetaStore>,
    pub remote: Remote,
    pub config: Config,
    objects: Arc<ObjectService>,
}

impl Repository {
    /// Creates the metadata store and persists the configuration into it.
    #[instrument(skip_all, fields(db = %db_path.display()))]
    pub fn init(db_path: &Path, config: Config) -> Result<Self, Error> {
        let meta = Arc::new(MetaStore::open(db_path)?);
        config.store(&meta)?;
        info!(storage_url = %config.storage_url, "repository initialized");
        Self::assemble(meta, config)
    }

    /// Opens an initialized repository, loading the persisted
    /// configuration.
    pub fn open(db_path: &Path) -> Result<Self, Error> {
        let meta = Arc::new(MetaStore::open(db_path)?);
        let config = Config::load(&meta)?;
        Self::assemble(meta, config)
    }

    /// Wires a repository from parts already at hand. Used by `init` and
    /// `open`, and directly by tests running against in-memory stores.
    pub fn assemble(meta: Arc<MetaStore>, config: Config) -> Result<Self, Error> {
        let remote = Remote::parse_url(&config.storage_url, config.compression)?;
        let objects = Arc::new(ObjectService::new(meta.clone(), remote.clone()));
        Ok(Self {
            meta,
            remote,
            config,
            objects,
        })
    }

    /// Starts tracking a filesystem root. The next scan walks it.
    pub fn add_root(&self, path: &Path) -> Result<(), Error> {
        use std::os::unix::ffi::OsStrExt;

        if !path.is_absolute() {
            return Err(Error::Config(format!(
                "backup root must be an absolute path, got {}",
                path.display()
            )));
        }
        let mut raw = path.as_os_str().as_bytes();
        while raw.len() > 1 && raw.ends_with(b"/") {
            raw = &raw[..raw.len() - 1];
        }

        self.meta.with_txn_blocking(|txn| {
            match queries::fsentry_insert_root(txn, raw) {
                Ok(_) => Ok(()),
                Err(e) if queries::is_unique_violation(&e) => Err(Error::Config(format!(
                    "{} is already tracked",
                    raw.as_bstr()
                ))),
                Err(e) => Err(e.into()),
            }
        })?;
        info!(path = %raw.as_bstr(), "tracking new root");
        Ok(())
    }

    /// Runs a scan on the blocking thread pool; the scan engine itself
    /// is synchronous.
    pub async fn scan(
        &self,
        skip_existing: bool,
        progress: impl FnMut(u64, Option<u64>) + Send + 'static,
    ) -> Result<ScanStats, Error> {
        let meta = self.meta.clone();
        tokio::task::spawn_blocking(move || scan::scan(&meta, skip_existing, progress)).await?
    }

    pub async fn backup(
        &self,
        cancel: &CancellationToken,
        progress: impl FnMut(u64, u64),
    ) -> Result<BackupStats, Error> {
        backup::backup(
            &self.meta,
            &self.objects,
            &self.remote,
            &self.config,
            cancel,
            progress,
        )
        .await
    }

    pub async fn gc(&self) -> Result<GcStats, Error> {
        gc::collect(&self.meta, &self.remote).await
    }
}
