use std::sync::Arc;

use url::Url;

use crate::config::Config;
use crate::meta::{queries, FsEntry, MetaStore};
use crate::repo::Repository;


/// A repository against an in-memory metadata store and an in-memory
/// remote.
pub(crate) fn test_repo() -> Repository {
    test_repo_with(|_| {})
}

pub(crate) fn test_repo_with(tweak: impl FnOnce(&mut Config)) -> Repository {
    let meta = Arc::new(MetaStore::open_in_memory().expect("open metadata store"));
    let mut config = Config::new(Url::parse("memory:///").expect("static url"));
    tweak(&mut config);
    Repository::assemble(meta, config).expect("assemble repository")
}

pub(crate) async fn scan_and_backup(repo: &Repository) -> crate::backup::BackupStats {
    repo.scan(false, |_, _| {}).await.expect("scan");
    repo.backup(&Default::default(), |_, _| {})
        .await
        .expect("backup")
}

pub(crate) fn object_count(repo: &Repository) -> u64 {
    repo.meta
        .with_conn_blocking(|conn| Ok(queries::object_count(conn)?))
        .expect("count objects")
}

pub(crate) fn all_objids(repo: &Repository) -> Vec<crate::ObjId> {
    repo.meta
        .with_conn_blocking(|conn| Ok(queries::object_ids_page(conn, None, i64::MAX as u64)?))
        .expect("list objects")
}

pub(crate) fn entry_by_path(repo: &Repository, path: &std::path::Path) -> Option<FsEntry> {
    use std::os::unix::ffi::OsStrExt;
    repo.meta
        .with_conn_blocking(|conn| Ok(queries::fsentry_by_path(conn, path.as_os_str().as_bytes())?))
        .expect("query entry")
}
