//! Repository configuration.
//!
//! Settings are persisted in the metadata store's `settings` table at
//! init time and loaded into a typed [Config] that gets passed explicitly
//! into the engines.

use url::Url;

use crate::meta::{queries, MetaStore};
use crate::Error;

/// Files strictly smaller than this are inlined into the inode payload.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 2 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Compression applied to remote bytes at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::Config(format!(
                "unknown compression mode {other:?} (expected \"none\" or \"zstd\")"
            ))),
        }
    }
}

/// Encryption applied to remote bytes at rest. Only `none` is wired in;
/// the setting is persisted so a repository created with a future cipher
/// is refused instead of silently read as plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
}

impl Encryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encryption::None => "none",
        }
    }
}

impl std::str::FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Encryption::None),
            other => Err(Error::Config(format!(
                "unsupported encryption mode {other:?} (expected \"none\")"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub inline_threshold: u64,
    pub chunk_size: u64,
    pub worker_count: usize,
    pub compression: Compression,
    pub encryption: Encryption,
    /// Where the remote storage driver lives, as an [object_store] URL
    /// (`file:///...`, `memory:///`, `s3://...`).
    pub storage_url: Url,
}

impl Config {
    pub fn new(storage_url: Url) -> Self {
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            compression: Compression::None,
            encryption: Encryption::None,
            storage_url,
        }
    }

    /// Persists every recognized setting.
    pub fn store(&self, store: &MetaStore) -> Result<(), Error> {
        store.with_txn_blocking(|txn| {
            queries::setting_set(txn, "inline_threshold", &self.inline_threshold.to_string())?;
            queries::setting_set(txn, "chunk_size", &self.chunk_size.to_string())?;
            queries::setting_set(txn, "worker_count", &self.worker_count.to_string())?;
            queries::setting_set(txn, "compression", self.compression.as_str())?;
            queries::setting_set(txn, "encryption", self.encryption.as_str())?;
            queries::setting_set(txn, "storage_url", self.storage_url.as_str())?;
            Ok(())
        })
    }

    /// Loads the configuration persisted at init time. Absent optional
    /// settings fall back to their defaults; `storage_url` has no
    /// sensible default, so a store that was never initialized is
    /// refused.
    pub fn load(store: &MetaStore) -> Result<Self, Error> {
        store.with_conn_blocking(|conn| {
            let storage_url =
                queries::setting_get_required(conn, "storage_url")?.parse::<Url>()?;

            Ok(Self {
                inline_threshold: parse_setting(
                    conn,
                    "inline_threshold",
                    DEFAULT_INLINE_THRESHOLD,
                )?,
                chunk_size: parse_setting(conn, "chunk_size", DEFAULT_CHUNK_SIZE)?,
                worker_count: parse_setting(conn, "worker_count", DEFAULT_WORKER_COUNT)?,
                compression: parse_setting(conn, "compression", Compression::None)?,
                encryption: parse_setting(conn, "encryption", Encryption::None)?,
                storage_url,
            })
        })
    }
}

fn parse_setting<T>(
    conn: &rusqlite::Connection,
    key: &str,
    default: T,
) -> Result<T, Error>
where
    T: std::str::FromStr,
    Error: From<T::Err>,
{
    match queries::setting_get(conn, key)? {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(value: std::num::ParseIntError) -> Self {
        Error::Config(value.to_string())
    }
}
