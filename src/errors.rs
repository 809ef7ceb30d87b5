use thiserror::Error;
use tokio::task::JoinError;

/// Errors surfaced by the engines and services.
///
/// Conditions caused by ordinary filesystem churn (entries vanishing or
/// becoming unreadable mid-run) are recovered where they occur and never
/// show up here; everything else aborts the enclosing run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("filesystem entries are still unscanned, run a scan first")]
    ScanNotRun,

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("backup made no progress: {0} entries left to back up but none ready")]
    NoProgress(u64),

    #[error("interrupted")]
    Interrupted,

    #[error("metadata store inconsistency: {0}")]
    Inconsistent(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    Meta(#[from] rusqlite::Error),

    #[error("remote storage error: {0}")]
    Remote(#[from] object_store::Error),

    #[error("invalid payload: {0}")]
    Payload(#[from] crate::payload::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Task(value.to_string())
    }
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::Inconsistent(value.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::Config(value.to_string())
    }
}
