use crate::cache::CacheError;
use crate::persistence::StoreError;
use crate::runtime::RuntimeError;

/// Daemon-level error taxonomy.
///
/// Logical conflicts are distinguished variants so callers can react without
/// matching on message strings; everything transport-shaped is folded into
/// `TransientIo` or `Fatal`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("build failure: {0}")]
    Fatal(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("build store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => {
                Error::InvalidRequest(format!("duplicate build id {id}"))
            }
            StoreError::NotFound(id) => Error::NotFound(format!("build {id}")),
            StoreError::IllegalTransition { .. } => Error::IllegalTransition(err.to_string()),
            StoreError::Sqlx(_) => Error::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled => Error::Cancelled,
            RuntimeError::Timeout(_) => Error::TransientIo(err.to_string()),
            _ => Error::Fatal(err.to_string()),
        }
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::LockTimeout { .. } => Error::TransientIo(err.to_string()),
            _ => Error::Fatal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
