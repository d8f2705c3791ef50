use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} does not start with the booklet magic prefix; refusing to open")]
    CorruptHeader { path: PathBuf },

    #[error("{path} is already open for write by another process")]
    Locked { path: PathBuf },

    #[error("key {0:?} is reserved for metadata and cannot be set directly")]
    ReservedKey(String),

    #[error("value for fixed-length store must be exactly {expected} bytes, got {actual}")]
    WrongValueLength { expected: usize, actual: usize },

    #[error("store was opened read-only")]
    ReadOnly,

    #[error("key {0:?} not found")]
    KeyMissing(String),
}

pub type Result<T> = std::result::Result<T, Error>;
