/// Every failure kind a [`crate::db::Database`] can surface (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local and remote both exist but disagree on UUID. Unrecoverable
    /// without user action - detected on open, before any further I/O.
    #[error("local file uuid {local} does not match remote uuid {remote}")]
    UuidMismatch { local: String, remote: String },

    #[error("remote transport is not writable")]
    NotWritable,

    #[error("remote transport is not readable")]
    NotReadable,

    #[error(transparent)]
    TransportError(#[from] remote_storage::Error),

    #[error("could not acquire the remote advisory lock within the configured timeout")]
    LockTimeout,

    #[error("database handle is read-only")]
    ReadOnly,

    #[error("key {0:?} not found")]
    KeyMissing(String),

    /// `set` was called with the reserved metadata key name - the façade
    /// translates that name to the primitive's own reserved slot and does
    /// not let a user value collide with it (spec.md §3, §9).
    #[error("key {0:?} is reserved for user metadata and cannot be set directly")]
    ReservedKey(String),

    /// Some per-key or per-group uploads failed during `push()`. The caller
    /// is given the failing key set; the Remote Index has already been
    /// advanced for every key that *did* succeed, so a retry only needs to
    /// resend these.
    #[error("{} of the pushed keys failed to upload: {failed_keys:?}", failed_keys.len())]
    PartialPushFailure { failed_keys: Vec<String> },

    #[error("local file header does not start with the booklet magic prefix")]
    CorruptHeader,

    #[error(transparent)]
    Local(#[from] booklet::Error),

    #[error("group blob is truncated or has an inconsistent length field")]
    CorruptGroup,
}

pub type Result<T> = std::result::Result<T, Error>;
