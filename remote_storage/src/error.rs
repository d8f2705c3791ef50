/// Errors surfaced by a [`crate::RemoteStorage`] transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any non-2xx, non-404 response from the transport. 404 on the db
    /// object itself is not an error (spec.md §4.1) — callers check
    /// `TransportError { status: 404, .. }` explicitly where a 404 is
    /// tolerated, and `is_not_found()` is a shorthand for that check.
    #[error("remote transport returned {status}: {body}")]
    TransportError { status: u16, body: String },

    /// Attempted a write operation (`put_object`, `delete_object`, ...)
    /// against a transport whose `writable()` is `false` (the HTTP
    /// variant, spec.md §4.1).
    #[error("remote transport is read-only")]
    NotWritable,

    /// The db object does not exist yet: a 404 on `get_db_object`/
    /// `head_db_object`, modelled as "remote empty" rather than an error
    /// at the call site that needs to distinguish it from real failures.
    #[error("remote database object does not exist")]
    RemoteEmpty,

    #[error("request error: {0}")]
    Request(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TransportError { status: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
