//! Error types for the braid data layer.

use crate::types::{BackendId, Cid};
use thiserror::Error;

/// Store and router errors.
///
/// Absent objects are not errors on read paths: reads return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Locally computed id and backend-assigned id disagree on create.
    /// Fatal for that create call; never retried, never cached under the
    /// mismatched id.
    #[error("id mismatch: computed {computed}, backend returned {assigned}")]
    IdMismatch { computed: Cid, assigned: Cid },

    #[error("malformed id: {0}")]
    MalformedId(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),

    /// An operation (not a plain read) required an object that is absent
    /// from the cache and every backend.
    #[error("object not found: {0}")]
    NotFound(Cid),

    /// The backend exists but does not support this operation. Must surface
    /// explicitly, never silently succeed as a no-op.
    #[error("operation not supported by backend: {0}")]
    Unimplemented(&'static str),

    #[error("backend {backend} failed: {detail}")]
    Backend { backend: BackendId, detail: String },

    /// A dispatched optimistic write failed after the caller already moved
    /// on. Surfaced by `Router::wait_drained`; the cache may be
    /// inconsistent with the backend afterwards.
    #[error("deferred write failed: {0}")]
    DeferredWrite(Box<StoreError>),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Tree service errors.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A tree operation referenced a perspective that is not in the
    /// addressed tree, or an out-of-range child index. Raised before any
    /// mutation is attempted.
    #[error("missing parent: {0}")]
    MissingParent(String),

    /// A perspective was reached twice on one traversal path. The data
    /// model does not guard against cyclic links in malformed input, so
    /// traversals do.
    #[error("cycle detected at perspective {0}")]
    CycleDetected(Cid),

    #[error("perspective not found: {0}")]
    PerspectiveNotFound(Cid),

    #[error("commit not found: {0}")]
    CommitNotFound(Cid),

    #[error("data not found: {0}")]
    DataNotFound(Cid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Merge engine errors.
///
/// An ambiguous context bucket is *not* an error: merges resolve it with a
/// fixed deterministic policy and always terminate with a result.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("perspective not found: {0}")]
    PerspectiveNotFound(Cid),

    #[error("commit not found: {0}")]
    CommitNotFound(Cid),

    #[error("data not found: {0}")]
    DataNotFound(Cid),

    /// Strategy used outside its supported surface (e.g. a draft-only
    /// strategy asked to merge remote perspectives).
    #[error("merge operation not supported by this strategy: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}
