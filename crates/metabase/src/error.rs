//! Metabase error types.
//!
//! Every failure surfaced to callers carries a stable kind (see
//! [`MetabaseError::kind`]) plus a short message. Backend errors are
//! translated at the adapter boundary; anything untranslated is wrapped with
//! its cause preserved.

use thiserror::Error;

/// Metabase operation errors.
#[derive(Debug, Error)]
pub enum MetabaseError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("pending object missing")]
    PendingObjectMissing,

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("object already exists")]
    ObjectAlreadyExists,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed precondition: {0}")]
    PreconditionFailed(String),

    #[error("object lock: {0}")]
    ObjectLock(String),

    #[error("object expiration: {0}")]
    ObjectExpiration(String),

    #[error("object status: {0}")]
    ObjectStatus(String),

    #[error("value changed: {0}")]
    ValueChanged(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetabaseError {
    /// Stable identity of this error, independent of the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            MetabaseError::InvalidRequest(_) => "invalid-request",
            MetabaseError::ObjectNotFound(_) => "object-not-found",
            MetabaseError::PendingObjectMissing => "pending-object-missing",
            MetabaseError::SegmentNotFound(_) => "segment-not-found",
            MetabaseError::ObjectAlreadyExists => "object-already-exists",
            MetabaseError::Conflict(_) => "conflict",
            MetabaseError::PreconditionFailed(_) => "precondition-failed",
            MetabaseError::ObjectLock(_) => "object-lock",
            MetabaseError::ObjectExpiration(_) => "object-expiration",
            MetabaseError::ObjectStatus(_) => "object-status",
            MetabaseError::ValueChanged(_) => "value-changed",
            MetabaseError::Database(_) | MetabaseError::Internal(_) => "internal",
        }
    }
}

impl From<vantage_core::Error> for MetabaseError {
    fn from(err: vantage_core::Error) -> Self {
        match err {
            vantage_core::Error::InvalidArgument(msg) => MetabaseError::InvalidRequest(msg),
            vantage_core::Error::Encoding(msg) => MetabaseError::Internal(msg),
        }
    }
}

/// Result type for metabase operations.
pub type MetabaseResult<T> = std::result::Result<T, MetabaseError>;

/// SQLSTATE for unique constraint violations.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for not-null constraint violations.
pub(crate) const NOT_NULL_VIOLATION: &str = "23502";
/// SQLSTATE for serialization failures (retriable on CockroachDB).
pub(crate) const SERIALIZATION_FAILURE: &str = "40001";

/// The SQLSTATE of a database error, if the error carries one.
pub(crate) fn sql_state(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}
