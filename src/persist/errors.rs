use thiserror::Error;
use time::OffsetDateTime;

use crate::ids::MemoId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("memo {id} was changed elsewhere (edited from {expected}, store is at {actual})")]
    Conflict {
        id: MemoId,
        expected: OffsetDateTime,
        actual: OffsetDateTime,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("persistence is not running")]
    Unavailable,

    #[error("stored data is malformed: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Connection(#[from] diesel::ConnectionError),
}

/// How a failure is propagated to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before touching anything; nothing to retry.
    Validation,
    /// Someone else changed the memo since our baseline.
    Conflict,
    /// Store or channel trouble; retried with the next edit.
    Transport,
    /// Terminal for the operation that hit it.
    NotFound,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound(_) => ErrorClass::NotFound,
            StoreError::Conflict { .. } => ErrorClass::Conflict,
            StoreError::BadRequest(_) => ErrorClass::Validation,
            StoreError::Unavailable
            | StoreError::Corrupt(_)
            | StoreError::Database(_)
            | StoreError::Connection(_) => ErrorClass::Transport,
        }
    }
}
