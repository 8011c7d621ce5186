//! Error types shared by the store, the origin fetcher and the coordinator.
//!
//! Every variant is cheap to clone: one fetch cycle's outcome is handed to
//! each caller waiting on it.

use std::io;
use std::sync::Arc;

use http::StatusCode;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("cache entry not found")]
    NotFound,

    #[error("cache io: {0}")]
    Io(Arc<io::Error>),
}

impl StoreError {
    pub fn io(err: io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::io(err)
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The locator cannot be fetched at all; never retried.
    #[error("malformed locator: {0}")]
    MalformedInput(String),

    /// The origin answered with a status that will not change on retry.
    #[error("origin returned terminal status {status}")]
    OriginTerminal { status: StatusCode },

    /// Retries exhausted on network errors, timeouts or non-terminal statuses.
    #[error("origin failed after {attempts} attempts: {reason}")]
    OriginTransient { attempts: u32, reason: String },

    #[error("origin returned an empty body")]
    EmptyBody,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

impl FetchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FetchError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::MalformedInput(_) => "malformed",
            FetchError::OriginTerminal { .. } => "terminal",
            FetchError::OriginTransient { .. } => "transient",
            FetchError::EmptyBody => "empty",
            FetchError::Store(_) => "store",
            FetchError::Internal(_) => "internal",
        }
    }
}
