// Crate-wide error type.
//
// Error kinds map onto the propagation policy: `InvalidInput` is surfaced to
// the caller and never retried; `Conflict` is counted, not escalated;
// `RetryableTransient` is recorded for the next sync/sweeper tick; `Fatal`
// aborts the process after logging. The HTTP layer maps these onto status
// codes (see `sync::server`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("too many ops: {0}")]
    TooManyOps(String),

    #[error("transient failure: {0}")]
    RetryableTransient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("observer failure: {0}")]
    ObserverFailure(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Message safe to print to the user, stripped of internal detail.
    pub fn to_user_string(&self) -> String {
        match self {
            Error::InvalidInput(m) => m.clone(),
            Error::Conflict(m) => m.clone(),
            Error::Unauthorized(_) => "unauthorized".to_string(),
            Error::Forbidden(_) => "forbidden".to_string(),
            Error::NotFound(m) => m.clone(),
            Error::PayloadTooLarge(m) => m.clone(),
            Error::TooManyOps(m) => m.clone(),
            Error::RetryableTransient(m) => m.clone(),
            Error::Fatal(m) => m.clone(),
            Error::ObserverFailure(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status code this error maps onto when returned from the sync server.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::PayloadTooLarge(_) => 413,
            Error::TooManyOps(_) => 413,
            Error::RetryableTransient(_) => 503,
            _ => 500,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::RetryableTransient("task cancelled".to_string())
        } else {
            Error::Fatal(format!("task panicked: {e}"))
        }
    }
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        e.to_string()
    }
}
