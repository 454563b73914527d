use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Couldn't persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Realm {realm}: page {page} failed: {source}")]
    PageFailed {
        realm: String,
        page: u32,
        #[source]
        source: FetchError,
    },

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    /// Errors after which the run must stop instead of skipping a page.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::PageFailed { .. })
    }
}

/// Outcome of a single failed page fetch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("network error: {0}")]
    Network(String),

    #[error("client error: HTTP {0}")]
    Client(u16),
    #[error("malformed page: {0}")]
    Malformed(String),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt at the same page may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::RateLimited { .. }
                | FetchError::Server(_)
                | FetchError::Network(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = value.status() {
            FetchError::from_status(status.as_u16(), None)
        } else if value.is_decode() {
            FetchError::Malformed(value.to_string())
        } else {
            FetchError::Network(value.to_string())
        }
    }
}

impl FetchError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => FetchError::RateLimited { retry_after },
            500..=599 => FetchError::Server(status),
            _ => FetchError::Client(status),
        }
    }
}
