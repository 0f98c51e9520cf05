//! Failure classes of a crawl cycle.
//!
//! Only [`CrawlError`] is fatal to a refresh. Everything else is logged at the
//! point of failure and degraded to "no data" / default state / skipped message.

use thiserror::Error;

/// A single request that produced no usable payload.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("invalid url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("fetcher shut down")]
    Closed,
}

impl FetchError {
    /// Transport errors, throttling and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Url { .. } | FetchError::Closed => false,
        }
    }
}

/// A payload that could not be read as a listing page or a time table.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("selector {0:?} rejected")]
    Selector(String),

    #[error("malformed time table: {0}")]
    TimeTable(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("duckdb: {0}")]
    Database(#[from] duckdb::Error),

    #[error("value under {key:?} is not valid json: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notify {subscriber} failed: {reason}")]
    Rejected { subscriber: String, reason: String },

    #[error("notify {subscriber} failed: {source}")]
    Transport {
        subscriber: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Fatal to one crawl run; surfaces to whoever triggered the refresh.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("facility directory unavailable: {0}")]
    DirectoryUnavailable(#[source] FetchError),

    #[error("no snapshot available")]
    NoSnapshot,
}

/// Rejected alert registrations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("date {0:?} is not YYYY-MM-DD or YYYYMMDD")]
    InvalidDate(String),

    #[error("date {0} is not after today")]
    DateNotInFuture(String),

    #[error("court group must not be empty")]
    EmptyCourtGroup,

    #[error("alert already registered for {court_group} on {date}")]
    Duplicate { court_group: String, date: String },

    #[error("no alert for {court_group} on {date}")]
    NotFound { court_group: String, date: String },

    #[error("could not persist alerts: {0}")]
    Storage(String),
}
