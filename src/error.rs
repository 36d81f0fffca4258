//! Error types shared by the cache, the upstream adapters and the web layer.

use thiserror::Error;

/// A required setting was absent from the process environment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable not configured")]
    Missing(&'static str),
}

/// Failures talking to the spreadsheet provider.
///
/// Messages are captured as strings so the error stays `Clone`; a single
/// refresh result is handed to every request waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    Parse(String),
}

impl UpstreamError {
    pub(crate) fn http(url: &str, err: reqwest::Error) -> Self {
        UpstreamError::Http {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors surfaced by cache reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("tab {0} not found")]
    NotFound(String),

    #[error("failed to refresh spreadsheet: {0}")]
    Refresh(#[from] UpstreamError),

    #[error("refresh task ended before publishing a snapshot")]
    Aborted,
}
