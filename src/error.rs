use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Per-symbol failure raised by a market-data or news provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("unauthorized (HTTP 401)")]
    Unauthorized,
    #[error("server error (HTTP {0})")]
    ServerError(u16),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("symbol not found (HTTP 404)")]
    NotFound,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),
    #[error("unexpected status (HTTP {0})")]
    UnexpectedStatus(u16),
}

impl FetchError {
    /// Maps an HTTP status to an error. Callers only pass non-success statuses.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500 | 502 | 503 | 504 => Self::ServerError(status),
            _ => Self::UnexpectedStatus(status),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::ServerError(_) => ErrorKind::ServerError,
            Self::Timeout => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::Network,
            Self::NotFound => ErrorKind::NotFound,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::InvalidSymbol(_) => ErrorKind::InvalidSymbol,
            Self::UnexpectedStatus(_) => ErrorKind::UnexpectedStatus,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Coarse classification used to group failures in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Unauthorized,
    ServerError,
    Timeout,
    Network,
    NotFound,
    Malformed,
    InvalidSymbol,
    UnexpectedStatus,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Unauthorized | Self::ServerError | Self::Timeout | Self::Network
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited",
            Self::Unauthorized => "unauthorized",
            Self::ServerError => "server error",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::NotFound => "not found",
            Self::Malformed => "malformed",
            Self::InvalidSymbol => "invalid symbol",
            Self::UnexpectedStatus => "unexpected status",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown rate limit preset '{0}'")]
    UnknownPreset(String),
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },
    #[error("backoff_base must be positive, got {0}")]
    BackoffBase(f64),
    #[error("{field} must be finite and non-negative with low <= high, got ({low}, {high})")]
    DelayRange {
        field: &'static str,
        low: f64,
        high: f64,
    },
    #[error("drop_threshold must be a finite percentage, got {0}")]
    Threshold(f64),
}

/// Failure to produce a ticker universe. Always fatal to the run.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to fetch ticker list: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to read ticker file {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("ticker source has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("could not locate the constituents table in the page")]
    TableNotFound,
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    #[error("ticker universe is empty")]
    Empty,
}
