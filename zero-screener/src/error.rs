//! Error types for the screener.
//!
//! Per-instrument failures (`FetchError`, `StoreError`) are counted by the
//! engine and never abort a run. `ScreenerError` covers the few conditions
//! that do.

use thiserror::Error;
use zero_common::ValidationError;

/// Failure reported by an indicator source or universe provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The instrument or market is unknown to the source
    #[error("Not found: {0}")]
    NotFound(String),

    /// The source did not answer in time
    #[error("Fetch timed out: {0}")]
    Timeout(String),

    /// Network hiccup, rate limit, or other failure worth retrying
    #[error("Transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    /// Check if the error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

impl From<FetchError> for zero_common::Error {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound(msg) => Self::NotFound(msg),
            FetchError::Timeout(_) => Self::Timeout,
            FetchError::Transient(msg) => Self::External(msg),
        }
    }
}

/// Failure inside a history store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for zero_common::Error {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Run-level failure. Only these stop a screening run.
#[derive(Debug, Error)]
pub enum ScreenerError {
    #[error("Failed to list instruments for market {market}: {source}")]
    Universe {
        market: String,
        #[source]
        source: FetchError,
    },

    #[error("Invalid screener configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("History store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryable() {
        assert!(FetchError::Timeout("005930".into()).is_retryable());
        assert!(FetchError::Transient("503".into()).is_retryable());
        assert!(!FetchError::NotFound("005930".into()).is_retryable());
    }

    #[test]
    fn test_fetch_error_into_common() {
        let err: zero_common::Error = FetchError::NotFound("000660".into()).into();
        assert!(matches!(err, zero_common::Error::NotFound(_)));
        let err: zero_common::Error = FetchError::Transient("reset".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_universe_error_message() {
        let err = ScreenerError::Universe {
            market: "KOSDAQ".into(),
            source: FetchError::Transient("connection reset".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("KOSDAQ"));
        assert!(msg.contains("connection reset"));
    }
}
