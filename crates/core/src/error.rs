//! Unified error types for scrapekit.
//!
//! "Not found" is never an error here: lookups return `Option`. Network
//! variants are produced by the transport and absorbed by the fetcher, while
//! storage and database variants always propagate to the caller.

use tokio_rusqlite::rusqlite;

/// Unified error types for the scrapekit crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request target could not be parsed as an http(s) URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Local filesystem I/O failed (cache directory, destination files).
    #[error("STORAGE_ERROR: {0}")]
    Storage(std::io::Error),

    /// Ledger database operation failed.
    #[error("LEDGER_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("LEDGER_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Metadata or payload could not be (de)serialized.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(String),

    /// Transport-level failure: DNS, connect, reset, timeout.
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    /// Server answered with a status that is neither 2xx nor 304.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Response body exceeded the configured byte limit.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// A ledger enumeration callback reported failure and halted the pass.
    #[error("CALLBACK_ABORTED: {cohort}/{uid}: {reason}")]
    CallbackAborted { cohort: String, uid: String, reason: String },
}

impl Error {
    /// Whether the error belongs to the network layer.
    ///
    /// These are the errors the fetcher converts into a failed outcome
    /// instead of returning them.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::HttpError(_) | Error::FetchTooLarge(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidUrl("not a url".to_string());
        assert!(err.to_string().contains("INVALID_URL"));
        assert!(err.to_string().contains("not a url"));
    }

    #[test]
    fn test_callback_aborted_display() {
        let err = Error::CallbackAborted { cohort: "feed1".into(), uid: "u4".into(), reason: "send failed".into() };
        assert_eq!(err.to_string(), "CALLBACK_ABORTED: feed1/u4: send failed");
    }

    #[test]
    fn test_io_error_is_storage() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!err.is_network());
    }

    #[test]
    fn test_network_classification() {
        assert!(Error::Network("timeout".into()).is_network());
        assert!(Error::HttpError("status 500".into()).is_network());
        assert!(Error::FetchTooLarge("big".into()).is_network());
        assert!(!Error::MigrationFailed("x".into()).is_network());
    }
}
