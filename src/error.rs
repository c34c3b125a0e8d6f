use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the synchronization core.
///
/// Most of these never reach the caller of evaluation queries: they are logged and swallowed at
/// the boundary of the component that produced them (backup persistence, stream dispatch, poll
/// tick, metrics flush).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Connection or HTTP-level failure. Retried by the scheduler or the stream reconnect loop.
    #[error(transparent)]
    Transport(Arc<reqwest::Error>),

    /// The stream delivered nothing, not even a heartbeat, within the read timeout.
    #[error("no data received from stream within {0:?}")]
    ReadTimeout(Duration),

    /// The server answered with an unexpected status code.
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),

    /// Payload could not be parsed into a snapshot.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Backup file or bootstrap file I/O failure.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// The reporting endpoint rejected a metrics report.
    #[error("metrics report rejected with status {0}")]
    ReportRejected(StatusCode),

    /// Invalid `url` configuration.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// Streaming mode was requested but the crate was built without the `streaming` feature.
    #[error("streaming transport is not available, rebuild with the `streaming` feature or use polling")]
    StreamingUnavailable,

    /// Bootstrap was configured without any usable source.
    #[error("bootstrap configuration has no data source")]
    BootstrapUnavailable,

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,
}

/// A snapshot payload was rejected by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload is not valid JSON or does not match the snapshot schema.
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    /// Payload is valid JSON but neither a snapshot nor an event envelope.
    #[error("unrecognized snapshot document")]
    UnrecognizedDocument,
}

impl From<serde_json::Error> for ParseError {
    fn from(value: serde_json::Error) -> Self {
        ParseError::Malformed(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(Arc::new(value.without_url()))
    }
}
