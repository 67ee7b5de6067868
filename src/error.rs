//! Error types for the drover crate.

use std::io;

use http::StatusCode;

use crate::transport::h2::frame::ErrorCode;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by request handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while driving a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer sent a request we refuse with an HTTP status.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// HTTP/2 protocol violation.
    #[error(transparent)]
    Http2(#[from] H2Error),

    /// The peer went away before the exchange completed.
    #[error("client disconnected")]
    ClientDisconnected,

    /// Inactivity timeout fired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid driver configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request handler failed or panicked.
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Create a client error carrying a status code.
    pub fn client(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Client(ClientError::new(status, reason))
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Status code to answer with, when the error maps to one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Client(e) => Some(e.status),
            Self::Handler(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }
}

/// A request rejected with an HTTP status (400, 413, 431, 501, 505...).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {reason}")]
pub struct ClientError {
    pub status: StatusCode,
    pub reason: String,
}

impl ClientError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    pub fn payload_too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds limit")
    }

    pub fn headers_too_large() -> Self {
        Self::new(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "request header block exceeds limit",
        )
    }
}

/// HTTP/2 errors, scoped to a stream or to the whole connection (RFC 9113 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum H2Error {
    /// Answered with RST_STREAM; other streams are unaffected.
    #[error("stream {id} error {code:?}: {reason}")]
    Stream {
        id: u32,
        code: ErrorCode,
        reason: String,
    },

    /// Answered with GOAWAY and connection close.
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorCode, reason: String },
}

impl H2Error {
    pub fn stream(id: u32, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Stream {
            id,
            code,
            reason: reason.into(),
        }
    }

    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    /// PROTOCOL_ERROR on the whole connection.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::connection(ErrorCode::ProtocolError, reason)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Stream { code, .. } | Self::Connection { code, .. } => *code,
        }
    }
}
