use serde_json::{json, Value};
use thiserror::Error;

/// Type alias for `Result<T, eventodb::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents all the ways a request can fail.
///
/// Domain errors are reported to callers verbatim; everything else surfaces
/// as a backend error.
#[derive(Debug, Error)]
pub enum Error {
    /// Database error.
    #[error(transparent)]
    Backend(#[from] sqlx::Error),

    /// Filesystem error while managing namespace files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored value failed to decode.
    #[error("failed to decode {expected}")]
    Decode {
        /// What was expected of the value.
        expected: &'static str,
    },

    /// The stream is not at the version the writer claimed.
    #[error("stream {stream} is at version {actual}, expected {expected}")]
    VersionConflict {
        /// Stream the write targeted.
        stream: String,
        /// Version claimed by the writer.
        expected: i64,
        /// Version the stream is actually at.
        actual: i64,
    },

    /// No message exists for the stream.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The namespace does not exist.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// A namespace with this id or locator already exists.
    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    /// A batch import supplied a global position that is already taken.
    #[error("global position already exists: {0}")]
    PositionExists(i64),

    /// The request is malformed.
    #[error("{message}")]
    InvalidRequest {
        /// Human-readable description of the problem.
        message: String,
        /// Optional structured context echoed back to the caller.
        details: Option<Value>,
    },

    /// The RPC method is not part of the dispatch table.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// No credentials were presented.
    #[error("authentication required")]
    AuthRequired,

    /// The presented token did not verify against any namespace.
    #[error("invalid token")]
    InvalidToken,

    /// The token is valid but does not grant access to the target namespace.
    #[error("not authorized for this namespace")]
    Unauthorized,
}

impl Error {
    /// Builds an [`Error::InvalidRequest`] without structured details.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest {
            message: message.into(),
            details: None,
        }
    }

    /// Wire-level error code, stable across backends and releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Backend(_) | Error::Io(_) => "BACKEND_ERROR",
            Error::Decode { .. } => "INTERNAL_ERROR",
            Error::VersionConflict { .. } => "STREAM_VERSION_CONFLICT",
            Error::StreamNotFound(_) => "STREAM_NOT_FOUND",
            Error::NamespaceNotFound(_) => "NAMESPACE_NOT_FOUND",
            Error::NamespaceExists(_) => "NAMESPACE_EXISTS",
            Error::PositionExists(_) => "POSITION_EXISTS",
            Error::InvalidRequest { .. } => "INVALID_REQUEST",
            Error::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Error::AuthRequired => "AUTH_REQUIRED",
            Error::InvalidToken => "AUTH_INVALID_TOKEN",
            Error::Unauthorized => "AUTH_UNAUTHORIZED",
        }
    }

    /// Structured details for the wire envelope, when the variant has any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::VersionConflict {
                expected, actual, ..
            } => Some(json!({ "expected": expected, "actual": actual })),
            Error::InvalidRequest { details, .. } => details.clone(),
            _ => None,
        }
    }
}
