//! Error types for session operations.

use thiserror::Error;

use crate::lsp::lifecycle::PhaseViolation;
use crate::lsp::types::{RequestId, ResponseError};

/// Errors raised while splitting a byte stream into frames.
///
/// Every framing error is fatal: the decoder does not resynchronize and the
/// session that owns it is torn down.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A header line could not be understood.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// The header block ended without a `Content-Length` field.
    #[error("Content-Length header not found")]
    MissingContentLength,

    /// The header block grew past the configured limit without terminating.
    #[error("frame header exceeds {max} bytes")]
    HeaderTooLarge {
        /// Configured header limit.
        max: usize,
    },

    /// The declared body length is larger than the configured limit.
    #[error("frame body of {len} bytes exceeds limit of {max} bytes")]
    BodyTooLarge {
        /// Declared body length.
        len: usize,
        /// Configured body limit.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("stream closed mid-frame with {buffered} bytes buffered")]
    UnexpectedEof {
        /// Bytes of the partial frame that were received.
        buffered: usize,
    },

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the registry, correlation table and session.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport produced bytes that could not be framed.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The message is not legal in the current session phase.
    #[error(transparent)]
    PhaseViolation(#[from] PhaseViolation),

    /// A response arrived for an id with no outstanding call.
    #[error("no pending request with id {0}")]
    UnknownId(RequestId),

    /// An id was registered while another call with the same id is pending.
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),

    /// A method name was registered twice with different shapes.
    #[error("method '{method}' is already registered as {existing}, cannot register as {attempted}")]
    DuplicateMethod {
        /// The method name.
        method: String,
        /// Shape already in the registry.
        existing: String,
        /// Shape that was rejected.
        attempted: String,
    },

    /// An outgoing message names a method the registry does not know.
    #[error("method '{0}' is not registered")]
    MethodNotRegistered(String),

    /// A method is used with types other than the ones it was registered with.
    #[error("method '{method}' is registered as {registered}, used as {used}")]
    ShapeMismatch {
        /// The method name.
        method: String,
        /// Registered shape.
        registered: String,
        /// Shape at the use site.
        used: String,
    },

    /// Failed to serialize outgoing params or results.
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Failed to deserialize incoming params or results.
    #[error("failed to deserialize message: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// A frame body is not a well-formed JSON-RPC message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer answered the request with an error response.
    #[error("peer returned error {}: {}", .0.code, .0.message)]
    Remote(ResponseError),

    /// The caller-side timeout elapsed before the response arrived.
    #[error("request '{method}' timed out")]
    Timeout {
        /// Method of the timed out call.
        method: String,
    },

    /// A router was attached to a session built on a different registry.
    #[error("router was built on a different method registry")]
    RegistryMismatch,

    /// The connection is closed; no further traffic is possible.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport failed while writing.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
