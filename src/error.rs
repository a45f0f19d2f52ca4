//! Crate-wide error types.

/// Result type for transport-layer operations (connection, body, exchange).
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors from the connection/body/exchange layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The peer closed the connection, or it was torn down locally.
    #[error("connection closed")]
    Closed,

    /// Underlying socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The request line or headers could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Request URI exceeded the configured limit.
    #[error("URI too long")]
    UriTooLong,

    /// An operation was attempted in a state that forbids it (e.g. writing
    /// a header after `send_headers` already ran).
    #[error("invalid exchange state: {0}")]
    InvalidState(String),
}

/// Result type for server-level operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Top-level server error, aggregating every layer below it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Transport-layer error (connection/body/exchange).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON-RPC protocol-level error, already carrying a standard error code.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::jsonrpc::JsonRpcError),

    /// Session lookup/management failure.
    #[error("session error: {message}")]
    Session {
        /// Human-readable detail.
        message: String,
    },

    /// Tool registry failure not representable as an in-band tool result
    /// (e.g. registering a duplicate name at startup).
    #[error("tool registry error: {message}")]
    ToolRegistry {
        /// Human-readable detail.
        message: String,
    },

    /// Configuration is internally inconsistent.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable detail.
        message: String,
    },
}

impl ServerError {
    /// Construct a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Construct a tool registry error.
    pub fn tool_registry(message: impl Into<String>) -> Self {
        Self::ToolRegistry {
            message: message.into(),
        }
    }
}
