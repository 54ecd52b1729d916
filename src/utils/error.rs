use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Standard JSON-RPC parse error code (-32700)
pub const ERROR_CODE_PARSE_ERROR: i64 = -32700;
/// Invalid request error code (-32600)
pub const ERROR_CODE_INVALID_REQUEST: i64 = -32600;
/// Method not found error code (-32601)
pub const ERROR_CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params error code (-32602)
pub const ERROR_CODE_INVALID_PARAMS: i64 = -32602;
/// Internal error code (-32603)
pub const ERROR_CODE_INTERNAL_ERROR: i64 = -32603;

/// SDK error code: the connection closed with requests still in flight
pub const ERROR_CODE_CONNECTION_CLOSED: i64 = -32000;
/// SDK error code: a request exceeded its timeout
pub const ERROR_CODE_REQUEST_TIMEOUT: i64 = -32001;
/// SDK error code: the `mcp-session-id` header did not match a live session
pub const ERROR_CODE_SESSION_NOT_FOUND: i64 = -32002;
/// SDK error code: the HTTP method is not part of the transport contract
pub const ERROR_CODE_METHOD_NOT_ALLOWED: i64 = -32003;

/// The wire-level JSON-RPC error object carried inside `Error` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type that occurred
    pub code: i64,
    /// A short description of the error
    pub message: String,
    /// Additional information about the error, defined by the sender
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    /// Create a new error object
    pub fn new(code: i64, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// Error type for MCP operations
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// Malformed JSON on the wire (-32700)
    #[error("parse error: {0}")]
    Parse(String),

    /// Structurally invalid JSON-RPC message (-32600)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler registered for the method (-32601)
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Parameters did not match what the handler expects (-32602)
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Handler or engine failure surfaced to the peer (-32603)
    #[error("internal error: {0}")]
    Internal(String),

    /// The connection closed while requests were outstanding (-32000)
    #[error("connection closed")]
    ConnectionClosed,

    /// The request timed out waiting for its response (-32001)
    #[error("request timed out")]
    RequestTimeout {
        /// Context carried to the peer inside the cancellation notification
        data: Option<serde_json::Value>,
    },

    /// The `mcp-session-id` header did not match a live session (-32002)
    #[error("session not found")]
    SessionNotFound,

    /// HTTP method outside the POST/GET/DELETE contract (-32003)
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The caller cancelled the request before a response arrived
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// A capability check rejected the operation before it hit the wire
    #[error("capability not supported: {0}")]
    CapabilityMissing(String),

    /// No transport is attached to the protocol
    #[error("transport not connected")]
    NotConnected,

    /// The transport failed to deliver bytes
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error during read/write operations
    #[error("io error: {0}")]
    Io(String),

    /// Serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An error envelope returned by the remote peer
    #[error("MCP error {}: {}", .0.code, .0.message)]
    Peer(ErrorObject),
}

impl McpError {
    /// The JSON-RPC error code this error maps to on the wire.
    ///
    /// # Returns
    ///
    /// One of the standard JSON-RPC codes or the SDK range (−32000 to
    /// −32003); anything without a dedicated code maps to internal error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mcp_core::utils::error::McpError;
    ///
    /// let err = McpError::MethodNotFound("tools/call".to_string());
    /// assert_eq!(err.code(), -32601);
    ///
    /// let err = McpError::RequestTimeout { data: None };
    /// assert_eq!(err.code(), -32001);
    /// ```
    pub fn code(&self) -> i64 {
        match self {
            McpError::Parse(_) => ERROR_CODE_PARSE_ERROR,
            McpError::InvalidRequest(_) => ERROR_CODE_INVALID_REQUEST,
            McpError::MethodNotFound(_) => ERROR_CODE_METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => ERROR_CODE_INVALID_PARAMS,
            McpError::ConnectionClosed => ERROR_CODE_CONNECTION_CLOSED,
            McpError::RequestTimeout { .. } => ERROR_CODE_REQUEST_TIMEOUT,
            McpError::SessionNotFound => ERROR_CODE_SESSION_NOT_FOUND,
            McpError::MethodNotAllowed(_) => ERROR_CODE_METHOD_NOT_ALLOWED,
            McpError::Peer(err) => err.code,
            _ => ERROR_CODE_INTERNAL_ERROR,
        }
    }

    /// Convert into the wire-level error object sent to the peer.
    ///
    /// The message is the display form of the error; detail that should not
    /// cross the wire belongs in logs, not here.
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            McpError::RequestTimeout { data } => data.clone(),
            McpError::Peer(err) => err.data.clone(),
            _ => None,
        };
        ErrorObject::new(self.code(), self.to_string(), data)
    }
}

impl From<ErrorObject> for McpError {
    fn from(err: ErrorObject) -> Self {
        match err.code {
            ERROR_CODE_CONNECTION_CLOSED => McpError::ConnectionClosed,
            ERROR_CODE_REQUEST_TIMEOUT => McpError::RequestTimeout { data: err.data },
            ERROR_CODE_SESSION_NOT_FOUND => McpError::SessionNotFound,
            _ => McpError::Peer(err),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Io(err.to_string())
    }
}
