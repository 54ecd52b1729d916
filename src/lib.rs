//! mcp-core is a pure Rust implementation of the Model Context Protocol (MCP)
//! protocol engine, usable as either side of a connection. It provides the
//! bidirectional JSON-RPC 2.0 multiplexer, the per-request lifecycle machinery
//! (timeouts, progress, cancellation), the wire codec with MCP's reserved
//! `_meta` discipline, and two transports: line-delimited stdio and the
//! resumable streamable HTTP transport with a server-initiated event stream.

/// Core MCP protocol implementation: codec, engine, transports, shells.
pub mod mcp;

/// Utility modules for error handling and common functionality.
pub mod utils;

// Re-export key MCP types
pub use mcp::{
    client::Client,
    protocol::{Protocol, ProtocolOptions, RequestOptions},
    server::Server,
    server_registry::McpServer,
    transport::Transport,
    types::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Params},
};

// Re-export error types
pub use utils::error::{McpError, McpResult};
