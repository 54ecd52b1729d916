//! MCP (Model Context Protocol) implementation
//!
//! This module provides the protocol engine and everything it needs: the
//! JSON-RPC wire codec with MCP's reserved-metadata discipline, the schema
//! scaffolding, the transport layer (stdio and streamable HTTP), and the
//! server/client shells with their capability policies.

/// Client shell and capability owner for the client side
pub mod client;
/// Closed registry of MCP method names
pub mod methods;
/// The bidirectional request/response multiplexer
pub mod protocol;
/// Shared concurrency primitives: guarded maps and cancellation tokens
pub mod registries;
/// MCP schema types: capabilities, tools, resources, prompts, sampling
pub mod schema;
/// Server shell and capability owner for the server side
pub mod server;
/// High-level registry façade over the server shell
pub mod server_registry;
/// Transport abstraction and implementations
pub mod transport;
/// JSON-RPC envelopes and the wire codec
pub mod types;
/// RFC 6570 subset used by resource templates
pub mod uri_template;

pub use client::Client;
pub use protocol::{Protocol, ProtocolOptions, RequestContext, RequestOptions};
pub use server::Server;
pub use server_registry::McpServer;
pub use transport::{Transport, TransportSendOptions};
pub use types::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Params};
