//! Transport layer for the MCP protocol.
//!
//! A transport frames and delivers JSON-RPC envelopes. The protocol engine
//! installs a [`TransportHandler`] before calling [`Transport::start`] and
//! thereafter owns the transport exclusively; inbound traffic arrives
//! through the handler callbacks, outbound traffic goes through
//! [`Transport::send`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::mcp::schema::AuthInfo;
use crate::mcp::types::{JsonRpcMessage, RequestId};
use crate::utils::error::{McpError, McpResult};

pub mod event_store;
pub mod http;
pub mod stdio;

pub use event_store::{EventId, EventStore, InMemoryEventStore, StreamId};
pub use http::{StreamableHttpServerOptions, StreamableHttpServerTransport};
pub use stdio::StdioTransport;

/// Callback invoked when the transport learns of a new resumption token.
pub type ResumptionCallback = Arc<dyn Fn(EventId) + Send + Sync>;

/// Options that travel with a single outbound message.
#[derive(Default, Clone)]
pub struct TransportSendOptions {
    /// The inbound request this outgoing message relates to. Absence means
    /// the message is unrelated to any request the peer is waiting on.
    pub related_request_id: Option<RequestId>,
    /// Opaque last-event-id to resume after, if the transport supports it
    pub resumption_token: Option<EventId>,
    /// Invoked when the transport assigns a new resumption token
    pub on_resumption_token: Option<ResumptionCallback>,
}

impl fmt::Debug for TransportSendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSendOptions")
            .field("related_request_id", &self.related_request_id)
            .field("resumption_token", &self.resumption_token)
            .field(
                "on_resumption_token",
                &self.on_resumption_token.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl TransportSendOptions {
    /// Options relating a message to an inbound request.
    pub fn related_to(request_id: RequestId) -> Self {
        Self {
            related_request_id: Some(request_id),
            ..Default::default()
        }
    }
}

/// Information about the HTTP request an inbound message arrived on, when
/// the transport has one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
    /// Request headers, lowercased names
    pub headers: HashMap<String, String>,
}

/// Out-of-band context delivered alongside an inbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageExtra {
    /// Validated auth descriptor, carried opaquely
    pub auth_info: Option<AuthInfo>,
    /// The HTTP request the message arrived on, when applicable
    pub request_info: Option<RequestInfo>,
}

/// Callbacks a transport delivers inbound traffic through.
///
/// Errors reported via `on_error` are not necessarily fatal; `on_close` is,
/// and fires at most once per started transport.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// A complete message arrived.
    async fn on_message(&self, message: JsonRpcMessage, extra: MessageExtra);
    /// An exceptional condition occurred that did not kill the connection.
    async fn on_error(&self, error: McpError);
    /// The connection closed, for any reason.
    async fn on_close(&self);
}

/// Framed byte delivery for JSON-RPC envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the handler for inbound traffic. Must be called before
    /// `start` or messages may be lost.
    fn bind_handler(&self, handler: Arc<dyn TransportHandler>);

    /// Start processing messages, including any connection steps.
    async fn start(&self) -> McpResult<()>;

    /// Send one message, with per-message options.
    async fn send(&self, message: JsonRpcMessage, options: TransportSendOptions) -> McpResult<()>;

    /// Close the connection. Triggers the handler's `on_close`.
    async fn close(&self) -> McpResult<()>;

    /// The session identifier this transport exposes for correlation with
    /// external systems, if it has one.
    fn session_id(&self) -> Option<String>;

    /// Record the protocol version negotiated during initialization.
    fn set_protocol_version(&self, version: &str) {
        let _ = version;
    }
}
