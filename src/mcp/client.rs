//! Client shell: the capability owner for the client side.
//!
//! Mirrors the server shell. `connect` performs the initialize handshake:
//! it sends `initialize` with the latest protocol version, verifies the
//! server's negotiated version is one we support (disconnecting otherwise),
//! records the server's capabilities for strict-capability checks, then
//! confirms with `notifications/initialized`.

use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::mcp::methods;
use crate::mcp::protocol::{
    NotificationHandler, NotificationOptions, Protocol, ProtocolHost, ProtocolOptions,
    RequestHandler, RequestOptions,
};
use crate::mcp::schema::{
    is_supported_protocol_version, CallToolParams, CallToolResult, ClientCapabilities,
    CompleteParams, CompleteResult, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, PaginatedParams, ReadResourceResult,
    ResourceUriParams, ServerCapabilities, SetLevelParams, LATEST_PROTOCOL_VERSION,
};
use crate::mcp::transport::Transport;
use crate::mcp::types::Params;
use crate::utils::error::{McpError, McpResult};

/// Configuration for a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Capabilities advertised during initialization
    pub capabilities: ClientCapabilities,
    /// Engine-level options
    pub protocol: ProtocolOptions,
}

struct ClientHost {
    capabilities: RwLock<ClientCapabilities>,
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    server_info: RwLock<Option<Implementation>>,
    instructions: RwLock<Option<String>>,
    fallback_request_handler: RwLock<Option<RequestHandler>>,
    fallback_notification_handler: RwLock<Option<NotificationHandler>>,
}

impl ClientHost {
    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities.read().expect("capabilities lock poisoned").clone()
    }

    fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities
            .read()
            .expect("server capabilities lock poisoned")
            .clone()
    }
}

impl ProtocolHost for ClientHost {
    fn may_invoke(&self, method: &str) -> McpResult<()> {
        let server = self.server_capabilities().unwrap_or_default();
        let missing = |capability: &str| {
            Err(McpError::CapabilityMissing(format!(
                "server has not advertised {capability} (required for {method})"
            )))
        };
        match method {
            methods::METHOD_INITIALIZE | methods::METHOD_PING => Ok(()),
            m if m.starts_with("prompts/") && server.prompts.is_none() => missing("prompts"),
            m if m.starts_with("resources/") && server.resources.is_none() => {
                missing("resources")
            }
            m if m.starts_with("tools/") && server.tools.is_none() => missing("tools"),
            methods::METHOD_LOGGING_SET_LEVEL if server.logging.is_none() => missing("logging"),
            methods::METHOD_COMPLETION_COMPLETE if server.completions.is_none() => {
                missing("completions")
            }
            _ => Ok(()),
        }
    }

    fn may_handle(&self, method: &str) -> McpResult<()> {
        let caps = self.capabilities();
        match method {
            methods::METHOD_SAMPLING_CREATE_MESSAGE if caps.sampling.is_none() => {
                Err(McpError::CapabilityMissing(format!(
                    "client capability sampling not advertised (required to handle {method})"
                )))
            }
            methods::METHOD_ROOTS_LIST if caps.roots.is_none() => {
                Err(McpError::CapabilityMissing(format!(
                    "client capability roots not advertised (required to handle {method})"
                )))
            }
            _ => Ok(()),
        }
    }

    fn may_notify(&self, method: &str) -> McpResult<()> {
        let caps = self.capabilities();
        match method {
            methods::NOTIFICATION_ROOTS_LIST_CHANGED if caps.roots.is_none() => {
                Err(McpError::CapabilityMissing(format!(
                    "client capability roots not advertised (required to send {method})"
                )))
            }
            _ => Ok(()),
        }
    }

    fn fallback_request_handler(&self) -> Option<RequestHandler> {
        self.fallback_request_handler
            .read()
            .expect("fallback lock poisoned")
            .clone()
    }

    fn fallback_notification_handler(&self) -> Option<NotificationHandler> {
        self.fallback_notification_handler
            .read()
            .expect("fallback lock poisoned")
            .clone()
    }

    fn on_error(&self, err: &McpError) {
        error!(error = %err, "client protocol error");
    }

    fn on_close(&self) {
        debug!("client connection closed");
    }
}

/// An MCP client: the capability owner for the client side of a connection.
#[derive(Clone)]
pub struct Client {
    host: Arc<ClientHost>,
    protocol: Protocol,
    info: Implementation,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("info", &self.info).finish()
    }
}

impl Client {
    /// Create a client with the given identity and options.
    pub fn new(info: Implementation, options: ClientOptions) -> Self {
        let host = Arc::new(ClientHost {
            capabilities: RwLock::new(options.capabilities),
            server_capabilities: RwLock::new(None),
            server_info: RwLock::new(None),
            instructions: RwLock::new(None),
            fallback_request_handler: RwLock::new(None),
            fallback_notification_handler: RwLock::new(None),
        });
        let protocol = Protocol::new(host.clone(), options.protocol);
        Self {
            host,
            protocol,
            info,
        }
    }

    /// Attach to a transport, start it and run the initialize handshake.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        self.protocol.connect(transport).await?;

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.host.capabilities(),
            client_info: self.info.clone(),
        };
        let result = self
            .protocol
            .request(
                methods::METHOD_INITIALIZE,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await?;
        let result: InitializeResult = result.typed()?;

        // The server may counter-offer a different version; if we cannot
        // speak it, it is on us to disconnect.
        if !is_supported_protocol_version(&result.protocol_version) {
            let version = result.protocol_version.clone();
            let _ = self.protocol.close().await;
            return Err(McpError::InvalidRequest(format!(
                "server negotiated unsupported protocol version {version}"
            )));
        }

        if let Some(transport) = self.protocol.transport() {
            transport.set_protocol_version(&result.protocol_version);
        }
        *self
            .host
            .server_capabilities
            .write()
            .expect("server capabilities lock poisoned") = Some(result.capabilities);
        *self.host.server_info.write().expect("server info lock poisoned") =
            Some(result.server_info);
        *self.host.instructions.write().expect("instructions lock poisoned") =
            result.instructions;

        self.protocol
            .notification(
                methods::NOTIFICATION_INITIALIZED,
                None,
                NotificationOptions::default(),
            )
            .await
    }

    /// Close the connection.
    pub async fn close(&self) -> McpResult<()> {
        self.protocol.close().await
    }

    /// The underlying engine, for advanced use.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// The capabilities the server advertised during initialization.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.host.server_capabilities()
    }

    /// The server identity from initialization.
    pub fn server_info(&self) -> Option<Implementation> {
        self.host.server_info.read().expect("server info lock poisoned").clone()
    }

    /// The usage instructions the server returned, if any.
    pub fn instructions(&self) -> Option<String> {
        self.host.instructions.read().expect("instructions lock poisoned").clone()
    }

    /// Backstop handler for request methods nothing else handles.
    pub fn set_fallback_request_handler(&self, handler: RequestHandler) {
        *self
            .host
            .fallback_request_handler
            .write()
            .expect("fallback lock poisoned") = Some(handler);
    }

    /// Backstop handler for notification methods nothing else handles.
    pub fn set_fallback_notification_handler(&self, handler: NotificationHandler) {
        *self
            .host
            .fallback_notification_handler
            .write()
            .expect("fallback lock poisoned") = Some(handler);
    }

    /// Check the other party is still alive.
    pub async fn ping(&self) -> McpResult<()> {
        self.protocol
            .request(methods::METHOD_PING, None, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// List the server's tools.
    pub async fn list_tools(&self, params: PaginatedParams) -> McpResult<ListToolsResult> {
        self.paginated_request(methods::METHOD_TOOLS_LIST, params).await
    }

    /// Invoke a tool on the server.
    pub async fn call_tool(
        &self,
        params: CallToolParams,
        options: RequestOptions,
    ) -> McpResult<CallToolResult> {
        let result = self
            .protocol
            .request(
                methods::METHOD_TOOLS_CALL,
                Some(Params::from_typed(&params)?),
                options,
            )
            .await?;
        result.typed()
    }

    /// List the server's resources.
    pub async fn list_resources(&self, params: PaginatedParams) -> McpResult<ListResourcesResult> {
        self.paginated_request(methods::METHOD_RESOURCES_LIST, params).await
    }

    /// List the server's resource templates.
    pub async fn list_resource_templates(
        &self,
        params: PaginatedParams,
    ) -> McpResult<ListResourceTemplatesResult> {
        self.paginated_request(methods::METHOD_RESOURCES_TEMPLATES_LIST, params)
            .await
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: impl Into<String>) -> McpResult<ReadResourceResult> {
        let params = ResourceUriParams { uri: uri.into() };
        let result = self
            .protocol
            .request(
                methods::METHOD_RESOURCES_READ,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await?;
        result.typed()
    }

    /// Subscribe to updates of a resource.
    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> McpResult<()> {
        let params = ResourceUriParams { uri: uri.into() };
        self.protocol
            .request(
                methods::METHOD_RESOURCES_SUBSCRIBE,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Cancel a resource subscription.
    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> McpResult<()> {
        let params = ResourceUriParams { uri: uri.into() };
        self.protocol
            .request(
                methods::METHOD_RESOURCES_UNSUBSCRIBE,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// List the server's prompts.
    pub async fn list_prompts(&self, params: PaginatedParams) -> McpResult<ListPromptsResult> {
        self.paginated_request(methods::METHOD_PROMPTS_LIST, params).await
    }

    /// Render a prompt.
    pub async fn get_prompt(&self, params: GetPromptParams) -> McpResult<GetPromptResult> {
        let result = self
            .protocol
            .request(
                methods::METHOD_PROMPTS_GET,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await?;
        result.typed()
    }

    /// Ask the server for argument completion.
    pub async fn complete(&self, params: CompleteParams) -> McpResult<CompleteResult> {
        let result = self
            .protocol
            .request(
                methods::METHOD_COMPLETION_COMPLETE,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await?;
        result.typed()
    }

    /// Set the minimum logging level the server should send.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> McpResult<()> {
        let params = SetLevelParams { level };
        self.protocol
            .request(
                methods::METHOD_LOGGING_SET_LEVEL,
                Some(Params::from_typed(&params)?),
                RequestOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Tell the server the root list changed.
    pub async fn send_roots_list_changed(&self) -> McpResult<()> {
        self.protocol
            .notification(
                methods::NOTIFICATION_ROOTS_LIST_CHANGED,
                None,
                NotificationOptions::default(),
            )
            .await
    }

    async fn paginated_request<T: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: PaginatedParams,
    ) -> McpResult<T> {
        let params = if params.cursor.is_some() {
            Some(Params::from_typed(&params)?)
        } else {
            None
        };
        let result = self
            .protocol
            .request(method, params, RequestOptions::default())
            .await?;
        result.typed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::schema::ListChangedCapability;

    #[test]
    fn test_may_invoke_follows_server_capabilities() {
        let client = Client::new(
            Implementation::new("test-client", "0.1.0"),
            ClientOptions::default(),
        );
        // Nothing negotiated yet.
        assert!(client.host.may_invoke("tools/call").is_err());
        assert!(client.host.may_invoke("ping").is_ok());
        assert!(client.host.may_invoke("initialize").is_ok());

        *client.host.server_capabilities.write().unwrap() = Some(ServerCapabilities {
            tools: Some(ListChangedCapability::default()),
            ..Default::default()
        });
        assert!(client.host.may_invoke("tools/call").is_ok());
        assert!(client.host.may_invoke("prompts/get").is_err());
    }

    #[test]
    fn test_may_handle_follows_own_capabilities() {
        let client = Client::new(
            Implementation::new("test-client", "0.1.0"),
            ClientOptions {
                capabilities: ClientCapabilities {
                    sampling: Some(serde_json::json!({})),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert!(client.host.may_handle("sampling/createMessage").is_ok());
        assert!(client.host.may_handle("roots/list").is_err());
    }
}
