//! Server shell: identity, advertised capabilities and policy checks.
//!
//! A [`Server`] owns a [`Protocol`] engine and implements the server side of
//! the capability matrix: which methods the peer may invoke on us, which we
//! may invoke on the peer, and which notification channels we advertised.
//! It also handles the `initialize` handshake, negotiating the protocol
//! version and recording the client's capabilities for later checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::mcp::methods;
use crate::mcp::protocol::{
    NotificationHandler, NotificationOptions, Protocol, ProtocolHost, ProtocolOptions,
    RequestHandler, RequestOptions,
};
use crate::mcp::registries::SharedMap;
use crate::mcp::schema::{
    is_supported_protocol_version, ClientCapabilities, CreateMessageParams, CreateMessageResult,
    Implementation, InitializeParams, InitializeResult, ListRootsResult, LoggingLevel,
    LoggingMessageParams, ResourceUpdatedParams, ServerCapabilities, SetLevelParams,
    LATEST_PROTOCOL_VERSION,
};
use crate::mcp::transport::Transport;
use crate::mcp::types::Params;
use crate::utils::error::{McpError, McpResult};

/// Configuration for a [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Capabilities advertised during initialization
    pub capabilities: ServerCapabilities,
    /// Usage instructions returned from `initialize`
    pub instructions: Option<String>,
    /// Engine-level options
    pub protocol: ProtocolOptions,
}

/// Callback invoked once the client confirms initialization.
pub type InitializedCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback observing non-fatal errors.
pub type ErrorCallback = Arc<dyn Fn(&McpError) + Send + Sync>;

struct ServerHost {
    capabilities: RwLock<ServerCapabilities>,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    client_info: RwLock<Option<Implementation>>,
    initialized: AtomicBool,
    on_initialized: RwLock<Option<InitializedCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    fallback_request_handler: RwLock<Option<RequestHandler>>,
    fallback_notification_handler: RwLock<Option<NotificationHandler>>,
    /// Minimum severity requested per session via `logging/setLevel`
    logging_levels: SharedMap<String, LoggingLevel>,
}

impl ServerHost {
    fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.read().expect("capabilities lock poisoned").clone()
    }

    fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities
            .read()
            .expect("client capabilities lock poisoned")
            .clone()
    }
}

impl ProtocolHost for ServerHost {
    fn may_invoke(&self, method: &str) -> McpResult<()> {
        let client = self.client_capabilities().unwrap_or_default();
        match method {
            methods::METHOD_SAMPLING_CREATE_MESSAGE if client.sampling.is_none() => {
                Err(McpError::CapabilityMissing(format!(
                    "client has not advertised sampling (required for {method})"
                )))
            }
            methods::METHOD_ROOTS_LIST if client.roots.is_none() => {
                Err(McpError::CapabilityMissing(format!(
                    "client has not advertised roots (required for {method})"
                )))
            }
            _ => Ok(()),
        }
    }

    fn may_handle(&self, method: &str) -> McpResult<()> {
        let caps = self.capabilities();
        let missing = |capability: &str| {
            Err(McpError::CapabilityMissing(format!(
                "server capability {capability} not advertised (required to handle {method})"
            )))
        };
        match method {
            methods::METHOD_INITIALIZE | methods::METHOD_PING => Ok(()),
            m if m.starts_with("prompts/") && caps.prompts.is_none() => missing("prompts"),
            m if m.starts_with("resources/") && caps.resources.is_none() => missing("resources"),
            m if m.starts_with("tools/") && caps.tools.is_none() => missing("tools"),
            methods::METHOD_LOGGING_SET_LEVEL if caps.logging.is_none() => missing("logging"),
            methods::METHOD_COMPLETION_COMPLETE if caps.completions.is_none() => {
                missing("completions")
            }
            _ => Ok(()),
        }
    }

    fn may_notify(&self, method: &str) -> McpResult<()> {
        let caps = self.capabilities();
        let missing = |capability: &str| {
            Err(McpError::CapabilityMissing(format!(
                "server capability {capability} not advertised (required to send {method})"
            )))
        };
        match method {
            methods::NOTIFICATION_MESSAGE if caps.logging.is_none() => missing("logging"),
            methods::NOTIFICATION_RESOURCES_LIST_CHANGED
            | methods::NOTIFICATION_RESOURCES_UPDATED
                if caps.resources.is_none() =>
            {
                missing("resources")
            }
            methods::NOTIFICATION_TOOLS_LIST_CHANGED if caps.tools.is_none() => missing("tools"),
            methods::NOTIFICATION_PROMPTS_LIST_CHANGED if caps.prompts.is_none() => {
                missing("prompts")
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
        error!(error = %err, "server protocol error");
        if let Some(callback) = self.on_error.read().expect("on_error lock poisoned").clone() {
            callback(err);
        }
    }

    fn on_close(&self) {
        debug!("server connection closed");
    }
}

/// An MCP server: the capability owner for the server side of a connection.
///
/// For the declarative tool/resource/prompt API, see
/// [`crate::mcp::server_registry::McpServer`], which layers on top of this.
#[derive(Clone)]
pub struct Server {
    host: Arc<ServerHost>,
    protocol: Protocol,
    info: Implementation,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("info", &self.info)
            .field("initialized", &self.host.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

impl Server {
    /// Create a server with the given identity and options.
    pub fn new(info: Implementation, options: ServerOptions) -> Self {
        let has_logging = options.capabilities.logging.is_some();
        let host = Arc::new(ServerHost {
            capabilities: RwLock::new(options.capabilities),
            client_capabilities: RwLock::new(None),
            client_info: RwLock::new(None),
            initialized: AtomicBool::new(false),
            on_initialized: RwLock::new(None),
            on_error: RwLock::new(None),
            fallback_request_handler: RwLock::new(None),
            fallback_notification_handler: RwLock::new(None),
            logging_levels: SharedMap::new(),
        });
        let protocol = Protocol::new(host.clone(), options.protocol);
        let server = Self {
            host,
            protocol,
            info,
        };
        server.install_initialize_handlers(options.instructions);
        if has_logging {
            server.install_set_level_handler();
        }
        server
    }

    fn install_initialize_handlers(&self, instructions: Option<String>) {
        let host = Arc::clone(&self.host);
        // Weak: the closure lives inside the engine's own handler table.
        let protocol = self.protocol.downgrade();
        let info = self.info.clone();
        self.protocol.set_request_handler(
            methods::METHOD_INITIALIZE,
            Arc::new(move |request, _context| {
                let host = Arc::clone(&host);
                let protocol = protocol.clone();
                let info = info.clone();
                let instructions = instructions.clone();
                Box::pin(async move {
                    let params: InitializeParams = request.params_as()?;
                    let requested = params.protocol_version.clone();
                    *host
                        .client_capabilities
                        .write()
                        .expect("client capabilities lock poisoned") =
                        Some(params.capabilities);
                    *host
                        .client_info
                        .write()
                        .expect("client info lock poisoned") = Some(params.client_info);

                    // Echo a supported requested version, else offer the
                    // latest; it is the client's call to disconnect.
                    let negotiated = if is_supported_protocol_version(&requested) {
                        requested
                    } else {
                        LATEST_PROTOCOL_VERSION.to_string()
                    };
                    if let Some(transport) = protocol.upgrade().and_then(|p| p.transport()) {
                        transport.set_protocol_version(&negotiated);
                    }

                    Params::from_typed(&InitializeResult {
                        meta: None,
                        protocol_version: negotiated,
                        capabilities: host.capabilities(),
                        server_info: info,
                        instructions,
                    })
                })
            }),
        );

        let host = Arc::clone(&self.host);
        self.protocol.set_notification_handler(
            methods::NOTIFICATION_INITIALIZED,
            Arc::new(move |_notification| {
                let host = Arc::clone(&host);
                Box::pin(async move {
                    host.initialized.store(true, Ordering::Release);
                    let callback = host
                        .on_initialized
                        .read()
                        .expect("on_initialized lock poisoned")
                        .clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                    Ok(())
                })
            }),
        );
    }

    fn install_set_level_handler(&self) {
        let host = Arc::clone(&self.host);
        self.protocol.set_request_handler(
            methods::METHOD_LOGGING_SET_LEVEL,
            Arc::new(move |request, context| {
                let host = Arc::clone(&host);
                Box::pin(async move {
                    let params: SetLevelParams = request.params_as()?;
                    let session = context.session_id.unwrap_or_default();
                    host.logging_levels.set(session, params.level);
                    Ok(Params::new())
                })
            }),
        );
    }

    /// Attach to a transport and start it.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        self.protocol.connect(transport).await
    }

    /// Close the connection.
    pub async fn close(&self) -> McpResult<()> {
        self.protocol.close().await
    }

    /// The underlying engine, for advanced use (custom handlers, raw
    /// requests).
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Whether a transport is currently attached.
    pub fn is_connected(&self) -> bool {
        self.protocol.transport().is_some()
    }

    /// Whether the client completed initialization.
    pub fn is_initialized(&self) -> bool {
        self.host.initialized.load(Ordering::Acquire)
    }

    /// Merge additional advertised capabilities. Must happen before
    /// connecting.
    pub fn register_capabilities(&self, capabilities: ServerCapabilities) -> McpResult<()> {
        if self.is_connected() {
            return Err(McpError::InvalidRequest(
                "cannot register capabilities after connecting to a transport".into(),
            ));
        }
        self.host
            .capabilities
            .write()
            .expect("capabilities lock poisoned")
            .merge(capabilities);
        Ok(())
    }

    /// The currently advertised capabilities.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.host.capabilities()
    }

    /// The capabilities the client advertised during initialization.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.host.client_capabilities()
    }

    /// The client identity from initialization.
    pub fn client_info(&self) -> Option<Implementation> {
        self.host.client_info.read().expect("client info lock poisoned").clone()
    }

    /// Invoked when the client sends `notifications/initialized`.
    pub fn set_on_initialized(&self, callback: InitializedCallback) {
        *self
            .host
            .on_initialized
            .write()
            .expect("on_initialized lock poisoned") = Some(callback);
    }

    /// Observe non-fatal errors.
    pub fn set_on_error(&self, callback: ErrorCallback) {
        *self.host.on_error.write().expect("on_error lock poisoned") = Some(callback);
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

    /// Ask the client to sample its LLM.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
        options: RequestOptions,
    ) -> McpResult<CreateMessageResult> {
        let result = self
            .protocol
            .request(
                methods::METHOD_SAMPLING_CREATE_MESSAGE,
                Some(Params::from_typed(&params)?),
                options,
            )
            .await?;
        result.typed()
    }

    /// Ask the client for its root list.
    pub async fn list_roots(&self) -> McpResult<ListRootsResult> {
        let result = self
            .protocol
            .request(methods::METHOD_ROOTS_LIST, None, RequestOptions::default())
            .await?;
        result.typed()
    }

    /// Send a log message to the client, honoring the minimum severity the
    /// session asked for via `logging/setLevel`.
    pub async fn send_logging_message(
        &self,
        level: LoggingLevel,
        data: serde_json::Value,
        logger: Option<String>,
    ) -> McpResult<()> {
        if let Some(transport) = self.protocol.transport() {
            if let Some(session) = transport.session_id() {
                if let Some(minimum) = self.host.logging_levels.get(&session) {
                    if level < minimum {
                        return Ok(());
                    }
                }
            }
        }
        let params = LoggingMessageParams {
            level,
            logger,
            data,
        };
        self.protocol
            .notification(
                methods::NOTIFICATION_MESSAGE,
                Some(Params::from_typed(&params)?),
                NotificationOptions::default(),
            )
            .await
    }

    /// Tell the client the resource list changed.
    pub async fn send_resource_list_changed(&self) -> McpResult<()> {
        self.protocol
            .notification(
                methods::NOTIFICATION_RESOURCES_LIST_CHANGED,
                None,
                NotificationOptions::default(),
            )
            .await
    }

    /// Tell the client a subscribed resource changed.
    pub async fn send_resource_updated(&self, uri: impl Into<String>) -> McpResult<()> {
        let params = ResourceUpdatedParams { uri: uri.into() };
        self.protocol
            .notification(
                methods::NOTIFICATION_RESOURCES_UPDATED,
                Some(Params::from_typed(&params)?),
                NotificationOptions::default(),
            )
            .await
    }

    /// Tell the client the tool list changed.
    pub async fn send_tool_list_changed(&self) -> McpResult<()> {
        self.protocol
            .notification(
                methods::NOTIFICATION_TOOLS_LIST_CHANGED,
                None,
                NotificationOptions::default(),
            )
            .await
    }

    /// Tell the client the prompt list changed.
    pub async fn send_prompt_list_changed(&self) -> McpResult<()> {
        self.protocol
            .notification(
                methods::NOTIFICATION_PROMPTS_LIST_CHANGED,
                None,
                NotificationOptions::default(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::schema::ListChangedCapability;

    fn server_with(capabilities: ServerCapabilities) -> Server {
        Server::new(
            Implementation::new("test-server", "0.1.0"),
            ServerOptions {
                capabilities,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_may_handle_follows_advertised_capabilities() {
        let server = server_with(ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            ..Default::default()
        });
        assert!(server.host.may_handle("tools/call").is_ok());
        assert!(server.host.may_handle("prompts/get").is_err());
        assert!(server.host.may_handle("ping").is_ok());
        assert!(server.host.may_handle("initialize").is_ok());
    }

    #[tokio::test]
    async fn test_may_invoke_checks_client_capabilities() {
        let server = server_with(ServerCapabilities::default());
        // No client connected yet: nothing advertised.
        assert!(server.host.may_invoke("sampling/createMessage").is_err());
        assert!(server.host.may_invoke("roots/list").is_err());
        assert!(server.host.may_invoke("ping").is_ok());

        *server.host.client_capabilities.write().unwrap() = Some(ClientCapabilities {
            sampling: Some(serde_json::json!({})),
            ..Default::default()
        });
        assert!(server.host.may_invoke("sampling/createMessage").is_ok());
        assert!(server.host.may_invoke("roots/list").is_err());
    }

    #[tokio::test]
    async fn test_may_notify_checks_channels() {
        let server = server_with(ServerCapabilities {
            logging: Some(serde_json::json!({})),
            ..Default::default()
        });
        assert!(server.host.may_notify("notifications/message").is_ok());
        assert!(server
            .host
            .may_notify("notifications/tools/list_changed")
            .is_err());
        assert!(server.host.may_notify("notifications/cancelled").is_ok());
    }

    #[tokio::test]
    async fn test_register_capabilities_merges() {
        let server = server_with(ServerCapabilities::default());
        server
            .register_capabilities(ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                ..Default::default()
            })
            .unwrap();
        assert!(server.capabilities().tools.is_some());
    }
}
