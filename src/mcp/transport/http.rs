//! Streamable HTTP server transport.
//!
//! Implements the MCP Streamable HTTP specification: POST carries one or
//! more JSON-RPC messages from the client, GET opens the single standalone
//! server-to-client SSE stream, DELETE terminates the session. Responses to
//! a POST are delivered either as SSE frames on a per-POST stream (the
//! default) or, when JSON-response mode is enabled, as a single JSON body
//! once every request in the POST has its response.
//!
//! With an [`EventStore`] configured every outbound SSE message is
//! persisted first and its event id written into the frame, so a client
//! can reconnect with `last-event-id` and have the missed tail replayed.
//!
//! In stateful mode a configured generator mints a session id on the
//! initialize POST; every later request must echo it via `mcp-session-id`.
//! Stateless mode (no generator) skips session handling entirely.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mcp_core::mcp::schema::Implementation;
//! use mcp_core::mcp::server::{Server, ServerOptions};
//! use mcp_core::mcp::transport::http::{
//!     StreamableHttpServerOptions, StreamableHttpServerTransport,
//! };
//! use mcp_core::utils::error::McpResult;
//!
//! async fn serve() -> McpResult<()> {
//!     let transport =
//!         StreamableHttpServerTransport::new(StreamableHttpServerOptions::stateful());
//!     let server = Server::new(
//!         Implementation::new("demo-server", "0.1.0"),
//!         ServerOptions::default(),
//!     );
//!     server.connect(transport.clone()).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, transport.router()).await?;
//!     Ok(())
//! }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::header::{ACCEPT, ALLOW, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::mcp::registries::SharedMap;
use crate::mcp::schema::{
    AuthInfo, is_supported_protocol_version, DEFAULT_NEGOTIATED_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::transport::event_store::{EventId, EventStore, StreamId};
use crate::mcp::transport::{
    MessageExtra, RequestInfo, Transport, TransportHandler, TransportSendOptions,
};
use crate::mcp::types::{JsonRpcMessage, RequestId};
use crate::utils::error::{
    ERROR_CODE_INVALID_REQUEST, ERROR_CODE_METHOD_NOT_ALLOWED, ERROR_CODE_PARSE_ERROR,
    ERROR_CODE_SESSION_NOT_FOUND, McpError, McpResult,
};

/// Maximum accepted POST body size: 4 MiB.
pub const MAXIMUM_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Session id header, on requests and responses.
pub const HEADER_SESSION_ID: &str = "mcp-session-id";
/// Protocol version header, required on post-initialize requests.
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
/// Resumption header on GET.
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

/// Sentinel stream id for the standalone GET stream.
const STANDALONE_STREAM_ID: &str = "_standalone-sse";

/// Produces session identifiers; should be globally unique and hard to
/// guess.
pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Observes session lifecycle events.
pub type SessionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for [`StreamableHttpServerTransport`].
#[derive(Clone, Default)]
pub struct StreamableHttpServerOptions {
    /// Generates the session id on initialization. `None` disables session
    /// management (stateless mode).
    pub session_id_generator: Option<SessionIdGenerator>,
    /// Called when the server initializes a new session
    pub on_session_initialized: Option<SessionCallback>,
    /// Called when a DELETE terminates the session
    pub on_session_closed: Option<SessionCallback>,
    /// Answer POSTs with a JSON body instead of an SSE stream
    pub enable_json_response: bool,
    /// Enables resumability when present
    pub event_store: Option<Arc<dyn EventStore>>,
    /// Allowed `Host` header values for DNS-rebinding protection
    pub allowed_hosts: Vec<String>,
    /// Allowed `Origin` header values for DNS-rebinding protection
    pub allowed_origins: Vec<String>,
    /// Turn the allow-lists on
    pub enable_dns_rebinding_protection: bool,
}

impl fmt::Debug for StreamableHttpServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerOptions")
            .field("stateful", &self.session_id_generator.is_some())
            .field("enable_json_response", &self.enable_json_response)
            .field("has_event_store", &self.event_store.is_some())
            .field("allowed_hosts", &self.allowed_hosts)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "enable_dns_rebinding_protection",
                &self.enable_dns_rebinding_protection,
            )
            .finish()
    }
}

impl StreamableHttpServerOptions {
    /// Stateful options with a UUID session generator.
    ///
    /// Session ids use the simple (unhyphenated) UUID form so they pass the
    /// strict alphanumeric check applied to inbound session headers.
    pub fn stateful() -> Self {
        Self {
            session_id_generator: Some(Arc::new(|| Uuid::new_v4().simple().to_string())),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct SseFrame {
    event_id: Option<EventId>,
    message: JsonRpcMessage,
}

/// Where responses for a stream go.
#[derive(Clone)]
enum StreamWriter {
    /// An open SSE response; dropping the sender ends the stream
    Sse {
        sender: mpsc::UnboundedSender<SseFrame>,
        nonce: u64,
    },
    /// A JSON-mode POST waiting for all of its responses
    Json(Arc<std::sync::Mutex<Option<oneshot::Sender<Vec<JsonRpcMessage>>>>>),
}

/// Server transport for MCP Streamable HTTP. Mount [`Self::router`] into an
/// axum application, or call [`Self::handle`] from a custom route.
pub struct StreamableHttpServerTransport {
    options: StreamableHttpServerOptions,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    started: AtomicBool,
    closed: AtomicBool,
    initialized: AtomicBool,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    streams: SharedMap<StreamId, StreamWriter>,
    request_streams: SharedMap<RequestId, StreamId>,
    request_responses: SharedMap<RequestId, (u64, JsonRpcMessage)>,
    response_seq: AtomicU64,
    stream_nonce: AtomicU64,
}

impl fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("options", &self.options)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("open_streams", &self.streams.len())
            .finish()
    }
}

impl StreamableHttpServerTransport {
    /// Create a transport with the given options.
    ///
    /// # Returns
    ///
    /// The transport behind an `Arc`: the HTTP handlers, the protocol
    /// engine and any stream guards all share it.
    pub fn new(options: StreamableHttpServerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            handler: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            streams: SharedMap::new(),
            request_streams: SharedMap::new(),
            request_responses: SharedMap::new(),
            response_seq: AtomicU64::new(0),
            stream_nonce: AtomicU64::new(0),
        })
    }

    /// An axum router serving the transport at `/mcp`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use axum::Router;
    /// use mcp_core::mcp::transport::http::{
    ///     StreamableHttpServerOptions, StreamableHttpServerTransport,
    /// };
    ///
    /// let transport =
    ///     StreamableHttpServerTransport::new(StreamableHttpServerOptions::default());
    /// let app: Router = Router::new().merge(transport.router());
    /// ```
    pub fn router(self: &Arc<Self>) -> Router {
        let transport = Arc::clone(self);
        Router::new().route(
            "/mcp",
            any(move |request: Request| {
                let transport = Arc::clone(&transport);
                async move { transport.handle(request).await }
            }),
        )
    }

    /// Handle one HTTP request, whatever its method.
    ///
    /// # Parameters
    ///
    /// * `request` - The raw HTTP request; POST carries JSON-RPC messages,
    ///   GET opens the standalone SSE stream, DELETE ends the session
    ///
    /// # Returns
    ///
    /// The HTTP response: a JSON body, an SSE stream held open until its
    /// responses are ready, or one of the transport's error statuses.
    pub async fn handle(self: Arc<Self>, request: Request) -> Response {
        if let Err(response) = self.validate_request_headers(request.headers()) {
            return response;
        }
        let method = request.method().clone();
        if method == Method::POST {
            self.handle_post(request).await
        } else if method == Method::GET {
            self.handle_get(request).await
        } else if method == Method::DELETE {
            self.handle_delete(request).await
        } else {
            (
                StatusCode::METHOD_NOT_ALLOWED,
                [(ALLOW, HeaderValue::from_static("GET, POST, DELETE"))],
                error_body(ERROR_CODE_METHOD_NOT_ALLOWED, "HTTP method not allowed"),
            )
                .into_response()
        }
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id.read().expect("session lock poisoned").clone()
    }

    /// DNS-rebinding protection: when enabled, Host and Origin must be on
    /// the allow-lists.
    fn validate_request_headers(&self, headers: &HeaderMap) -> Result<(), Response> {
        if !self.options.enable_dns_rebinding_protection {
            return Ok(());
        }
        if !self.options.allowed_hosts.is_empty() {
            let host = header_str(headers, "host").unwrap_or_default();
            if !self.options.allowed_hosts.iter().any(|h| h == host) {
                return Err(jsonrpc_error(
                    StatusCode::FORBIDDEN,
                    ERROR_CODE_INVALID_REQUEST,
                    &format!("invalid Host header: {host}"),
                ));
            }
        }
        if !self.options.allowed_origins.is_empty() {
            let origin = header_str(headers, "origin").unwrap_or_default();
            if !self.options.allowed_origins.iter().any(|o| o == origin) {
                return Err(jsonrpc_error(
                    StatusCode::FORBIDDEN,
                    ERROR_CODE_INVALID_REQUEST,
                    &format!("invalid Origin header: {origin}"),
                ));
            }
        }
        Ok(())
    }

    /// Session validation for non-initialize requests, stateful mode only.
    fn validate_session(&self, headers: &HeaderMap) -> Result<(), Response> {
        if self.options.session_id_generator.is_none() {
            return Ok(());
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(jsonrpc_error(
                StatusCode::BAD_REQUEST,
                ERROR_CODE_INVALID_REQUEST,
                "Bad Request: server not initialized",
            ));
        }
        let Some(session_id) = header_str(headers, HEADER_SESSION_ID) else {
            return Err(jsonrpc_error(
                StatusCode::BAD_REQUEST,
                ERROR_CODE_INVALID_REQUEST,
                "Bad Request: mcp-session-id header is required",
            ));
        };
        if !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(jsonrpc_error(
                StatusCode::BAD_REQUEST,
                ERROR_CODE_INVALID_REQUEST,
                "Bad Request: mcp-session-id header must be alphanumeric",
            ));
        }
        if self.current_session_id().as_deref() != Some(session_id) {
            return Err(jsonrpc_error(
                StatusCode::NOT_FOUND,
                ERROR_CODE_SESSION_NOT_FOUND,
                "Session not found",
            ));
        }
        Ok(())
    }

    /// Protocol-version validation for post-initialize requests; absence
    /// defaults to the last-negotiated version.
    fn validate_protocol_version(&self, headers: &HeaderMap) -> Result<(), Response> {
        let negotiated = self
            .protocol_version
            .read()
            .expect("protocol version lock poisoned")
            .clone();
        let version = header_str(headers, HEADER_PROTOCOL_VERSION)
            .map(str::to_string)
            .or(negotiated)
            .unwrap_or_else(|| DEFAULT_NEGOTIATED_PROTOCOL_VERSION.to_string());
        if !is_supported_protocol_version(&version) {
            return Err(jsonrpc_error(
                StatusCode::BAD_REQUEST,
                ERROR_CODE_INVALID_REQUEST,
                &format!(
                    "Bad Request: unsupported protocol version {version} (supported: {})",
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            ));
        }
        Ok(())
    }

    async fn handle_post(self: Arc<Self>, request: Request) -> Response {
        let (parts, body) = request.into_parts();

        let accept = header_str(&parts.headers, ACCEPT.as_str()).unwrap_or_default();
        if !accept.contains("application/json") || !accept.contains("text/event-stream") {
            return jsonrpc_error(
                StatusCode::NOT_ACCEPTABLE,
                ERROR_CODE_INVALID_REQUEST,
                "Not Acceptable: client must accept both application/json and text/event-stream",
            );
        }
        let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str()).unwrap_or_default();
        if !content_type.contains("application/json") {
            return jsonrpc_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ERROR_CODE_INVALID_REQUEST,
                "Unsupported Media Type: Content-Type must be application/json",
            );
        }

        let bytes = match axum::body::to_bytes(body, MAXIMUM_MESSAGE_SIZE).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return jsonrpc_error(
                    StatusCode::BAD_REQUEST,
                    ERROR_CODE_INVALID_REQUEST,
                    &format!("Bad Request: invalid body: {e}"),
                )
            }
        };
        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                return jsonrpc_error(
                    StatusCode::BAD_REQUEST,
                    ERROR_CODE_PARSE_ERROR,
                    &format!("Parse error: {e}"),
                )
            }
        };
        let raw_messages: Vec<Value> = match raw {
            Value::Array(items) => items,
            single => vec![single],
        };

        let has_initialize = raw_messages
            .iter()
            .any(|m| m.get("method").and_then(Value::as_str) == Some("initialize"));

        if has_initialize {
            if self.initialized.load(Ordering::Acquire) && self.current_session_id().is_some() {
                return jsonrpc_error(
                    StatusCode::BAD_REQUEST,
                    ERROR_CODE_INVALID_REQUEST,
                    "Invalid Request: server already initialized",
                );
            }
            // An initialize request must travel alone.
            if raw_messages.len() > 1 {
                return jsonrpc_error(
                    StatusCode::BAD_REQUEST,
                    ERROR_CODE_INVALID_REQUEST,
                    "Invalid Request: only one initialization request is allowed",
                );
            }
            if let Some(generator) = &self.options.session_id_generator {
                let session_id = generator();
                *self.session_id.write().expect("session lock poisoned") =
                    Some(session_id.clone());
                if let Some(callback) = &self.options.on_session_initialized {
                    callback(&session_id);
                }
            }
            self.initialized.store(true, Ordering::Release);
        } else {
            if let Err(response) = self.validate_session(&parts.headers) {
                return response;
            }
            if let Err(response) = self.validate_protocol_version(&parts.headers) {
                return response;
            }
        }

        let mut messages = Vec::with_capacity(raw_messages.len());
        for raw_message in raw_messages {
            match JsonRpcMessage::from_value(raw_message) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    return jsonrpc_error(
                        StatusCode::BAD_REQUEST,
                        ERROR_CODE_PARSE_ERROR,
                        &format!("Parse error: {e}"),
                    )
                }
            }
        }

        let Some(handler) = self.handler() else {
            return jsonrpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INVALID_REQUEST,
                "transport not started",
            );
        };

        let extra = MessageExtra {
            auth_info: parts.extensions.get::<AuthInfo>().cloned(),
            request_info: Some(RequestInfo {
                headers: parts
                    .headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            value.to_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect(),
            }),
        };

        let request_ids: Vec<RequestId> = messages
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Request(req) => Some(req.id),
                _ => None,
            })
            .collect();

        // Notifications and responses only: acknowledge and dispatch.
        if request_ids.is_empty() {
            tokio::spawn(dispatch_messages(handler, messages, extra));
            return self.with_session_header(StatusCode::ACCEPTED.into_response());
        }

        let stream_id = StreamId(Uuid::new_v4().to_string());
        for id in &request_ids {
            self.request_streams.set(*id, stream_id.clone());
        }

        if self.options.enable_json_response {
            let (tx, rx) = oneshot::channel();
            self.streams.set(
                stream_id.clone(),
                StreamWriter::Json(Arc::new(std::sync::Mutex::new(Some(tx)))),
            );
            tokio::spawn(dispatch_messages(handler, messages, extra));
            match rx.await {
                Ok(mut responses) => {
                    let body = if responses.len() == 1 {
                        serde_json::to_string(&responses.remove(0))
                    } else {
                        serde_json::to_string(&responses)
                    };
                    match body {
                        Ok(body) => self.with_session_header(
                            (
                                StatusCode::OK,
                                [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                                body,
                            )
                                .into_response(),
                        ),
                        Err(e) => jsonrpc_error(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            ERROR_CODE_INVALID_REQUEST,
                            &format!("failed to encode responses: {e}"),
                        ),
                    }
                }
                Err(_) => jsonrpc_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERROR_CODE_INVALID_REQUEST,
                    "connection closed before responses were ready",
                ),
            }
        } else {
            let response = self.open_sse_stream(stream_id);
            tokio::spawn(dispatch_messages(handler, messages, extra));
            response
        }
    }

    async fn handle_get(self: Arc<Self>, request: Request) -> Response {
        let headers = request.headers();
        let accept = header_str(headers, ACCEPT.as_str()).unwrap_or_default();
        if !accept.contains("text/event-stream") {
            return jsonrpc_error(
                StatusCode::NOT_ACCEPTABLE,
                ERROR_CODE_INVALID_REQUEST,
                "Not Acceptable: client must accept text/event-stream",
            );
        }
        if let Err(response) = self.validate_session(headers) {
            return response;
        }
        if let Err(response) = self.validate_protocol_version(headers) {
            return response;
        }

        let store = self.options.event_store.clone();
        let last_event_id = header_str(headers, HEADER_LAST_EVENT_ID).map(EventId::from);
        if let (Some(store), Some(last_event_id)) = (store, last_event_id) {
            return self.resume_stream(store, last_event_id).await;
        }

        // Only one standalone GET stream per session.
        let standalone = StreamId::from(STANDALONE_STREAM_ID);
        if self.streams.contains(&standalone) {
            return jsonrpc_error(
                StatusCode::CONFLICT,
                ERROR_CODE_INVALID_REQUEST,
                "Conflict: only one SSE stream is allowed per session",
            );
        }
        self.open_sse_stream(standalone)
    }

    /// Replay stored events after `last_event_id`, then attach a fresh SSE
    /// response to the stream they belong to.
    async fn resume_stream(
        self: Arc<Self>,
        store: Arc<dyn EventStore>,
        last_event_id: EventId,
    ) -> Response {
        let (sender, receiver) = mpsc::unbounded_channel::<SseFrame>();
        let replay_sender = sender.clone();
        let replayed = store
            .replay_events_after(&last_event_id, &move |event_id, message| {
                replay_sender
                    .send(SseFrame {
                        event_id: Some(event_id),
                        message,
                    })
                    .map_err(|_| McpError::Transport("resumed client went away".into()))
            })
            .await;
        let stream_id = match replayed {
            Ok(stream_id) => stream_id,
            Err(e) => {
                return jsonrpc_error(
                    StatusCode::BAD_REQUEST,
                    ERROR_CODE_INVALID_REQUEST,
                    &format!("Bad Request: {e}"),
                )
            }
        };
        let nonce = self.stream_nonce.fetch_add(1, Ordering::Relaxed);
        self.streams
            .set(stream_id.clone(), StreamWriter::Sse { sender, nonce });
        self.sse_response(stream_id, nonce, receiver)
    }

    /// Register a fresh SSE writer for `stream_id` and build the response.
    fn open_sse_stream(self: Arc<Self>, stream_id: StreamId) -> Response {
        let (sender, receiver) = mpsc::unbounded_channel::<SseFrame>();
        let nonce = self.stream_nonce.fetch_add(1, Ordering::Relaxed);
        self.streams
            .set(stream_id.clone(), StreamWriter::Sse { sender, nonce });
        self.sse_response(stream_id, nonce, receiver)
    }

    fn sse_response(
        self: Arc<Self>,
        stream_id: StreamId,
        nonce: u64,
        receiver: mpsc::UnboundedReceiver<SseFrame>,
    ) -> Response {
        let guard = StreamGuard {
            transport: Arc::downgrade(&self),
            stream_id,
            nonce,
        };
        let stream = futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            let frame = receiver.recv().await?;
            let mut event = Event::default().event("message");
            if let Some(event_id) = &frame.event_id {
                event = event.id(event_id.to_string());
            }
            let data = serde_json::to_string(&frame.message).unwrap_or_else(|_| "null".into());
            Some((Ok::<_, Infallible>(event.data(data)), (receiver, guard)))
        });
        self.with_session_header(Sse::new(stream).into_response())
    }

    async fn handle_delete(self: Arc<Self>, request: Request) -> Response {
        let headers = request.headers();
        if let Err(response) = self.validate_session(headers) {
            return response;
        }
        if let Err(response) = self.validate_protocol_version(headers) {
            return response;
        }
        if let (Some(callback), Some(session_id)) = (
            &self.options.on_session_closed,
            self.current_session_id(),
        ) {
            callback(&session_id);
        }
        if let Err(e) = self.close_transport().await {
            return jsonrpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INVALID_REQUEST,
                &format!("error closing session: {e}"),
            );
        }
        self.with_session_header(StatusCode::OK.into_response())
    }

    fn with_session_header(&self, mut response: Response) -> Response {
        if let Some(session_id) = self.current_session_id() {
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(HEADER_SESSION_ID), value);
            }
        }
        response
    }

    fn remove_stream_if(&self, stream_id: &StreamId, nonce: u64) {
        let matches = matches!(
            self.streams.get(stream_id),
            Some(StreamWriter::Sse { nonce: current, .. }) if current == nonce
        );
        if matches {
            self.streams.remove(stream_id);
        }
    }

    async fn write_sse(
        &self,
        stream_id: &StreamId,
        sender: &mpsc::UnboundedSender<SseFrame>,
        message: &JsonRpcMessage,
        options: &TransportSendOptions,
    ) -> McpResult<bool> {
        let event_id = match &self.options.event_store {
            Some(store) => Some(store.store_event(stream_id, message).await?),
            None => None,
        };
        if let (Some(event_id), Some(callback)) = (&event_id, &options.on_resumption_token) {
            callback(event_id.clone());
        }
        let delivered = sender
            .send(SseFrame {
                event_id,
                message: message.clone(),
            })
            .is_ok();
        if !delivered {
            // The client went away; with an event store the message is
            // already persisted for resumption.
            debug!(stream = %stream_id, "dropping message for disconnected SSE stream");
            self.streams.remove(stream_id);
        }
        Ok(delivered)
    }

    /// Record an outbound response and, once every request on the stream
    /// has one, finish the stream: close the SSE stream or emit the JSON
    /// body, then clean the mapping tables.
    fn finish_if_complete(&self, stream_id: &StreamId) {
        let ids: Vec<RequestId> = self
            .request_streams
            .entries()
            .into_iter()
            .filter(|(_, sid)| sid == stream_id)
            .map(|(id, _)| id)
            .collect();
        let mut ready = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.request_responses.get(id) {
                Some(entry) => ready.push(entry),
                None => return,
            }
        }

        // All responses for this POST are ready.
        ready.sort_by_key(|(seq, _)| *seq);
        match self.streams.remove(stream_id) {
            Some(StreamWriter::Json(slot)) => {
                if let Some(sender) = slot.lock().expect("json writer lock poisoned").take() {
                    let responses = ready.into_iter().map(|(_, message)| message).collect();
                    let _ = sender.send(responses);
                }
            }
            // Dropping the SSE sender ends the stream.
            Some(StreamWriter::Sse { .. }) | None => {}
        }
        for id in ids {
            self.request_responses.remove(&id);
            self.request_streams.remove(&id);
        }
    }

    async fn close_transport(&self) -> McpResult<()> {
        // Drop every writer: open SSE streams end, JSON waiters fail.
        self.streams.clear();
        self.request_streams.clear();
        self.request_responses.clear();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handler) = self.handler() {
            handler.on_close().await;
        }
        Ok(())
    }
}

/// Removes the stream mapping when the HTTP response stream is dropped,
/// so a disconnected GET frees the standalone slot.
struct StreamGuard {
    transport: Weak<StreamableHttpServerTransport>,
    stream_id: StreamId,
    nonce: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_stream_if(&self.stream_id, self.nonce);
        }
    }
}

async fn dispatch_messages(
    handler: Arc<dyn TransportHandler>,
    messages: Vec<JsonRpcMessage>,
    extra: MessageExtra,
) {
    for message in messages {
        handler.on_message(message, extra.clone()).await;
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn error_body(code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": Value::Null,
        "error": {"code": code, "message": message},
    })
    .to_string()
}

fn jsonrpc_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        error_body(code, message),
    )
        .into_response()
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    fn bind_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    async fn start(&self) -> McpResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(McpError::Transport("transport already started".into()));
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage, options: TransportSendOptions) -> McpResult<()> {
        // Responses route by their own id; other messages by the related
        // request, when there is one.
        let related = message.response_id().or(options.related_request_id);

        let Some(related) = related else {
            if message.is_response() {
                return Err(McpError::Transport(
                    "cannot send a response on the standalone SSE stream".into(),
                ));
            }
            let standalone = StreamId::from(STANDALONE_STREAM_ID);
            match self.streams.get(&standalone) {
                Some(StreamWriter::Sse { sender, .. }) => {
                    self.write_sse(&standalone, &sender, &message, &options).await?;
                }
                // No standalone stream open: the server MAY send messages
                // there, so discarding is fine.
                _ => debug!("no standalone SSE stream, discarding message"),
            }
            return Ok(());
        };

        let Some(stream_id) = self.request_streams.get(&related) else {
            return Err(McpError::Transport(format!(
                "no connection established for request id {related}"
            )));
        };
        let Some(writer) = self.streams.get(&stream_id) else {
            return Err(McpError::Transport(format!(
                "no open stream for request id {related}"
            )));
        };

        if let StreamWriter::Sse { sender, .. } = &writer {
            self.write_sse(&stream_id, sender, &message, &options).await?;
        }

        if message.is_response() {
            let seq = self.response_seq.fetch_add(1, Ordering::Relaxed);
            self.request_responses.set(related, (seq, message));
            self.finish_if_complete(&stream_id);
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.close_transport().await
    }

    fn session_id(&self) -> Option<String> {
        self.current_session_id()
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .write()
            .expect("protocol version lock poisoned") = Some(version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = error_body(ERROR_CODE_SESSION_NOT_FOUND, "Session not found");
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"]["code"], json!(-32002));
        assert_eq!(value["jsonrpc"], json!("2.0"));
    }

    #[tokio::test]
    async fn test_stateless_transport_skips_session_validation() {
        let transport = StreamableHttpServerTransport::new(StreamableHttpServerOptions::default());
        assert!(transport.validate_session(&HeaderMap::new()).is_ok());
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn test_stateful_transport_requires_initialization() {
        let transport = StreamableHttpServerTransport::new(StreamableHttpServerOptions::stateful());
        let result = transport.validate_session(&HeaderMap::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_response_without_stream_fails() {
        let transport = StreamableHttpServerTransport::new(StreamableHttpServerOptions::default());
        let message = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 9, "result": {}
        }))
        .unwrap();
        let err = transport
            .send(message, TransportSendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_notification_without_standalone_stream_is_discarded() {
        let transport = StreamableHttpServerTransport::new(StreamableHttpServerOptions::default());
        let message = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/tools/list_changed"
        }))
        .unwrap();
        assert!(transport
            .send(message, TransportSendOptions::default())
            .await
            .is_ok());
    }
}
