//! The bidirectional request/response multiplexer.
//!
//! A [`Protocol`] owns one transport and multiplexes outbound requests over
//! it while routing inbound traffic: responses resolve the caller that sent
//! the matching request, requests and notifications go to registered
//! handlers with a fallback as backstop. Each outbound request carries its
//! own lifecycle record — response channel, optional progress callback and
//! an abortable timer — and finishes exactly once: with a response, an
//! error, a cancellation, a timeout, or `CONNECTION_CLOSED` when the
//! transport goes away.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mcp_core::mcp::protocol::{Protocol, ProtocolHost, ProtocolOptions, RequestOptions};
//! use mcp_core::mcp::transport::stdio::StdioTransport;
//! use mcp_core::utils::error::McpResult;
//!
//! struct Host;
//!
//! impl ProtocolHost for Host {
//!     fn may_invoke(&self, _method: &str) -> McpResult<()> {
//!         Ok(())
//!     }
//!     fn may_handle(&self, _method: &str) -> McpResult<()> {
//!         Ok(())
//!     }
//!     fn may_notify(&self, _method: &str) -> McpResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> McpResult<()> {
//!     // Create an engine, attach a transport, send a request.
//!     let protocol = Protocol::new(Arc::new(Host), ProtocolOptions::default());
//!     protocol.connect(Arc::new(StdioTransport::new())).await?;
//!
//!     let result = protocol
//!         .request("ping", None, RequestOptions::default())
//!         .await?;
//!     assert!(result.is_empty());
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mcp::methods;
use crate::mcp::registries::{CancelToken, SharedMap};
use crate::mcp::schema::{CancelledParams, Progress, ProgressParams};
use crate::mcp::transport::{
    MessageExtra, RequestInfo, Transport, TransportHandler, TransportSendOptions,
};
use crate::mcp::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Params,
    ProgressToken, RequestId,
};
use crate::utils::error::{McpError, McpResult};

/// The default timeout applied to outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handler for inbound requests: receives the raw envelope plus the
/// per-request context and produces the result bag or an error.
pub type RequestHandler =
    Arc<dyn Fn(JsonRpcRequest, RequestContext) -> BoxFuture<'static, McpResult<Params>> + Send + Sync>;

/// Handler for inbound notifications.
pub type NotificationHandler =
    Arc<dyn Fn(JsonRpcNotification) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Callback invoked for each progress notification routed to a request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Engine-level configuration.
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    /// Restrict outbound requests to methods the peer has advertised
    /// support for. Off by default for backward compatibility.
    pub enforce_strict_capabilities: bool,
}

/// The capability owner sitting above the engine: supplies policy checks
/// and fallback handlers, and observes errors and connection close.
pub trait ProtocolHost: Send + Sync + 'static {
    /// May we invoke this method on the peer (has it advertised support)?
    fn may_invoke(&self, method: &str) -> McpResult<()>;

    /// May we handle this method locally (have we advertised support)?
    fn may_handle(&self, method: &str) -> McpResult<()>;

    /// May we emit this notification (have we advertised the channel)?
    fn may_notify(&self, method: &str) -> McpResult<()>;

    /// Handler for request methods with no registered handler.
    fn fallback_request_handler(&self) -> Option<RequestHandler> {
        None
    }

    /// Handler for notification methods with no registered handler.
    fn fallback_notification_handler(&self) -> Option<NotificationHandler> {
        None
    }

    /// Observes exceptional conditions that are not fatal to the session.
    fn on_error(&self, error: &McpError) {
        let _ = error;
    }

    /// Observes connection close, including an explicit `close()`.
    fn on_close(&self) {}
}

/// Options for a single outbound request.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Invoked for each progress notification correlated to this request
    pub on_progress: Option<ProgressCallback>,
    /// Externally supplied cancellation; the first signal cancels the
    /// request and notifies the peer
    pub cancel: Option<CancelToken>,
    /// Per-attempt timeout; [`DEFAULT_REQUEST_TIMEOUT`] when `None`
    pub timeout: Option<Duration>,
    /// Re-arm the timeout whenever progress arrives
    pub reset_timeout_on_progress: bool,
    /// Upper bound on total elapsed time regardless of progress resets
    pub max_total_timeout: Option<Duration>,
    /// Inbound request to associate this outgoing request with
    pub related_request_id: Option<RequestId>,
    /// Resumption token for transports that support it
    pub resumption_token: Option<crate::mcp::transport::EventId>,
    /// Invoked when the transport assigns a new resumption token
    pub on_resumption_token: Option<crate::mcp::transport::ResumptionCallback>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("related_request_id", &self.related_request_id)
            .field("has_progress_callback", &self.on_progress.is_some())
            .field("has_cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Options for a single outbound notification.
#[derive(Debug, Clone, Default)]
pub struct NotificationOptions {
    /// Inbound request to associate this outgoing notification with
    pub related_request_id: Option<RequestId>,
}

/// A sender pre-bound to the inbound request currently being handled, so
/// related messages are associated on the wire.
#[derive(Clone)]
pub struct Peer {
    inner: Weak<ProtocolInner>,
    related_request_id: Option<RequestId>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("related_request_id", &self.related_request_id)
            .finish()
    }
}

impl Peer {
    /// Send a request related to the inbound request being handled.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Params>,
        mut options: RequestOptions,
    ) -> McpResult<Params> {
        let inner = self.inner.upgrade().ok_or(McpError::ConnectionClosed)?;
        options.related_request_id = self.related_request_id;
        inner.request(method.into(), params, options).await
    }

    /// Send a notification related to the inbound request being handled.
    pub async fn send_notification(
        &self,
        method: impl Into<String>,
        params: Option<Params>,
    ) -> McpResult<()> {
        let inner = self.inner.upgrade().ok_or(McpError::ConnectionClosed)?;
        inner
            .notification(
                method.into(),
                params,
                NotificationOptions {
                    related_request_id: self.related_request_id,
                },
            )
            .await
    }
}

/// Everything an inbound request handler gets besides the envelope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Cancelled when the peer sends `notifications/cancelled` for this
    /// request; the handler should stop and its return value is discarded
    pub cancel: CancelToken,
    /// The transport's session identifier
    pub session_id: Option<String>,
    /// The `_meta` object from the request params
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
    /// Opaque auth descriptor, when the transport authenticated the message
    pub auth_info: Option<crate::mcp::schema::AuthInfo>,
    /// The JSON-RPC id of the request being handled
    pub request_id: RequestId,
    /// The HTTP request the message arrived on, when the transport has one
    pub request_info: Option<RequestInfo>,
    /// Sender pre-bound to this request for related messages
    pub peer: Peer,
}

impl RequestContext {
    /// The progress token the originator attached, if any.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        let token = self.meta.as_ref()?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }

    /// Emit a progress notification correlated to this request, when the
    /// originator asked for progress. A no-op otherwise.
    pub async fn send_progress(&self, progress: Progress) -> McpResult<()> {
        let Some(token) = self.progress_token() else {
            return Ok(());
        };
        let params = Params::from_typed(&ProgressParams {
            progress_token: token,
            progress,
        })?;
        self.peer
            .send_notification(methods::NOTIFICATION_PROGRESS, Some(params))
            .await
    }
}

/// Per-outbound-request lifecycle record. Owns the response channel, the
/// optional progress callback and the timer; completion is one-shot.
struct OutboundEntry {
    responder: Mutex<Option<oneshot::Sender<McpResult<Params>>>>,
    progress: Option<ProgressCallback>,
    related_request_id: Option<RequestId>,
    /// Signalled once the request reached a terminal state; timer and
    /// cancel-watcher tasks exit on it.
    done: CancelToken,
    timer: Mutex<TimerState>,
}

struct TimerState {
    started: Instant,
    timeout: Duration,
    max_total: Option<Duration>,
    reset_on_progress: bool,
    handle: Option<JoinHandle<()>>,
}

impl OutboundEntry {
    /// Deliver the outcome to the awaiting caller. Only the first call per
    /// entry does anything.
    fn resolve(&self, outcome: McpResult<Params>) -> bool {
        let sender = self.responder.lock().expect("responder lock poisoned").take();
        let Some(sender) = sender else {
            return false;
        };
        self.done.cancel("request settled");
        if let Some(handle) = self
            .timer
            .lock()
            .expect("timer lock poisoned")
            .handle
            .take()
        {
            handle.abort();
        }
        // The caller may have stopped waiting; that is not an error.
        let _ = sender.send(outcome);
        true
    }
}

/// The protocol engine. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

/// A non-owning handle to an engine, for closures the engine itself stores.
#[derive(Clone)]
pub struct WeakProtocol {
    inner: Weak<ProtocolInner>,
}

impl std::fmt::Debug for WeakProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakProtocol").finish()
    }
}

impl WeakProtocol {
    /// The engine, if it is still alive.
    pub fn upgrade(&self) -> Option<Protocol> {
        self.inner.upgrade().map(|inner| Protocol { inner })
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("in_flight", &self.inner.outbound.len())
            .field("request_handlers", &self.inner.request_handlers.len())
            .finish()
    }
}

struct ProtocolInner {
    weak: Weak<ProtocolInner>,
    host: Arc<dyn ProtocolHost>,
    options: ProtocolOptions,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_request_id: AtomicI64,
    outbound: SharedMap<RequestId, Arc<OutboundEntry>>,
    inbound_cancels: SharedMap<RequestId, CancelToken>,
    request_handlers: SharedMap<String, RequestHandler>,
    notification_handlers: SharedMap<String, NotificationHandler>,
}

impl Protocol {
    /// Create an engine owned by the given capability owner. The built-in
    /// handlers (`ping`, `notifications/cancelled`, `notifications/progress`)
    /// are installed here.
    ///
    /// # Parameters
    ///
    /// * `host` - The capability owner: supplies the policy checks, the
    ///   fallback handlers and the error/close observers
    /// * `options` - Engine-level configuration
    pub fn new(host: Arc<dyn ProtocolHost>, options: ProtocolOptions) -> Self {
        let inner = Arc::new_cyclic(|weak| ProtocolInner {
            weak: weak.clone(),
            host,
            options,
            transport: RwLock::new(None),
            next_request_id: AtomicI64::new(1),
            outbound: SharedMap::new(),
            inbound_cancels: SharedMap::new(),
            request_handlers: SharedMap::new(),
            notification_handlers: SharedMap::new(),
        });

        // Automatic pong.
        inner.request_handlers.set(
            methods::METHOD_PING.to_string(),
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Params::new()) })),
        );

        let weak = Arc::downgrade(&inner);
        inner.notification_handlers.set(
            methods::NOTIFICATION_CANCELLED.to_string(),
            Arc::new(move |notif| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_cancelled(notif)?;
                    }
                    Ok(())
                })
            }),
        );

        let weak = Arc::downgrade(&inner);
        inner.notification_handlers.set(
            methods::NOTIFICATION_PROGRESS.to_string(),
            Arc::new(move |notif| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_progress(notif).await?;
                    }
                    Ok(())
                })
            }),
        );

        Self { inner }
    }

    /// Attach to the transport, install callbacks and start it. The engine
    /// owns the transport exclusively from here on.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the transport is running, or the transport's start
    /// error; on failure the engine stays disconnected.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        transport.bind_handler(self.inner.clone());
        *self
            .inner
            .transport
            .write()
            .expect("transport lock poisoned") = Some(Arc::clone(&transport));
        if let Err(e) = transport.start().await {
            *self
                .inner
                .transport
                .write()
                .expect("transport lock poisoned") = None;
            return Err(e);
        }
        Ok(())
    }

    /// The attached transport, if connected.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().expect("transport lock poisoned").clone()
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> McpResult<()> {
        let transport = self.transport().ok_or(McpError::NotConnected)?;
        transport.close().await
    }

    /// Send a request and wait for its response.
    ///
    /// Do not use this method to emit notifications; use
    /// [`Protocol::notification`] instead.
    ///
    /// # Parameters
    ///
    /// * `method` - The method name to invoke on the peer
    /// * `params` - The params bag, or `None` for bare requests like `ping`
    /// * `options` - Timeout, progress, cancellation and relation options
    ///
    /// # Returns
    ///
    /// The result bag from the peer's response.
    ///
    /// # Error Handling
    ///
    /// Fails with `NotConnected` before a transport is attached,
    /// `CapabilityMissing` in strict-capability mode when the peer has not
    /// advertised the method, `RequestTimeout` when the timer expires,
    /// `Cancelled` when the caller's token fires, `ConnectionClosed` when
    /// the transport goes away mid-flight, or the peer's own error
    /// envelope.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mcp_core::mcp::protocol::{Protocol, RequestOptions};
    /// use mcp_core::utils::error::McpResult;
    ///
    /// async fn ping(protocol: &Protocol) -> McpResult<()> {
    ///     let result = protocol
    ///         .request("ping", None, RequestOptions::default())
    ///         .await?;
    ///     assert!(result.is_empty());
    ///     Ok(())
    /// }
    /// ```
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Params>,
        options: RequestOptions,
    ) -> McpResult<Params> {
        self.inner.request(method.into(), params, options).await
    }

    /// Emit a one-way notification.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the transport accepted the message; a notification
    /// never produces a response.
    pub async fn notification(
        &self,
        method: impl Into<String>,
        params: Option<Params>,
        options: NotificationOptions,
    ) -> McpResult<()> {
        self.inner.notification(method.into(), params, options).await
    }

    /// Register a handler for a request method, replacing any previous one.
    ///
    /// Problems (missing local capability, already-registered method) are
    /// reported through the host's `on_error` but the handler is installed
    /// anyway.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    ///
    /// use mcp_core::mcp::protocol::Protocol;
    /// use mcp_core::mcp::types::Params;
    ///
    /// fn install(protocol: &Protocol) {
    ///     protocol.set_request_handler(
    ///         "tools/list",
    ///         Arc::new(|_request, _context| Box::pin(async { Ok(Params::new()) })),
    ///     );
    /// }
    /// ```
    pub fn set_request_handler(&self, method: impl Into<String>, handler: RequestHandler) {
        let method = method.into();
        if let Err(e) = self.inner.host.may_handle(&method) {
            self.inner.host.on_error(&e);
        }
        if let Err(e) = self.assert_can_set_request_handler(&method) {
            self.inner.host.on_error(&e);
        }
        self.inner.request_handlers.set(method, handler);
    }

    /// Error when a handler is already registered for `method`.
    pub fn assert_can_set_request_handler(&self, method: &str) -> McpResult<()> {
        if self.inner.request_handlers.contains(&method.to_string()) {
            return Err(McpError::InvalidRequest(format!(
                "a request handler for {method} is already registered"
            )));
        }
        Ok(())
    }

    /// Remove the request handler for a method.
    pub fn remove_request_handler(&self, method: &str) {
        self.inner.request_handlers.remove(&method.to_string());
    }

    /// Register a handler for a notification method, idempotently replacing
    /// any previous one.
    pub fn set_notification_handler(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.inner.notification_handlers.set(method.into(), handler);
    }

    /// Remove the notification handler for a method.
    pub fn remove_notification_handler(&self, method: &str) {
        self.inner.notification_handlers.remove(&method.to_string());
    }

    /// Number of requests currently in flight. Empty iff nothing awaits a
    /// response.
    pub fn in_flight(&self) -> usize {
        self.inner.outbound.len()
    }

    /// A non-owning handle, safe to capture in handlers the engine stores
    /// without keeping it alive forever.
    pub fn downgrade(&self) -> WeakProtocol {
        WeakProtocol {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl ProtocolInner {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().expect("transport lock poisoned").clone()
    }

    async fn request(
        &self,
        method: String,
        params: Option<Params>,
        options: RequestOptions,
    ) -> McpResult<Params> {
        let transport = self.transport().ok_or(McpError::NotConnected)?;

        if self.options.enforce_strict_capabilities {
            self.host.may_invoke(&method)?;
        }
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(McpError::Cancelled(
                    token.reason().unwrap_or_else(|| "cancelled before send".into()),
                ));
            }
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut params = params;
        if options.on_progress.is_some() {
            params
                .get_or_insert_with(Params::new)
                .set_progress_token(ProgressToken::Number(id));
        }

        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(OutboundEntry {
            responder: Mutex::new(Some(tx)),
            progress: options.on_progress.clone(),
            related_request_id: options.related_request_id,
            done: CancelToken::new(),
            timer: Mutex::new(TimerState {
                started: Instant::now(),
                timeout,
                max_total: options.max_total_timeout,
                reset_on_progress: options.reset_timeout_on_progress,
                handle: None,
            }),
        });
        self.outbound.set(id, Arc::clone(&entry));
        self.arm_timer(id, &entry);

        if let Some(token) = options.cancel.clone() {
            let weak = self.weak.clone();
            let done = entry.done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = token.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            let reason = token
                                .reason()
                                .unwrap_or_else(|| "cancelled by caller".into());
                            inner.cancel_flow(id, McpError::Cancelled(reason)).await;
                        }
                    }
                }
            });
        }

        let envelope = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        let send_options = TransportSendOptions {
            related_request_id: options.related_request_id,
            resumption_token: options.resumption_token.clone(),
            on_resumption_token: options.on_resumption_token.clone(),
        };
        if let Err(e) = transport.send(envelope, send_options).await {
            if let Some(entry) = self.outbound.remove(&id) {
                entry.resolve(Err(e.clone()));
            }
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The responder disappeared without resolving; only teardown
            // paths drop it, so treat as a closed connection.
            Err(_) => Err(McpError::ConnectionClosed),
        }
    }

    async fn notification(
        &self,
        method: String,
        params: Option<Params>,
        options: NotificationOptions,
    ) -> McpResult<()> {
        let transport = self.transport().ok_or(McpError::NotConnected)?;
        self.host.may_notify(&method)?;
        let envelope = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        transport
            .send(
                envelope,
                TransportSendOptions {
                    related_request_id: options.related_request_id,
                    ..Default::default()
                },
            )
            .await
    }

    fn arm_timer(&self, id: RequestId, entry: &Arc<OutboundEntry>) {
        let weak = self.weak.clone();
        let done = entry.done.clone();
        let mut timer = entry.timer.lock().expect("timer lock poisoned");
        let timeout = timer.timeout;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        inner
                            .cancel_flow(
                                id,
                                McpError::RequestTimeout {
                                    data: Some(json!({"timeout": timeout.as_millis() as u64})),
                                },
                            )
                            .await;
                    }
                }
            }
        });
        if let Some(previous) = timer.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Terminal transition shared by caller cancellation and timer expiry:
    /// tear the record down, tell the peer, resolve the caller with the
    /// reason. Runs at most once per request id.
    async fn cancel_flow(&self, id: RequestId, reason: McpError) {
        let Some(entry) = self.outbound.remove(&id) else {
            return;
        };
        if let Some(transport) = self.transport() {
            let params = CancelledParams {
                request_id: id,
                reason: Some(reason.to_string()),
            };
            let notification = JsonRpcMessage::Notification(JsonRpcNotification::new(
                methods::NOTIFICATION_CANCELLED,
                Params::from_typed(&params).ok(),
            ));
            let options = TransportSendOptions {
                related_request_id: entry.related_request_id,
                ..Default::default()
            };
            if let Err(e) = transport.send(notification, options).await {
                self.host
                    .on_error(&McpError::Transport(format!("failed to send cancellation: {e}")));
            }
        }
        entry.resolve(Err(reason));
    }

    fn handle_cancelled(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let params: CancelledParams = notification.params_as()?;
        match self.inbound_cancels.get(&params.request_id) {
            Some(token) => {
                debug!(
                    request_id = params.request_id,
                    reason = params.reason.as_deref().unwrap_or(""),
                    "peer cancelled in-flight request"
                );
                token.cancel(params.reason.unwrap_or_else(|| "cancelled by peer".into()));
            }
            None => {
                // Either the handler already finished or the cancellation
                // lost the race with our response. Both are benign.
                debug!(
                    request_id = params.request_id,
                    "cancellation for unknown request id"
                );
            }
        }
        Ok(())
    }

    async fn handle_progress(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let params: ProgressParams = notification.params_as()?;
        let ProgressToken::Number(id) = params.progress_token else {
            return Err(McpError::InvalidParams(
                "progress token does not correlate to a request issued here".into(),
            ));
        };
        let Some(entry) = self.outbound.get(&id) else {
            self.host.on_error(&McpError::Internal(format!(
                "received a progress notification for an unknown token {id}"
            )));
            return Ok(());
        };

        let needs_reset = {
            let timer = entry.timer.lock().expect("timer lock poisoned");
            timer.reset_on_progress
        };
        if needs_reset {
            let exceeded = {
                let timer = entry.timer.lock().expect("timer lock poisoned");
                timer
                    .max_total
                    .map(|max| (timer.started.elapsed(), max))
                    .filter(|(elapsed, max)| elapsed >= max)
            };
            if let Some((elapsed, max)) = exceeded {
                self.cancel_flow(
                    id,
                    McpError::RequestTimeout {
                        data: Some(json!({
                            "maxTotalTimeout": max.as_millis() as u64,
                            "totalElapsed": elapsed.as_millis() as u64,
                        })),
                    },
                )
                .await;
                return Ok(());
            }
            if let Some(entry) = self.outbound.get(&id) {
                self.arm_timer(id, &entry);
            }
        }

        if let Some(callback) = &entry.progress {
            callback(params.progress);
        }
        Ok(())
    }

    fn handle_response(&self, message: JsonRpcMessage) {
        let Some(id) = message.response_id() else {
            return;
        };
        let Some(entry) = self.outbound.remove(&id) else {
            self.host.on_error(&McpError::Internal(format!(
                "received a response for an unknown message id {id}"
            )));
            return;
        };
        let outcome = match message {
            JsonRpcMessage::Response(response) => Ok(response.result),
            JsonRpcMessage::Error(error) => Err(McpError::from(error.error)),
            _ => unreachable!("response_id() only matches responses"),
        };
        entry.resolve(outcome);
    }

    async fn handle_request(self: Arc<Self>, request: JsonRpcRequest, extra: MessageExtra) {
        let handler = self
            .request_handlers
            .get(&request.method)
            .or_else(|| self.host.fallback_request_handler());

        let Some(handler) = handler else {
            warn!(method = %request.method, "no handler for inbound request");
            self.respond(JsonRpcMessage::Error(JsonRpcError::new(
                request.id,
                McpError::MethodNotFound(request.method.clone()).to_error_object(),
            )))
            .await;
            return;
        };

        let id = request.id;
        let cancel = CancelToken::new();
        self.inbound_cancels.set(id, cancel.clone());

        let context = RequestContext {
            cancel: cancel.clone(),
            session_id: self.transport().and_then(|t| t.session_id()),
            meta: request.params.as_ref().and_then(|p| p.meta.clone()),
            auth_info: extra.auth_info,
            request_id: id,
            request_info: extra.request_info,
            peer: Peer {
                inner: self.weak.clone(),
                related_request_id: Some(id),
            },
        };

        let result = handler(request.clone(), context).await;
        self.inbound_cancels.remove(&id);

        if cancel.is_cancelled() {
            // The peer gave up on this request; answering now would race
            // with its cancellation.
            debug!(method = %request.method, request_id = id, "handler finished after cancellation, dropping response");
            return;
        }

        let envelope = match result {
            Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(id, result)),
            Err(e) => {
                self.host.on_error(&e);
                JsonRpcMessage::Error(JsonRpcError::new(id, e.to_error_object()))
            }
        };
        self.respond(envelope).await;
    }

    async fn respond(&self, envelope: JsonRpcMessage) {
        let Some(transport) = self.transport() else {
            return;
        };
        let related = envelope.response_id();
        let options = TransportSendOptions {
            related_request_id: related,
            ..Default::default()
        };
        if let Err(e) = transport.send(envelope, options).await {
            self.host
                .on_error(&McpError::Transport(format!("failed to send response: {e}")));
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        let handler = self
            .notification_handlers
            .get(&notification.method)
            .or_else(|| self.host.fallback_notification_handler());
        let Some(handler) = handler else {
            debug!(method = %notification.method, "no handler for notification");
            return;
        };
        if let Err(e) = handler(notification.clone()).await {
            self.host.on_error(&McpError::Internal(format!(
                "uncaught error in notification handler for {}: {e}",
                notification.method
            )));
        }
    }
}

#[async_trait]
impl TransportHandler for ProtocolInner {
    async fn on_message(&self, message: JsonRpcMessage, extra: MessageExtra) {
        match message {
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                self.handle_response(message);
            }
            JsonRpcMessage::Request(request) => {
                // Handlers may be slow or send sub-requests; never block the
                // transport's reader on them.
                if let Some(inner) = self.weak.upgrade() {
                    tokio::spawn(inner.handle_request(request, extra));
                }
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await;
            }
        }
    }

    async fn on_error(&self, error: McpError) {
        self.host.on_error(&error);
    }

    async fn on_close(&self) {
        // Single swap to empty, then fail the captured snapshot: every
        // in-flight request observes CONNECTION_CLOSED exactly once.
        let entries = self.outbound.drain();
        *self.transport.write().expect("transport lock poisoned") = None;
        self.host.on_close();
        for (_, entry) in entries {
            entry.resolve(Err(McpError::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PermissiveHost;

    impl ProtocolHost for PermissiveHost {
        fn may_invoke(&self, _method: &str) -> McpResult<()> {
            Ok(())
        }
        fn may_handle(&self, _method: &str) -> McpResult<()> {
            Ok(())
        }
        fn may_notify(&self, _method: &str) -> McpResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_without_transport_fails() {
        let protocol = Protocol::new(Arc::new(PermissiveHost), ProtocolOptions::default());
        let err = protocol
            .request("ping", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn test_duplicate_handler_is_reported_but_installed() {
        let protocol = Protocol::new(Arc::new(PermissiveHost), ProtocolOptions::default());
        protocol.set_request_handler(
            "tools/list",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Params::new()) })),
        );
        assert!(protocol.assert_can_set_request_handler("tools/list").is_err());
        assert!(protocol.assert_can_set_request_handler("tools/call").is_ok());
        // Replacement still goes through.
        protocol.set_request_handler(
            "tools/list",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(Params::new()) })),
        );
    }

    #[tokio::test]
    async fn test_ping_handler_installed_on_construction() {
        let protocol = Protocol::new(Arc::new(PermissiveHost), ProtocolOptions::default());
        assert!(protocol.assert_can_set_request_handler("ping").is_err());
    }
}
