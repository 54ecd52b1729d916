//! Line-delimited byte-stream transport.
//!
//! One JSON object per line, LF-terminated, UTF-8. An optional trailing CR
//! is stripped on input and empty lines are skipped. Reads run on a
//! dedicated task; writes are serialized under a lock and flushed per
//! message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::mcp::registries::CancelToken;
use crate::mcp::transport::{MessageExtra, Transport, TransportHandler, TransportSendOptions};
use crate::mcp::types::JsonRpcMessage;
use crate::utils::error::{McpError, McpResult};

/// The fixed session identifier the stdio transport reports.
pub const STDIO_SESSION_ID: &str = "mcp-session-stdio";

const READ_CHUNK_SIZE: usize = 4096;

/// Accumulates raw bytes and yields one complete LF-terminated message at a
/// time.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buffer: BytesMut,
}

impl ReadBuffer {
    /// Create an empty framing buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Append a chunk of raw bytes.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete message off the buffer, if a full line is
    /// available. Empty lines are consumed and skipped.
    pub fn read_message(&mut self) -> McpResult<Option<JsonRpcMessage>> {
        loop {
            let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = self.buffer.split_to(newline + 1);
            let mut line = &line[..newline];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }
            return JsonRpcMessage::from_slice(line).map(Some);
        }
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Serialize a message for the line-delimited wire: JSON plus a trailing LF.
pub fn serialize_message(message: &JsonRpcMessage) -> McpResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

type DynReader = Box<dyn AsyncRead + Send + Unpin>;
type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport speaking line-delimited JSON-RPC over a byte stream pair,
/// stdin/stdout by default.
pub struct StdioTransport {
    reader: Mutex<Option<DynReader>>,
    writer: Arc<Mutex<DynWriter>>,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    shutdown: CancelToken,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    /// A transport over the current process' stdin and stdout.
    pub fn new() -> Self {
        Self::with_streams(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    }

    /// A transport over an arbitrary byte stream pair. Used by tests to run
    /// two engines over in-memory pipes.
    pub fn with_streams(reader: DynReader, writer: DynWriter) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            handler: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancelToken::new(),
        }
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }
}

/// Deliver on_close at most once, whether triggered by EOF, a read error or
/// an explicit close().
async fn notify_close(closed: &AtomicBool, handler: Option<Arc<dyn TransportHandler>>) {
    if closed.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Some(handler) = handler {
        handler.on_close().await;
    }
}

async fn read_loop(
    mut reader: DynReader,
    handler: Arc<dyn TransportHandler>,
    closed: Arc<AtomicBool>,
    shutdown: CancelToken,
) {
    let mut framing = ReadBuffer::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("stdio transport shutting down read loop");
                break;
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("stdio transport reached end of input");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    handler.on_error(McpError::Io(e.to_string())).await;
                    break;
                }
            },
        };
        framing.append(&chunk[..n]);
        loop {
            match framing.read_message() {
                Ok(Some(message)) => {
                    handler.on_message(message, MessageExtra::default()).await;
                }
                Ok(None) => break,
                Err(e) => {
                    // A malformed line is surfaced but does not kill the
                    // connection; framing already consumed the line.
                    handler.on_error(e).await;
                }
            }
        }
    }
    notify_close(&closed, Some(handler)).await;
}

#[async_trait]
impl Transport for StdioTransport {
    fn bind_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    async fn start(&self) -> McpResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(McpError::Transport(
                "stdio transport already started".into(),
            ));
        }
        let handler = self
            .handler()
            .ok_or_else(|| McpError::Transport("no handler installed before start".into()))?;
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| McpError::Transport("stdio reader already taken".into()))?;
        tokio::spawn(read_loop(
            reader,
            handler,
            Arc::clone(&self.closed),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage, _options: TransportSendOptions) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::ConnectionClosed);
        }
        let bytes = serialize_message(&message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.shutdown.cancel("transport closed");
        notify_close(&self.closed, self.handler()).await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(STDIO_SESSION_ID.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_buffer_frames_lines() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"{\"jsonrpc\":\"2.0\",\"id\":1,");
        assert!(buffer.read_message().unwrap().is_none());

        buffer.append(b"\"method\":\"ping\"}\n");
        let message = buffer.read_message().unwrap().unwrap();
        assert!(matches!(message, JsonRpcMessage::Request(ref r) if r.method == "ping"));
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_read_buffer_strips_cr_and_skips_empty_lines() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"\r\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\r\n");
        let message = buffer.read_message().unwrap().unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn test_read_buffer_reports_malformed_line_once() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n");
        assert!(buffer.read_message().is_err());
        // The bad line was consumed; the next one parses.
        let message = buffer.read_message().unwrap().unwrap();
        assert!(matches!(message, JsonRpcMessage::Request(_)));
    }

    #[test]
    fn test_serialize_appends_newline() {
        let message = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "ping"
        }))
        .unwrap();
        let bytes = serialize_message(&message).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert!(!bytes[..bytes.len() - 1].contains(&b'\n'));
    }
}
