//! Event storage for streamable HTTP resumability.
//!
//! When an event store is configured, the HTTP transport persists every
//! outbound SSE message before writing it and stamps the returned event id
//! into the frame's `id:` field. A client that reconnects with
//! `last-event-id` gets the missed tail of its stream replayed in original
//! order. The store is an interface; nothing in the core assumes in-memory
//! or persistent storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::mcp::types::JsonRpcMessage;
use crate::utils::error::{McpError, McpResult};

/// Opaque identifier grouping messages that belong to one logical stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(pub String);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque identifier of one stored message, monotonic within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Sink invoked once per replayed event, in original order.
pub type ReplaySink<'a> = &'a (dyn Fn(EventId, JsonRpcMessage) -> McpResult<()> + Send + Sync);

/// Persists outbound messages per stream and replays them on reconnect.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably record an outbound message. The returned event id must be
    /// unique and preserve insertion order within the stream.
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> McpResult<EventId>;

    /// Invoke `send` exactly once per message stored after `last_event_id`
    /// in the stream containing it, in original order, and return that
    /// stream's id so the caller can attach a new writer to it.
    ///
    /// Resuming from an id the store no longer knows (including evicted
    /// events) is an error; it must never silently restart the stream.
    async fn replay_events_after(
        &self,
        last_event_id: &EventId,
        send: ReplaySink<'_>,
    ) -> McpResult<StreamId>;
}

/// A process-local event store, suitable for tests and single-node
/// deployments.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: Mutex<HashMap<StreamId, Vec<(EventId, JsonRpcMessage)>>>,
    counter: AtomicU64,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded for a stream.
    pub fn event_count(&self, stream_id: &StreamId) -> usize {
        self.streams
            .lock()
            .expect("event store lock poisoned")
            .get(stream_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> McpResult<EventId> {
        // Zero-padded global sequence keeps ids lexicographically sortable
        // by insertion order within a stream.
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let event_id = EventId(format!("{stream_id}_{seq:020}"));
        self.streams
            .lock()
            .expect("event store lock poisoned")
            .entry(stream_id.clone())
            .or_default()
            .push((event_id.clone(), message.clone()));
        Ok(event_id)
    }

    async fn replay_events_after(
        &self,
        last_event_id: &EventId,
        send: ReplaySink<'_>,
    ) -> McpResult<StreamId> {
        let tail: Option<(StreamId, Vec<(EventId, JsonRpcMessage)>)> = {
            let streams = self.streams.lock().expect("event store lock poisoned");
            streams.iter().find_map(|(stream_id, events)| {
                let position = events.iter().position(|(id, _)| id == last_event_id)?;
                Some((stream_id.clone(), events[position + 1..].to_vec()))
            })
        };
        let Some((stream_id, events)) = tail else {
            return Err(McpError::InvalidRequest(format!(
                "cannot resume: unknown event id {last_event_id}"
            )));
        };
        for (event_id, message) in events {
            send(event_id, message)?;
        }
        Ok(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn message(id: i64) -> JsonRpcMessage {
        JsonRpcMessage::from_value(json!({"jsonrpc": "2.0", "id": id, "result": {}})).unwrap()
    }

    #[tokio::test]
    async fn test_event_ids_are_ordered_within_stream() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("s1");
        let first = store.store_event(&stream, &message(1)).await.unwrap();
        let second = store.store_event(&stream, &message(2)).await.unwrap();
        assert!(second.0 > first.0);
    }

    #[tokio::test]
    async fn test_replay_after_returns_tail_in_order() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("s1");
        let e1 = store.store_event(&stream, &message(1)).await.unwrap();
        store.store_event(&stream, &message(2)).await.unwrap();
        store.store_event(&stream, &message(3)).await.unwrap();

        let replayed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replayed);
        let stream_id = store
            .replay_events_after(&e1, &move |_, msg| {
                sink.lock().unwrap().push(msg.response_id().unwrap());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(stream_id, stream);
        assert_eq!(*replayed.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_replay_from_unknown_id_is_an_error() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::from("s1");
        store.store_event(&stream, &message(1)).await.unwrap();

        let result = store
            .replay_events_after(&EventId::from("missing"), &|_, _| Ok(()))
            .await;
        assert!(result.is_err());
    }
}
