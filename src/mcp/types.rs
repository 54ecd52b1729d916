//! JSON-RPC envelopes and the MCP wire codec.
//!
//! Every message that crosses a transport is one of the four envelope
//! variants in [`JsonRpcMessage`]. Classification of a raw JSON object
//! follows the protocol rules: a `method` with an `id` is a request, a
//! `method` without one is a notification, a `result` is a response, an
//! `error` is an error envelope, and anything else is a parse failure.
//! Unknown methods are never dropped; they decode to generic envelopes so
//! dispatch can route them to a fallback handler or answer
//! `METHOD_NOT_FOUND`.
//!
//! Params and result objects are modelled by [`Params`], which enforces the
//! reserved-metadata discipline: user-supplied additional properties live
//! next to the protocol-owned `_meta` bag, `_meta` wins on collision, and a
//! user attempt to smuggle a key named `_meta` through the additional
//! properties is silently dropped.
//!
//! ## Example
//!
//! ```rust
//! use mcp_core::mcp::types::JsonRpcMessage;
//! use serde_json::json;
//!
//! let message = JsonRpcMessage::from_value(json!({
//!     "jsonrpc": "2.0",
//!     "id": 1,
//!     "method": "ping"
//! }))
//! .unwrap();
//!
//! assert!(matches!(message, JsonRpcMessage::Request(_)));
//! assert_eq!(message.to_value()["method"], json!("ping"));
//! ```

use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mcp::methods;
use crate::utils::error::{ErrorObject, McpError, McpResult};

/// JSON-RPC version emitted on every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// A uniquely identifying ID for a request, unique per outbound direction.
///
/// The engine allocates these monotonically; inbound IDs are accepted as
/// received.
pub type RequestId = i64;

/// An opaque value attached to a request when the originator wants progress
/// callbacks. The engine uses the originating [`RequestId`] as the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Numeric token, the form this engine emits
    Number(i64),
    /// String token, accepted from peers
    String(String),
}

/// A params or result bag: caller-supplied additional properties plus the
/// protocol-reserved `_meta` sub-object.
///
/// # Example
///
/// ```rust
/// use mcp_core::mcp::types::{Params, ProgressToken};
/// use serde_json::json;
///
/// let mut params = Params::new();
/// params.set_progress_token(ProgressToken::Number(7));
/// params.extra.insert("exampleKey".to_string(), json!("v"));
/// // A user key named `_meta` is dropped on encode; the reserved bag wins.
/// params.extra.insert("_meta".to_string(), json!("x"));
///
/// assert_eq!(
///     params.to_value(),
///     json!({"exampleKey": "v", "_meta": {"progressToken": 7}})
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// The reserved `_meta` object, owned by the protocol
    pub meta: Option<Map<String, Value>>,
    /// Additional properties, serialized at the same level as `_meta`.
    /// A key named `_meta` in here is dropped on encode.
    pub extra: Map<String, Value>,
}

impl Params {
    /// An empty bag (serializes as `{}`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, splitting out the reserved `_meta` key.
    ///
    /// # Returns
    ///
    /// The split bag; `null` decodes as an empty bag, anything that is not
    /// an object is an `InvalidRequest` error.
    pub fn from_value(value: Value) -> McpResult<Self> {
        match value {
            Value::Object(mut map) => {
                let meta = match map.remove("_meta") {
                    Some(Value::Object(m)) => Some(m),
                    Some(other) => {
                        return Err(McpError::InvalidRequest(format!(
                            "_meta must be an object, got {other}"
                        )))
                    }
                    None => None,
                };
                Ok(Self { meta, extra: map })
            }
            Value::Null => Ok(Self::default()),
            other => Err(McpError::InvalidRequest(format!(
                "params must be an object, got {other}"
            ))),
        }
    }

    /// Serialize back to a JSON object, `_meta` taking precedence over any
    /// additional property of the same name.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.extra.len() + 1);
        for (key, value) in &self.extra {
            if key == "_meta" {
                continue;
            }
            map.insert(key.clone(), value.clone());
        }
        if let Some(meta) = &self.meta {
            map.insert("_meta".to_string(), Value::Object(meta.clone()));
        }
        Value::Object(map)
    }

    /// Build from any serializable value, splitting out its `_meta` field.
    pub fn from_typed<T: Serialize>(value: &T) -> McpResult<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Deserialize the whole bag (including `_meta`) into a typed value.
    pub fn typed<T: for<'de> Deserialize<'de>>(&self) -> McpResult<T> {
        serde_json::from_value(self.to_value()).map_err(Into::into)
    }

    /// Whether the bag carries neither `_meta` nor additional properties.
    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.extra.is_empty()
    }

    /// The progress token from `_meta`, if the originator requested progress.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        let token = self.meta.as_ref()?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }

    /// Attach a progress token under `_meta`, preserving other meta keys.
    pub fn set_progress_token(&mut self, token: ProgressToken) {
        let meta = self.meta.get_or_insert_with(Map::new);
        meta.insert(
            "progressToken".to_string(),
            serde_json::to_value(token).unwrap_or(Value::Null),
        );
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let reserved = usize::from(self.meta.is_some());
        let mut map = serializer.serialize_map(Some(self.extra.len() + reserved))?;
        for (key, value) in &self.extra {
            if key == "_meta" {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        if let Some(meta) = &self.meta {
            map.serialize_entry("_meta", meta)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Params::from_value(value).map_err(D::Error::custom)
    }
}

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Request identifier, echoed on the response
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters, absent for bare requests such as `ping`
    pub params: Option<Params>,
}

impl JsonRpcRequest {
    /// Create a new request envelope.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Deserialize the params into a typed value; missing params decode as `{}`.
    pub fn params_as<T: for<'de> Deserialize<'de>>(&self) -> McpResult<T> {
        let value = self
            .params
            .as_ref()
            .map(Params::to_value)
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(value)
            .map_err(|e| McpError::InvalidParams(format!("{}: {e}", self.method)))
    }

    /// Whether the method is part of the closed request registry.
    pub fn is_known_method(&self) -> bool {
        methods::is_request_method(&self.method)
    }
}

/// A fire-and-forget notification; carries no `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    /// Method name
    pub method: String,
    /// Parameters
    pub params: Option<Params>,
}

impl JsonRpcNotification {
    /// Create a new notification envelope.
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Deserialize the params into a typed value; missing params decode as `{}`.
    pub fn params_as<T: for<'de> Deserialize<'de>>(&self) -> McpResult<T> {
        let value = self
            .params
            .as_ref()
            .map(Params::to_value)
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(value)
            .map_err(|e| McpError::InvalidParams(format!("{}: {e}", self.method)))
    }
}

/// A successful response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// The id of the request being answered
    pub id: RequestId,
    /// The result bag; serializes as `{}` when empty
    pub result: Params,
}

impl JsonRpcResponse {
    /// Create a new response envelope.
    pub fn new(id: RequestId, result: Params) -> Self {
        Self { id, result }
    }
}

/// An error response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    /// The id of the request being answered
    pub id: RequestId,
    /// The error object
    pub error: ErrorObject,
}

impl JsonRpcError {
    /// Create a new error envelope.
    pub fn new(id: RequestId, error: ErrorObject) -> Self {
        Self { id, error }
    }
}

/// Any valid JSON-RPC envelope that can be decoded off the wire or encoded
/// to be sent.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// A request expecting a response
    Request(JsonRpcRequest),
    /// A fire-and-forget notification
    Notification(JsonRpcNotification),
    /// A successful response
    Response(JsonRpcResponse),
    /// An error response
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Classify and decode a raw JSON value into an envelope.
    ///
    /// A `method` with an `id` is a request and a `method` without one is a
    /// notification, whether or not the method is in the closed registry;
    /// unknown methods flow through so dispatch can answer
    /// `METHOD_NOT_FOUND` or hand them to a fallback.
    ///
    /// # Returns
    ///
    /// The decoded envelope, or a `Parse`/`InvalidRequest` error when the
    /// value is not a JSON-RPC message.
    pub fn from_value(value: Value) -> McpResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(McpError::Parse("message is not a JSON object".into()));
        };

        let method = match map.get("method") {
            Some(Value::String(m)) => Some(m.clone()),
            Some(other) => {
                return Err(McpError::InvalidRequest(format!(
                    "method must be a string, got {other}"
                )))
            }
            None => None,
        };

        if let Some(method) = method {
            let params = match map.remove("params") {
                Some(value) => Some(Params::from_value(value)?),
                None => None,
            };
            return match map.get("id") {
                Some(id) => {
                    let id = id.as_i64().ok_or_else(|| {
                        McpError::InvalidRequest(format!("request id must be an integer: {id}"))
                    })?;
                    Ok(JsonRpcMessage::Request(JsonRpcRequest { id, method, params }))
                }
                None => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    method,
                    params,
                })),
            };
        }

        if let Some(result) = map.remove("result") {
            let id = require_id(&map)?;
            return Ok(JsonRpcMessage::Response(JsonRpcResponse {
                id,
                result: Params::from_value(result)?,
            }));
        }

        if let Some(error) = map.remove("error") {
            let id = require_id(&map)?;
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| McpError::InvalidRequest(format!("malformed error object: {e}")))?;
            return Ok(JsonRpcMessage::Error(JsonRpcError { id, error }));
        }

        Err(McpError::Parse(
            "object is neither a request, notification, response nor error".into(),
        ))
    }

    /// Decode an envelope from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> McpResult<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| McpError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Encode the envelope to a JSON value with `jsonrpc: "2.0"`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.into()));
        match self {
            JsonRpcMessage::Request(req) => {
                map.insert("id".to_string(), Value::from(req.id));
                map.insert("method".to_string(), Value::String(req.method.clone()));
                if let Some(params) = &req.params {
                    map.insert("params".to_string(), params.to_value());
                }
            }
            JsonRpcMessage::Notification(notif) => {
                map.insert("method".to_string(), Value::String(notif.method.clone()));
                if let Some(params) = &notif.params {
                    map.insert("params".to_string(), params.to_value());
                }
            }
            JsonRpcMessage::Response(resp) => {
                map.insert("id".to_string(), Value::from(resp.id));
                map.insert("result".to_string(), resp.result.to_value());
            }
            JsonRpcMessage::Error(err) => {
                map.insert("id".to_string(), Value::from(err.id));
                map.insert(
                    "error".to_string(),
                    serde_json::to_value(&err.error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(map)
    }

    /// The request id a response or error answers, if this is one.
    pub fn response_id(&self) -> Option<RequestId> {
        match self {
            JsonRpcMessage::Response(resp) => Some(resp.id),
            JsonRpcMessage::Error(err) => Some(err.id),
            _ => None,
        }
    }

    /// Whether this envelope answers a request (response or error).
    pub fn is_response(&self) -> bool {
        self.response_id().is_some()
    }
}

fn require_id(map: &Map<String, Value>) -> McpResult<RequestId> {
    map.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| McpError::InvalidRequest("response is missing an integer id".into()))
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(D::Error::custom)
    }
}

/// The concrete result variant a response carries, discriminated by the
/// presence of characteristic keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// `initialize` result (`protocolVersion`)
    Initialize,
    /// `tools/list` result (`tools`)
    ListTools,
    /// `resources/list` result (`resources`)
    ListResources,
    /// `resources/templates/list` result (`resourceTemplates`)
    ListResourceTemplates,
    /// `prompts/list` result (`prompts`)
    ListPrompts,
    /// `prompts/get` result (`messages`)
    GetPrompt,
    /// `resources/read` result (`contents`)
    ReadResource,
    /// `completion/complete` result (`completion`)
    Complete,
    /// `roots/list` result (`roots`)
    ListRoots,
    /// `sampling/createMessage` result (`model`)
    CreateMessage,
    /// `tools/call` result (`content`)
    CallTool,
    /// A paginated result identified only by its cursor (`nextCursor`)
    Paginated,
    /// A result with no characteristic keys
    Empty,
}

impl ResultShape {
    /// Discriminate a result bag by its characteristic keys.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mcp_core::mcp::types::{Params, ResultShape};
    /// use serde_json::json;
    ///
    /// let result = Params::from_value(json!({"tools": []})).unwrap();
    /// assert_eq!(ResultShape::classify(&result), ResultShape::ListTools);
    ///
    /// let result = Params::from_value(json!({})).unwrap();
    /// assert_eq!(ResultShape::classify(&result), ResultShape::Empty);
    /// ```
    pub fn classify(result: &Params) -> Self {
        let has = |key: &str| result.extra.contains_key(key);
        if has("protocolVersion") {
            ResultShape::Initialize
        } else if has("tools") {
            ResultShape::ListTools
        } else if has("resources") {
            ResultShape::ListResources
        } else if has("resourceTemplates") {
            ResultShape::ListResourceTemplates
        } else if has("prompts") {
            ResultShape::ListPrompts
        } else if has("messages") {
            ResultShape::GetPrompt
        } else if has("contents") {
            ResultShape::ReadResource
        } else if has("completion") {
            ResultShape::Complete
        } else if has("roots") {
            ResultShape::ListRoots
        } else if has("model") {
            ResultShape::CreateMessage
        } else if has("content") {
            ResultShape::CallTool
        } else if has("nextCursor") {
            ResultShape::Paginated
        } else {
            ResultShape::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request_notification_response_error() {
        let req = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "ping"
        }))
        .unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(ref r) if r.method == "ping" && r.id == 1));

        let notif = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(notif, JsonRpcMessage::Notification(_)));

        let resp = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "result": {}
        }))
        .unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(ref r) if r.id == 7));

        let err = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "error": {"code": -32601, "message": "nope"}
        }))
        .unwrap();
        assert!(matches!(err, JsonRpcMessage::Error(ref e) if e.error.code == -32601));
    }

    #[test]
    fn test_unknown_method_is_not_dropped() {
        let msg = JsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "method": "made/up", "params": {"x": 1}
        }))
        .unwrap();
        match msg {
            JsonRpcMessage::Request(req) => {
                assert!(!req.is_known_method());
                assert_eq!(req.method, "made/up");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classification_failure() {
        assert!(JsonRpcMessage::from_value(json!({"jsonrpc": "2.0"})).is_err());
        assert!(JsonRpcMessage::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_reserved_meta_discipline() {
        // A user attempt to supply `_meta` through additional properties is
        // dropped; the reserved `_meta` wins.
        let mut params = Params::new();
        params.set_progress_token(ProgressToken::Number(7));
        params.extra.insert("_meta".to_string(), json!("x"));
        params.extra.insert("exampleKey".to_string(), json!("v"));

        let encoded = params.to_value();
        assert_eq!(
            encoded,
            json!({"_meta": {"progressToken": 7}, "exampleKey": "v"})
        );
    }

    #[test]
    fn test_round_trip_preserves_meta_and_extras() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
            "params": {
                "_meta": {"progressToken": 42, "trace": "abc"},
                "name": "echo",
                "arguments": {"text": "hi"}
            }
        });
        let msg = JsonRpcMessage::from_value(raw.clone()).unwrap();
        assert_eq!(msg.to_value(), raw);

        let decoded = JsonRpcMessage::from_value(msg.to_value()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_progress_token_access() {
        let params = Params::from_value(json!({"_meta": {"progressToken": 42}})).unwrap();
        assert_eq!(params.progress_token(), Some(ProgressToken::Number(42)));

        let params = Params::from_value(json!({"_meta": {"progressToken": "tok"}})).unwrap();
        assert_eq!(
            params.progress_token(),
            Some(ProgressToken::String("tok".into()))
        );
    }

    #[test]
    fn test_empty_result_serializes_as_object() {
        let resp = JsonRpcMessage::Response(JsonRpcResponse::new(1, Params::new()));
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#
        );
    }

    #[test]
    fn test_result_shape_classification() {
        let shape = |v: Value| ResultShape::classify(&Params::from_value(v).unwrap());
        assert_eq!(shape(json!({"protocolVersion": "2025-03-26"})), ResultShape::Initialize);
        assert_eq!(shape(json!({"tools": []})), ResultShape::ListTools);
        assert_eq!(shape(json!({"resources": []})), ResultShape::ListResources);
        assert_eq!(shape(json!({"resourceTemplates": []})), ResultShape::ListResourceTemplates);
        assert_eq!(shape(json!({"prompts": []})), ResultShape::ListPrompts);
        assert_eq!(shape(json!({"messages": []})), ResultShape::GetPrompt);
        assert_eq!(shape(json!({"contents": []})), ResultShape::ReadResource);
        assert_eq!(shape(json!({"completion": {"values": []}})), ResultShape::Complete);
        assert_eq!(shape(json!({"roots": []})), ResultShape::ListRoots);
        assert_eq!(shape(json!({"model": "m"})), ResultShape::CreateMessage);
        assert_eq!(shape(json!({"content": []})), ResultShape::CallTool);
        assert_eq!(shape(json!({"nextCursor": "c"})), ResultShape::Paginated);
        assert_eq!(shape(json!({})), ResultShape::Empty);
    }
}
