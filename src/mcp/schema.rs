//! MCP schema types.
//!
//! These are the typed bodies that travel inside the params/result bags of
//! the wire envelopes: capability sets, implementation identity, tools,
//! resources, prompts, sampling, roots, completion and logging. They convert
//! to and from [`crate::mcp::types::Params`] with serde; unknown sibling keys
//! survive because the envelope layer, not these structs, owns the bag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mcp::types::{ProgressToken, RequestId};

/// The latest protocol version this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// The version assumed when a peer does not state one.
pub const DEFAULT_NEGOTIATED_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version this implementation accepts.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

/// Whether `version` is in the supported set.
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Describes the name and version of an MCP implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Programmatic name
    pub name: String,
    /// Human-readable display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Implementation version
    pub version: String,
}

impl Implementation {
    /// Create an implementation descriptor without a display title.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}

/// A capability flag that may advertise list-changed notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether the owner emits `*/list_changed` notifications
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list_changed: bool,
}

/// Resource capability: subscription support plus list-changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Whether this server supports `resources/subscribe`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub subscribe: bool,
    /// Whether this server emits `notifications/resources/list_changed`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list_changed: bool,
}

/// Capabilities a client may support. Not a closed set: experimental keys
/// ride along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// Experimental, non-standard capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    /// Present if the client supports listing roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<ListChangedCapability>,
    /// Present if the client supports LLM sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Capabilities a server may support.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Experimental, non-standard capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    /// Present if the server can send log messages to the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Present if the server supports argument autocompletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    /// Present if the server offers prompt templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    /// Present if the server offers readable resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Present if the server offers callable tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
}

impl ServerCapabilities {
    /// Merge another capability set into this one; fields present in `other`
    /// replace the corresponding fields here.
    pub fn merge(&mut self, other: ServerCapabilities) {
        if other.experimental.is_some() {
            self.experimental = other.experimental;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
        if other.completions.is_some() {
            self.completions = other.completions;
        }
        if other.prompts.is_some() {
            self.prompts = other.prompts;
        }
        if other.resources.is_some() {
            self.resources = other.resources;
        }
        if other.tools.is_some() {
            self.tools = other.tools;
        }
    }
}

/// Params of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The latest protocol version the client supports
    pub protocol_version: String,
    /// What the client can do
    pub capabilities: ClientCapabilities,
    /// Who the client is
    pub client_info: Implementation,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Reserved protocol metadata
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    /// The version the server wants to use. If the client cannot support
    /// it, the client must disconnect.
    pub protocol_version: String,
    /// What the server can do
    pub capabilities: ServerCapabilities,
    /// Who the server is
    pub server_info: Implementation,
    /// Usage hints surfaced to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// The id of the request being cancelled, in the same direction it was
    /// originally issued
    pub request_id: RequestId,
    /// Human-readable reason, loggable on the receiving side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Progress state carried by `notifications/progress`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// How far along the operation is
    pub progress: f64,
    /// Total amount of work, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Human-readable progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Params of `notifications/progress`: the token correlating back to the
/// original request plus the progress state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// The token the request originator attached
    pub progress_token: ProgressToken,
    /// Progress state
    #[serde(flatten)]
    pub progress: Progress,
}

/// The severity ladder for `notifications/message`, per RFC 5424.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    /// Detailed debugging information
    Debug,
    /// Normal operational messages
    Info,
    /// Significant but normal events
    Notice,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
    /// Critical conditions
    Critical,
    /// Action must be taken immediately
    Alert,
    /// System is unusable
    Emergency,
}

/// Params of `logging/setLevel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLevelParams {
    /// Minimum severity the client wants to receive
    pub level: LoggingLevel,
}

/// Params of `notifications/message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingMessageParams {
    /// Severity of this message
    pub level: LoggingLevel,
    /// Optional name of the logger issuing the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// The data to log; any JSON value
    pub data: Value,
}

/// The sender or recipient of messages in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side of the conversation
    User,
    /// The model side of the conversation
    Assistant,
}

/// Optional annotations telling the client how an object is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    /// Who the content is intended for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<Role>,
    /// Importance, 1 = effectively required, 0 = entirely optional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

/// A content block provided to or from an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Plain text
    Text {
        /// The text content of the message
        text: String,
    },
    /// An image
    #[serde(rename_all = "camelCase")]
    Image {
        /// Base64-encoded image data
        data: String,
        /// MIME type of the image
        mime_type: String,
    },
    /// Audio
    #[serde(rename_all = "camelCase")]
    Audio {
        /// Base64-encoded audio data
        data: String,
        /// MIME type of the audio
        mime_type: String,
    },
    /// A resource embedded into a prompt or tool result
    Resource {
        /// The embedded contents
        resource: ResourceContents,
    },
}

impl Content {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }
}

/// The contents of a specific resource, text or binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceContents {
    /// Textual contents
    #[serde(rename_all = "camelCase")]
    Text {
        /// The URI of this resource
        uri: String,
        /// MIME type, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// The text itself
        text: String,
    },
    /// Binary contents
    #[serde(rename_all = "camelCase")]
    Blob {
        /// The URI of this resource
        uri: String,
        /// MIME type, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Base64-encoded binary data
        blob: String,
    },
}

/// A known resource the server is capable of reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// The URI of this resource
    pub uri: String,
    /// Human-readable name
    pub name: String,
    /// What this resource represents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Display annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// Raw content size in bytes, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A template description for resources available on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateInfo {
    /// An RFC 6570 URI template for constructing resource URIs
    pub uri_template: String,
    /// Human-readable name for the resource type
    pub name: String,
    /// What this template is for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type shared by every matching resource, if uniform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Display annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Params shared by the paginated list requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedParams {
    /// Opaque pagination cursor from a previous result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Result of `resources/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    /// The resources currently offered
    pub resources: Vec<Resource>,
    /// Cursor for the next page, when more are available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `resources/templates/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    /// The templates currently offered
    pub resource_templates: Vec<ResourceTemplateInfo>,
    /// Cursor for the next page, when more are available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Params of `resources/read`, `resources/subscribe` and
/// `resources/unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUriParams {
    /// The URI of the resource; interpretation is up to the server
    pub uri: String,
}

/// Result of `resources/read`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResult {
    /// The contents of the resource or sub-resources
    pub contents: Vec<ResourceContents>,
}

/// Params of `notifications/resources/updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdatedParams {
    /// The URI that changed; possibly a sub-resource of the subscription
    pub uri: String,
}

/// A JSON-Schema-shaped description of tool input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    /// Always "object" in practice
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Property schemas keyed by argument name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    /// Required argument names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: None,
            required: None,
        }
    }
}

/// Behavioral hints describing a tool to clients. All hints are advisory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    /// Human-readable title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// The tool does not modify its environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    /// The tool may perform destructive updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    /// Repeated calls with the same arguments have no additional effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    /// The tool interacts with an open world of external entities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// Definition for a tool the client can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// Human-readable display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// What the tool does, as a hint to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expected parameters
    pub input_schema: ToolSchema,
    /// Shape of `structuredContent` in results, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<ToolSchema>,
    /// Behavioral hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// The tools currently offered
    pub tools: Vec<Tool>,
    /// Cursor for the next page, when more are available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Params of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    /// Which tool to invoke
    pub name: String,
    /// Arguments, passed through as a mapping without validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// Result of `tools/call`.
///
/// Errors that originate from the tool itself are reported inside the
/// result with `isError`, not as protocol-level errors, so the model can see
/// them and self-correct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Reserved protocol metadata
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    /// Unstructured content blocks
    pub content: Vec<Content>,
    /// Structured output matching the tool's output schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Whether the tool call ended in an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// A result carrying a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            ..Default::default()
        }
    }

    /// An error result carrying a single text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: Some(true),
            ..Default::default()
        }
    }
}

/// A prompt or prompt template the server offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    /// The name of the prompt
    pub name: String,
    /// Human-readable display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// What this prompt provides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arguments used for templating
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// An argument a prompt accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    /// The name of the argument
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be provided
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// A message returned as part of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMessage {
    /// Who speaks this message
    pub role: Role,
    /// The content block
    pub content: Content,
}

/// Result of `prompts/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    /// The prompts currently offered
    pub prompts: Vec<Prompt>,
    /// Cursor for the next page, when more are available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Params of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptParams {
    /// The name of the prompt or prompt template
    pub name: String,
    /// Arguments to use for templating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptResult {
    /// Optional description of the rendered prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The rendered messages
    pub messages: Vec<PromptMessage>,
}

/// A message in a sampling conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingMessage {
    /// Who speaks this message
    pub role: Role,
    /// The content block
    pub content: Content,
}

/// The server's hints about model selection for sampling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPreferences {
    /// Model name hints, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<ModelHint>,
    /// How much to prioritize cost (0 to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_priority: Option<f64>,
    /// How much to prioritize speed (0 to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_priority: Option<f64>,
    /// How much to prioritize intelligence (0 to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligence_priority: Option<f64>,
}

/// A hint naming a model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelHint {
    /// Substring-matched model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Params of `sampling/createMessage`, a server-to-client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    /// The conversation so far
    pub messages: Vec<SamplingMessage>,
    /// Model selection preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<ModelPreferences>,
    /// System prompt the server wants used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens to sample
    pub max_tokens: u64,
    /// Sequences that stop sampling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

/// Result of `sampling/createMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    /// Who speaks the sampled message
    pub role: Role,
    /// The sampled content
    pub content: Content,
    /// The model that produced it
    pub model: String,
    /// Why sampling stopped: endTurn, stopSequence or maxTokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// A root directory or file the server can operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    /// The URI identifying the root; must start with `file://` for now
    pub uri: String,
    /// Optional human-readable identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Result of `roots/list`, a server-to-client request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRootsResult {
    /// The roots the client exposes
    pub roots: Vec<Root>,
}

/// What a completion request is completing against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    /// A prompt, by name
    #[serde(rename = "ref/prompt")]
    Prompt {
        /// The name of the prompt
        name: String,
    },
    /// A resource template, by URI template
    #[serde(rename = "ref/resource")]
    Resource {
        /// The URI or URI template of the resource
        uri: String,
    },
}

/// The argument being completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionArgument {
    /// The name of the argument
    pub name: String,
    /// The value to use for completion matching
    pub value: String,
}

/// Params of `completion/complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteParams {
    /// What is being completed
    #[serde(rename = "ref")]
    pub reference: CompletionReference,
    /// The argument under completion
    pub argument: CompletionArgument,
    /// Previously-resolved arguments, for context-aware completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<CompletionContext>,
}

/// Context carried alongside a completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionContext {
    /// Argument values already chosen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// Result of `completion/complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    /// The completion values
    pub completion: Completion,
}

/// The completion payload: at most 100 values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// Completion values, capped at 100 entries
    pub values: Vec<String>,
    /// Total available, which may exceed the values sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Whether more values exist beyond those returned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

/// Information about a validated access token, carried opaquely to request
/// handlers. The engine never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    /// The access token
    pub token: String,
    /// When the token expires, in seconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Scopes granted to the token
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capabilities_round_trip() {
        let caps = ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            resources: Some(ResourcesCapability {
                subscribe: true,
                list_changed: false,
            }),
            logging: Some(json!({})),
            ..Default::default()
        };
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(
            value,
            json!({
                "tools": {"listChanged": true},
                "resources": {"subscribe": true},
                "logging": {}
            })
        );
        let back: ServerCapabilities = serde_json::from_value(value).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_capability_merge() {
        let mut caps = ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            ..Default::default()
        };
        caps.merge(ServerCapabilities {
            prompts: Some(ListChangedCapability { list_changed: true }),
            ..Default::default()
        });
        assert!(caps.tools.is_some());
        assert!(caps.prompts.is_some());
    }

    #[test]
    fn test_content_tagging() {
        let content = Content::text("hello");
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({"type": "text", "text": "hello"})
        );

        let image: Content =
            serde_json::from_value(json!({"type": "image", "data": "aa", "mimeType": "image/png"}))
                .unwrap();
        assert!(matches!(image, Content::Image { .. }));
    }

    #[test]
    fn test_resource_contents_untagged() {
        let text: ResourceContents =
            serde_json::from_value(json!({"uri": "file:///a", "text": "body"})).unwrap();
        assert!(matches!(text, ResourceContents::Text { .. }));

        let blob: ResourceContents =
            serde_json::from_value(json!({"uri": "file:///b", "blob": "aGk="})).unwrap();
        assert!(matches!(blob, ResourceContents::Blob { .. }));
    }

    #[test]
    fn test_completion_reference_tagging() {
        let reference: CompletionReference =
            serde_json::from_value(json!({"type": "ref/prompt", "name": "greet"})).unwrap();
        assert_eq!(reference, CompletionReference::Prompt { name: "greet".into() });

        let reference: CompletionReference =
            serde_json::from_value(json!({"type": "ref/resource", "uri": "file:///{path}"}))
                .unwrap();
        assert!(matches!(reference, CompletionReference::Resource { .. }));
    }

    #[test]
    fn test_logging_level_order() {
        assert!(LoggingLevel::Debug < LoggingLevel::Info);
        assert!(LoggingLevel::Warning < LoggingLevel::Emergency);
        assert_eq!(
            serde_json::to_value(LoggingLevel::Notice).unwrap(),
            json!("notice")
        );
    }

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_protocol_version("2025-03-26"));
        assert!(is_supported_protocol_version("2024-10-07"));
        assert!(!is_supported_protocol_version("1999-01-01"));
    }
}
