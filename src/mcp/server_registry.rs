//! High-level registry façade over [`Server`].
//!
//! `McpServer` turns declarative `register_tool` / `register_resource` /
//! `register_resource_template` / `register_prompt` calls into the engine's
//! request-handler registrations. The protocol handlers for each family are
//! installed lazily on first registration; every mutation that changes the
//! observable list contents emits the corresponding `*/list_changed`
//! notification. Enabled-flag enforcement and the output-schema /
//! structured-content cross-check happen here and surface to the peer as
//! `INVALID_PARAMS` errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::warn;

use crate::mcp::methods;
use crate::mcp::protocol::RequestContext;
use crate::mcp::registries::SharedMap;
use crate::mcp::schema::{
    Annotations, CallToolParams, CallToolResult, CompleteParams, CompleteResult, Completion,
    CompletionContext, CompletionReference, GetPromptParams, GetPromptResult, ListChangedCapability,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt,
    PromptArgument, ReadResourceResult, Resource, ResourceTemplateInfo, ResourceUriParams,
    ResourcesCapability, ServerCapabilities, Tool, ToolAnnotations, ToolSchema,
};
use crate::mcp::server::Server;
use crate::mcp::types::{JsonRpcRequest, Params};
use crate::mcp::uri_template::{UriTemplate, UriVariables};
use crate::utils::error::{McpError, McpResult};

const MAX_COMPLETION_VALUES: usize = 100;

/// Callback invoked for `tools/call` against a registered tool.
pub type ToolCallback = Arc<
    dyn Fn(Option<Map<String, Value>>, RequestContext) -> BoxFuture<'static, McpResult<CallToolResult>>
        + Send
        + Sync,
>;

/// Callback to read a registered resource at its fixed URI.
pub type ReadResourceCallback =
    Arc<dyn Fn(String, RequestContext) -> BoxFuture<'static, McpResult<ReadResourceResult>> + Send + Sync>;

/// Callback to read a resource matched through a template, with the
/// variables the URI filled in.
pub type ReadResourceTemplateCallback = Arc<
    dyn Fn(String, UriVariables, RequestContext) -> BoxFuture<'static, McpResult<ReadResourceResult>>
        + Send
        + Sync,
>;

/// Callback listing the concrete resources a template currently matches.
pub type ListResourcesCallback =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, McpResult<ListResourcesResult>> + Send + Sync>;

/// Callback rendering a registered prompt.
pub type PromptCallback = Arc<
    dyn Fn(Option<Map<String, Value>>, RequestContext) -> BoxFuture<'static, McpResult<GetPromptResult>>
        + Send
        + Sync,
>;

/// Completer for one argument: current value plus already-resolved context
/// in, suggestions out.
pub type CompleteCallback =
    Arc<dyn Fn(&str, Option<&CompletionContext>) -> Vec<String> + Send + Sync>;

/// Declarative description of a tool at registration time.
#[derive(Clone, Default)]
pub struct ToolOptions {
    /// Display title
    pub title: Option<String>,
    /// What the tool does
    pub description: Option<String>,
    /// Input schema; defaults to an empty object schema
    pub input_schema: ToolSchema,
    /// Output schema; when present, successful results must carry
    /// `structuredContent`
    pub output_schema: Option<ToolSchema>,
    /// Behavioral hints
    pub annotations: Option<ToolAnnotations>,
}

/// Metadata for a fixed-URI resource at registration time.
#[derive(Clone, Default)]
pub struct ResourceOptions {
    /// Display title
    pub title: Option<String>,
    /// What the resource represents
    pub description: Option<String>,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// Display annotations
    pub annotations: Option<Annotations>,
    /// Raw size in bytes, if known
    pub size: Option<u64>,
}

/// A template argument description plus its optional completer.
#[derive(Clone)]
pub struct PromptArgumentDef {
    /// Argument name
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Whether the argument is required
    pub required: bool,
    /// Autocompletion for this argument
    pub complete: Option<CompleteCallback>,
}

/// Declarative description of a prompt at registration time.
#[derive(Clone, Default)]
pub struct PromptOptions {
    /// Display title
    pub title: Option<String>,
    /// What the prompt provides
    pub description: Option<String>,
    /// Accepted arguments
    pub arguments: Vec<PromptArgumentDef>,
}

/// A URI template bundled with its callbacks.
#[derive(Clone)]
pub struct ResourceTemplate {
    template: UriTemplate,
    list_callback: Option<ListResourcesCallback>,
    complete_callbacks: HashMap<String, CompleteCallback>,
}

impl ResourceTemplate {
    /// Parse the template pattern.
    pub fn new(pattern: impl Into<String>) -> McpResult<Self> {
        Ok(Self {
            template: UriTemplate::new(pattern)?,
            list_callback: None,
            complete_callbacks: HashMap::new(),
        })
    }

    /// Attach a callback enumerating the resources this template matches.
    pub fn with_list_callback(mut self, callback: ListResourcesCallback) -> Self {
        self.list_callback = Some(callback);
        self
    }

    /// Attach a completer for one template variable.
    pub fn with_completer(mut self, variable: impl Into<String>, callback: CompleteCallback) -> Self {
        self.complete_callbacks.insert(variable.into(), callback);
        self
    }

    /// The underlying URI template.
    pub fn uri_template(&self) -> &UriTemplate {
        &self.template
    }
}

struct ToolEntry {
    title: Option<String>,
    description: Option<String>,
    input_schema: ToolSchema,
    output_schema: Option<ToolSchema>,
    annotations: Option<ToolAnnotations>,
    callback: ToolCallback,
    enabled: bool,
}

struct ResourceEntry {
    name: String,
    options: ResourceOptions,
    callback: ReadResourceCallback,
    enabled: bool,
}

struct ResourceTemplateEntry {
    template: ResourceTemplate,
    options: ResourceOptions,
    callback: ReadResourceTemplateCallback,
    enabled: bool,
}

struct PromptEntry {
    title: Option<String>,
    description: Option<String>,
    arguments: Vec<PromptArgumentDef>,
    callback: PromptCallback,
    enabled: bool,
}

/// Registry state shared between the façade and the installed handlers.
/// Deliberately does not hold the [`Server`]; handlers would otherwise keep
/// the engine alive through its own handler table.
#[derive(Default)]
struct RegistryState {
    tools: SharedMap<String, Arc<RwLock<ToolEntry>>>,
    resources: SharedMap<String, Arc<RwLock<ResourceEntry>>>,
    resource_templates: SharedMap<String, Arc<RwLock<ResourceTemplateEntry>>>,
    prompts: SharedMap<String, Arc<RwLock<PromptEntry>>>,
    tool_handlers_installed: AtomicBool,
    resource_handlers_installed: AtomicBool,
    prompt_handlers_installed: AtomicBool,
    completion_handler_installed: AtomicBool,
}

/// High-level MCP server with a declarative registration API.
///
/// For advanced usage (custom request handlers, notifications) reach
/// through to [`McpServer::server`].
#[derive(Clone)]
pub struct McpServer {
    server: Server,
    state: Arc<RegistryState>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("tools", &self.state.tools.len())
            .field("resources", &self.state.resources.len())
            .field("resource_templates", &self.state.resource_templates.len())
            .field("prompts", &self.state.prompts.len())
            .finish()
    }
}

impl McpServer {
    /// Wrap a server shell with the registry façade.
    pub fn new(server: Server) -> Self {
        Self {
            server,
            state: Arc::new(RegistryState::default()),
        }
    }

    /// The underlying server shell.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Register a tool. Fails when the name is taken.
    pub async fn register_tool(
        &self,
        name: impl Into<String>,
        options: ToolOptions,
        callback: ToolCallback,
    ) -> McpResult<RegisteredTool> {
        let name = name.into();
        if self.state.tools.contains(&name) {
            return Err(McpError::InvalidParams(format!(
                "tool {name} is already registered"
            )));
        }
        self.state.tools.set(
            name.clone(),
            Arc::new(RwLock::new(ToolEntry {
                title: options.title,
                description: options.description,
                input_schema: options.input_schema,
                output_schema: options.output_schema,
                annotations: options.annotations,
                callback,
                enabled: true,
            })),
        );
        self.install_tool_handlers()?;
        self.notify_tools_changed().await?;
        Ok(RegisteredTool {
            registry: self.clone(),
            name: Mutex::new(name),
        })
    }

    /// Register a resource at a fixed URI. Fails when the URI is taken.
    pub async fn register_resource(
        &self,
        name: impl Into<String>,
        uri: impl Into<String>,
        options: ResourceOptions,
        callback: ReadResourceCallback,
    ) -> McpResult<RegisteredResource> {
        let uri = uri.into();
        if self.state.resources.contains(&uri) {
            return Err(McpError::InvalidParams(format!(
                "resource {uri} is already registered"
            )));
        }
        self.state.resources.set(
            uri.clone(),
            Arc::new(RwLock::new(ResourceEntry {
                name: name.into(),
                options,
                callback,
                enabled: true,
            })),
        );
        self.install_resource_handlers()?;
        self.notify_resources_changed().await?;
        Ok(RegisteredResource {
            registry: self.clone(),
            uri: Mutex::new(uri),
        })
    }

    /// Register a resource template. Fails when the name is taken.
    pub async fn register_resource_template(
        &self,
        name: impl Into<String>,
        template: ResourceTemplate,
        options: ResourceOptions,
        callback: ReadResourceTemplateCallback,
    ) -> McpResult<RegisteredResourceTemplate> {
        let name = name.into();
        if self.state.resource_templates.contains(&name) {
            return Err(McpError::InvalidParams(format!(
                "resource template {name} is already registered"
            )));
        }
        self.state.resource_templates.set(
            name.clone(),
            Arc::new(RwLock::new(ResourceTemplateEntry {
                template,
                options,
                callback,
                enabled: true,
            })),
        );
        self.install_resource_handlers()?;
        self.notify_resources_changed().await?;
        Ok(RegisteredResourceTemplate {
            registry: self.clone(),
            name: Mutex::new(name),
        })
    }

    /// Register a prompt. Fails when the name is taken.
    pub async fn register_prompt(
        &self,
        name: impl Into<String>,
        options: PromptOptions,
        callback: PromptCallback,
    ) -> McpResult<RegisteredPrompt> {
        let name = name.into();
        if self.state.prompts.contains(&name) {
            return Err(McpError::InvalidParams(format!(
                "prompt {name} is already registered"
            )));
        }
        self.state.prompts.set(
            name.clone(),
            Arc::new(RwLock::new(PromptEntry {
                title: options.title,
                description: options.description,
                arguments: options.arguments,
                callback,
                enabled: true,
            })),
        );
        self.install_prompt_handlers()?;
        self.notify_prompts_changed().await?;
        Ok(RegisteredPrompt {
            registry: self.clone(),
            name: Mutex::new(name),
        })
    }

    /// Attach to a transport and start serving.
    pub async fn connect(
        &self,
        transport: Arc<dyn crate::mcp::transport::Transport>,
    ) -> McpResult<()> {
        self.server.connect(transport).await
    }

    /// Close the connection.
    pub async fn close(&self) -> McpResult<()> {
        self.server.close().await
    }

    async fn notify_tools_changed(&self) -> McpResult<()> {
        if !self.server.is_connected() {
            return Ok(());
        }
        self.server.send_tool_list_changed().await
    }

    async fn notify_resources_changed(&self) -> McpResult<()> {
        if !self.server.is_connected() {
            return Ok(());
        }
        self.server.send_resource_list_changed().await
    }

    async fn notify_prompts_changed(&self) -> McpResult<()> {
        if !self.server.is_connected() {
            return Ok(());
        }
        self.server.send_prompt_list_changed().await
    }

    fn install_tool_handlers(&self) -> McpResult<()> {
        if self.state.tool_handlers_installed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.server
            .protocol()
            .assert_can_set_request_handler(methods::METHOD_TOOLS_LIST)?;
        if !self.server.is_connected() {
            self.server.register_capabilities(ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                ..Default::default()
            })?;
        }

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_TOOLS_LIST,
            Arc::new(move |_request, _context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let mut tools = Vec::new();
                    for (name, entry) in state.tools.entries() {
                        let entry = entry.read().expect("tool entry lock poisoned");
                        if !entry.enabled {
                            continue;
                        }
                        tools.push(Tool {
                            name,
                            title: entry.title.clone(),
                            description: entry.description.clone(),
                            input_schema: entry.input_schema.clone(),
                            output_schema: entry.output_schema.clone(),
                            annotations: entry.annotations.clone(),
                        });
                    }
                    tools.sort_by(|a, b| a.name.cmp(&b.name));
                    Params::from_typed(&ListToolsResult {
                        tools,
                        next_cursor: None,
                    })
                })
            }),
        );

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_TOOLS_CALL,
            Arc::new(move |request: JsonRpcRequest, context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let params: CallToolParams = request.params_as()?;
                    let Some(entry) = state.tools.get(&params.name) else {
                        return Err(McpError::InvalidParams(format!(
                            "tool {} not found",
                            params.name
                        )));
                    };
                    let (callback, output_schema, enabled) = {
                        let entry = entry.read().expect("tool entry lock poisoned");
                        (
                            Arc::clone(&entry.callback),
                            entry.output_schema.clone(),
                            entry.enabled,
                        )
                    };
                    if !enabled {
                        return Err(McpError::InvalidParams(format!(
                            "tool {} disabled",
                            params.name
                        )));
                    }

                    // Tool failures are reported inside the result so the
                    // model can see them, not as protocol errors.
                    let result = match callback(params.arguments, context).await {
                        Ok(result) => result,
                        Err(e) => CallToolResult::error(e.to_string()),
                    };

                    let is_error = result.is_error.unwrap_or(false);
                    if output_schema.is_some() && !is_error && result.structured_content.is_none() {
                        return Err(McpError::InvalidParams(format!(
                            "tool {} has an output schema but no structured content was provided",
                            params.name
                        )));
                    }
                    Params::from_typed(&result)
                })
            }),
        );
        Ok(())
    }

    fn install_resource_handlers(&self) -> McpResult<()> {
        if self
            .state
            .resource_handlers_installed
            .swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        self.server
            .protocol()
            .assert_can_set_request_handler(methods::METHOD_RESOURCES_LIST)?;
        if !self.server.is_connected() {
            self.server.register_capabilities(ServerCapabilities {
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: true,
                }),
                ..Default::default()
            })?;
        }

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_RESOURCES_LIST,
            Arc::new(move |_request, context: RequestContext| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let mut resources = Vec::new();
                    for (uri, entry) in state.resources.entries() {
                        let entry = entry.read().expect("resource entry lock poisoned");
                        if !entry.enabled {
                            continue;
                        }
                        resources.push(Resource {
                            uri,
                            name: entry.name.clone(),
                            description: entry.options.description.clone(),
                            mime_type: entry.options.mime_type.clone(),
                            annotations: entry.options.annotations.clone(),
                            size: entry.options.size,
                        });
                    }
                    resources.sort_by(|a, b| a.uri.cmp(&b.uri));

                    // Templates with a list callback contribute their
                    // current expansions.
                    for (name, entry) in state.resource_templates.entries() {
                        let (list_callback, enabled) = {
                            let entry =
                                entry.read().expect("resource template lock poisoned");
                            (entry.template.list_callback.clone(), entry.enabled)
                        };
                        let Some(list_callback) = list_callback else {
                            continue;
                        };
                        if !enabled {
                            continue;
                        }
                        let listed = list_callback(context.clone()).await.map_err(|e| {
                            McpError::InvalidParams(format!(
                                "list callback of template {name}: {e}"
                            ))
                        })?;
                        resources.extend(listed.resources);
                    }

                    Params::from_typed(&ListResourcesResult {
                        resources,
                        next_cursor: None,
                    })
                })
            }),
        );

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_RESOURCES_TEMPLATES_LIST,
            Arc::new(move |_request, _context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let mut resource_templates = Vec::new();
                    for (name, entry) in state.resource_templates.entries() {
                        let entry = entry.read().expect("resource template lock poisoned");
                        if !entry.enabled {
                            continue;
                        }
                        resource_templates.push(ResourceTemplateInfo {
                            uri_template: entry.template.template.as_str().to_string(),
                            name,
                            description: entry.options.description.clone(),
                            mime_type: entry.options.mime_type.clone(),
                            annotations: entry.options.annotations.clone(),
                        });
                    }
                    resource_templates.sort_by(|a, b| a.name.cmp(&b.name));
                    Params::from_typed(&ListResourceTemplatesResult {
                        resource_templates,
                        next_cursor: None,
                    })
                })
            }),
        );

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_RESOURCES_READ,
            Arc::new(move |request: JsonRpcRequest, context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let params: ResourceUriParams = request.params_as()?;
                    let uri = params.uri;

                    // Exact resource match first.
                    if let Some(entry) = state.resources.get(&uri) {
                        let (callback, enabled) = {
                            let entry = entry.read().expect("resource entry lock poisoned");
                            (Arc::clone(&entry.callback), entry.enabled)
                        };
                        if !enabled {
                            return Err(McpError::InvalidParams(format!(
                                "resource {uri} disabled"
                            )));
                        }
                        let result = callback(uri, context).await?;
                        return Params::from_typed(&result);
                    }

                    // Then templates.
                    for (_, entry) in state.resource_templates.entries() {
                        let (template, callback, enabled) = {
                            let entry =
                                entry.read().expect("resource template lock poisoned");
                            (
                                entry.template.template.clone(),
                                Arc::clone(&entry.callback),
                                entry.enabled,
                            )
                        };
                        let Some(variables) = template.match_uri(&uri) else {
                            continue;
                        };
                        if !enabled {
                            return Err(McpError::InvalidParams(format!(
                                "resource {uri} disabled"
                            )));
                        }
                        let result = callback(uri, variables, context).await?;
                        return Params::from_typed(&result);
                    }

                    Err(McpError::InvalidParams(format!("resource {uri} not found")))
                })
            }),
        );

        self.install_completion_handler()?;
        Ok(())
    }

    fn install_prompt_handlers(&self) -> McpResult<()> {
        if self
            .state
            .prompt_handlers_installed
            .swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        self.server
            .protocol()
            .assert_can_set_request_handler(methods::METHOD_PROMPTS_LIST)?;
        if !self.server.is_connected() {
            self.server.register_capabilities(ServerCapabilities {
                prompts: Some(ListChangedCapability { list_changed: true }),
                ..Default::default()
            })?;
        }

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_PROMPTS_LIST,
            Arc::new(move |_request, _context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let mut prompts = Vec::new();
                    for (name, entry) in state.prompts.entries() {
                        let entry = entry.read().expect("prompt entry lock poisoned");
                        if !entry.enabled {
                            continue;
                        }
                        prompts.push(Prompt {
                            name,
                            title: entry.title.clone(),
                            description: entry.description.clone(),
                            arguments: entry
                                .arguments
                                .iter()
                                .map(|arg| PromptArgument {
                                    name: arg.name.clone(),
                                    description: arg.description.clone(),
                                    required: arg.required,
                                })
                                .collect(),
                        });
                    }
                    prompts.sort_by(|a, b| a.name.cmp(&b.name));
                    Params::from_typed(&ListPromptsResult {
                        prompts,
                        next_cursor: None,
                    })
                })
            }),
        );

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_PROMPTS_GET,
            Arc::new(move |request: JsonRpcRequest, context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let params: GetPromptParams = request.params_as()?;
                    let Some(entry) = state.prompts.get(&params.name) else {
                        return Err(McpError::InvalidParams(format!(
                            "prompt {} not found",
                            params.name
                        )));
                    };
                    let (callback, enabled) = {
                        let entry = entry.read().expect("prompt entry lock poisoned");
                        (Arc::clone(&entry.callback), entry.enabled)
                    };
                    if !enabled {
                        return Err(McpError::InvalidParams(format!(
                            "prompt {} disabled",
                            params.name
                        )));
                    }
                    let result = callback(params.arguments, context).await?;
                    Params::from_typed(&result)
                })
            }),
        );

        self.install_completion_handler()?;
        Ok(())
    }

    fn install_completion_handler(&self) -> McpResult<()> {
        if self
            .state
            .completion_handler_installed
            .swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        if !self.server.is_connected() {
            self.server.register_capabilities(ServerCapabilities {
                completions: Some(serde_json::json!({})),
                ..Default::default()
            })?;
        }

        let state = Arc::clone(&self.state);
        self.server.protocol().set_request_handler(
            methods::METHOD_COMPLETION_COMPLETE,
            Arc::new(move |request: JsonRpcRequest, _context| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let params: CompleteParams = request.params_as()?;
                    let suggestions = match &params.reference {
                        CompletionReference::Prompt { name } => {
                            complete_prompt_argument(&state, name, &params)?
                        }
                        CompletionReference::Resource { uri } => {
                            complete_template_variable(&state, uri, &params)?
                        }
                    };
                    Params::from_typed(&completion_result(suggestions))
                })
            }),
        );
        Ok(())
    }
}

fn complete_prompt_argument(
    state: &RegistryState,
    name: &str,
    params: &CompleteParams,
) -> McpResult<Vec<String>> {
    let Some(entry) = state.prompts.get(&name.to_string()) else {
        return Err(McpError::InvalidParams(format!("prompt {name} not found")));
    };
    let entry = entry.read().expect("prompt entry lock poisoned");
    if !entry.enabled {
        return Err(McpError::InvalidParams(format!("prompt {name} disabled")));
    }
    let completer = entry
        .arguments
        .iter()
        .find(|arg| arg.name == params.argument.name)
        .and_then(|arg| arg.complete.clone());
    Ok(match completer {
        Some(completer) => completer(&params.argument.value, params.context.as_ref()),
        None => Vec::new(),
    })
}

fn complete_template_variable(
    state: &RegistryState,
    uri: &str,
    params: &CompleteParams,
) -> McpResult<Vec<String>> {
    let entry = state
        .resource_templates
        .entries()
        .into_iter()
        .map(|(_, entry)| entry)
        .find(|entry| {
            entry
                .read()
                .expect("resource template lock poisoned")
                .template
                .template
                .as_str()
                == uri
        });
    let Some(entry) = entry else {
        // A fixed resource reference completes to nothing.
        if state.resources.contains(&uri.to_string()) {
            return Ok(Vec::new());
        }
        return Err(McpError::InvalidParams(format!(
            "resource template {uri} not found"
        )));
    };
    let completer = entry
        .read()
        .expect("resource template lock poisoned")
        .template
        .complete_callbacks
        .get(&params.argument.name)
        .cloned();
    Ok(match completer {
        Some(completer) => completer(&params.argument.value, params.context.as_ref()),
        None => Vec::new(),
    })
}

fn completion_result(suggestions: Vec<String>) -> CompleteResult {
    let total = suggestions.len();
    let has_more = total > MAX_COMPLETION_VALUES;
    let mut values = suggestions;
    values.truncate(MAX_COMPLETION_VALUES);
    CompleteResult {
        completion: Completion {
            values,
            total: Some(total as u64),
            has_more: Some(has_more),
        },
    }
}

/// Fields of a registered tool that can change after registration.
#[derive(Clone, Default)]
pub struct ToolUpdate {
    /// Rename the tool
    pub name: Option<String>,
    /// Replace the title
    pub title: Option<String>,
    /// Replace the description
    pub description: Option<String>,
    /// Replace the input schema
    pub input_schema: Option<ToolSchema>,
    /// Replace the output schema
    pub output_schema: Option<ToolSchema>,
    /// Replace the callback
    pub callback: Option<ToolCallback>,
}

/// Handle to a registered tool.
pub struct RegisteredTool {
    registry: McpServer,
    name: Mutex<String>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &*self.name.lock().expect("name lock poisoned"))
            .finish()
    }
}

impl RegisteredTool {
    fn current_name(&self) -> String {
        self.name.lock().expect("name lock poisoned").clone()
    }

    fn entry(&self) -> McpResult<Arc<RwLock<ToolEntry>>> {
        let name = self.current_name();
        self.registry
            .state
            .tools
            .get(&name)
            .ok_or_else(|| McpError::InvalidParams(format!("tool {name} was removed")))
    }

    /// Make the tool visible and callable again.
    pub async fn enable(&self) -> McpResult<()> {
        self.set_enabled(true).await
    }

    /// Hide the tool from `tools/list` and reject `tools/call`.
    pub async fn disable(&self) -> McpResult<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enabled: bool) -> McpResult<()> {
        let entry = self.entry()?;
        let changed = {
            let mut entry = entry.write().expect("tool entry lock poisoned");
            let changed = entry.enabled != enabled;
            entry.enabled = enabled;
            changed
        };
        if changed {
            self.registry.notify_tools_changed().await?;
        }
        Ok(())
    }

    /// Apply updates; a rename moves the registry key.
    pub async fn update(&self, update: ToolUpdate) -> McpResult<()> {
        let entry = self.entry()?;
        {
            let mut guard = entry.write().expect("tool entry lock poisoned");
            if let Some(title) = update.title {
                guard.title = Some(title);
            }
            if let Some(description) = update.description {
                guard.description = Some(description);
            }
            if let Some(input_schema) = update.input_schema {
                guard.input_schema = input_schema;
            }
            if let Some(output_schema) = update.output_schema {
                guard.output_schema = Some(output_schema);
            }
            if let Some(callback) = update.callback {
                guard.callback = callback;
            }
        }
        if let Some(new_name) = update.name {
            let old_name = self.current_name();
            if new_name != old_name {
                if self.registry.state.tools.contains(&new_name) {
                    return Err(McpError::InvalidParams(format!(
                        "tool {new_name} is already registered"
                    )));
                }
                self.registry.state.tools.remove(&old_name);
                self.registry.state.tools.set(new_name.clone(), entry);
                *self.name.lock().expect("name lock poisoned") = new_name;
            }
        }
        self.registry.notify_tools_changed().await
    }

    /// Remove the tool from the registry.
    pub async fn remove(&self) -> McpResult<()> {
        let name = self.current_name();
        if self.registry.state.tools.remove(&name).is_none() {
            warn!(tool = %name, "removing a tool that was already removed");
            return Ok(());
        }
        self.registry.notify_tools_changed().await
    }
}

/// Handle to a registered fixed-URI resource.
pub struct RegisteredResource {
    registry: McpServer,
    uri: Mutex<String>,
}

impl std::fmt::Debug for RegisteredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredResource")
            .field("uri", &*self.uri.lock().expect("uri lock poisoned"))
            .finish()
    }
}

impl RegisteredResource {
    fn current_uri(&self) -> String {
        self.uri.lock().expect("uri lock poisoned").clone()
    }

    fn entry(&self) -> McpResult<Arc<RwLock<ResourceEntry>>> {
        let uri = self.current_uri();
        self.registry
            .state
            .resources
            .get(&uri)
            .ok_or_else(|| McpError::InvalidParams(format!("resource {uri} was removed")))
    }

    /// Make the resource visible and readable again.
    pub async fn enable(&self) -> McpResult<()> {
        self.set_enabled(true).await
    }

    /// Hide the resource from `resources/list` and reject reads.
    pub async fn disable(&self) -> McpResult<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enabled: bool) -> McpResult<()> {
        let entry = self.entry()?;
        let changed = {
            let mut entry = entry.write().expect("resource entry lock poisoned");
            let changed = entry.enabled != enabled;
            entry.enabled = enabled;
            changed
        };
        if changed {
            self.registry.notify_resources_changed().await?;
        }
        Ok(())
    }

    /// Replace the resource metadata and/or callback.
    pub async fn update(
        &self,
        options: Option<ResourceOptions>,
        callback: Option<ReadResourceCallback>,
    ) -> McpResult<()> {
        let entry = self.entry()?;
        {
            let mut guard = entry.write().expect("resource entry lock poisoned");
            if let Some(options) = options {
                guard.options = options;
            }
            if let Some(callback) = callback {
                guard.callback = callback;
            }
        }
        self.registry.notify_resources_changed().await
    }

    /// Remove the resource from the registry.
    pub async fn remove(&self) -> McpResult<()> {
        let uri = self.current_uri();
        if self.registry.state.resources.remove(&uri).is_none() {
            warn!(resource = %uri, "removing a resource that was already removed");
            return Ok(());
        }
        self.registry.notify_resources_changed().await
    }
}

/// Handle to a registered resource template.
pub struct RegisteredResourceTemplate {
    registry: McpServer,
    name: Mutex<String>,
}

impl std::fmt::Debug for RegisteredResourceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredResourceTemplate")
            .field("name", &*self.name.lock().expect("name lock poisoned"))
            .finish()
    }
}

impl RegisteredResourceTemplate {
    fn current_name(&self) -> String {
        self.name.lock().expect("name lock poisoned").clone()
    }

    fn entry(&self) -> McpResult<Arc<RwLock<ResourceTemplateEntry>>> {
        let name = self.current_name();
        self.registry
            .state
            .resource_templates
            .get(&name)
            .ok_or_else(|| {
                McpError::InvalidParams(format!("resource template {name} was removed"))
            })
    }

    /// Make the template visible and matchable again.
    pub async fn enable(&self) -> McpResult<()> {
        self.set_enabled(true).await
    }

    /// Hide the template and stop matching reads against it.
    pub async fn disable(&self) -> McpResult<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enabled: bool) -> McpResult<()> {
        let entry = self.entry()?;
        let changed = {
            let mut entry = entry.write().expect("resource template lock poisoned");
            let changed = entry.enabled != enabled;
            entry.enabled = enabled;
            changed
        };
        if changed {
            self.registry.notify_resources_changed().await?;
        }
        Ok(())
    }

    /// Replace the template and/or its metadata.
    pub async fn update(
        &self,
        template: Option<ResourceTemplate>,
        options: Option<ResourceOptions>,
    ) -> McpResult<()> {
        let entry = self.entry()?;
        {
            let mut guard = entry.write().expect("resource template lock poisoned");
            if let Some(template) = template {
                guard.template = template;
            }
            if let Some(options) = options {
                guard.options = options;
            }
        }
        self.registry.notify_resources_changed().await
    }

    /// Remove the template from the registry.
    pub async fn remove(&self) -> McpResult<()> {
        let name = self.current_name();
        if self
            .registry
            .state
            .resource_templates
            .remove(&name)
            .is_none()
        {
            warn!(template = %name, "removing a template that was already removed");
            return Ok(());
        }
        self.registry.notify_resources_changed().await
    }
}

/// Handle to a registered prompt.
pub struct RegisteredPrompt {
    registry: McpServer,
    name: Mutex<String>,
}

impl std::fmt::Debug for RegisteredPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPrompt")
            .field("name", &*self.name.lock().expect("name lock poisoned"))
            .finish()
    }
}

impl RegisteredPrompt {
    fn current_name(&self) -> String {
        self.name.lock().expect("name lock poisoned").clone()
    }

    fn entry(&self) -> McpResult<Arc<RwLock<PromptEntry>>> {
        let name = self.current_name();
        self.registry
            .state
            .prompts
            .get(&name)
            .ok_or_else(|| McpError::InvalidParams(format!("prompt {name} was removed")))
    }

    /// Make the prompt visible and renderable again.
    pub async fn enable(&self) -> McpResult<()> {
        self.set_enabled(true).await
    }

    /// Hide the prompt from `prompts/list` and reject `prompts/get`.
    pub async fn disable(&self) -> McpResult<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enabled: bool) -> McpResult<()> {
        let entry = self.entry()?;
        let changed = {
            let mut entry = entry.write().expect("prompt entry lock poisoned");
            let changed = entry.enabled != enabled;
            entry.enabled = enabled;
            changed
        };
        if changed {
            self.registry.notify_prompts_changed().await?;
        }
        Ok(())
    }

    /// Replace the prompt metadata, arguments and/or callback.
    pub async fn update(
        &self,
        options: Option<PromptOptions>,
        callback: Option<PromptCallback>,
    ) -> McpResult<()> {
        let entry = self.entry()?;
        {
            let mut guard = entry.write().expect("prompt entry lock poisoned");
            if let Some(options) = options {
                guard.title = options.title;
                guard.description = options.description;
                guard.arguments = options.arguments;
            }
            if let Some(callback) = callback {
                guard.callback = callback;
            }
        }
        self.registry.notify_prompts_changed().await
    }

    /// Remove the prompt from the registry.
    pub async fn remove(&self) -> McpResult<()> {
        let name = self.current_name();
        if self.registry.state.prompts.remove(&name).is_none() {
            warn!(prompt = %name, "removing a prompt that was already removed");
            return Ok(());
        }
        self.registry.notify_prompts_changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::schema::Implementation;
    use crate::mcp::server::ServerOptions;

    fn registry() -> McpServer {
        McpServer::new(Server::new(
            Implementation::new("test-server", "0.1.0"),
            ServerOptions::default(),
        ))
    }

    fn echo_tool() -> ToolCallback {
        Arc::new(|arguments, _context| {
            Box::pin(async move {
                let text = arguments
                    .and_then(|mut a| a.remove("text"))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                Ok(CallToolResult::text(text))
            })
        })
    }

    #[tokio::test]
    async fn test_register_tool_advertises_capability() {
        let registry = registry();
        registry
            .register_tool("echo", ToolOptions::default(), echo_tool())
            .await
            .unwrap();
        assert!(registry.server().capabilities().tools.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_tool_is_rejected() {
        let registry = registry();
        registry
            .register_tool("echo", ToolOptions::default(), echo_tool())
            .await
            .unwrap();
        assert!(registry
            .register_tool("echo", ToolOptions::default(), echo_tool())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_the_registry_key() {
        let registry = registry();
        let tool = registry
            .register_tool("echo", ToolOptions::default(), echo_tool())
            .await
            .unwrap();
        tool.update(ToolUpdate {
            name: Some("echo2".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(!registry.state.tools.contains(&"echo".to_string()));
        assert!(registry.state.tools.contains(&"echo2".to_string()));

        // The handle follows the rename.
        tool.disable().await.unwrap();
        let entry = registry.state.tools.get(&"echo2".to_string()).unwrap();
        assert!(!entry.read().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_remove_twice_is_benign() {
        let registry = registry();
        let tool = registry
            .register_tool("echo", ToolOptions::default(), echo_tool())
            .await
            .unwrap();
        tool.remove().await.unwrap();
        tool.remove().await.unwrap();
        assert!(registry.state.tools.is_empty());
    }

    #[test]
    fn test_completion_result_caps_values() {
        let suggestions: Vec<String> = (0..150).map(|i| format!("v{i}")).collect();
        let result = completion_result(suggestions);
        assert_eq!(result.completion.values.len(), 100);
        assert_eq!(result.completion.total, Some(150));
        assert_eq!(result.completion.has_more, Some(true));
    }
}
