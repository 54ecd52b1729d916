//! Registry façade contract, exercised end-to-end: a Client and a
//! McpServer talking over in-memory pipes, list-changed notifications
//! counted on the client side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcp_core::mcp::client::{Client, ClientOptions};
use mcp_core::mcp::protocol::ProtocolOptions;
use mcp_core::mcp::schema::{
    CallToolParams, CallToolResult, ClientCapabilities, CompleteParams, CompletionArgument,
    CompletionReference, Content, CreateMessageParams, CreateMessageResult, GetPromptParams,
    GetPromptResult, Implementation, ListResourcesResult, LoggingLevel, PaginatedParams,
    PromptMessage, ReadResourceResult, Resource, ResourceContents, Role, SamplingMessage,
    ServerCapabilities, ToolSchema,
};
use mcp_core::mcp::protocol::RequestOptions;
use mcp_core::mcp::server::{Server, ServerOptions};
use mcp_core::mcp::server_registry::{
    McpServer, PromptArgumentDef, PromptOptions, ResourceOptions, ResourceTemplate, ToolOptions,
    ToolUpdate,
};
use mcp_core::mcp::transport::stdio::StdioTransport;
use mcp_core::mcp::types::Params;
use mcp_core::utils::error::McpError;
use serde_json::{json, Map, Value};
use tokio::io::DuplexStream;

fn transport_for(stream: DuplexStream) -> Arc<StdioTransport> {
    let (reader, writer) = tokio::io::split(stream);
    Arc::new(StdioTransport::with_streams(
        Box::new(reader),
        Box::new(writer),
    ))
}

async fn connect(registry: &McpServer, client: &Client) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    registry.connect(transport_for(left)).await.unwrap();
    client.connect(transport_for(right)).await.unwrap();
}

fn default_client() -> Client {
    Client::new(
        Implementation::new("test-client", "0.1.0"),
        ClientOptions::default(),
    )
}

fn echo_tool_callback() -> mcp_core::mcp::server_registry::ToolCallback {
    Arc::new(|arguments: Option<Map<String, Value>>, _context| {
        Box::pin(async move {
            let text = arguments
                .and_then(|mut a| a.remove("text"))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            Ok(CallToolResult::text(text))
        })
    })
}

/// Counts notifications of one method arriving at the client.
fn count_notifications(client: &Client, method: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    client.protocol().set_notification_handler(
        method,
        Arc::new(move |_notification| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
    );
    counter
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_tool_lifecycle_emits_one_notification_per_mutation() {
    let registry = McpServer::new(Server::new(
        Implementation::new("test-server", "0.1.0"),
        ServerOptions::default(),
    ));
    let tool = registry
        .register_tool("echo", ToolOptions::default(), echo_tool_callback())
        .await
        .unwrap();

    let client = default_client();
    let changes = count_notifications(&client, "notifications/tools/list_changed");
    connect(&registry, &client).await;

    // Visible and callable.
    let tools = client.list_tools(PaginatedParams::default()).await.unwrap();
    assert_eq!(tools.tools.len(), 1);
    assert_eq!(tools.tools[0].name, "echo");

    let result = client
        .call_tool(
            CallToolParams {
                name: "echo".into(),
                arguments: Some(
                    json!({"text": "hi"}).as_object().unwrap().clone(),
                ),
            },
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.content, vec![Content::text("hi")]);

    // disable, enable, rename, remove: one notification each.
    tool.disable().await.unwrap();
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    let tools = client.list_tools(PaginatedParams::default()).await.unwrap();
    assert!(tools.tools.is_empty());
    let err = client
        .call_tool(
            CallToolParams {
                name: "echo".into(),
                arguments: None,
            },
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        McpError::Peer(object) => assert_eq!(object.code, -32602),
        other => panic!("expected invalid-params error, got {other}"),
    }

    // Disabling an already-disabled tool changes nothing observable.
    tool.disable().await.unwrap();
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    tool.enable().await.unwrap();
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 2);

    tool.update(ToolUpdate {
        name: Some("echo-renamed".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 3);
    let tools = client.list_tools(PaginatedParams::default()).await.unwrap();
    assert_eq!(tools.tools[0].name, "echo-renamed");

    tool.remove().await.unwrap();
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 4);
    let tools = client.list_tools(PaginatedParams::default()).await.unwrap();
    assert!(tools.tools.is_empty());
}

#[tokio::test]
async fn test_output_schema_requires_structured_content() {
    let registry = McpServer::new(Server::new(
        Implementation::new("test-server", "0.1.0"),
        ServerOptions::default(),
    ));
    registry
        .register_tool(
            "structured",
            ToolOptions {
                output_schema: Some(ToolSchema::default()),
                ..Default::default()
            },
            Arc::new(|arguments: Option<Map<String, Value>>, _context| {
                Box::pin(async move {
                    let with_structured = arguments
                        .as_ref()
                        .and_then(|a| a.get("structured"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let mut result = CallToolResult::text("done");
                    if with_structured {
                        result.structured_content = Some(json!({"answer": 42}));
                    }
                    Ok(result)
                })
            }),
        )
        .await
        .unwrap();

    let client = default_client();
    connect(&registry, &client).await;

    // A declared output schema with no structured content is a protocol
    // error, not a tool error.
    let err = client
        .call_tool(
            CallToolParams {
                name: "structured".into(),
                arguments: Some(json!({"structured": false}).as_object().unwrap().clone()),
            },
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        McpError::Peer(object) => assert_eq!(object.code, -32602),
        other => panic!("expected invalid-params error, got {other}"),
    }

    let result = client
        .call_tool(
            CallToolParams {
                name: "structured".into(),
                arguments: Some(json!({"structured": true}).as_object().unwrap().clone()),
            },
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.structured_content, Some(json!({"answer": 42})));
}

#[tokio::test]
async fn test_tool_failure_is_reported_inside_the_result() {
    let registry = McpServer::new(Server::new(
        Implementation::new("test-server", "0.1.0"),
        ServerOptions::default(),
    ));
    registry
        .register_tool(
            "flaky",
            ToolOptions::default(),
            Arc::new(|_arguments, _context| {
                Box::pin(async { Err(McpError::Internal("disk on fire".into())) })
            }),
        )
        .await
        .unwrap();

    let client = default_client();
    connect(&registry, &client).await;

    let result = client
        .call_tool(
            CallToolParams {
                name: "flaky".into(),
                arguments: None,
            },
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(true));
    match &result.content[0] {
        Content::Text { text } => assert!(text.contains("disk on fire")),
        other => panic!("expected text content, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resources_fixed_templates_and_completion() {
    let registry = McpServer::new(Server::new(
        Implementation::new("test-server", "0.1.0"),
        ServerOptions::default(),
    ));

    registry
        .register_resource(
            "readme",
            "file:///readme.md",
            ResourceOptions {
                mime_type: Some("text/markdown".into()),
                ..Default::default()
            },
            Arc::new(|uri: String, _context| {
                Box::pin(async move {
                    Ok(ReadResourceResult {
                        contents: vec![ResourceContents::Text {
                            uri,
                            mime_type: Some("text/markdown".into()),
                            text: "# hello".into(),
                        }],
                    })
                })
            }),
        )
        .await
        .unwrap();

    let template = ResourceTemplate::new("notes://{name}")
        .unwrap()
        .with_list_callback(Arc::new(|_context| {
            Box::pin(async {
                Ok(ListResourcesResult {
                    resources: vec![Resource {
                        uri: "notes://today".into(),
                        name: "today".into(),
                        description: None,
                        mime_type: None,
                        annotations: None,
                        size: None,
                    }],
                    next_cursor: None,
                })
            })
        }))
        .with_completer(
            "name",
            Arc::new(|value, _context| {
                ["today", "tomorrow", "yesterday"]
                    .iter()
                    .filter(|v| v.starts_with(value))
                    .map(|v| v.to_string())
                    .collect()
            }),
        );
    registry
        .register_resource_template(
            "notes",
            template,
            ResourceOptions::default(),
            Arc::new(|uri: String, variables, _context| {
                Box::pin(async move {
                    let name = variables.get("name").cloned().unwrap_or_default();
                    Ok(ReadResourceResult {
                        contents: vec![ResourceContents::Text {
                            uri,
                            mime_type: None,
                            text: format!("note {name}"),
                        }],
                    })
                })
            }),
        )
        .await
        .unwrap();

    let client = default_client();
    connect(&registry, &client).await;

    // Fixed resources and template expansions both appear in the list.
    let listed = client.list_resources(PaginatedParams::default()).await.unwrap();
    let uris: Vec<&str> = listed.resources.iter().map(|r| r.uri.as_str()).collect();
    assert!(uris.contains(&"file:///readme.md"));
    assert!(uris.contains(&"notes://today"));

    let templates = client
        .list_resource_templates(PaginatedParams::default())
        .await
        .unwrap();
    assert_eq!(templates.resource_templates[0].uri_template, "notes://{name}");

    // Exact read.
    let read = client.read_resource("file:///readme.md").await.unwrap();
    assert!(matches!(
        &read.contents[0],
        ResourceContents::Text { text, .. } if text == "# hello"
    ));

    // Template read extracts the variable.
    let read = client.read_resource("notes://today").await.unwrap();
    assert!(matches!(
        &read.contents[0],
        ResourceContents::Text { text, .. } if text == "note today"
    ));

    // Unknown URI is invalid-params.
    let err = client.read_resource("file:///missing").await.unwrap_err();
    assert!(matches!(err, McpError::Peer(ref o) if o.code == -32602));

    // Variable completion through the template completer.
    let completion = client
        .complete(CompleteParams {
            reference: CompletionReference::Resource {
                uri: "notes://{name}".into(),
            },
            argument: CompletionArgument {
                name: "name".into(),
                value: "to".into(),
            },
            context: None,
        })
        .await
        .unwrap();
    assert_eq!(completion.completion.values, vec!["today", "tomorrow"]);
}

#[tokio::test]
async fn test_prompts_and_argument_completion() {
    let registry = McpServer::new(Server::new(
        Implementation::new("test-server", "0.1.0"),
        ServerOptions::default(),
    ));
    registry
        .register_prompt(
            "greet",
            PromptOptions {
                description: Some("Greets someone".into()),
                arguments: vec![PromptArgumentDef {
                    name: "who".into(),
                    description: None,
                    required: true,
                    complete: Some(Arc::new(|value, _context| {
                        ["world", "friend"]
                            .iter()
                            .filter(|v| v.starts_with(value))
                            .map(|v| v.to_string())
                            .collect()
                    })),
                }],
                ..Default::default()
            },
            Arc::new(|arguments: Option<Map<String, Value>>, _context| {
                Box::pin(async move {
                    let who = arguments
                        .and_then(|mut a| a.remove("who"))
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "world".into());
                    Ok(GetPromptResult {
                        description: None,
                        messages: vec![PromptMessage {
                            role: Role::User,
                            content: Content::text(format!("Say hello to {who}")),
                        }],
                    })
                })
            }),
        )
        .await
        .unwrap();

    let client = default_client();
    connect(&registry, &client).await;

    let prompts = client.list_prompts(PaginatedParams::default()).await.unwrap();
    assert_eq!(prompts.prompts.len(), 1);
    assert!(prompts.prompts[0].arguments[0].required);

    let rendered = client
        .get_prompt(GetPromptParams {
            name: "greet".into(),
            arguments: Some(json!({"who": "friend"}).as_object().unwrap().clone()),
        })
        .await
        .unwrap();
    assert!(matches!(
        &rendered.messages[0].content,
        Content::Text { text } if text == "Say hello to friend"
    ));

    let completion = client
        .complete(CompleteParams {
            reference: CompletionReference::Prompt {
                name: "greet".into(),
            },
            argument: CompletionArgument {
                name: "who".into(),
                value: "w".into(),
            },
            context: None,
        })
        .await
        .unwrap();
    assert_eq!(completion.completion.values, vec!["world"]);
}

#[tokio::test]
async fn test_sampling_round_trip_and_strict_capability() {
    // Strict server: sampling requires the client to advertise it.
    let strict_server = Server::new(
        Implementation::new("strict-server", "0.1.0"),
        ServerOptions {
            protocol: ProtocolOptions {
                enforce_strict_capabilities: true,
            },
            ..Default::default()
        },
    );
    let plain_client = default_client();
    let registry = McpServer::new(strict_server.clone());
    connect(&registry, &plain_client).await;

    let err = strict_server
        .create_message(
            CreateMessageParams {
                messages: vec![],
                model_preferences: None,
                system_prompt: None,
                temperature: None,
                max_tokens: 16,
                stop_sequences: vec![],
            },
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityMissing(_)));

    // A sampling-capable client answers the server's request.
    let server = Server::new(
        Implementation::new("sampling-server", "0.1.0"),
        ServerOptions::default(),
    );
    let client = Client::new(
        Implementation::new("sampling-client", "0.1.0"),
        ClientOptions {
            capabilities: ClientCapabilities {
                sampling: Some(json!({})),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    client.protocol().set_request_handler(
        "sampling/createMessage",
        Arc::new(|_request, _context| {
            Box::pin(async {
                Params::from_typed(&CreateMessageResult {
                    role: Role::Assistant,
                    content: Content::text("sampled"),
                    model: "test-model".into(),
                    stop_reason: Some("endTurn".into()),
                })
            })
        }),
    );
    let registry = McpServer::new(server.clone());
    connect(&registry, &client).await;

    let result = server
        .create_message(
            CreateMessageParams {
                messages: vec![SamplingMessage {
                    role: Role::User,
                    content: Content::text("hello?"),
                }],
                model_preferences: None,
                system_prompt: None,
                temperature: None,
                max_tokens: 16,
                stop_sequences: vec![],
            },
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.model, "test-model");
}

#[tokio::test]
async fn test_logging_level_filters_messages() {
    let server = Server::new(
        Implementation::new("logging-server", "0.1.0"),
        ServerOptions {
            capabilities: ServerCapabilities {
                logging: Some(json!({})),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let client = default_client();
    let received = count_notifications(&client, "notifications/message");
    let registry = McpServer::new(server.clone());
    connect(&registry, &client).await;

    client.set_logging_level(LoggingLevel::Warning).await.unwrap();

    server
        .send_logging_message(LoggingLevel::Info, json!("too quiet"), None)
        .await
        .unwrap();
    server
        .send_logging_message(LoggingLevel::Error, json!("loud enough"), None)
        .await
        .unwrap();
    settle().await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
}
