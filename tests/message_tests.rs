//! Wire-codec properties: classification, round-trips and the reserved
//! `_meta` discipline.

use mcp_core::mcp::types::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, Params, ProgressToken, ResultShape,
};
use serde_json::json;

#[test]
fn test_decode_encode_round_trip_is_structural_identity() {
    let cases = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}}),
        json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "Method not found"}}),
        json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {
                "_meta": {"progressToken": 4, "custom": {"nested": true}},
                "name": "echo",
                "arguments": {"text": "hello"},
                "vendorExtension": [1, 2, 3]
            }
        }),
    ];

    for case in cases {
        let decoded = JsonRpcMessage::from_value(case.clone()).unwrap();
        assert_eq!(decoded.to_value(), case);
        // A second decode of the re-encoding is structurally equal.
        assert_eq!(JsonRpcMessage::from_value(decoded.to_value()).unwrap(), decoded);
    }
}

#[test]
fn test_reserved_metadata_discipline_literal() {
    // Caller supplies `_meta` both as the reserved bag and smuggled through
    // the additional properties: the reserved one wins, the smuggled one is
    // dropped.
    let mut params = Params::new();
    params.set_progress_token(ProgressToken::Number(7));
    params.extra.insert("_meta".to_string(), json!("x"));
    params.extra.insert("exampleKey".to_string(), json!("v"));

    let request = JsonRpcMessage::Request(JsonRpcRequest::new(1, "tools/call", Some(params)));
    let encoded = request.to_value();
    assert_eq!(
        encoded["params"],
        json!({"_meta": {"progressToken": 7}, "exampleKey": "v"})
    );
}

#[test]
fn test_meta_survives_round_trip_on_results() {
    let raw = json!({
        "jsonrpc": "2.0",
        "id": 10,
        "result": {
            "_meta": {"traceId": "abc123"},
            "content": [{"type": "text", "text": "done"}]
        }
    });
    let decoded = JsonRpcMessage::from_value(raw.clone()).unwrap();
    let JsonRpcMessage::Response(response) = &decoded else {
        panic!("expected response");
    };
    assert_eq!(
        response.result.meta.as_ref().unwrap().get("traceId"),
        Some(&json!("abc123"))
    );
    assert_eq!(decoded.to_value(), raw);
}

#[test]
fn test_ping_response_wire_shape() {
    let response = JsonRpcMessage::Response(JsonRpcResponse::new(1, Params::new()));
    assert_eq!(
        serde_json::to_string(&response).unwrap(),
        r#"{"jsonrpc":"2.0","id":1,"result":{}}"#
    );
}

#[test]
fn test_unknown_method_becomes_generic_envelope() {
    let request = JsonRpcMessage::from_value(json!({
        "jsonrpc": "2.0", "id": 5, "method": "vendor/custom", "params": {"a": 1}
    }))
    .unwrap();
    match request {
        JsonRpcMessage::Request(req) => {
            assert!(!req.is_known_method());
            assert_eq!(req.params.unwrap().extra.get("a"), Some(&json!(1)));
        }
        other => panic!("expected request, got {other:?}"),
    }

    let notification = JsonRpcMessage::from_value(json!({
        "jsonrpc": "2.0", "method": "vendor/event"
    }))
    .unwrap();
    assert!(matches!(notification, JsonRpcMessage::Notification(_)));
}

#[test]
fn test_malformed_payloads_are_parse_failures() {
    assert!(JsonRpcMessage::from_slice(b"not json at all").is_err());
    assert!(JsonRpcMessage::from_value(json!({"jsonrpc": "2.0"})).is_err());
    assert!(JsonRpcMessage::from_value(json!({"jsonrpc": "2.0", "id": 1})).is_err());
    assert!(JsonRpcMessage::from_value(json!("just a string")).is_err());
    // Params must be an object when present.
    assert!(JsonRpcMessage::from_value(json!({
        "jsonrpc": "2.0", "id": 1, "method": "ping", "params": [1, 2]
    }))
    .is_err());
}

#[test]
fn test_result_shape_discrimination() {
    let shape = |v: serde_json::Value| ResultShape::classify(&Params::from_value(v).unwrap());
    assert_eq!(
        shape(json!({"protocolVersion": "2025-03-26", "capabilities": {}})),
        ResultShape::Initialize
    );
    assert_eq!(shape(json!({"tools": []})), ResultShape::ListTools);
    assert_eq!(shape(json!({"completion": {"values": []}})), ResultShape::Complete);
    assert_eq!(shape(json!({"model": "claude", "role": "assistant"})), ResultShape::CreateMessage);
    assert_eq!(shape(json!({"content": [], "isError": false})), ResultShape::CallTool);
    assert_eq!(shape(json!({"_meta": {"x": 1}})), ResultShape::Empty);
}

#[test]
fn test_progress_token_forms() {
    let numeric = Params::from_value(json!({"_meta": {"progressToken": 12}})).unwrap();
    assert_eq!(numeric.progress_token(), Some(ProgressToken::Number(12)));

    let string = Params::from_value(json!({"_meta": {"progressToken": "abc"}})).unwrap();
    assert_eq!(
        string.progress_token(),
        Some(ProgressToken::String("abc".into()))
    );

    let absent = Params::from_value(json!({"_meta": {}})).unwrap();
    assert_eq!(absent.progress_token(), None);
}
