//! Behavior of in-process tool servers: MCP method dispatch and the
//! registry round-trip laws.

use baton::{Error, McpTool, ToolContext, ToolServer, ToolServerRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

struct EchoTool;

impl McpTool for EchoTool {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> String {
        "echo".to_string()
    }

    fn description(&self) -> String {
        "Echoes its arguments back".to_string()
    }

    async fn call(&self, input: Value, _cx: ToolContext) -> Result<Value, Error> {
        Ok(input)
    }
}

#[derive(JsonSchema, Deserialize)]
struct FailInput {
    reason: String,
}

#[derive(JsonSchema, Serialize)]
struct FailOutput {}

struct FailingTool;

impl McpTool for FailingTool {
    type Input = FailInput;
    type Output = FailOutput;

    fn name(&self) -> String {
        "fail".to_string()
    }

    fn description(&self) -> String {
        "Always fails".to_string()
    }

    async fn call(&self, input: FailInput, _cx: ToolContext) -> Result<FailOutput, Error> {
        Err(Error::new(-1, input.reason))
    }
}

fn test_cx() -> ToolContext {
    ToolContext {
        session_id: Some("sess-test".to_string()),
        connection_id: "conn-test".to_string(),
    }
}

fn echo_server() -> ToolServer {
    ToolServer::builder("s")
        .version("1.2.3")
        .tool(EchoTool)
        .tool(FailingTool)
        .build()
}

#[tokio::test]
async fn initialize_reports_server_info_and_tools_capability() {
    let server = echo_server();
    let result = server.handle_method("initialize", None, test_cx()).await.unwrap();
    assert_eq!(result["serverInfo"]["name"], json!("s"));
    assert_eq!(result["serverInfo"]["version"], json!("1.2.3"));
    assert_eq!(result["capabilities"]["tools"], json!({}));
    assert!(result["protocolVersion"].is_string());
}

#[tokio::test]
async fn tools_list_contains_registered_tools() {
    let server = echo_server();
    let result = server.handle_method("tools/list", None, test_cx()).await.unwrap();
    let names: Vec<&str> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["echo", "fail"]);
    assert!(result["tools"][0]["inputSchema"].is_object());
}

#[tokio::test]
async fn tools_call_wraps_output_in_content_envelope() {
    let server = echo_server();
    let result = server
        .handle_method(
            "tools/call",
            Some(json!({ "name": "echo", "arguments": { "k": "v" } })),
            test_cx(),
        )
        .await
        .unwrap();
    assert_eq!(result["content"][0]["type"], json!("text"));
    assert_eq!(result["content"][0]["text"], json!(r#"{"k":"v"}"#));
}

#[tokio::test]
async fn tool_failure_becomes_internal_error() {
    let server = echo_server();
    let err = server
        .handle_method(
            "tools/call",
            Some(json!({ "name": "fail", "arguments": { "reason": "boom" } })),
            test_cx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, baton::error::INTERNAL_ERROR);
    assert_eq!(err.message, "boom");
}

#[tokio::test]
async fn unknown_tool_and_unknown_method_are_rejected() {
    let server = echo_server();
    let err = server
        .handle_method("tools/call", Some(json!({ "name": "nope" })), test_cx())
        .await
        .unwrap_err();
    assert_eq!(err.code, baton::error::INVALID_PARAMS);

    let err = server
        .handle_method("resources/list", None, test_cx())
        .await
        .unwrap_err();
    assert_eq!(err.code, baton::error::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn bad_arguments_are_invalid_params() {
    let server = echo_server();
    let err = server
        .handle_method(
            "tools/call",
            Some(json!({ "name": "fail", "arguments": { "reason": 7 } })),
            test_cx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, baton::error::INVALID_PARAMS);
}

#[test]
fn registry_round_trip() {
    let mut registry = ToolServerRegistry::new();
    let server = registry.register(echo_server());
    let url = server.acp_url().to_string();
    assert!(url.starts_with("acp:"));

    assert!(registry.get(&url).is_some());
    assert!(registry.unregister(&url).is_some());
    assert!(registry.get(&url).is_none());
}
