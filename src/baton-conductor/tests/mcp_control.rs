//! The control channel: `mcp/*` methods are serviced by the conductor and
//! never cross the pipeline.

mod common;

use baton_conductor::Conductor;
use common::*;
use serde_json::{json, Value};

async fn connect(client: &mut TestEndpoint, acp_url: &str) -> Value {
    let id = client.send_request("mcp/connect", json!({ "acp_url": acp_url }));
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    response.into_result().expect("mcp/connect should succeed")
}

#[tokio::test]
async fn connect_describes_the_server_and_its_tools() {
    let server = echo_tool_server();
    let acp_url = server.acp_url().to_string();
    let (agent, _agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test").with_component(agent).with_tool_server(server);
    let (mut client, _handle) = start(conductor);

    let connected = connect(&mut client, &acp_url).await;
    assert!(connected["connectionId"].is_string());
    assert_eq!(connected["serverInfo"], json!({ "name": "s", "version": "1.0.0" }));
    assert_eq!(connected["capabilities"], json!({ "tools": {} }));
    assert_eq!(connected["tools"][0]["name"], json!("echo"));
}

#[tokio::test]
async fn connect_to_unknown_url_fails() {
    let (agent, _agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test")
        .with_component(agent)
        .with_tool_server(echo_tool_server());
    let (mut client, _handle) = start(conductor);

    let id = client.send_request("mcp/connect", json!({ "acp_url": "acp:nope" }));
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    let error = response.into_result().unwrap_err();
    assert!(error.message.contains("No MCP server registered for URL"), "{error:?}");
}

#[tokio::test]
async fn message_returns_the_raw_mcp_result() {
    let server = echo_tool_server();
    let acp_url = server.acp_url().to_string();
    let (agent, _agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test").with_component(agent).with_tool_server(server);
    let (mut client, _handle) = start(conductor);

    let connected = connect(&mut client, &acp_url).await;
    let connection_id = connected["connectionId"].as_str().unwrap().to_string();

    // tools/list through the tunnel: the raw MCP result, not re-wrapped.
    let id = client.send_request(
        "mcp/message",
        json!({ "connectionId": connection_id, "method": "tools/list", "params": {} }),
    );
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    let result = response.into_result().unwrap();
    assert_eq!(result["tools"][0]["name"], json!("echo"));

    // tools/call produces the content envelope.
    let id = client.send_request(
        "mcp/message",
        json!({
            "connectionId": connection_id,
            "method": "tools/call",
            "params": { "name": "echo", "arguments": { "k": "v" } },
        }),
    );
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    let result = response.into_result().unwrap();
    assert_eq!(result["content"][0]["text"], json!(r#"{"k":"v"}"#));
}

#[tokio::test]
async fn disconnect_invalidates_the_connection() {
    let server = echo_tool_server();
    let acp_url = server.acp_url().to_string();
    let (agent, _agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test").with_component(agent).with_tool_server(server);
    let (mut client, _handle) = start(conductor);

    let connected = connect(&mut client, &acp_url).await;
    let connection_id = connected["connectionId"].as_str().unwrap().to_string();

    client.send_notification("mcp/disconnect", Some(json!({ "connectionId": connection_id })));

    let id = client.send_request(
        "mcp/message",
        json!({ "connectionId": connection_id, "method": "tools/list", "params": {} }),
    );
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    let error = response.into_result().unwrap_err();
    assert_eq!(error.code, -32600);
}

#[tokio::test]
async fn underscore_prefixed_form_is_rejected() {
    let server = echo_tool_server();
    let acp_url = server.acp_url().to_string();
    let (agent, _agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test").with_component(agent).with_tool_server(server);
    let (mut client, _handle) = start(conductor);

    let id = client.send_request("_mcp/connect", json!({ "acp_url": acp_url }));
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    let error = response.into_result().unwrap_err();
    assert_eq!(error.code, -32600);
}

/// `mcp/*` frames are consumed by the conductor even before `initialize`,
/// and none of them ever reach the agent.
#[tokio::test]
async fn control_frames_never_reach_the_pipeline() {
    let server = echo_tool_server();
    let acp_url = server.acp_url().to_string();
    let (agent, agent_log) = spawn_echo_agent();
    let conductor = Conductor::new("test").with_component(agent).with_tool_server(server);
    let (mut client, _handle) = start(conductor);

    // Before initialize.
    connect(&mut client, &acp_url).await;

    initialize(&mut client).await;

    // Unknown mcp/ method: consumed with an error, not forwarded.
    let id = client.send_request("mcp/shrug", json!({}));
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    assert_eq!(response.into_result().unwrap_err().code, -32601);

    let log = agent_log.lock().unwrap();
    assert!(
        log.iter().all(|request| !request.method.contains("mcp/")),
        "agent must never see mcp traffic: {log:?}"
    );
}
