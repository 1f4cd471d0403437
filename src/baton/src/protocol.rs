//! The extension-method vocabulary spoken between the conductor and its
//! peers.
//!
//! Two families of reserved methods ride on the outer protocol:
//!
//! * `_proxy/successor/*` — envelopes carrying agent-bound traffic through a
//!   proxy chain. Forward frames travel wrapped so each proxy sees only its
//!   immediate successor; backward frames travel raw.
//! * `mcp/*` — the control-channel methods tunneling MCP to in-process tool
//!   servers. The canonical wire form has no underscore prefix; the
//!   `_mcp/*` spelling is rejected as malformed rather than silently
//!   accepted.
//!
//! The `initialize` handshake offers the successor-wrapping contract to each
//! proxy via `params._meta.proxy = true`; a proxy accepts by answering
//! `result._meta.proxy = true`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";

pub const METHOD_SUCCESSOR_REQUEST: &str = "_proxy/successor/request";
pub const METHOD_SUCCESSOR_NOTIFICATION: &str = "_proxy/successor/notification";

pub const METHOD_MCP_CONNECT: &str = "mcp/connect";
pub const METHOD_MCP_MESSAGE: &str = "mcp/message";
pub const METHOD_MCP_DISCONNECT: &str = "mcp/disconnect";

/// URL scheme identifying an in-process tool server.
pub const ACP_URL_SCHEME: &str = "acp:";

/// Is this one of the control-channel methods the conductor consumes itself?
///
/// Covers the whole `mcp/` namespace and its underscore-prefixed spelling:
/// none of these may ever be forwarded to a proxy or the agent.
pub fn is_control_method(method: &str) -> bool {
    method.starts_with("mcp/") || method.starts_with("_mcp/")
}

pub fn is_successor_method(method: &str) -> bool {
    method == METHOD_SUCCESSOR_REQUEST || method == METHOD_SUCCESSOR_NOTIFICATION
}

/// The payload of a `_proxy/successor/*` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessorPayload {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Wrap a frame's method and params into envelope params.
pub fn wrap_successor(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({ "method": method, "params": params }),
        None => json!({ "method": method }),
    }
}

/// Return the params with `_meta.proxy = true` set, creating the `_meta`
/// object if needed. Existing `_meta` keys are preserved.
pub fn offer_proxy(params: Option<Value>) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    let object = params.as_object_mut().expect("params is an object");
    let meta = object
        .entry("_meta")
        .or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("proxy".to_string(), Value::Bool(true));
    } else {
        *meta = json!({ "proxy": true });
    }
    params
}

/// Did an `initialize` result acknowledge the proxy contract?
pub fn accepts_proxy(result: &Value) -> bool {
    result
        .get("_meta")
        .and_then(|meta| meta.get("proxy"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Params of `mcp/connect`. The server URL is accepted under `acpUrl`,
/// `acp_url`, or plain `url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectParams {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default, alias = "acp_url", alias = "url")]
    pub acp_url: Option<String>,
}

/// Params of `mcp/message`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpMessageParams {
    pub connection_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Params of `mcp/disconnect`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpDisconnectParams {
    pub connection_id: String,
}
