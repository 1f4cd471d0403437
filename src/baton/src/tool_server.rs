//! In-process MCP tool servers addressed by `acp:` URLs.
//!
//! A [`ToolServer`] bundles a set of tools behind a freshly minted
//! `acp:<uuid>` URL. The conductor's control handler dispatches the inner
//! MCP protocol (`initialize`, `tools/list`, `tools/call`) into
//! [`ToolServer::handle_method`]; tools themselves are written against the
//! typed [`McpTool`] trait and erased into dynamic [`ToolDef`]s at
//! registration.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use fxhash::FxHashMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{self, Error};
use crate::protocol::ACP_URL_SCHEME;

/// MCP protocol revision reported from `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Context threaded into every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The session the calling agent is operating in, when known. Bridge
    /// connections always carry one; connections driven directly over the
    /// control channel may not.
    pub session_id: Option<String>,

    /// The MCP connection this call arrived on.
    pub connection_id: String,
}

/// A typed MCP tool. Input and output schemas are derived with `schemars`.
pub trait McpTool: Send + Sync + 'static {
    type Input: JsonSchema + DeserializeOwned + Send;
    type Output: JsonSchema + Serialize + Send;

    fn name(&self) -> String;

    fn description(&self) -> String;

    fn call(
        &self,
        input: Self::Input,
        cx: ToolContext,
    ) -> impl Future<Output = Result<Self::Output, Error>> + Send;
}

type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;

/// A registered tool: name, description, schemas, and the erased handler.
/// Immutable after registration.
#[derive(Clone)]
pub struct ToolDef {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    handler: ToolHandler,
}

impl ToolDef {
    pub fn from_tool<T: McpTool>(tool: T) -> ToolDef {
        let tool = Arc::new(tool);
        let name = tool.name();
        let description = tool.description();
        let handler: ToolHandler = Arc::new(move |input, cx| {
            let tool = tool.clone();
            Box::pin(async move {
                let input: T::Input = serde_json::from_value(input)
                    .map_err(|err| Error::invalid_params().with_data(err.to_string()))?;
                let output = tool.call(input, cx).await?;
                serde_json::to_value(output).map_err(Error::into_internal_error)
            })
        });
        ToolDef {
            name,
            description,
            input_schema: schema_value::<T::Input>(),
            output_schema: schema_value::<T::Output>(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wire-facing descriptor listed from `tools/list` and `mcp/connect`.
    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "outputSchema": self.output_schema,
        })
    }
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }))
}

/// An in-process MCP server: a named set of tools behind an `acp:` URL.
#[derive(Debug)]
pub struct ToolServer {
    acp_url: String,
    name: String,
    version: String,
    instructions: Option<String>,
    tools: Vec<ToolDef>,
}

impl ToolServer {
    pub fn builder(name: impl ToString) -> ToolServerBuilder {
        ToolServerBuilder {
            name: name.to_string(),
            version: "0.1.0".to_string(),
            instructions: None,
            tools: Vec::new(),
        }
    }

    pub fn acp_url(&self) -> &str {
        &self.acp_url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tool_descriptors(&self) -> Vec<Value> {
        self.tools.iter().map(ToolDef::descriptor).collect()
    }

    /// Dispatch one inner MCP method.
    ///
    /// Failures inside a tool are encoded as JSON-RPC errors here — the
    /// control handler forwards whatever this returns and never tears the
    /// conductor down over a tool fault.
    pub async fn handle_method(
        &self,
        method: &str,
        params: Option<Value>,
        cx: ToolContext,
    ) -> Result<Value, Error> {
        match method {
            "initialize" => {
                let mut result = json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": self.version },
                });
                if let Some(instructions) = &self.instructions {
                    result["instructions"] = json!(instructions);
                }
                Ok(result)
            }

            "tools/list" => Ok(json!({ "tools": self.tool_descriptors() })),

            "tools/call" => {
                let params = params.unwrap_or_else(|| json!({}));
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_params().with_data("tools/call needs a `name`"))?;
                let tool = self
                    .tools
                    .iter()
                    .find(|tool| tool.name == name)
                    .ok_or_else(|| {
                        Error::invalid_params().with_data(format!("unknown tool: {name}"))
                    })?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

                let output = (tool.handler)(arguments, cx).await.map_err(|err| {
                    if err.code == error::INVALID_PARAMS {
                        err
                    } else {
                        let mut wrapped = Error::new(error::INTERNAL_ERROR, err.message);
                        wrapped.data = err.data;
                        wrapped
                    }
                })?;

                let text = serde_json::to_string(&output).map_err(Error::into_internal_error)?;
                Ok(json!({ "content": [{ "type": "text", "text": text }] }))
            }

            _ => Err(Error::method_not_found().with_data(method.to_string())),
        }
    }
}

/// Builder for [`ToolServer`]. The `acp:` URL is minted at `build`.
pub struct ToolServerBuilder {
    name: String,
    version: String,
    instructions: Option<String>,
    tools: Vec<ToolDef>,
}

impl ToolServerBuilder {
    pub fn version(mut self, version: impl ToString) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn instructions(mut self, instructions: impl ToString) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }

    pub fn tool(mut self, tool: impl McpTool) -> Self {
        self.tools.push(ToolDef::from_tool(tool));
        self
    }

    pub fn tool_def(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> ToolServer {
        ToolServer {
            acp_url: format!("{ACP_URL_SCHEME}{}", Uuid::new_v4()),
            name: self.name,
            version: self.version,
            instructions: self.instructions,
            tools: self.tools,
        }
    }
}

/// Registry mapping `acp:` URLs to their tool servers.
#[derive(Debug, Clone, Default)]
pub struct ToolServerRegistry {
    by_url: FxHashMap<String, Arc<ToolServer>>,
}

impl ToolServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server under its minted URL, returning the shared handle.
    pub fn register(&mut self, server: ToolServer) -> Arc<ToolServer> {
        let server = Arc::new(server);
        self.by_url.insert(server.acp_url.clone(), server.clone());
        server
    }

    pub fn unregister(&mut self, acp_url: &str) -> Option<Arc<ToolServer>> {
        self.by_url.remove(acp_url)
    }

    pub fn get(&self, acp_url: &str) -> Option<Arc<ToolServer>> {
        self.by_url.get(acp_url).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }
}
