//! MCP-over-control servicing: the conductor-side connection table for
//! in-process tool servers.
//!
//! Connections arrive from two directions — the client driving `mcp/*`
//! methods directly, and bridge listeners opening connections on behalf of
//! the agent's HTTP traffic. Both end up here; the table is only ever
//! touched from the router task.

use std::sync::Arc;

use futures::future::BoxFuture;
use fxhash::FxHashMap;
use serde_json::{json, Value};
use uuid::Uuid;

use baton::error::{self, Error};
use baton::{ToolContext, ToolServer, ToolServerRegistry};

pub(crate) struct ControlHandler {
    registry: ToolServerRegistry,
    connections: FxHashMap<String, ControlConnection>,
}

struct ControlConnection {
    server: Arc<ToolServer>,
    session_id: Option<String>,
}

impl ControlHandler {
    pub(crate) fn new(registry: ToolServerRegistry) -> Self {
        ControlHandler {
            registry,
            connections: FxHashMap::default(),
        }
    }

    /// `mcp/connect`: look the server up by URL, record the connection, and
    /// describe the server.
    pub(crate) fn connect(
        &mut self,
        connection_id: Option<String>,
        acp_url: &str,
        session_id: Option<String>,
    ) -> Result<Value, Error> {
        let Some(server) = self.registry.get(acp_url) else {
            return Err(Error::new(
                error::INVALID_PARAMS,
                format!("No MCP server registered for URL {acp_url}"),
            ));
        };

        let connection_id = connection_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::debug!(%connection_id, %acp_url, session_id = ?session_id, "mcp connection opened");

        let description = json!({
            "connectionId": connection_id,
            "serverInfo": { "name": server.name(), "version": server.version() },
            "capabilities": { "tools": {} },
            "tools": server.tool_descriptors(),
        });
        self.connections
            .insert(connection_id, ControlConnection { server, session_id });
        Ok(description)
    }

    /// `mcp/message`: resolve the connection and produce the invocation
    /// future. Resolution is synchronous so an unknown connection errors
    /// immediately; the invocation itself runs on the router's task set.
    pub(crate) fn dispatch(
        &self,
        connection_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<BoxFuture<'static, Result<Value, Error>>, Error> {
        let Some(connection) = self.connections.get(connection_id) else {
            return Err(Error::new(
                error::INVALID_REQUEST,
                format!("unknown connection id: {connection_id}"),
            ));
        };

        let cx = ToolContext {
            session_id: connection.session_id.clone(),
            connection_id: connection_id.to_string(),
        };
        let server = connection.server.clone();
        let method = method.to_string();
        Ok(Box::pin(async move {
            server.handle_method(&method, params, cx).await
        }))
    }

    /// `mcp/disconnect`: drop the connection. Unknown ids are ignored.
    pub(crate) fn disconnect(&mut self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            tracing::debug!(%connection_id, "mcp connection closed");
        } else {
            tracing::debug!(%connection_id, "mcp/disconnect for unknown connection");
        }
    }
}
