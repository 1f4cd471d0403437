//! # baton
//!
//! Core plumbing for the baton protocol conductor: the JSON-RPC 2.0 frame
//! model, the connector contract for attaching components over byte streams
//! or child processes, the reserved extension-method vocabulary
//! (`_proxy/successor/*` envelopes, `mcp/*` control methods), and in-process
//! MCP tool servers.
//!
//! The conductor itself lives in the `baton-conductor` crate; this crate is
//! the shared substrate for it and for anything that wants to speak to it —
//! test harnesses, embedders wiring components over in-process channels, or
//! custom components.
//!
//! ## Design notes
//!
//! Forwarded payloads are opaque [`serde_json::Value`]s throughout. Only the
//! fields the conductor routes on — `method`, `id`, `params._meta.proxy`,
//! `params.mcpServers[*].url`, `result.sessionId` — are ever inspected;
//! everything else round-trips untouched.

pub mod connector;
pub mod error;
pub mod jsonrpc;
pub mod process;
pub mod protocol;
pub mod tool_server;
pub mod transport;

pub use connector::{Channel, Connector, IoFuture};
pub use error::Error;
pub use jsonrpc::{Id, Message, Request, Response};
pub use process::ChildProcess;
pub use tool_server::{McpTool, ToolContext, ToolDef, ToolServer, ToolServerBuilder, ToolServerRegistry};
pub use transport::{ByteStreams, Stdio};
