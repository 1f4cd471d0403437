//! Shared harness for conductor integration tests: in-process endpoints and
//! scripted components wired over duplex channels.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use baton::jsonrpc::{Id, Message, Request, Response};
use baton::{Channel, Error, McpTool, ToolContext, ToolServer};
use baton_conductor::Conductor;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{json, Value};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A test-side endpoint: the far end of a duplex channel handed to the
/// conductor as a connector.
pub struct TestEndpoint {
    tx: mpsc::UnboundedSender<Result<Message, Error>>,
    rx: mpsc::UnboundedReceiver<Result<Message, Error>>,
    next_id: i64,
}

/// Create a connector for the conductor plus the test's end of it.
pub fn endpoint() -> (Channel, TestEndpoint) {
    let (near, far) = Channel::duplex();
    (
        near,
        TestEndpoint {
            tx: far.tx,
            rx: far.rx,
            next_id: 1,
        },
    )
}

impl TestEndpoint {
    pub fn send_request(&mut self, method: &str, params: Value) -> Id {
        let id = Id::Number(self.next_id);
        self.next_id += 1;
        self.send_request_with_id(id.clone(), method, Some(params));
        id
    }

    pub fn send_request_with_id(&self, id: Id, method: &str, params: Option<Value>) {
        self.send(Message::Request(Request::new(id, method, params)));
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) {
        self.send(Message::Request(Request::notification(method, params)));
    }

    pub fn respond_ok(&self, id: Id, result: Value) {
        self.send(Message::Response(Response::success(Some(id), result)));
    }

    pub fn respond_err(&self, id: Id, error: Error) {
        self.send(Message::Response(Response::failure(Some(id), error)));
    }

    pub fn send(&self, message: Message) {
        self.tx.unbounded_send(Ok(message)).expect("conductor channel open");
    }

    /// Push a frame the transport would have flagged as malformed.
    pub fn send_malformed(&self, error: Error) {
        self.tx.unbounded_send(Err(error)).expect("conductor channel open");
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed while waiting for a frame")
            .expect("unexpected transport error")
    }

    pub async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    pub async fn recv_response(&mut self) -> Response {
        match self.recv().await {
            Message::Response(response) => response,
            other => panic!("expected response, got {other:?}"),
        }
    }

    /// Wait for the conductor to close this channel.
    pub async fn expect_closed(&mut self) {
        loop {
            match tokio::time::timeout(TIMEOUT, self.rx.next()).await {
                Ok(None) => return,
                Ok(Some(_)) => continue,
                Err(_) => panic!("channel did not close"),
            }
        }
    }
}

/// Start a conductor against an in-process client endpoint.
pub fn start(
    conductor: Conductor,
) -> (TestEndpoint, tokio::task::JoinHandle<Result<(), Error>>) {
    let (client_channel, client) = endpoint();
    let handle = tokio::spawn(conductor.run(client_channel));
    (client, handle)
}

/// Run the client side of the initialize handshake and assert it succeeds.
pub async fn initialize(client: &mut TestEndpoint) -> Value {
    let id = client.send_request("initialize", json!({}));
    let response = client.recv_response().await;
    assert_eq!(response.id, Some(id));
    response.into_result().expect("initialize should succeed")
}

/// A scripted agent: records every inbound request/notification, answers
/// `initialize` with `{}`, `session/new` with a fixed session id, and echoes
/// the params of anything else.
pub fn spawn_echo_agent() -> (Channel, Arc<Mutex<Vec<Request>>>) {
    let (near, far) = Channel::duplex();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    tokio::spawn(async move {
        let mut rx = far.rx;
        let tx = far.tx;
        while let Some(Ok(message)) = rx.next().await {
            let Message::Request(request) = message else { continue };
            seen.lock().unwrap().push(request.clone());
            let Some(id) = request.id else { continue };
            let result = match request.method.as_str() {
                "initialize" => json!({}),
                "session/new" => json!({ "sessionId": "sess-A" }),
                _ => request.params.unwrap_or_else(|| json!({})),
            };
            let _ = tx.unbounded_send(Ok(Message::Response(Response::success(Some(id), result))));
        }
    });
    (near, log)
}

/// A scripted proxy that plays the successor-wrapping protocol: it
/// acknowledges the handshake and relays every other frame onward under its
/// own ids, mapping responses back.
pub fn spawn_passthrough_proxy() -> (Channel, Arc<Mutex<Vec<Request>>>) {
    let (near, far) = Channel::duplex();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    tokio::spawn(async move {
        let mut rx = far.rx;
        let tx = far.tx;
        let mut next_id: i64 = 1;
        // my relayed id -> the id of the frame being relayed
        let mut relays: HashMap<i64, Id> = HashMap::new();
        while let Some(Ok(message)) = rx.next().await {
            match message {
                Message::Request(request) => {
                    seen.lock().unwrap().push(request.clone());
                    if request.method == "initialize" {
                        let id = request.id.expect("initialize is a request");
                        let _ = tx.unbounded_send(Ok(Message::Response(Response::success(
                            Some(id),
                            json!({ "_meta": { "proxy": true } }),
                        ))));
                        continue;
                    }
                    match request.id {
                        Some(their_id) => {
                            let my_id = next_id;
                            next_id += 1;
                            relays.insert(my_id, their_id);
                            let _ = tx.unbounded_send(Ok(Message::Request(Request::new(
                                Id::Number(my_id),
                                &request.method,
                                request.params,
                            ))));
                        }
                        None => {
                            let _ = tx.unbounded_send(Ok(Message::Request(Request::notification(
                                &request.method,
                                request.params,
                            ))));
                        }
                    }
                }
                Message::Response(response) => {
                    let Some(Id::Number(my_id)) = response.id else { continue };
                    let Some(their_id) = relays.remove(&my_id) else { continue };
                    let _ = tx.unbounded_send(Ok(Message::Response(Response {
                        id: Some(their_id),
                        ..response
                    })));
                }
            }
        }
    });
    (near, log)
}

/// A proxy that answers `initialize` without acknowledging the proxy
/// contract.
pub fn spawn_rejecting_proxy() -> (Channel, Arc<Mutex<Vec<Request>>>) {
    let (near, far) = Channel::duplex();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    tokio::spawn(async move {
        let mut rx = far.rx;
        let tx = far.tx;
        while let Some(Ok(message)) = rx.next().await {
            let Message::Request(request) = message else { continue };
            seen.lock().unwrap().push(request.clone());
            if let Some(id) = request.id {
                let _ = tx.unbounded_send(Ok(Message::Response(Response::success(Some(id), json!({})))));
            }
        }
    });
    (near, log)
}

/// Extract the inner method of a `_proxy/successor/*` envelope.
pub fn envelope_method(request: &Request) -> &str {
    request
        .params
        .as_ref()
        .and_then(|params| params.get("method"))
        .and_then(Value::as_str)
        .expect("successor envelope carries a method")
}

pub struct EchoTool;

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

/// A tool server named `s` exposing the echo tool.
pub fn echo_tool_server() -> ToolServer {
    ToolServer::builder("s").version("1.0.0").tool(EchoTool).build()
}
