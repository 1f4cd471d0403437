//! The conductor core: pipeline wiring, the central ordered queue, and the
//! routing rules.
//!
//! ## Architecture
//!
//! The conductor manages a fixed pipeline `[client, proxy₁ … proxyₙ, agent]`.
//! Every component gets three cooperating pieces:
//!
//! * a transport driver (from its [`Connector`]) moving frames on the wire,
//! * an inbound *pump* that correlates responses against that peer's pending
//!   requests and feeds everything else into the central queue,
//! * a [`PeerLink`] held by the router for sending, carrying the peer's
//!   monotonic id allocator.
//!
//! The router task is the single consumer of the central queue; no frame
//! reaches an outbound channel except by being dequeued here. That one rule
//! gives the system-wide ordering guarantee: between any two adjacent
//! components, frames are delivered in the order they were sent. Responses
//! to forwarded requests re-enter the queue from the pump that received
//! them (in arrival order with that peer's other traffic) instead of being
//! written back directly.
//!
//! ## Direction and wrapping
//!
//! Forward traffic (client → agent) other than the `initialize` handshake is
//! wrapped in `_proxy/successor/request` / `_proxy/successor/notification`
//! envelopes on every hop that targets a proxy, and unwrapped on the final
//! hop to the agent. Envelopes emitted by a proxy pass to the next proxy
//! opaquely, with id rewriting only. Backward traffic (agent → client)
//! travels raw at every hop. A proxy therefore distinguishes direction
//! purely by shape: envelope frames move toward the agent, raw frames move
//! toward the client.

use std::pin::pin;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::future::{self, BoxFuture, Either};
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use fxhash::FxHashMap;
use serde_json::Value;

use baton::jsonrpc::{Id, Message, Request, Response};
use baton::protocol::{self, SuccessorPayload};
use baton::{Channel, Connector, Error, IoFuture, ToolServer, ToolServerRegistry};

use self::control::ControlHandler;
use self::session::SessionRegistry;

mod bridge;
mod control;
mod session;

/// Capacity of the central queue. Bounded so a flooding component
/// backpressures its own pump instead of growing without limit.
const QUEUE_CAPACITY: usize = 128;

/// How long shutdown waits for queued outbound frames to drain before the
/// transports are dropped.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A position in the pipeline, as seen from the conductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Client,
    Component(usize),
}

/// The conductor: a fixed pipeline of components between a client and an
/// agent, plus the tool servers it offers to sessions.
///
/// ```ignore
/// Conductor::new("conductor")
///     .with_component(ChildProcess::from_command_line("my-proxy")?)
///     .with_component(ChildProcess::from_command_line("my-agent")?)
///     .with_tool_server(ToolServer::builder("tools").tool(MyTool).build())
///     .run(Stdio)
///     .await
/// ```
pub struct Conductor {
    name: String,
    components: Vec<Box<dyn Connector>>,
    tool_servers: ToolServerRegistry,
}

impl Conductor {
    pub fn new(name: impl ToString) -> Self {
        Conductor {
            name: name.to_string(),
            components: Vec::new(),
            tool_servers: ToolServerRegistry::new(),
        }
    }

    /// Append a component. The last one added is the agent; everything
    /// before it is a proxy.
    pub fn with_component(mut self, component: impl Connector + 'static) -> Self {
        self.components.push(Box::new(component));
        self
    }

    /// Offer an in-process MCP tool server. Sessions reference it by its
    /// `acp:` URL in `session/new`.
    pub fn with_tool_server(mut self, server: ToolServer) -> Self {
        let server = self.tool_servers.register(server);
        tracing::debug!(acp_url = server.acp_url(), name = server.name(), "registered tool server");
        self
    }

    /// Run the pipeline against the given client transport until the client
    /// disconnects (clean) or a component faults (error).
    pub async fn run(self, client: impl Connector + 'static) -> Result<(), Error> {
        if self.components.is_empty() {
            return Err(Error::invalid_params().with_data("pipeline needs at least an agent component"));
        }

        let (conductor_tx, conductor_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut background_tasks: Vec<BoxFuture<'static, ()>> = Vec::new();

        let (channel, io) = Box::new(client).connect()?;
        attach_transport("client", io, &conductor_tx, &mut background_tasks);
        let client =
            PeerLink::attach(Endpoint::Client, "client", channel, &conductor_tx, &mut background_tasks);

        let component_count = self.components.len();
        let mut hops = Vec::with_capacity(component_count);
        for (index, component) in self.components.into_iter().enumerate() {
            let label = if index + 1 == component_count {
                "agent".to_string()
            } else {
                format!("proxy:{index}")
            };
            let (channel, io) = component.connect()?;
            attach_transport(&label, io, &conductor_tx, &mut background_tasks);
            hops.push(PeerLink::attach(
                Endpoint::Component(index),
                &label,
                channel,
                &conductor_tx,
                &mut background_tasks,
            ));
        }

        tracing::info!(
            name = %self.name,
            proxies = component_count - 1,
            has_tool_servers = !self.tool_servers.is_empty(),
            "pipeline connected"
        );

        let router = Router {
            client,
            hops,
            initialized: false,
            control: ControlHandler::new(self.tool_servers),
            sessions: SessionRegistry::default(),
            conductor_tx,
            tasks: FuturesUnordered::new(),
        };

        run_until_routed(future::join_all(background_tasks), router.run(conductor_rx)).await
    }
}

/// Turn a transport driver into a background task whose failure is reported
/// to the router instead of torn out from under it.
fn attach_transport(
    label: &str,
    io: IoFuture,
    conductor_tx: &mpsc::Sender<ConductorMessage>,
    background_tasks: &mut Vec<BoxFuture<'static, ()>>,
) {
    let label = label.to_string();
    let mut conductor_tx = conductor_tx.clone();
    background_tasks.push(Box::pin(async move {
        if let Err(error) = io.await {
            tracing::error!(peer = %label, %error, "transport failed");
            let _ = conductor_tx.send(ConductorMessage::Fault { error }).await;
        }
    }));
}

/// Race the transport/pump machinery against the router. Faults are routed
/// through the queue, so the router always decides the outcome; once it
/// finishes — cleanly on client EOF, or with the fault that tears the
/// pipeline down — its peer senders drop, and the still-running writers get
/// a short grace to drain queued frames (such as a final error response)
/// before everything is dropped.
async fn run_until_routed(
    background: impl std::future::Future<Output = Vec<()>>,
    router: impl std::future::Future<Output = Result<(), Error>>,
) -> Result<(), Error> {
    let background = pin!(background);
    let router = pin!(router);
    match future::select(background, router).await {
        Either::Left((_, router)) => router.await,
        Either::Right((router_result, background)) => {
            let _ = tokio::time::timeout(DRAIN_GRACE, background).await;
            router_result
        }
    }
}

/// Everything that flows through the central queue.
pub(crate) enum ConductorMessage {
    /// A request or notification arriving from a peer.
    Inbound { source: Endpoint, frame: Request },

    /// A response to a request the conductor forwarded, re-entering the
    /// queue so it stays ordered with the responding peer's other traffic.
    ForwardResponse {
        target: Endpoint,
        id: Id,
        session_key: Option<u64>,
        result: Result<Value, Error>,
    },

    /// A bridge listener opening its control connection.
    BridgeConnect {
        acp_url: String,
        connection_id: String,
        session_id: String,
        reply: oneshot::Sender<Result<Value, Error>>,
    },

    /// An MCP message from a bridge connection. `reply: None` for
    /// notifications.
    BridgeMessage {
        connection_id: String,
        method: String,
        params: Option<Value>,
        reply: Option<oneshot::Sender<Result<Value, Error>>>,
    },

    /// A bridge connection going away.
    BridgeDisconnect { connection_id: String },

    /// A transport or pump fault: fatal for the whole pipeline.
    Fault { error: Error },

    /// The client closed its channel: normal shutdown.
    ClientClosed,
}

/// What to do with a peer's response once it is correlated.
enum Waiter {
    /// Hand the result to an in-conductor waiter (handshake, bridge calls).
    Oneshot(oneshot::Sender<Result<Value, Error>>),

    /// Forward the result to `origin` under its original id, optionally
    /// publishing a session id on the way.
    Forward {
        origin: Endpoint,
        origin_id: Id,
        session_key: Option<u64>,
    },
}

/// The router's sending handle for one peer.
struct PeerLink {
    label: String,
    outgoing_tx: mpsc::UnboundedSender<Result<Message, Error>>,
    reply_tx: mpsc::UnboundedSender<(i64, Waiter)>,
    next_id: i64,
}

impl PeerLink {
    /// Wire a connected channel into the conductor: spawn its inbound pump
    /// and return the sending handle.
    fn attach(
        endpoint: Endpoint,
        label: impl ToString,
        channel: Channel,
        conductor_tx: &mpsc::Sender<ConductorMessage>,
        background_tasks: &mut Vec<BoxFuture<'static, ()>>,
    ) -> PeerLink {
        let label = label.to_string();
        let (reply_tx, reply_rx) = mpsc::unbounded();
        background_tasks.push(Box::pin(peer_pump(
            endpoint,
            label.clone(),
            channel.rx,
            reply_rx,
            conductor_tx.clone(),
        )));
        PeerLink {
            label,
            outgoing_tx: channel.tx,
            reply_tx,
            next_id: 1,
        }
    }

    fn closed_error(&self) -> Error {
        Error::internal_error().with_data(format!("{}: connection closed", self.label))
    }

    fn send_frame(&self, message: Message) -> Result<(), Error> {
        self.outgoing_tx
            .unbounded_send(Ok(message))
            .map_err(|_| self.closed_error())
    }

    /// Send a request under a fresh conductor-minted id, recording where the
    /// response should go.
    fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        waiter: Waiter,
    ) -> Result<(), Error> {
        let id = self.next_id;
        self.next_id += 1;
        self.reply_tx
            .unbounded_send((id, waiter))
            .map_err(|_| self.closed_error())?;
        self.send_frame(Message::Request(Request::new(Id::Number(id), method, params)))
    }

    /// Send a request and get a oneshot for its result.
    fn request_with_reply(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send_request(method, params, Waiter::Oneshot(tx))?;
        Ok(rx)
    }

    fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.send_frame(Message::Request(Request::notification(method, params)))
    }

    fn respond(&self, id: Id, result: Result<Value, Error>) -> Result<(), Error> {
        let response = match result {
            Ok(value) => Response::success(Some(id), value),
            Err(error) => Response::failure(Some(id), error),
        };
        self.send_frame(Message::Response(response))
    }

    /// An error response with no id, for faults that cannot be correlated
    /// to a request (e.g. a bad notification).
    fn send_error_notification(&self, error: Error) -> Result<(), Error> {
        self.send_frame(Message::Response(Response::failure(None, error)))
    }
}

/// Per-peer inbound pump: correlates responses against this peer's pending
/// requests and feeds requests/notifications into the central queue in
/// arrival order. Fatal conditions are reported to the router as
/// [`ConductorMessage::Fault`]; the pump itself always winds down quietly.
async fn peer_pump(
    endpoint: Endpoint,
    label: String,
    mut frames_rx: mpsc::UnboundedReceiver<Result<Message, Error>>,
    mut reply_rx: mpsc::UnboundedReceiver<(i64, Waiter)>,
    mut conductor_tx: mpsc::Sender<ConductorMessage>,
) {
    let mut pending: FxHashMap<i64, Waiter> = FxHashMap::default();

    enum PumpEvent {
        Subscription(Option<(i64, Waiter)>),
        Frame(Option<Result<Message, Error>>),
    }

    loop {
        // Biased toward subscriptions: the router enqueues the waiter before
        // the request ever reaches the peer, so draining `reply_rx` first
        // guarantees a response never races past its own registration.
        let event = futures::select_biased! {
            subscription = reply_rx.next() => PumpEvent::Subscription(subscription),
            frame = frames_rx.next() => PumpEvent::Frame(frame),
        };

        match event {
            PumpEvent::Subscription(Some((id, waiter))) => {
                pending.insert(id, waiter);
            }

            // Router gone: shutdown in progress.
            PumpEvent::Subscription(None) => return,

            PumpEvent::Frame(None) => {
                match endpoint {
                    Endpoint::Client => {
                        let _ = conductor_tx.send(ConductorMessage::ClientClosed).await;
                    }
                    Endpoint::Component(_) => {
                        tracing::error!(peer = %label, "component channel closed");
                        let error = Error::internal_error()
                            .with_data(format!("{label}: channel closed unexpectedly"));
                        let _ = conductor_tx.send(ConductorMessage::Fault { error }).await;
                    }
                }
                return;
            }

            // Malformed frame: fatal at the transport level.
            PumpEvent::Frame(Some(Err(error))) => {
                tracing::error!(peer = %label, %error, "malformed frame");
                let _ = conductor_tx.send(ConductorMessage::Fault { error }).await;
                return;
            }

            PumpEvent::Frame(Some(Ok(Message::Response(response)))) => {
                let id = match &response.id {
                    Some(Id::Number(n)) => *n,
                    other => {
                        tracing::warn!(peer = %label, id = ?other, "response with unknown id shape, dropping");
                        continue;
                    }
                };
                match pending.remove(&id) {
                    Some(Waiter::Oneshot(tx)) => {
                        let _ = tx.send(response.into_result());
                    }
                    Some(Waiter::Forward { origin, origin_id, session_key }) => {
                        if conductor_tx
                            .send(ConductorMessage::ForwardResponse {
                                target: origin,
                                id: origin_id,
                                session_key,
                                result: response.into_result(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        tracing::warn!(peer = %label, id, "response for unknown request id, dropping");
                    }
                }
            }

            PumpEvent::Frame(Some(Ok(Message::Request(request)))) => {
                if conductor_tx
                    .send(ConductorMessage::Inbound { source: endpoint, frame: request })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// The single consumer of the central queue.
struct Router {
    client: PeerLink,
    /// Proxies in order, agent last.
    hops: Vec<PeerLink>,
    initialized: bool,
    control: ControlHandler,
    sessions: SessionRegistry,
    conductor_tx: mpsc::Sender<ConductorMessage>,
    /// Router-driven background work: bridge listeners and in-flight tool
    /// invocations. Dropped wholesale on shutdown, which cancels every
    /// suspended waiter.
    tasks: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl Router {
    async fn run(mut self, mut rx: mpsc::Receiver<ConductorMessage>) -> Result<(), Error> {
        loop {
            // The select only picks the next event; handling happens below so
            // the router can borrow itself freely.
            let next = futures::select! {
                message = rx.next() => Some(message),
                _ = self.tasks.select_next_some() => None,
            };
            match next {
                None => {}
                Some(None) => return Ok(()),
                Some(Some(ConductorMessage::ClientClosed)) => {
                    tracing::info!("client disconnected, shutting down");
                    return Ok(());
                }
                Some(Some(ConductorMessage::Fault { error })) => {
                    tracing::error!(%error, "component fault, shutting the pipeline down");
                    return Err(error);
                }
                Some(Some(message)) => self.handle_message(message).await?,
            }
        }
    }

    async fn handle_message(&mut self, message: ConductorMessage) -> Result<(), Error> {
        match message {
            ConductorMessage::Inbound { source, frame } => self.handle_inbound(source, frame).await,

            ConductorMessage::ForwardResponse { target, id, session_key, result } => {
                if let Some(key) = session_key {
                    self.publish_session(key, &result);
                }
                self.respond_to(target, id, result)
            }

            ConductorMessage::BridgeConnect { acp_url, connection_id, session_id, reply } => {
                let result = self.control.connect(Some(connection_id), &acp_url, Some(session_id));
                let _ = reply.send(result);
                Ok(())
            }

            ConductorMessage::BridgeMessage { connection_id, method, params, reply } => {
                match self.control.dispatch(&connection_id, &method, params) {
                    Ok(invocation) => {
                        self.tasks.push(Box::pin(async move {
                            let result = invocation.await;
                            if let Some(reply) = reply {
                                let _ = reply.send(result);
                            }
                        }));
                    }
                    Err(error) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(error));
                        }
                    }
                }
                Ok(())
            }

            ConductorMessage::BridgeDisconnect { connection_id } => {
                self.control.disconnect(&connection_id);
                Ok(())
            }

            // Handled in the run loop.
            ConductorMessage::Fault { error } => Err(error),
            ConductorMessage::ClientClosed => Ok(()),
        }
    }

    fn peer(&self, endpoint: Endpoint) -> &PeerLink {
        match endpoint {
            Endpoint::Client => &self.client,
            Endpoint::Component(index) => &self.hops[index],
        }
    }

    fn agent_index(&self) -> usize {
        self.hops.len() - 1
    }

    /// Deliver a response, preserving the originator's id exactly.
    ///
    /// A failed send to the client is not a fault: its pump is about to
    /// deliver `ClientClosed` and the router exits cleanly.
    fn respond_to(&mut self, target: Endpoint, id: Id, result: Result<Value, Error>) -> Result<(), Error> {
        match self.peer(target).respond(id, result) {
            Ok(()) => Ok(()),
            Err(err) if target == Endpoint::Client => {
                tracing::debug!(%err, "dropping response to closed client");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Answer a bad frame: an error response when it had an id, an
    /// uncorrelated error notification otherwise.
    fn reject(&mut self, source: Endpoint, id: Option<Id>, error: Error) -> Result<(), Error> {
        tracing::debug!(peer = %self.peer(source).label, %error, "rejecting frame");
        match id {
            Some(id) => self.respond_to(source, id, Err(error)),
            None => self.peer(source).send_error_notification(error),
        }
    }

    async fn handle_inbound(&mut self, source: Endpoint, frame: Request) -> Result<(), Error> {
        tracing::debug!(
            peer = %self.peer(source).label,
            method = %frame.method,
            id = ?frame.id,
            "routing frame"
        );
        match source {
            Endpoint::Client => self.handle_client_frame(frame).await,
            Endpoint::Component(index) => self.handle_component_frame(index, frame).await,
        }
    }

    // ------------------------------------------------------------------
    // Client-originated traffic
    // ------------------------------------------------------------------

    async fn handle_client_frame(&mut self, frame: Request) -> Result<(), Error> {
        if protocol::is_control_method(&frame.method) {
            return self.handle_control_frame(frame);
        }

        if !self.initialized {
            return self.perform_handshake(frame).await;
        }

        self.forward_into_pipeline(frame).await
    }

    /// Drive `initialize` sequentially through the pipeline: each proxy is
    /// offered the successor-wrapping contract and must acknowledge it, then
    /// the agent receives the client's params untouched and its result is
    /// returned to the client.
    async fn perform_handshake(&mut self, frame: Request) -> Result<(), Error> {
        let Some(client_id) = frame.id.clone() else {
            tracing::warn!(method = %frame.method, "notification before initialize");
            return self
                .client
                .send_error_notification(Error::invalid_request().with_data("expected an `initialize` request"));
        };
        if frame.method != protocol::METHOD_INITIALIZE {
            return self.respond_to(
                Endpoint::Client,
                client_id,
                Err(Error::invalid_request().with_data("expected `initialize` as the first request")),
            );
        }

        let agent_index = self.agent_index();
        for index in 0..agent_index {
            let offered = protocol::offer_proxy(frame.params.clone());
            let label = self.hops[index].label.clone();
            tracing::debug!(peer = %label, "offering proxy contract");
            let outcome = match self.hops[index].request_with_reply(protocol::METHOD_INITIALIZE, Some(offered)) {
                Ok(reply) => reply.await,
                // The proxy is already gone; same disposition as a
                // disconnect while awaiting the reply.
                Err(_) => Err(oneshot::Canceled),
            };

            let failure = match outcome {
                Ok(Ok(result)) if protocol::accepts_proxy(&result) => None,
                Ok(Ok(_)) => Some(Error::new(
                    baton::error::INVALID_REQUEST,
                    format!("proxy handshake failed: {label} did not acknowledge `_meta.proxy`"),
                )),
                Ok(Err(error)) => Some(Error::new(
                    error.code,
                    format!("proxy handshake failed at {label}: {}", error.message),
                )),
                Err(_) => Some(Error::new(
                    baton::error::INTERNAL_ERROR,
                    format!("proxy handshake failed: {label} disconnected during initialize"),
                )),
            };

            if let Some(error) = failure {
                tracing::error!(peer = %label, %error, "initialize failed");
                self.respond_to(Endpoint::Client, client_id, Err(error.clone()))?;
                return Err(error);
            }
        }

        let outcome = match self.hops[agent_index].request_with_reply(protocol::METHOD_INITIALIZE, frame.params) {
            Ok(reply) => reply.await,
            Err(_) => Err(oneshot::Canceled),
        };
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let error = Error::internal_error().with_data("agent disconnected during initialize");
                self.respond_to(Endpoint::Client, client_id, Err(error.clone()))?;
                return Err(error);
            }
        };

        let accepted = result.is_ok();
        self.respond_to(Endpoint::Client, client_id, result)?;
        if accepted {
            self.initialized = true;
            tracing::info!(proxies = agent_index, "pipeline initialized");
        }
        Ok(())
    }

    /// Forward a client frame toward the agent: raw when the first hop is
    /// the agent, otherwise wrapped for the first proxy.
    async fn forward_into_pipeline(&mut self, frame: Request) -> Result<(), Error> {
        if self.hops.len() == 1 {
            return self.deliver_to_agent(Endpoint::Client, frame).await;
        }

        let Request { id, method, params, .. } = frame;
        let envelope = protocol::wrap_successor(&method, params);
        match id {
            Some(origin_id) => self.hops[0].send_request(
                protocol::METHOD_SUCCESSOR_REQUEST,
                Some(envelope),
                Waiter::Forward { origin: Endpoint::Client, origin_id, session_key: None },
            ),
            None => self.hops[0].send_notification(protocol::METHOD_SUCCESSOR_NOTIFICATION, Some(envelope)),
        }
    }

    // ------------------------------------------------------------------
    // Component-originated traffic
    // ------------------------------------------------------------------

    async fn handle_component_frame(&mut self, index: usize, frame: Request) -> Result<(), Error> {
        let agent_index = self.agent_index();

        if protocol::is_successor_method(&frame.method) {
            if index == agent_index {
                let id = frame.id.clone();
                return self.reject(
                    Endpoint::Component(index),
                    id,
                    Error::invalid_request().with_data("the terminal component has no successor"),
                );
            }

            // Envelope shape must match the frame kind.
            let is_request = frame.id.is_some();
            let expects_request = frame.method == protocol::METHOD_SUCCESSOR_REQUEST;
            if is_request != expects_request {
                let id = frame.id.clone();
                return self.reject(
                    Endpoint::Component(index),
                    id,
                    Error::invalid_request()
                        .with_data(format!("`{}` used with the wrong frame kind", frame.method)),
                );
            }

            let target = index + 1;
            if target == agent_index {
                // Unwrap before the agent.
                let payload: SuccessorPayload =
                    match serde_json::from_value(frame.params.clone().unwrap_or(Value::Null)) {
                        Ok(payload) => payload,
                        Err(err) => {
                            let id = frame.id.clone();
                            return self.reject(
                                Endpoint::Component(index),
                                id,
                                Error::invalid_params().with_data(format!("bad successor envelope: {err}")),
                            );
                        }
                    };
                let inner = Request {
                    jsonrpc: frame.jsonrpc,
                    id: frame.id,
                    method: payload.method,
                    params: payload.params,
                };
                return self.deliver_to_agent(Endpoint::Component(index), inner).await;
            }

            // Opaque pass-through between proxies: id rewriting only.
            return match frame.id {
                Some(origin_id) => self.hops[target].send_request(
                    protocol::METHOD_SUCCESSOR_REQUEST,
                    frame.params,
                    Waiter::Forward { origin: Endpoint::Component(index), origin_id, session_key: None },
                ),
                None => self.hops[target].send_notification(protocol::METHOD_SUCCESSOR_NOTIFICATION, frame.params),
            };
        }

        if protocol::is_control_method(&frame.method) {
            // `mcp/*` never crosses the pipeline in either direction.
            let id = frame.id.clone();
            return self.reject(
                Endpoint::Component(index),
                id,
                Error::invalid_request()
                    .with_data("mcp/* methods are only accepted on the client control channel"),
            );
        }

        // Raw frame: backward, toward the predecessor.
        let target = if index == 0 { Endpoint::Client } else { Endpoint::Component(index - 1) };
        let origin = Endpoint::Component(index);
        match target {
            Endpoint::Client => match frame.id {
                Some(origin_id) => self.client.send_request(
                    &frame.method,
                    frame.params,
                    Waiter::Forward { origin, origin_id, session_key: None },
                ),
                None => self.client.send_notification(&frame.method, frame.params),
            },
            Endpoint::Component(previous) => match frame.id {
                Some(origin_id) => self.hops[previous].send_request(
                    &frame.method,
                    frame.params,
                    Waiter::Forward { origin, origin_id, session_key: None },
                ),
                None => self.hops[previous].send_notification(&frame.method, frame.params),
            },
        }
    }

    /// The final forward hop: deliver a raw frame to the agent. `session/new`
    /// requests get their `acp:` servers bridged here, so nothing with an
    /// `acp:` URL is ever on the wire toward the agent.
    async fn deliver_to_agent(&mut self, origin: Endpoint, mut frame: Request) -> Result<(), Error> {
        let mut session_key = None;
        if frame.method == protocol::METHOD_SESSION_NEW && frame.id.is_some() {
            session_key = self.prepare_session_new(&mut frame).await?;
        }

        let agent_index = self.agent_index();
        match frame.id {
            Some(origin_id) => self.hops[agent_index].send_request(
                &frame.method,
                frame.params,
                Waiter::Forward { origin, origin_id, session_key },
            ),
            None => self.hops[agent_index].send_notification(&frame.method, frame.params),
        }
    }

    /// Rewrite every `acp:` MCP server in a `session/new` request into an
    /// ephemeral local HTTP listener, and register the listeners under a
    /// fresh session key awaiting the agent's session id.
    async fn prepare_session_new(&mut self, frame: &mut Request) -> Result<Option<u64>, Error> {
        let Some(params) = frame.params.as_mut() else { return Ok(None) };
        let Some(servers) = params.get_mut("mcpServers").and_then(Value::as_array_mut) else {
            return Ok(None);
        };

        let mut bound = Vec::new();
        for server in servers.iter_mut() {
            let Some(url) = server.get("url").and_then(Value::as_str) else { continue };
            if !url.starts_with(protocol::ACP_URL_SCHEME) {
                continue;
            }
            let acp_url = url.to_string();

            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(Error::into_internal_error)?;
            let port = listener.local_addr().map_err(Error::into_internal_error)?.port();
            let http_url = format!("http://127.0.0.1:{port}");
            tracing::info!(%acp_url, %http_url, "bridging MCP server over HTTP");

            if let Some(entry) = server.as_object_mut() {
                entry.insert("url".to_string(), Value::String(http_url.clone()));
                entry.insert("type".to_string(), Value::String("http".to_string()));
            }
            bound.push((acp_url, http_url, listener));
        }

        if bound.is_empty() {
            return Ok(None);
        }

        let key = self.sessions.allocate_key();
        for (acp_url, http_url, listener) in bound {
            let (session_tx, session_rx) = oneshot::channel();
            self.sessions.add_listener(key, &acp_url, &http_url, session_tx);
            let listener_future =
                bridge::run_listener(listener, acp_url.clone(), session_rx, self.conductor_tx.clone());
            self.tasks.push(Box::pin(async move {
                if let Err(error) = listener_future.await {
                    tracing::warn!(%acp_url, %error, "mcp bridge listener terminated");
                }
            }));
        }
        Ok(Some(key))
    }

    /// The agent's `session/new` response closes the pending listeners: a
    /// session id publishes, anything else cancels.
    fn publish_session(&mut self, key: u64, result: &Result<Value, Error>) {
        match result {
            Ok(value) => match value.get("sessionId").and_then(Value::as_str) {
                Some(session_id) => self.sessions.publish(key, session_id),
                None => self.sessions.cancel(
                    key,
                    Error::internal_error().with_data("session/new response carried no sessionId"),
                ),
            },
            Err(error) => self.sessions.cancel(key, error.clone()),
        }
    }

    // ------------------------------------------------------------------
    // The control channel
    // ------------------------------------------------------------------

    /// Service `mcp/*` from the client. These frames are consumed here —
    /// never forwarded — and the underscore-prefixed spelling is rejected.
    fn handle_control_frame(&mut self, frame: Request) -> Result<(), Error> {
        let Request { id, method, params, .. } = frame;

        if let Some(canonical) = method.strip_prefix('_') {
            return self.reject(
                Endpoint::Client,
                id,
                Error::invalid_request()
                    .with_data(format!("unsupported method `{method}`; use `{canonical}`")),
            );
        }

        match method.as_str() {
            protocol::METHOD_MCP_CONNECT => {
                let Some(id) = id else {
                    return self.client.send_error_notification(
                        Error::invalid_request().with_data("mcp/connect must be a request"),
                    );
                };
                let result = match parse_params::<protocol::McpConnectParams>(params) {
                    Ok(connect) => match connect.acp_url {
                        Some(url) => self.control.connect(connect.connection_id, &url, None),
                        None => Err(Error::invalid_params().with_data("mcp/connect needs an `acp_url`")),
                    },
                    Err(error) => Err(error),
                };
                self.respond_to(Endpoint::Client, id, result)
            }

            protocol::METHOD_MCP_MESSAGE => {
                let message = match parse_params::<protocol::McpMessageParams>(params) {
                    Ok(message) => message,
                    Err(error) => return self.reject(Endpoint::Client, id, error),
                };
                match self.control.dispatch(&message.connection_id, &message.method, message.params) {
                    Ok(invocation) => {
                        match id {
                            Some(id) => {
                                // Respond with the raw MCP result, routed back
                                // through the queue for ordering.
                                let mut conductor_tx = self.conductor_tx.clone();
                                self.tasks.push(Box::pin(async move {
                                    let result = invocation.await;
                                    let _ = conductor_tx
                                        .send(ConductorMessage::ForwardResponse {
                                            target: Endpoint::Client,
                                            id,
                                            session_key: None,
                                            result,
                                        })
                                        .await;
                                }));
                            }
                            None => {
                                self.tasks.push(Box::pin(async move {
                                    let _ = invocation.await;
                                }));
                            }
                        }
                        Ok(())
                    }
                    Err(error) => self.reject(Endpoint::Client, id, error),
                }
            }

            protocol::METHOD_MCP_DISCONNECT => {
                match parse_params::<protocol::McpDisconnectParams>(params) {
                    Ok(disconnect) => {
                        self.control.disconnect(&disconnect.connection_id);
                        // Documented as a notification; answer a stray id
                        // anyway rather than leaving it pending.
                        match id {
                            Some(id) => self.respond_to(Endpoint::Client, id, Ok(Value::Null)),
                            None => Ok(()),
                        }
                    }
                    Err(error) => self.reject(Endpoint::Client, id, error),
                }
            }

            other => self.reject(
                Endpoint::Client,
                id,
                Error::method_not_found().with_data(other.to_string()),
            ),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, Error> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|err| Error::invalid_params().with_data(err.to_string()))
}
