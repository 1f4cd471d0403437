//! The MCP HTTP bridge: ephemeral local listeners translating strict
//! MCP-over-HTTP (one POSTed JSON-RPC message per request) into
//! control-channel calls against the in-process tool servers.
//!
//! Each `acp:` server in a `session/new` gets one listener and one logical
//! MCP connection. A per-listener actor serializes the traffic: it parks
//! until the agent's session id is published, opens the control connection,
//! then services posts strictly one at a time — later posts queue behind the
//! in-flight one.

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use futures_concurrency::future::Race;
use tokio::net::TcpListener;
use uuid::Uuid;

use baton::jsonrpc::{Message, Response};
use baton::Error;

use super::ConductorMessage;

/// Run one bridge listener until the conductor tears it down.
pub(crate) async fn run_listener(
    listener: TcpListener,
    acp_url: String,
    session_rx: oneshot::Receiver<Result<String, Error>>,
    conductor_tx: mpsc::Sender<ConductorMessage>,
) -> Result<(), Error> {
    let (post_tx, post_rx) = mpsc::channel(16);
    let app = axum::Router::new()
        .route("/", post(handle_post).options(handle_preflight))
        .with_state(BridgeState { post_tx });

    let serve = async move {
        axum::serve(listener, app)
            .await
            .map_err(Error::into_internal_error)
    };
    let actor = connection_actor(acp_url, session_rx, post_rx, conductor_tx);

    (serve, actor).race().await
}

#[derive(Clone)]
struct BridgeState {
    post_tx: mpsc::Sender<PostedMessage>,
}

struct PostedMessage {
    message: Message,
    reply: oneshot::Sender<HttpReply>,
}

enum HttpReply {
    /// 200 with the JSON-RPC response body.
    Json(Response),
    /// 202, empty body (notifications).
    Accepted,
    /// 5xx: the bridge connection is poisoned or the conductor is gone.
    Failed(Error),
}

/// Malformed HTTP bodies answer 400.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct BridgeError(#[from] Error);

impl IntoResponse for BridgeError {
    fn into_response(self) -> HttpResponse {
        with_cors((StatusCode::BAD_REQUEST, format!("Error: {}", self.0)).into_response())
    }
}

fn with_cors(mut response: HttpResponse) -> HttpResponse {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

/// CORS preflight.
async fn handle_preflight() -> HttpResponse {
    with_cors(StatusCode::NO_CONTENT.into_response())
}

/// Accept one JSON-RPC message per POST and relay it to the connection
/// actor. Requests block until the actor produces the response; everything
/// else is acknowledged with 202.
async fn handle_post(State(state): State<BridgeState>, body: String) -> Result<HttpResponse, BridgeError> {
    let message = Message::from_line(&body)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let mut post_tx = state.post_tx.clone();
    if post_tx
        .send(PostedMessage { message, reply: reply_tx })
        .await
        .is_err()
    {
        return Ok(with_cors(
            (StatusCode::BAD_GATEWAY, "bridge connection closed").into_response(),
        ));
    }

    let response = match reply_rx.await {
        Ok(HttpReply::Json(response)) => (StatusCode::OK, axum::Json(response)).into_response(),
        Ok(HttpReply::Accepted) => StatusCode::ACCEPTED.into_response(),
        Ok(HttpReply::Failed(error)) => {
            (StatusCode::BAD_GATEWAY, format!("Error: {error}")).into_response()
        }
        Err(_) => (StatusCode::BAD_GATEWAY, "bridge connection closed").into_response(),
    };
    Ok(with_cors(response))
}

/// The per-listener connection actor.
async fn connection_actor(
    acp_url: String,
    session_rx: oneshot::Receiver<Result<String, Error>>,
    mut post_rx: mpsc::Receiver<PostedMessage>,
    mut conductor_tx: mpsc::Sender<ConductorMessage>,
) -> Result<(), Error> {
    // Park until the agent's session/new response publishes the session id.
    // Posts arriving early queue in `post_rx` and complete afterwards.
    let session_id = match session_rx.await {
        Ok(Ok(session_id)) => session_id,
        Ok(Err(error)) => return serve_poisoned(error, post_rx).await,
        Err(_) => {
            return Err(Error::internal_error().with_data("conductor shut down before session id publication"))
        }
    };

    // The connection opens implicitly, before the first message is served.
    let connection_id = Uuid::new_v4().to_string();
    let (reply_tx, reply_rx) = oneshot::channel();
    if conductor_tx
        .send(ConductorMessage::BridgeConnect {
            acp_url: acp_url.clone(),
            connection_id: connection_id.clone(),
            session_id: session_id.clone(),
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return Ok(());
    }
    match reply_rx.await {
        Ok(Ok(info)) => {
            tracing::debug!(
                %acp_url,
                %connection_id,
                %session_id,
                server = ?info.get("serverInfo"),
                "bridge connection established"
            );
        }
        Ok(Err(error)) => return serve_poisoned(error, post_rx).await,
        Err(_) => return Ok(()),
    }

    // One in-flight request at a time; `post_rx` holds the queue.
    while let Some(PostedMessage { message, reply }) = post_rx.next().await {
        match message {
            Message::Request(request) if request.id.is_some() => {
                let (result_tx, result_rx) = oneshot::channel();
                if conductor_tx
                    .send(ConductorMessage::BridgeMessage {
                        connection_id: connection_id.clone(),
                        method: request.method.clone(),
                        params: request.params.clone(),
                        reply: Some(result_tx),
                    })
                    .await
                    .is_err()
                {
                    let _ = reply.send(HttpReply::Failed(conductor_gone()));
                    return Ok(());
                }
                let result = match result_rx.await {
                    Ok(result) => result,
                    Err(_) => {
                        let _ = reply.send(HttpReply::Failed(conductor_gone()));
                        return Ok(());
                    }
                };
                let response = match result {
                    Ok(value) => Response::success(request.id, value),
                    Err(error) => Response::failure(request.id, error),
                };
                let _ = reply.send(HttpReply::Json(response));
            }

            Message::Request(notification) => {
                if conductor_tx
                    .send(ConductorMessage::BridgeMessage {
                        connection_id: connection_id.clone(),
                        method: notification.method.clone(),
                        params: notification.params.clone(),
                        reply: None,
                    })
                    .await
                    .is_err()
                {
                    let _ = reply.send(HttpReply::Failed(conductor_gone()));
                    return Ok(());
                }
                let _ = reply.send(HttpReply::Accepted);
            }

            // Client-posted responses have no routing target here;
            // acknowledge and drop.
            Message::Response(_) => {
                let _ = reply.send(HttpReply::Accepted);
            }
        }
    }

    let _ = conductor_tx
        .send(ConductorMessage::BridgeDisconnect { connection_id })
        .await;
    Ok(())
}

/// The session failed or the connection could not open: keep the listener
/// alive, answering every post with the poisoning error.
async fn serve_poisoned(error: Error, mut post_rx: mpsc::Receiver<PostedMessage>) -> Result<(), Error> {
    tracing::debug!(%error, "bridge listener poisoned");
    while let Some(PostedMessage { reply, .. }) = post_rx.next().await {
        let _ = reply.send(HttpReply::Failed(error.clone()));
    }
    Ok(())
}

fn conductor_gone() -> Error {
    Error::internal_error().with_data("conductor shut down")
}
