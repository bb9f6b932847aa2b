//! Console and live-stats relay between a client socket and the owning node.
//!
//! After authorization the relay opens one socket to the node, sends a single `auth`
//! frame with the node's api key and then forwards frames unmodified both ways. When
//! either side closes, the other side is closed too. A node-side failure produces one
//! diagnostic frame for the client and then a close; the client decides whether to
//! reconnect.

use std::borrow::Cow;

use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use skyport_model::{Instance, NodeRef};
use tokio_tungstenite::tungstenite::{
    Message as NodeMessage,
    protocol::{CloseFrame as NodeCloseFrame, frame::coding::CloseCode},
};
use tracing::Instrument;

use crate::{
    auth::AuthUser,
    error::ControlError,
    node_client::ws_url,
    state::AppState,
};

pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_NOT_FOUND: u16 = 4404;
pub const CLOSE_SUSPENDED: u16 = 4423;
pub const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Stats,
}

impl StreamKind {
    pub fn node_path(self, instance: &Instance) -> String {
        match self {
            Self::Console => format!("/exec/{}", instance.container_id),
            Self::Stats => format!("/stats/{}/{}", instance.container_id, instance.volume_id),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Stats => "stats",
        }
    }
}

pub fn auth_frame(api_key: &str) -> String {
    serde_json::json!({ "event": "auth", "args": [api_key] }).to_string()
}

fn diagnostic_frame(detail: &str) -> String {
    serde_json::json!({
        "event": "error",
        "args": [format!("node stream unavailable: {detail}. Reconnect to try again.")]
    })
    .to_string()
}

fn close_reason(err: &ControlError) -> (u16, &'static str) {
    match err {
        ControlError::Unauthorized => (CLOSE_UNAUTHORIZED, "unauthorized"),
        ControlError::Forbidden => (CLOSE_FORBIDDEN, "forbidden"),
        ControlError::NotFound(_) => (CLOSE_NOT_FOUND, "instance not found"),
        ControlError::Suspended => (CLOSE_SUSPENDED, "instance suspended"),
        _ => (CLOSE_INTERNAL, "internal error"),
    }
}

fn client_close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

fn to_node(msg: Message) -> NodeMessage {
    match msg {
        Message::Text(t) => NodeMessage::Text(t.into()),
        Message::Binary(b) => NodeMessage::Binary(b.into()),
        Message::Ping(b) => NodeMessage::Ping(b.into()),
        Message::Pong(b) => NodeMessage::Pong(b.into()),
        Message::Close(frame) => NodeMessage::Close(frame.map(|f| NodeCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into_owned().into(),
        })),
    }
}

fn to_client(msg: NodeMessage) -> Option<Message> {
    match msg {
        NodeMessage::Text(t) => Some(Message::Text(t.as_str().to_string())),
        NodeMessage::Binary(b) => Some(Message::Binary(b.to_vec())),
        NodeMessage::Ping(b) => Some(Message::Ping(b.to_vec())),
        NodeMessage::Pong(b) => Some(Message::Pong(b.to_vec())),
        NodeMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: Cow::Owned(f.reason.as_str().to_string()),
        }))),
        NodeMessage::Frame(_) => None,
    }
}

pub async fn console_ws(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    user: Option<AuthUser>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, instance_id, user, ws, StreamKind::Console)
}

pub async fn stats_ws(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    user: Option<AuthUser>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, instance_id, user, ws, StreamKind::Stats)
}

fn upgrade(
    state: AppState,
    instance_id: String,
    user: Option<AuthUser>,
    ws: WebSocketUpgrade,
    kind: StreamKind,
) -> Response {
    let span = tracing::info_span!("relay", kind = kind.as_str(), instance = %instance_id);
    ws.on_upgrade(move |socket| {
        async move {
            match authorize(&state, user, &instance_id).await {
                Ok((instance, node)) => bridge(socket, &instance, &node, kind).await,
                Err(err) => {
                    let (code, reason) = close_reason(&err);
                    tracing::info!(code, reason, "relay refused");
                    let mut socket = socket;
                    let _ = socket.send(client_close(code, reason)).await;
                }
            }
        }
        .instrument(span)
    })
}

async fn authorize(
    state: &AppState,
    user: Option<AuthUser>,
    instance_id: &str,
) -> Result<(Instance, NodeRef), ControlError> {
    let auth = user.ok_or(ControlError::Unauthorized)?;
    let user = state.current_user(&auth).await?;
    let instance = state.guard.authorize_active(&user, instance_id).await?;

    // Prefer the node's current key over the deploy-time snapshot.
    let node = match state.registry.get_node(&instance.node.id).await? {
        Some(node) if node.api_key.as_deref().is_some_and(|k| !k.is_empty()) => node.connection(),
        _ => instance.node.clone(),
    };
    Ok((instance, node))
}

async fn fail_client(client: &mut futures_util::stream::SplitSink<WebSocket, Message>, detail: &str) {
    let _ = client.send(Message::Text(diagnostic_frame(detail))).await;
    let _ = client
        .send(client_close(CLOSE_INTERNAL, "node stream unavailable"))
        .await;
}

async fn bridge(client: WebSocket, instance: &Instance, node: &NodeRef, kind: StreamKind) {
    let (mut client_tx, mut client_rx) = client.split();

    let url = ws_url(node, &kind.node_path(instance));
    let upstream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            tracing::warn!(%url, error = %err, "node stream connect failed");
            fail_client(&mut client_tx, &err.to_string()).await;
            return;
        }
    };
    let (mut node_tx, mut node_rx) = upstream.split();

    if let Err(err) = node_tx
        .send(NodeMessage::Text(auth_frame(&node.api_key).into()))
        .await
    {
        tracing::warn!(error = %err, "node stream auth failed");
        fail_client(&mut client_tx, &err.to_string()).await;
        return;
    }
    tracing::debug!(%url, "relay established");

    loop {
        tokio::select! {
            incoming = client_rx.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    let _ = node_tx.send(to_node(Message::Close(frame))).await;
                    break;
                }
                Some(Ok(msg)) => {
                    if let Err(err) = node_tx.send(to_node(msg)).await {
                        tracing::warn!(error = %err, "node stream write failed");
                        fail_client(&mut client_tx, &err.to_string()).await;
                        break;
                    }
                }
                Some(Err(_)) | None => {
                    let _ = node_tx.send(NodeMessage::Close(None)).await;
                    break;
                }
            },
            outgoing = node_rx.next() => match outgoing {
                Some(Ok(NodeMessage::Close(frame))) => {
                    let _ = client_tx.send(to_client(NodeMessage::Close(frame)).unwrap_or(Message::Close(None))).await;
                    break;
                }
                Some(Ok(msg)) => {
                    let Some(msg) = to_client(msg) else { continue };
                    if client_tx.send(msg).await.is_err() {
                        let _ = node_tx.send(NodeMessage::Close(None)).await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "node stream error");
                    fail_client(&mut client_tx, &err.to_string()).await;
                    break;
                }
                None => {
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    tracing::debug!("relay closed");
}
