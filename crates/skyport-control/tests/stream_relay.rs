//! Console and stats relays, end to end over real sockets.

mod common;

use std::{net::SocketAddr, time::Duration};

use common::{FakeNode, app_state, instance, seed_user, token_for};
use futures_util::{SinkExt, StreamExt};
use skyport_control::{api::router, relay, state::AppState};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message, client::IntoClientRequest},
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, path: &str, token: Option<&str>) -> Client {
    let mut req = format!("ws://{addr}{path}").into_client_request().unwrap();
    if let Some(token) = token {
        req.headers_mut()
            .insert("authorization", format!("Bearer {token}").parse().unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    ws
}

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("relay went silent")
        .expect("stream ended")
        .expect("socket error")
}

fn close_code(msg: &Message) -> Option<u16> {
    match msg {
        Message::Close(Some(frame)) => Some(u16::from(frame.code)),
        _ => None,
    }
}

#[tokio::test]
async fn console_frames_flow_both_ways() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let state = app_state(&node, dir.path()).await;
    seed_user(&state, "u1", false).await;
    state.registry.put_instance(&instance(&node, "c1", "u1")).await.unwrap();
    let addr = serve(state).await;

    let mut ws = connect(addr, "/ws/instances/c1/console", Some(&token_for("u1", false))).await;
    ws.send(Message::Text("say hello".into())).await.unwrap();

    let reply = next_message(&mut ws).await;
    assert_eq!(reply.into_text().unwrap().as_str(), "out:say hello");

    let auth_frames = node.state.ws_auth_frames.lock().unwrap().clone();
    assert_eq!(auth_frames.len(), 1);
    let auth: serde_json::Value = serde_json::from_str(&auth_frames[0]).unwrap();
    assert_eq!(auth, serde_json::json!({ "event": "auth", "args": [common::NODE_API_KEY] }));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn stats_stream_closes_when_the_node_does() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let state = app_state(&node, dir.path()).await;
    state.registry.put_instance(&instance(&node, "c2", "u1")).await.unwrap();
    let addr = serve(state).await;

    let mut ws = connect(addr, "/ws/instances/c2/stats", Some(&token_for("root", true))).await;

    let stats: serde_json::Value =
        serde_json::from_str(next_message(&mut ws).await.into_text().unwrap().as_str()).unwrap();
    assert_eq!(stats["event"], "stats");
    assert!(matches!(next_message(&mut ws).await, Message::Close(_)));
}

#[tokio::test]
async fn unauthorized_and_forbidden_clients_are_closed() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let state = app_state(&node, dir.path()).await;
    seed_user(&state, "u2", false).await;
    state.registry.put_instance(&instance(&node, "c3", "u1")).await.unwrap();
    let addr = serve(state).await;

    let mut anonymous = connect(addr, "/ws/instances/c3/console", None).await;
    assert_eq!(
        close_code(&next_message(&mut anonymous).await),
        Some(relay::CLOSE_UNAUTHORIZED)
    );

    let mut stranger = connect(addr, "/ws/instances/c3/console", Some(&token_for("u2", false))).await;
    assert_eq!(
        close_code(&next_message(&mut stranger).await),
        Some(relay::CLOSE_FORBIDDEN)
    );

    assert!(node.state.ws_auth_frames.lock().unwrap().is_empty());
}

#[tokio::test]
async fn suspended_instances_refuse_owner_streams() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let state = app_state(&node, dir.path()).await;
    seed_user(&state, "u1", false).await;
    let mut inst = instance(&node, "c4", "u1");
    inst.suspended = Some(true);
    state.registry.put_instance(&inst).await.unwrap();
    let addr = serve(state).await;

    let mut ws = connect(addr, "/ws/instances/c4/console", Some(&token_for("u1", false))).await;
    assert_eq!(
        close_code(&next_message(&mut ws).await),
        Some(relay::CLOSE_SUSPENDED)
    );
}

#[tokio::test]
async fn unreachable_node_yields_one_diagnostic_then_close() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let state = app_state(&node, dir.path()).await;
    let mut dead = node.node();
    dead.port = common::closed_port().await;
    state.registry.put_node(&dead).await.unwrap();
    let mut inst = instance(&node, "c5", "u1");
    inst.node.port = dead.port;
    state.registry.put_instance(&inst).await.unwrap();
    let addr = serve(state).await;

    let mut ws = connect(addr, "/ws/instances/c5/console", Some(&token_for("root", true))).await;

    let diagnostic: serde_json::Value =
        serde_json::from_str(next_message(&mut ws).await.into_text().unwrap().as_str()).unwrap();
    assert_eq!(diagnostic["event"], "error");
    assert_eq!(
        close_code(&next_message(&mut ws).await),
        Some(relay::CLOSE_INTERNAL)
    );
}
