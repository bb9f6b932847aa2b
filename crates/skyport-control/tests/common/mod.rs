//! Shared harness: a scriptable fake node agent plus helpers to build a control plane
//! against it.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path as UrlPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use serde_json::{Value, json};
use skyport_control::{
    auth::{AuthUser, issue_access_jwt},
    config::{Config, PollConfig},
    images::ImageCatalog,
    state::AppState,
};
use skyport_db::MemoryKv;
use skyport_model::{Image, Instance, InternalState, Node, NodeRef, NodeStatus, User};

pub const NODE_API_KEY: &str = "node-key";
pub const JWT_SECRET: &[u8] = b"integration-secret";

#[derive(Default)]
pub struct FakeNodeState {
    pub create_calls: AtomicUsize,
    pub redeploy_calls: AtomicUsize,
    pub reinstall_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub purge_calls: AtomicUsize,
    pub power_calls: AtomicUsize,
    pub state_polls: AtomicUsize,
    pub webhook_calls: AtomicUsize,
    pub bad_auth: AtomicUsize,
    next_container: AtomicUsize,

    /// Status returned by create; anything other than 200 is a rejection.
    pub create_status: AtomicU16,
    pub power_status: AtomicU16,
    /// Accept deploy-shaped calls without naming a container.
    pub omit_container_id: AtomicBool,

    /// Consumed front to back by `/state/:volume`; `state_default` once empty.
    pub state_script: Mutex<VecDeque<(u16, Value)>>,
    pub state_default: Mutex<(u16, Value)>,

    pub payloads: Mutex<Vec<Value>>,
    pub paths: Mutex<Vec<String>>,
    pub power_actions: Mutex<Vec<String>>,
    pub webhook_bodies: Mutex<Vec<Value>>,
    pub flagged: Mutex<Vec<Value>>,
    pub ws_auth_frames: Mutex<Vec<String>>,
}

impl FakeNodeState {
    pub fn script_states(&self, states: &[&str]) {
        let mut script = self.state_script.lock().unwrap();
        for s in states {
            script.push_back((200, json!({ "state": s })));
        }
    }

    pub fn set_state_default(&self, status: u16, body: Value) {
        *self.state_default.lock().unwrap() = (status, body);
    }

    pub fn last_payload(&self) -> Value {
        self.payloads.lock().unwrap().last().cloned().unwrap_or(Value::Null)
    }

    fn next_container_id(&self) -> String {
        format!("ctr-{}", self.next_container.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

pub struct FakeNode {
    pub addr: SocketAddr,
    pub state: Arc<FakeNodeState>,
}

impl FakeNode {
    pub async fn start() -> Self {
        let state = Arc::new(FakeNodeState::default());
        state.create_status.store(200, Ordering::SeqCst);
        state.power_status.store(200, Ordering::SeqCst);
        state.set_state_default(200, json!({ "state": "INSTALLING" }));

        let app = Router::new()
            .route("/", get(info))
            .route("/state/:volume", get(volume_state))
            .route("/check/all", get(check_all))
            .route("/hook", post(webhook))
            .route("/exec/:container", get(exec_ws))
            .route("/stats/:container/:volume", get(stats_ws))
            .fallback(dispatch)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            id: "node-1".to_string(),
            address: "127.0.0.1".to_string(),
            port: self.addr.port(),
            api_key: NODE_API_KEY.to_string(),
        }
    }

    pub fn node(&self) -> Node {
        Node {
            id: "node-1".to_string(),
            name: "local".to_string(),
            address: "127.0.0.1".to_string(),
            port: self.addr.port(),
            api_key: Some(NODE_API_KEY.to_string()),
            configure_key: None,
            status: NodeStatus::Configured,
            version_family: None,
            version_release: None,
            last_checked_at: None,
        }
    }

    pub fn webhook_url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }
}

/// A port nothing listens on.
/// A port that accepts connections and never answers, so requests run into the timeout.
pub async fn silent_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("Skyport:{NODE_API_KEY}"))
    );
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str())
}

async fn info() -> Json<Value> {
    Json(json!({ "versionFamily": "1", "versionRelease": "1.4.2", "online": true }))
}

async fn volume_state(
    State(node): State<Arc<FakeNodeState>>,
    UrlPath(_volume): UrlPath<String>,
) -> Response {
    node.state_polls.fetch_add(1, Ordering::SeqCst);
    let next = node.state_script.lock().unwrap().pop_front();
    let (status, body) = next.unwrap_or_else(|| node.state_default.lock().unwrap().clone());
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

async fn check_all(State(node): State<Arc<FakeNodeState>>) -> Json<Value> {
    let flagged = node.flagged.lock().unwrap().clone();
    Json(json!({ "flaggedMessages": flagged }))
}

async fn webhook(State(node): State<Arc<FakeNodeState>>, Json(body): Json<Value>) -> StatusCode {
    node.webhook_calls.fetch_add(1, Ordering::SeqCst);
    node.webhook_bodies.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

fn deploy_reply(node: &FakeNodeState, body: &Bytes) -> Response {
    let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let volume = payload.get("Id").cloned().unwrap_or(Value::Null);
    node.payloads.lock().unwrap().push(payload);
    if node.omit_container_id.load(Ordering::SeqCst) {
        return Json(json!({ "message": "queued" })).into_response();
    }
    Json(json!({ "containerId": node.next_container_id(), "volumeId": volume })).into_response()
}

async fn dispatch(
    State(node): State<Arc<FakeNodeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        node.bad_auth.fetch_add(1, Ordering::SeqCst);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    node.paths.lock().unwrap().push(format!("{method} {}", uri.path()));

    let segments: Vec<&str> = uri.path().trim_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("POST", ["instances", "create"]) => {
            node.create_calls.fetch_add(1, Ordering::SeqCst);
            let status = node.create_status.load(Ordering::SeqCst);
            if status != 200 {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::CONFLICT);
                return (status, Json(json!({ "message": "port 30001 is already allocated" })))
                    .into_response();
            }
            deploy_reply(&node, &body)
        }
        ("POST", ["instances", "redeploy", _container, _id]) => {
            node.redeploy_calls.fetch_add(1, Ordering::SeqCst);
            deploy_reply(&node, &body)
        }
        ("POST", ["instances", "reinstall", _container]) => {
            node.reinstall_calls.fetch_add(1, Ordering::SeqCst);
            deploy_reply(&node, &body)
        }
        ("GET", ["instances", "purge", "all"]) => {
            node.purge_calls.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK.into_response()
        }
        ("GET", ["instances", _container, "delete"]) => {
            node.delete_calls.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK.into_response()
        }
        ("POST", ["instances", _container, action]) => {
            node.power_calls.fetch_add(1, Ordering::SeqCst);
            node.power_actions.lock().unwrap().push(action.to_string());
            let status = node.power_status.load(Ordering::SeqCst);
            StatusCode::from_u16(status)
                .unwrap_or(StatusCode::OK)
                .into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn exec_ws(
    State(node): State<Arc<FakeNodeState>>,
    UrlPath(_container): UrlPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| exec_session(node, socket))
}

// First frame must be the auth event; everything after is echoed with an `out:` prefix.
async fn exec_session(node: Arc<FakeNodeState>, mut socket: WebSocket) {
    let Some(Ok(Message::Text(auth))) = socket.recv().await else {
        return;
    };
    node.ws_auth_frames.lock().unwrap().push(auth);

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(t) => {
                if socket.send(Message::Text(format!("out:{t}"))).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn stats_ws(
    State(node): State<Arc<FakeNodeState>>,
    UrlPath((_container, _volume)): UrlPath<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        if let Some(Ok(Message::Text(auth))) = socket.recv().await {
            node.ws_auth_frames.lock().unwrap().push(auth);
        }
        let _ = socket
            .send(Message::Text(json!({ "event": "stats", "args": [{ "cpu": 12.5 }] }).to_string()))
            .await;
        let _ = socket.send(Message::Close(None)).await;
    })
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        database_url: None,
        listen_addr: ([127, 0, 0, 1], 0).into(),
        workflows_file: dir.join("workflows.json"),
        images_dir: dir.join("images"),
        node_timeout: Duration::from_secs(2),
        // Background reconciliation stays asleep; tests drive polling directly.
        poll: PollConfig {
            interval: Duration::from_secs(3600),
            max_attempts: 50,
        },
        health_interval: None,
        workflow_liveness_interval: Duration::from_secs(3600),
        jwt_secret: JWT_SECRET.to_vec(),
    }
}

pub fn paper_image() -> Image {
    Image {
        name: "Paper".to_string(),
        image: "ghcr.io/skyport/paper:latest".to_string(),
        alt_images: vec!["ghcr.io/skyport/paper:1.20".to_string()],
        env: vec!["EULA=false".to_string(), "VERSION=latest".to_string()],
        scripts: json!({ "install": [] }),
        stop_command: Some("stop".to_string()),
    }
}

pub async fn app_state(node: &FakeNode, dir: &Path) -> AppState {
    let state = AppState::build(
        test_config(dir),
        Arc::new(MemoryKv::new()),
        ImageCatalog::from_images(vec![paper_image()]),
    )
    .unwrap();
    state.registry.put_node(&node.node()).await.unwrap();
    state
}

pub fn instance(node: &FakeNode, id: &str, owner: &str) -> Instance {
    Instance {
        id: id.to_string(),
        volume_id: id.to_string(),
        container_id: format!("ctr-{id}"),
        node: node.node_ref(),
        user: owner.to_string(),
        name: format!("server-{id}"),
        image: "ghcr.io/skyport/paper:latest".to_string(),
        alt_images: vec![],
        env: vec!["EULA=true".to_string()],
        memory: 2048,
        cpu: 200,
        ports: "25565:30001".to_string(),
        primary: "30001".to_string(),
        internal_state: InternalState::Installing,
        suspended: None,
    }
}

pub async fn seed_user(state: &AppState, id: &str, admin: bool) -> User {
    let user = User {
        id: id.to_string(),
        username: format!("user-{id}"),
        admin,
        access_to: vec![],
    };
    state.registry.put_user(&user).await.unwrap();
    user
}

pub fn token_for(user_id: &str, admin: bool) -> String {
    issue_access_jwt(
        JWT_SECRET,
        &AuthUser {
            user_id: user_id.to_string(),
            username: format!("user-{user_id}"),
            is_admin: admin,
        },
        time::Duration::minutes(10),
    )
    .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
