use std::{collections::BTreeMap, time::Duration};

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use skyport_model::{NodeRef, PowerAction};

/// Basic-auth username every node agent expects alongside its api key.
pub const NODE_AUTH_USER: &str = "Skyport";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("node responded {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub version_family: Option<String>,
    pub version_release: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostBinding {
    pub host_port: String,
}

/// Body of create/redeploy/reinstall calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeployPayload {
    pub name: String,
    pub id: String,
    pub image: String,
    pub env: Vec<String>,
    pub scripts: serde_json::Value,
    pub memory: u64,
    pub cpu: u64,
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
    pub alt_images: Vec<String>,
    pub stop_command: Option<String>,
    pub primary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployResponse {
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A create/redeploy/reinstall the node accepted, with the container it now runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployed {
    pub container_id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub state: String,
    #[serde(default)]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedMessage {
    pub container_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckAllResponse {
    #[serde(default)]
    flagged_messages: Vec<FlaggedMessage>,
}

pub fn base_url(node: &NodeRef) -> String {
    let address = node.address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{address}:{}", node.port)
    } else {
        format!("http://{address}:{}", node.port)
    }
}

pub fn ws_url(node: &NodeRef, path: &str) -> String {
    let base = base_url(node);
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };
    format!("{base}{path}")
}

fn upstream_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for field in ["message", "error"] {
            if let Some(msg) = v.get(field).and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
    }
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string();
    }
    trimmed.to_string()
}

fn value_to_string(v: Option<&serde_json::Value>) -> Option<String> {
    match v? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    /// `timeout` bounds every call, including health probes against dead hosts.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skyport-control/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn authed(&self, builder: RequestBuilder, node: &NodeRef) -> RequestBuilder {
        builder.basic_auth(NODE_AUTH_USER, Some(&node.api_key))
    }

    async fn send(&self, url: &str, builder: RequestBuilder) -> Result<Response, NodeError> {
        builder.send().await.map_err(|source| NodeError::Transport {
            url: url.to_string(),
            source,
        })
    }

    async fn reject(resp: Response) -> NodeError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        NodeError::Rejected {
            status: status.as_u16(),
            message: upstream_message(status, &body),
        }
    }

    async fn expect_json<T: DeserializeOwned>(url: &str, resp: Response) -> Result<T, NodeError> {
        if !resp.status().is_success() {
            return Err(Self::reject(resp).await);
        }
        let bytes = resp.bytes().await.map_err(|source| NodeError::Transport {
            url: url.to_string(),
            source,
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return serde_json::from_str("{}").map_err(|e| NodeError::Malformed {
                url: url.to_string(),
                message: e.to_string(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| NodeError::Malformed {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, node: &NodeRef, path: &str) -> Result<T, NodeError> {
        let url = format!("{}{path}", base_url(node));
        let resp = self.send(&url, self.authed(self.http.get(&url), node)).await?;
        Self::expect_json(&url, resp).await
    }

    async fn post_json<B, T>(&self, node: &NodeRef, path: &str, body: &B) -> Result<T, NodeError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", base_url(node));
        let resp = self
            .send(&url, self.authed(self.http.post(&url), node).json(body))
            .await?;
        Self::expect_json(&url, resp).await
    }

    async fn get_ok(&self, node: &NodeRef, path: &str) -> Result<(), NodeError> {
        let url = format!("{}{path}", base_url(node));
        let resp = self.send(&url, self.authed(self.http.get(&url), node)).await?;
        if !resp.status().is_success() {
            return Err(Self::reject(resp).await);
        }
        Ok(())
    }

    /// `GET /`: health and version.
    pub async fn probe(&self, node: &NodeRef) -> Result<NodeInfo, NodeError> {
        let url = format!("{}/", base_url(node));
        let v: serde_json::Value = self.get_json(node, "/").await?;
        if !v.is_object() {
            return Err(NodeError::Malformed {
                url,
                message: "expected a JSON object".to_string(),
            });
        }
        Ok(NodeInfo {
            version_family: value_to_string(v.get("versionFamily")),
            version_release: value_to_string(v.get("versionRelease")),
        })
    }

    /// Every deploy-shaped call must name the container it produced.
    async fn deploy_call(&self, node: &NodeRef, path: &str, payload: &DeployPayload) -> Result<Deployed, NodeError> {
        let resp: DeployResponse = self.post_json(node, path, payload).await?;
        match resp.container_id.filter(|c| !c.trim().is_empty()) {
            Some(container_id) => Ok(Deployed {
                container_id,
                message: resp.message,
            }),
            None => Err(NodeError::Malformed {
                url: format!("{}{path}", base_url(node)),
                message: "response carried no containerId".to_string(),
            }),
        }
    }

    pub async fn create(&self, node: &NodeRef, payload: &DeployPayload) -> Result<Deployed, NodeError> {
        self.deploy_call(node, "/instances/create", payload).await
    }

    pub async fn redeploy(
        &self,
        node: &NodeRef,
        container_id: &str,
        id: &str,
        payload: &DeployPayload,
    ) -> Result<Deployed, NodeError> {
        self.deploy_call(node, &format!("/instances/redeploy/{container_id}/{id}"), payload)
            .await
    }

    pub async fn reinstall(
        &self,
        node: &NodeRef,
        container_id: &str,
        payload: &DeployPayload,
    ) -> Result<Deployed, NodeError> {
        self.deploy_call(node, &format!("/instances/reinstall/{container_id}"), payload)
            .await
    }

    pub async fn delete_container(&self, node: &NodeRef, container_id: &str) -> Result<(), NodeError> {
        self.get_ok(node, &format!("/instances/{container_id}/delete"))
            .await
    }

    pub async fn purge_all(&self, node: &NodeRef) -> Result<(), NodeError> {
        self.get_ok(node, "/instances/purge/all").await
    }

    pub async fn state(&self, node: &NodeRef, volume_id: &str) -> Result<StateResponse, NodeError> {
        self.get_json(node, &format!("/state/{volume_id}")).await
    }

    /// 200 and 304 (already in the requested state) both count as success.
    pub async fn power(
        &self,
        node: &NodeRef,
        container_id: &str,
        action: PowerAction,
    ) -> Result<StatusCode, NodeError> {
        let url = format!("{}/instances/{container_id}/{}", base_url(node), action.as_str());
        let resp = self.send(&url, self.authed(self.http.post(&url), node)).await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NOT_MODIFIED => Ok(resp.status()),
            _ => Err(Self::reject(resp).await),
        }
    }

    pub async fn check_all(&self, node: &NodeRef) -> Result<Vec<FlaggedMessage>, NodeError> {
        let resp: CheckAllResponse = self.get_json(node, "/check/all").await?;
        Ok(resp.flagged_messages)
    }
}
