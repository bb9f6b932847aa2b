use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Reconciled lifecycle of the remote container backing an instance.
///
/// NOTE: This is independent of whether the instance exists in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalState {
    #[default]
    Installing,
    Ready,
    Failed,
}

impl InternalState {
    /// Map a state string reported by a node agent. Unknown values are `None`.
    pub fn from_remote(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSTALLING" => Some(Self::Installing),
            "READY" => Some(Self::Ready),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Connection info of the owning node, captured when the instance was deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Instance {
    pub id: String,
    pub volume_id: String,
    #[serde(default)]
    pub container_id: String,
    pub node: NodeRef,
    pub user: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub alt_images: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub memory: u64,
    pub cpu: u64,
    pub ports: String,
    pub primary: String,
    #[serde(default)]
    pub internal_state: InternalState,
    /// Administrative hold. `None` until first evaluated by the suspension gate.
    #[serde(rename = "suspended", default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<bool>,
}

impl Instance {
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Unconfigured,
    Configured,
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    /// One-time provisioning token; only set before the agent has configured itself.
    #[serde(default)]
    pub configure_key: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub version_family: Option<String>,
    #[serde(default)]
    pub version_release: Option<String>,
    #[serde(default)]
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Node {
    pub fn connection(&self) -> NodeRef {
        NodeRef {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            api_key: self.api_key.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
    /// Instance ids shared with this user; distinct from ownership.
    #[serde(default)]
    pub access_to: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            other => Err(format!("unknown power action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkflowBlock {
    Interval { minutes: u32 },
    Power { action: PowerAction },
    Webhook { url: String },
}

/// Per-instance automation: one interval trigger, power actions, webhook notifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub blocks: Vec<WorkflowBlock>,
}

impl Workflow {
    /// Minutes of the first interval block. Only one interval drives scheduling.
    pub fn interval_minutes(&self) -> Option<u32> {
        self.blocks.iter().find_map(|b| match b {
            WorkflowBlock::Interval { minutes } => Some(*minutes),
            _ => None,
        })
    }

    pub fn power_actions(&self) -> impl Iterator<Item = PowerAction> + '_ {
        self.blocks.iter().filter_map(|b| match b {
            WorkflowBlock::Power { action } => Some(*action),
            _ => None,
        })
    }

    pub fn webhooks(&self) -> impl Iterator<Item = &str> + '_ {
        self.blocks.iter().filter_map(|b| match b {
            WorkflowBlock::Webhook { url } => Some(url.as_str()),
            _ => None,
        })
    }
}

/// Image metadata used to build node-facing deploy payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub alt_images: Vec<String>,
    /// `KEY=VALUE` defaults, in order.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub scripts: serde_json::Value,
    #[serde(default)]
    pub stop_command: Option<String>,
}
