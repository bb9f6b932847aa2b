use base64::Engine;
use serde::Deserialize;
use skyport_model::{Node, NodeStatus};

use crate::{
    error::{ControlError, ControlResult},
    registry::Registry,
};

fn random_token(n: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureNodeRequest {
    pub configure_key: String,
    pub api_key: String,
}

/// Node registration and agent provisioning.
#[derive(Clone)]
pub struct Fleet {
    registry: Registry,
}

impl Fleet {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn create_node(&self, req: CreateNodeRequest) -> ControlResult<Node> {
        let name = req.name.trim();
        let address = req.address.trim();
        if name.is_empty() {
            return Err(ControlError::parameter("name", "required"));
        }
        if address.is_empty() {
            return Err(ControlError::parameter("address", "required"));
        }
        if req.port == 0 {
            return Err(ControlError::parameter("port", "required"));
        }

        let node = Node {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            address: address.to_string(),
            port: req.port,
            api_key: None,
            configure_key: Some(random_token(32)),
            status: NodeStatus::Unconfigured,
            version_family: None,
            version_release: None,
            last_checked_at: None,
        };
        self.registry.put_node(&node).await?;
        tracing::info!(node = %node.id, address = %node.address, "node created");
        Ok(node)
    }

    /// Called by the agent itself: a matching one-time key stores the agent's api key.
    pub async fn configure_node(&self, node_id: &str, req: ConfigureNodeRequest) -> ControlResult<Node> {
        let mut node = self.registry.require_node(node_id).await?;
        let Some(expected) = node.configure_key.as_deref() else {
            return Err(ControlError::Conflict("node is already configured".to_string()));
        };
        if expected != req.configure_key.trim() {
            return Err(ControlError::Forbidden);
        }
        let api_key = req.api_key.trim();
        if api_key.is_empty() {
            return Err(ControlError::parameter("apiKey", "required"));
        }

        node.api_key = Some(api_key.to_string());
        node.configure_key = None;
        node.status = NodeStatus::Configured;
        self.registry.put_node(&node).await?;
        tracing::info!(node = %node.id, "node configured");
        Ok(node)
    }

    pub async fn delete_node(&self, node_id: &str) -> ControlResult<()> {
        self.registry.require_node(node_id).await?;
        let hosted = self.registry.instances_on_node(node_id).await?;
        if !hosted.is_empty() {
            return Err(ControlError::Conflict(format!(
                "node still hosts {} instance(s); purge it first",
                hosted.len()
            )));
        }
        self.registry.remove_node(node_id).await?;
        tracing::info!(node = %node_id, "node deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skyport_db::MemoryKv;

    use super::*;

    fn fleet() -> (Registry, Fleet) {
        let registry = Registry::new(Arc::new(MemoryKv::new()));
        (registry.clone(), Fleet::new(registry))
    }

    fn create_req() -> CreateNodeRequest {
        CreateNodeRequest {
            name: "fra-1".to_string(),
            address: "10.0.0.9".to_string(),
            port: 3002,
        }
    }

    #[tokio::test]
    async fn new_node_is_unconfigured_with_key() {
        let (registry, fleet) = fleet();
        let node = fleet.create_node(create_req()).await.unwrap();
        assert_eq!(node.status, NodeStatus::Unconfigured);
        assert!(node.configure_key.as_deref().is_some_and(|k| k.len() >= 32));
        assert_eq!(registry.list_nodes().await.unwrap(), vec![node]);
    }

    #[tokio::test]
    async fn configure_requires_matching_key_and_is_one_time() {
        let (_, fleet) = fleet();
        let node = fleet.create_node(create_req()).await.unwrap();
        let key = node.configure_key.clone().unwrap();

        let wrong = fleet
            .configure_node(
                &node.id,
                ConfigureNodeRequest {
                    configure_key: "nope".to_string(),
                    api_key: "agent-key".to_string(),
                },
            )
            .await;
        assert!(matches!(wrong, Err(ControlError::Forbidden)));

        let configured = fleet
            .configure_node(
                &node.id,
                ConfigureNodeRequest {
                    configure_key: key.clone(),
                    api_key: "agent-key".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(configured.status, NodeStatus::Configured);
        assert_eq!(configured.api_key.as_deref(), Some("agent-key"));
        assert!(configured.configure_key.is_none());

        let again = fleet
            .configure_node(
                &node.id,
                ConfigureNodeRequest {
                    configure_key: key,
                    api_key: "other".to_string(),
                },
            )
            .await;
        assert!(matches!(again, Err(ControlError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_refuses_nodes_with_instances() {
        let (registry, fleet) = fleet();
        let node = fleet.create_node(create_req()).await.unwrap();
        let mut inst = crate::registry::tests::sample_instance("i1", "u1");
        inst.node.id = node.id.clone();
        registry.put_instance(&inst).await.unwrap();

        assert!(matches!(
            fleet.delete_node(&node.id).await,
            Err(ControlError::Conflict(_))
        ));

        registry.remove_instance("i1").await.unwrap();
        fleet.delete_node(&node.id).await.unwrap();
        assert!(registry.list_nodes().await.unwrap().is_empty());
    }
}
